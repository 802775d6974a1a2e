use anyhow::Context;
use aod_realtime::{RealtimeClient, RealtimeConfig, SseTransport};
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Follow realtime gateway channels from the terminal. Prints every
/// business event as it arrives, plus connection health transitions, until
/// interrupted. Useful for watching a gateway without the dashboard.
#[derive(Parser, Debug)]
#[command(name = "aod-tail")]
struct Args {
    /// Gateway base URL, e.g. http://127.0.0.1:8787
    #[arg(long)]
    gateway_url: String,
    /// Channel to follow, e.g. runs:ws_42 (repeatable)
    #[arg(long = "channel", required = true)]
    channels: Vec<String>,
    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let transport = Arc::new(SseTransport::new(args.gateway_url.clone()));
    let client = RealtimeClient::new(RealtimeConfig::default(), transport);

    let mut subscriptions = Vec::new();
    for raw in &args.channels {
        let subscription = client
            .subscribe(raw, |event| {
                info!(
                    channel = %event.channel,
                    event_type = %event.event_type,
                    id = %event.id,
                    payload = %event.payload,
                    "event"
                );
            })
            .with_context(|| format!("invalid channel {raw:?}"))?;

        if let Some(mut status) = client.connection_status(raw) {
            let channel = raw.clone();
            tokio::spawn(async move {
                loop {
                    info!(channel = %channel, status = ?*status.borrow(), "connection_status");
                    if status.changed().await.is_err() {
                        break;
                    }
                }
            });
        }
        subscriptions.push(subscription);
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    info!("shutting down");
    drop(subscriptions);
    client.shutdown().await;
    Ok(())
}
