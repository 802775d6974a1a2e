use aod_core::ChannelName;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use reqwest::header::ACCEPT;
use std::io;
use thiserror::Error;

pub type EventByteStream = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("gateway rejected stream with status {status}")]
    Handshake { status: u16 },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// One push connection per channel. Implementations hand back the raw byte
/// stream; framing and envelope decoding stay with the supervisor so every
/// transport gets the same malformed-frame tolerance.
pub trait Transport: Send + Sync {
    fn open(
        &self,
        channel: &ChannelName,
    ) -> BoxFuture<'static, Result<EventByteStream, TransportError>>;
}

/// Production transport: Server-Sent Events over HTTP against the gateway's
/// push endpoint, one GET per channel.
pub struct SseTransport {
    base_url: String,
    client: reqwest::Client,
}

impl SseTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, client }
    }

    fn channel_url(&self, channel: &ChannelName) -> String {
        format!("{}/v1/events/{}", self.base_url, channel.path_segment())
    }
}

impl Transport for SseTransport {
    fn open(
        &self,
        channel: &ChannelName,
    ) -> BoxFuture<'static, Result<EventByteStream, TransportError>> {
        let client = self.client.clone();
        let url = self.channel_url(channel);
        async move {
            let response = client
                .get(&url)
                .header(ACCEPT, "text/event-stream")
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                return Err(TransportError::Handshake {
                    status: status.as_u16(),
                });
            }
            let stream = response
                .bytes_stream()
                .map(|item| item.map_err(|err| io::Error::new(io::ErrorKind::Other, err)));
            Ok(stream.boxed() as EventByteStream)
        }
        .boxed()
    }
}
