use crate::backoff::BackoffPolicy;
use crate::dispatch::DispatchRegistry;
use crate::transport::Transport;
use aod_core::{ChannelName, SseFrameDecoder, CLOSE_EVENT, DEFAULT_MAX_FRAME_BYTES};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

/// Health of one channel's connection, published through a watch so views
/// can render a degraded-connection affordance. Errors never surface as
/// exceptions to consumers; they only show up here as transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Silence threshold before forcing a reconnect; the gateway heartbeats
    /// every 30s, so twice that detects a stalled stream.
    pub heartbeat_timeout: Duration,
    /// Maximum age of one connection before it is proactively cycled.
    pub connection_lifetime: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(60),
            connection_lifetime: Duration::from_secs(600),
            backoff: BackoffPolicy::default(),
        }
    }
}

pub(crate) struct SupervisorHandle {
    shutdown: watch::Sender<bool>,
    status: watch::Receiver<ConnectionStatus>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub(crate) fn spawn(
        channel: ChannelName,
        transport: Arc<dyn Transport>,
        registry: Arc<DispatchRegistry>,
        config: RealtimeConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connecting);
        let task = tokio::spawn(run_channel(
            channel,
            transport,
            registry,
            config,
            status_tx,
            shutdown_rx,
        ));
        Self {
            shutdown: shutdown_tx,
            status: status_rx,
            task,
        }
    }

    pub(crate) fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Signal the task to stop; it cancels any pending backoff sleep and
    /// drops the live stream on its next wakeup.
    pub(crate) fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    pub(crate) async fn join(self) {
        self.shutdown();
        let _ = self.task.await;
    }
}

enum EpochEnd {
    /// Teardown requested; leave the lifecycle loop.
    Shutdown,
    /// Graceful end (lifetime reached or server close): reconnect now,
    /// without backoff, keeping the retry counter untouched.
    Cycle,
    /// Error, EOF, or heartbeat silence: back off before reconnecting.
    Failed,
}

/// Per-channel connection lifecycle. Exactly one of these tasks runs per
/// distinct channel while it has subscribers; it owns the channel's
/// ConnectionState and is the only writer to it.
async fn run_channel(
    channel: ChannelName,
    transport: Arc<dyn Transport>,
    registry: Arc<DispatchRegistry>,
    config: RealtimeConfig,
    status: watch::Sender<ConnectionStatus>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut retry_count: u32 = 0;
    'lifecycle: loop {
        status.send_replace(ConnectionStatus::Connecting);
        let opened = tokio::select! {
            _ = shutdown.changed() => break 'lifecycle,
            opened = transport.open(&channel) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(err) => {
                warn!(channel = %channel, error = %err, "transport_open_error");
                retry_count = retry_count.saturating_add(1);
                status.send_replace(ConnectionStatus::Reconnecting);
                if !backoff_sleep(&config.backoff, retry_count, &mut shutdown).await {
                    break 'lifecycle;
                }
                continue 'lifecycle;
            }
        };

        retry_count = 0;
        status.send_replace(ConnectionStatus::Open);
        info!(channel = %channel, "channel_open");
        let lifetime_deadline = Instant::now() + config.connection_lifetime;
        let mut heartbeat_deadline = Instant::now() + config.heartbeat_timeout;
        let mut decoder = SseFrameDecoder::new(DEFAULT_MAX_FRAME_BYTES);

        let outcome = loop {
            tokio::select! {
                _ = shutdown.changed() => break EpochEnd::Shutdown,
                _ = sleep_until(lifetime_deadline) => {
                    info!(channel = %channel, "connection_lifetime_reached");
                    break EpochEnd::Cycle;
                }
                _ = sleep_until(heartbeat_deadline) => {
                    warn!(channel = %channel, "heartbeat_timeout");
                    break EpochEnd::Failed;
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        let report = decoder.push_chunk(&bytes);
                        for err in &report.errors {
                            warn!(channel = %channel, error = %err, "frame_decode_error");
                        }
                        let mut close_requested = false;
                        for envelope in report.envelopes {
                            // Any decoded frame counts as liveness.
                            heartbeat_deadline = Instant::now() + config.heartbeat_timeout;
                            if envelope.is_control() {
                                if envelope.event_type == CLOSE_EVENT {
                                    close_requested = true;
                                }
                                continue;
                            }
                            registry.dispatch(envelope);
                        }
                        if close_requested {
                            info!(channel = %channel, "server_close");
                            break EpochEnd::Cycle;
                        }
                    }
                    Some(Err(err)) => {
                        warn!(channel = %channel, error = %err, "stream_error");
                        break EpochEnd::Failed;
                    }
                    None => {
                        warn!(channel = %channel, "stream_closed");
                        break EpochEnd::Failed;
                    }
                },
            }
        };
        drop(stream);

        match outcome {
            EpochEnd::Shutdown => break 'lifecycle,
            EpochEnd::Cycle => continue 'lifecycle,
            EpochEnd::Failed => {
                retry_count = retry_count.saturating_add(1);
                status.send_replace(ConnectionStatus::Reconnecting);
                if !backoff_sleep(&config.backoff, retry_count, &mut shutdown).await {
                    break 'lifecycle;
                }
            }
        }
    }
    status.send_replace(ConnectionStatus::Closed);
    debug!(channel = %channel, "supervisor_stopped");
}

/// Returns false when shutdown interrupted the sleep.
async fn backoff_sleep(
    policy: &BackoffPolicy,
    retry_count: u32,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let delay = policy.jittered_delay(retry_count, rand::random::<f64>());
    debug!(retry_count, delay_ms = delay.as_millis() as u64, "reconnect_backoff");
    tokio::select! {
        _ = shutdown.changed() => false,
        _ = sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{EventByteStream, TransportError};
    use bytes::Bytes;
    use futures_util::future::BoxFuture;
    use futures_util::{stream, FutureExt};
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn sse_frame(id: &str, event_type: &str, channel: &str) -> Bytes {
        Bytes::from(format!(
            "id: {id}\nevent: message\ndata: {{\"id\":\"{id}\",\"type\":\"{event_type}\",\"channel\":\"{channel}\",\"timestamp\":\"2026-08-06T12:00:00Z\",\"payload\":{{}}}}\n\n"
        ))
    }

    enum Epoch {
        FailOpen,
        Events { chunks: Vec<io::Result<Bytes>>, hang: bool },
    }

    /// Replays a scripted sequence of connection epochs and counts every
    /// open attempt and every dropped (closed) stream.
    struct ScriptedTransport {
        script: StdMutex<VecDeque<Epoch>>,
        attempts: AtomicUsize,
        closes: Arc<AtomicUsize>,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Epoch>) -> Arc<Self> {
            Arc::new(Self {
                script: StdMutex::new(script.into()),
                attempts: AtomicUsize::new(0),
                closes: Arc::new(AtomicUsize::new(0)),
            })
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    struct CloseCounter(Arc<AtomicUsize>);

    impl Drop for CloseCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Transport for ScriptedTransport {
        fn open(
            &self,
            _channel: &ChannelName,
        ) -> BoxFuture<'static, Result<EventByteStream, TransportError>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let epoch = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Epoch::Events {
                    chunks: Vec::new(),
                    hang: true,
                });
            match epoch {
                Epoch::FailOpen => async {
                    Err(TransportError::Io(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        "scripted refusal",
                    )))
                }
                .boxed(),
                Epoch::Events { chunks, hang } => {
                    let counter = CloseCounter(self.closes.clone());
                    let head = stream::iter(chunks);
                    let stream: EventByteStream = if hang {
                        head.chain(stream::pending())
                            .map(move |item| {
                                let _ = &counter;
                                item
                            })
                            .boxed()
                    } else {
                        head.map(move |item| {
                            let _ = &counter;
                            item
                        })
                        .boxed()
                    };
                    async move { Ok(stream) }.boxed()
                }
            }
        }
    }

    fn fast_config() -> RealtimeConfig {
        RealtimeConfig {
            // Generous enough that only the dedicated heartbeat test ever
            // trips it.
            heartbeat_timeout: Duration::from_secs(5),
            connection_lifetime: Duration::from_secs(30),
            backoff: BackoffPolicy {
                seed: Duration::from_millis(10),
                factor: 2,
                ceiling: Duration::from_millis(40),
                jitter_ratio: 0.0,
            },
        }
    }

    fn channel() -> ChannelName {
        ChannelName::parse("runs:ws_42").expect("test channel")
    }

    fn capture_registry() -> (Arc<DispatchRegistry>, Arc<StdMutex<Vec<String>>>) {
        let registry = Arc::new(DispatchRegistry::default());
        let seen: Arc<StdMutex<Vec<String>>> = Arc::default();
        let sink = seen.clone();
        registry.subscribe(
            channel(),
            Arc::new(move |event| {
                sink.lock()
                    .unwrap()
                    .push(format!("{}:{}", event.event_type, event.id))
            }),
        );
        (registry, seen)
    }

    async fn wait_until(deadline_ms: u64, predicate: impl Fn() -> bool) {
        for _ in 0..(deadline_ms / 5).max(1) {
            if predicate() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within {deadline_ms}ms");
    }

    #[tokio::test]
    async fn dispatches_business_events_and_swallows_control_events() {
        let transport = ScriptedTransport::new(vec![Epoch::Events {
            chunks: vec![
                Ok(sse_frame("ev_0", "connected", "runs:ws_42")),
                Ok(sse_frame("ev_1", "run_status_changed", "runs:ws_42")),
                Ok(sse_frame("ev_2", "heartbeat", "runs:ws_42")),
            ],
            hang: true,
        }]);
        let (registry, seen) = capture_registry();
        let handle = SupervisorHandle::spawn(
            channel(),
            transport.clone(),
            registry,
            fast_config(),
        );

        wait_until(2_000, || !seen.lock().unwrap().is_empty()).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["run_status_changed:ev_1".to_string()]
        );
        handle.join().await;
    }

    #[tokio::test]
    async fn malformed_frame_keeps_the_connection_open() {
        let transport = ScriptedTransport::new(vec![Epoch::Events {
            chunks: vec![
                Ok(sse_frame("ev_1", "step_created", "runs:ws_42")),
                Ok(Bytes::from_static(b"data: not json\n\n")),
                Ok(sse_frame("ev_2", "step_created", "runs:ws_42")),
            ],
            hang: true,
        }]);
        let (registry, seen) = capture_registry();
        let handle = SupervisorHandle::spawn(
            channel(),
            transport.clone(),
            registry,
            fast_config(),
        );
        let status = handle.status();

        wait_until(2_000, || seen.lock().unwrap().len() == 2).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "step_created:ev_1".to_string(),
                "step_created:ev_2".to_string()
            ]
        );
        assert_eq!(*status.borrow(), ConnectionStatus::Open);
        assert_eq!(transport.attempts(), 1);
        handle.join().await;
    }

    #[tokio::test]
    async fn heartbeat_silence_forces_a_reconnect() {
        let config = RealtimeConfig {
            heartbeat_timeout: Duration::from_millis(100),
            ..fast_config()
        };
        let transport = ScriptedTransport::new(vec![
            Epoch::Events {
                chunks: vec![Ok(sse_frame("ev_0", "connected", "runs:ws_42"))],
                hang: true,
            },
            Epoch::Events {
                chunks: vec![Ok(sse_frame("ev_1", "run_status_changed", "runs:ws_42"))],
                hang: true,
            },
        ]);
        let (registry, seen) = capture_registry();
        let handle = SupervisorHandle::spawn(channel(), transport.clone(), registry, config);
        let mut status = handle.status();
        let watcher = tokio::spawn(async move {
            let mut reconnecting_seen = 0usize;
            while status.changed().await.is_ok() {
                if *status.borrow() == ConnectionStatus::Reconnecting {
                    reconnecting_seen += 1;
                }
            }
            reconnecting_seen
        });

        // First epoch goes silent; the supervisor must declare it dead and
        // open a second connection that then delivers.
        wait_until(3_000, || !seen.lock().unwrap().is_empty()).await;
        assert_eq!(transport.attempts(), 2);
        assert_eq!(transport.closes(), 1);
        handle.join().await;

        // One silent epoch produced exactly one Reconnecting transition,
        // not a storm of them. (Epoch two was shut down before its own
        // heartbeat deadline.)
        assert_eq!(watcher.await.expect("watcher"), 1);
    }

    #[tokio::test]
    async fn open_failures_retry_until_success() {
        let transport = ScriptedTransport::new(vec![
            Epoch::FailOpen,
            Epoch::FailOpen,
            Epoch::Events {
                chunks: vec![Ok(sse_frame("ev_1", "approval_created", "runs:ws_42"))],
                hang: true,
            },
        ]);
        let (registry, seen) = capture_registry();
        let handle = SupervisorHandle::spawn(
            channel(),
            transport.clone(),
            registry,
            fast_config(),
        );

        wait_until(3_000, || !seen.lock().unwrap().is_empty()).await;
        assert_eq!(transport.attempts(), 3);
        assert_eq!(*handle.status().borrow(), ConnectionStatus::Open);
        handle.join().await;
    }

    #[tokio::test]
    async fn stream_eof_reconnects_with_backoff() {
        let transport = ScriptedTransport::new(vec![
            Epoch::Events {
                chunks: vec![Ok(sse_frame("ev_1", "run_status_changed", "runs:ws_42"))],
                hang: false,
            },
            Epoch::Events {
                chunks: vec![Ok(sse_frame("ev_2", "run_status_changed", "runs:ws_42"))],
                hang: true,
            },
        ]);
        let (registry, seen) = capture_registry();
        let handle = SupervisorHandle::spawn(
            channel(),
            transport.clone(),
            registry,
            fast_config(),
        );

        wait_until(3_000, || seen.lock().unwrap().len() == 2).await;
        assert_eq!(transport.attempts(), 2);
        assert_eq!(transport.closes(), 1);
        handle.join().await;
    }

    #[tokio::test]
    async fn server_close_event_cycles_without_backoff_status() {
        let transport = ScriptedTransport::new(vec![
            Epoch::Events {
                chunks: vec![
                    Ok(sse_frame("ev_0", "connected", "runs:ws_42")),
                    Ok(sse_frame("ev_1", "close", "runs:ws_42")),
                ],
                hang: true,
            },
            Epoch::Events {
                chunks: vec![Ok(sse_frame("ev_2", "audit_appended", "runs:ws_42"))],
                hang: true,
            },
        ]);
        let (registry, seen) = capture_registry();
        let handle = SupervisorHandle::spawn(
            channel(),
            transport.clone(),
            registry,
            fast_config(),
        );
        let mut status = handle.status();
        let mut saw_reconnecting = false;
        let watcher = tokio::spawn(async move {
            while status.changed().await.is_ok() {
                if *status.borrow() == ConnectionStatus::Reconnecting {
                    saw_reconnecting = true;
                }
            }
            saw_reconnecting
        });

        wait_until(3_000, || !seen.lock().unwrap().is_empty()).await;
        assert_eq!(transport.attempts(), 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["audit_appended:ev_2".to_string()]
        );
        handle.join().await;
        assert!(!watcher.await.expect("watcher"), "cycle must not back off");
    }

    #[tokio::test]
    async fn connection_lifetime_cycles_the_connection() {
        let config = RealtimeConfig {
            heartbeat_timeout: Duration::from_secs(30),
            connection_lifetime: Duration::from_millis(80),
            backoff: fast_config().backoff,
        };
        let transport = ScriptedTransport::new(vec![
            Epoch::Events {
                chunks: vec![Ok(sse_frame("ev_0", "connected", "runs:ws_42"))],
                hang: true,
            },
            Epoch::Events {
                chunks: vec![Ok(sse_frame("ev_1", "connected", "runs:ws_42"))],
                hang: true,
            },
        ]);
        let (registry, _seen) = capture_registry();
        let handle = SupervisorHandle::spawn(channel(), transport.clone(), registry, config);
        let mut status = handle.status();
        let watcher = tokio::spawn(async move {
            let mut saw_reconnecting = false;
            while status.changed().await.is_ok() {
                if *status.borrow() == ConnectionStatus::Reconnecting {
                    saw_reconnecting = true;
                }
            }
            saw_reconnecting
        });

        wait_until(3_000, || transport.attempts() >= 2).await;
        assert!(transport.closes() >= 1);
        handle.join().await;

        // Lifetime cycling is proactive renewal, not failure recovery.
        assert!(!watcher.await.expect("watcher"));
    }

    #[tokio::test]
    async fn shutdown_closes_the_stream_and_stops_reconnecting() {
        let transport = ScriptedTransport::new(vec![Epoch::Events {
            chunks: vec![Ok(sse_frame("ev_0", "connected", "runs:ws_42"))],
            hang: true,
        }]);
        let (registry, _seen) = capture_registry();
        let handle = SupervisorHandle::spawn(
            channel(),
            transport.clone(),
            registry,
            fast_config(),
        );
        let status = handle.status();

        wait_until(2_000, || transport.attempts() == 1).await;
        handle.join().await;
        assert_eq!(transport.closes(), 1);
        assert_eq!(*status.borrow(), ConnectionStatus::Closed);

        // No orphaned reconnect timer: attempts stay where they were.
        sleep(Duration::from_millis(120)).await;
        assert_eq!(transport.attempts(), 1);
    }
}
