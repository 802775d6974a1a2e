use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Refetch cadences the dashboard's consumers use per entity class. The
/// scheduler itself is interval-agnostic; callers re-derive the interval
/// every cycle so it tracks the entity's current status.
pub mod intervals {
    use std::time::Duration;

    /// An actively running entity (run with live steps).
    pub const ACTIVE_RUN: Duration = Duration::from_secs(2);
    /// A run that reached a stable status.
    pub const SETTLED_RUN: Duration = Duration::from_secs(30);
    /// Approval queues awaiting operator action.
    pub const APPROVAL_QUEUE: Duration = Duration::from_secs(4);
    /// Slowly-changing registries (agents, tools, policies).
    pub const REGISTRY: Duration = Duration::from_secs(60);
}

#[derive(Clone)]
pub struct PollOptions {
    /// Current interval; re-evaluated before every sleep.
    pub interval_of: Arc<dyn Fn() -> Duration + Send + Sync>,
    /// Checked before every refetch; true cancels the task permanently.
    pub is_terminal: Arc<dyn Fn() -> bool + Send + Sync>,
    /// One REST refetch. Failures are logged and polling continues.
    pub refetch: Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>,
}

struct PollHandle {
    generation: u64,
    stop: watch::Sender<bool>,
}

/// Interval-based refetch fallback, one task per entity key.
///
/// Refetches for one key never overlap: the task awaits each refetch
/// before arming the next tick, so a slow response simply delays the
/// following cycle. Once the entity reports terminal, the task ends and is
/// never re-armed.
pub struct PollScheduler {
    tasks: Arc<Mutex<HashMap<String, PollHandle>>>,
    next_generation: AtomicU64,
}

impl Default for PollScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl PollScheduler {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// Start polling an entity. Scheduling a key that is already polled
    /// cancels and replaces the previous task.
    pub fn schedule(&self, entity_key: impl Into<String>, options: PollOptions) {
        let entity_key = entity_key.into();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (stop_tx, mut stop_rx) = watch::channel(false);
        {
            let mut tasks = self.tasks.lock().unwrap();
            if let Some(previous) = tasks.insert(
                entity_key.clone(),
                PollHandle {
                    generation,
                    stop: stop_tx,
                },
            ) {
                let _ = previous.stop.send(true);
            }
        }

        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            loop {
                if (options.is_terminal)() {
                    debug!(entity = %entity_key, "poll_terminal");
                    break;
                }
                let delay = (options.interval_of)();
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    _ = sleep(delay) => {}
                }
                if (options.is_terminal)() {
                    debug!(entity = %entity_key, "poll_terminal");
                    break;
                }
                let refetch = (options.refetch)();
                tokio::select! {
                    _ = stop_rx.changed() => return,
                    result = refetch => {
                        if let Err(err) = result {
                            warn!(entity = %entity_key, error = %err, "poll_refetch_error");
                        }
                    }
                }
            }
            // Terminal exit: clear our own entry unless a newer task took
            // the key in the meantime.
            let mut tasks = tasks.lock().unwrap();
            if tasks
                .get(&entity_key)
                .is_some_and(|handle| handle.generation == generation)
            {
                tasks.remove(&entity_key);
            }
        });
    }

    /// Stop polling an entity. Idempotent; unknown keys are a no-op.
    pub fn cancel(&self, entity_key: &str) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(handle) = tasks.remove(entity_key) {
            let _ = handle.stop.send(true);
        }
    }

    pub fn cancel_all(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        for (_, handle) in tasks.drain() {
            let _ = handle.stop.send(true);
        }
    }

    pub fn is_polling(&self, entity_key: &str) -> bool {
        self.tasks.lock().unwrap().contains_key(entity_key)
    }
}
