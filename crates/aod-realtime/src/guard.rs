use std::collections::HashSet;
use std::future::Future;
use std::sync::Mutex;
use tracing::debug;

/// Outcome of a guarded action: either the underlying call ran to
/// settlement, or it was deliberately skipped because the same action key
/// already had a call in flight. `Suppressed` is not an error.
#[derive(Debug, PartialEq, Eq)]
pub enum Guarded<T> {
    Done(T),
    Suppressed,
}

impl<T> Guarded<T> {
    pub fn is_suppressed(&self) -> bool {
        matches!(self, Guarded::Suppressed)
    }

    pub fn into_inner(self) -> Option<T> {
        match self {
            Guarded::Done(value) => Some(value),
            Guarded::Suppressed => None,
        }
    }
}

/// At-most-once-in-flight marker per action key (entity id + action type,
/// e.g. `approval:apr_123:approve`). Distinct keys never contend.
#[derive(Default)]
pub struct MutationGuard {
    in_flight: Mutex<HashSet<String>>,
}

impl MutationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `perform` unless a call with the same key is outstanding, in
    /// which case `Suppressed` returns immediately and `perform` is never
    /// invoked. The marker clears when the future settles — success,
    /// failure value, or panic — so a later retry always goes through.
    /// There is no cancellation of a started call; only subsequent calls
    /// on the same key are suppressed.
    pub async fn run<T, F, Fut>(&self, action_key: &str, perform: F) -> Guarded<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            if !in_flight.insert(action_key.to_string()) {
                debug!(action = action_key, "mutation_suppressed");
                return Guarded::Suppressed;
            }
        }
        let _release = Release {
            guard: self,
            action_key,
        };
        Guarded::Done(perform().await)
    }

    pub fn is_in_flight(&self, action_key: &str) -> bool {
        self.in_flight.lock().unwrap().contains(action_key)
    }
}

struct Release<'a> {
    guard: &'a MutationGuard,
    action_key: &'a str,
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.guard.in_flight.lock() {
            in_flight.remove(self.action_key);
        }
    }
}
