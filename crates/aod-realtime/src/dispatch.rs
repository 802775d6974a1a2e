use aod_core::{ChannelName, EventEnvelope};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

pub(crate) type EventCallback = Arc<dyn Fn(EventEnvelope) + Send + Sync>;

#[derive(Clone)]
struct Entry {
    id: u64,
    alive: Arc<AtomicBool>,
    callback: EventCallback,
}

/// Fan-out of decoded business events to the consumers subscribed to each
/// channel. Subscribe/unsubscribe report whether a channel gained its first
/// or lost its last consumer so the client can reference-count connections.
#[derive(Default)]
pub(crate) struct DispatchRegistry {
    next_id: AtomicU64,
    channels: Mutex<HashMap<ChannelName, Vec<Entry>>>,
}

pub(crate) struct SubscriptionToken {
    pub(crate) channel: ChannelName,
    id: u64,
    alive: Arc<AtomicBool>,
}

impl DispatchRegistry {
    /// Register a consumer. Returns the token plus whether this was the
    /// channel's first subscriber.
    pub(crate) fn subscribe(
        &self,
        channel: ChannelName,
        callback: EventCallback,
    ) -> (SubscriptionToken, bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let alive = Arc::new(AtomicBool::new(true));
        let mut channels = self.channels.lock().unwrap();
        let entries = channels.entry(channel.clone()).or_default();
        let first = entries.is_empty();
        entries.push(Entry {
            id,
            alive: alive.clone(),
            callback,
        });
        (SubscriptionToken { channel, id, alive }, first)
    }

    /// Remove a consumer. Returns true when the channel lost its last
    /// subscriber. Idempotent: a token can only be spent once because the
    /// live flag is cleared first, and repeat calls find nothing to remove.
    pub(crate) fn unsubscribe(&self, token: &SubscriptionToken) -> bool {
        token.alive.store(false, Ordering::SeqCst);
        let mut channels = self.channels.lock().unwrap();
        let Some(entries) = channels.get_mut(&token.channel) else {
            return false;
        };
        entries.retain(|entry| entry.id != token.id);
        if entries.is_empty() {
            channels.remove(&token.channel);
            true
        } else {
            false
        }
    }

    /// Deliver one decoded business event to every live subscriber of its
    /// channel, in registration order. The entry list is snapshotted before
    /// iterating so a callback that unsubscribes (itself or a sibling)
    /// cannot corrupt the pass, and panics are isolated so one faulty
    /// consumer cannot break delivery to the rest.
    pub(crate) fn dispatch(&self, envelope: EventEnvelope) {
        let channel = match ChannelName::parse(&envelope.channel) {
            Ok(channel) => channel,
            Err(err) => {
                warn!(error = %err, "dispatch_unknown_channel");
                return;
            }
        };
        let snapshot: Vec<Entry> = {
            let channels = self.channels.lock().unwrap();
            match channels.get(&channel) {
                Some(entries) => entries.clone(),
                None => return,
            }
        };
        for entry in snapshot {
            if !entry.alive.load(Ordering::SeqCst) {
                continue;
            }
            let event = envelope.clone();
            let callback = entry.callback.clone();
            if catch_unwind(AssertUnwindSafe(move || callback(event))).is_err() {
                warn!(channel = %channel, subscriber = entry.id, "subscriber_callback_panicked");
            }
        }
    }

    pub(crate) fn subscriber_count(&self, channel: &ChannelName) -> usize {
        self.channels
            .lock()
            .unwrap()
            .get(channel)
            .map(Vec::len)
            .unwrap_or(0)
    }
}
