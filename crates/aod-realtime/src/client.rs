use crate::dispatch::{DispatchRegistry, EventCallback, SubscriptionToken};
use crate::guard::{Guarded, MutationGuard};
use crate::poller::{PollOptions, PollScheduler};
use crate::supervisor::{ConnectionStatus, RealtimeConfig, SupervisorHandle};
use crate::transport::Transport;
use aod_core::{ChannelError, ChannelName, EventEnvelope};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::debug;

/// Entry point for the realtime layer. One instance per application
/// process, handed to views by dependency injection; it owns the map from
/// channel to connection and the map from channel to subscribers, so there
/// are no ambient singletons to leak between tests.
#[derive(Clone)]
pub struct RealtimeClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: RealtimeConfig,
    transport: Arc<dyn Transport>,
    registry: Arc<DispatchRegistry>,
    supervisors: Mutex<HashMap<ChannelName, SupervisorHandle>>,
    poller: PollScheduler,
    guard: MutationGuard,
}

impl RealtimeClient {
    pub fn new(config: RealtimeConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                transport,
                registry: Arc::new(DispatchRegistry::default()),
                supervisors: Mutex::new(HashMap::new()),
                poller: PollScheduler::new(),
                guard: MutationGuard::new(),
            }),
        }
    }

    /// Subscribe a consumer callback to a channel. Malformed channel
    /// strings reject synchronously; connection establishment happens in
    /// the background and its health is observable via
    /// [`RealtimeClient::connection_status`]. The first subscriber for a
    /// channel creates its connection; further subscribers share it.
    pub fn subscribe<F>(&self, raw: &str, on_event: F) -> Result<Subscription, ChannelError>
    where
        F: Fn(EventEnvelope) + Send + Sync + 'static,
    {
        let channel = ChannelName::parse(raw)?;
        let callback: EventCallback = Arc::new(on_event);
        let (token, first) = self.inner.registry.subscribe(channel.clone(), callback);
        if first {
            debug!(channel = %channel, "channel_first_subscriber");
            let handle = SupervisorHandle::spawn(
                channel.clone(),
                self.inner.transport.clone(),
                self.inner.registry.clone(),
                self.inner.config.clone(),
            );
            self.inner
                .supervisors
                .lock()
                .unwrap()
                .insert(channel, handle);
        }
        Ok(Subscription {
            inner: self.inner.clone(),
            token: Some(token),
        })
    }

    /// Watch a channel's connection health, e.g. to render a
    /// "reconnecting" affordance. None if the string is malformed or the
    /// channel currently has no subscribers.
    pub fn connection_status(&self, raw: &str) -> Option<watch::Receiver<ConnectionStatus>> {
        let channel = ChannelName::parse(raw).ok()?;
        self.inner
            .supervisors
            .lock()
            .unwrap()
            .get(&channel)
            .map(SupervisorHandle::status)
    }

    /// Interval refetch fallback for one entity; see [`PollScheduler`].
    pub fn poll_entity(&self, entity_key: impl Into<String>, options: PollOptions) {
        self.inner.poller.schedule(entity_key, options);
    }

    pub fn stop_polling(&self, entity_key: &str) {
        self.inner.poller.cancel(entity_key);
    }

    /// At-most-once-in-flight wrapper for state-changing actions; see
    /// [`MutationGuard`].
    pub async fn guarded_action<T, F, Fut>(&self, action_key: &str, perform: F) -> Guarded<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.inner.guard.run(action_key, perform).await
    }

    /// Tear down every connection and poll task. Outstanding subscriptions
    /// become inert; dropping them afterwards is a no-op.
    pub async fn shutdown(&self) {
        let handles: Vec<SupervisorHandle> = {
            let mut supervisors = self.inner.supervisors.lock().unwrap();
            supervisors.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.join().await;
        }
        self.inner.poller.cancel_all();
    }
}

/// A live consumer registration. Unsubscribes on drop; the last
/// subscription for a channel tears its connection down with it.
pub struct Subscription {
    inner: Arc<ClientInner>,
    token: Option<SubscriptionToken>,
}

impl Subscription {
    pub fn channel(&self) -> Option<&ChannelName> {
        self.token.as_ref().map(|token| &token.channel)
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let last = self.inner.registry.unsubscribe(&token);
        if last {
            if let Some(handle) = self
                .inner
                .supervisors
                .lock()
                .unwrap()
                .remove(&token.channel)
            {
                handle.shutdown();
            }
            debug!(channel = %token.channel, "channel_torn_down");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
