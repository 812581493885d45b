//! Delivery transport abstraction.
//!
//! A transport publishes typed [`ThreadEvent`]s to the peers of a thread and
//! hands incoming ones to local subscribers. Subscriptions are explicit
//! tokens; dropping interest is `Subscription::unsubscribe`.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};

use async_trait::async_trait;
use serde_json::Value;
use threadkey_core::ThreadId;
use tokio::sync::broadcast;

use crate::config::{ConfigKey, RelayMode};
use crate::error::{Result, TransportError};
use crate::events::{AckPayload, MessagePayload, ThreadEvent};
use crate::telemetry::TelemetryEvent;

/// Callback invoked for every event on a subscribed thread.
pub type EventHandler = Arc<dyn Fn(&ThreadEvent) + Send + Sync>;

/// Transport for thread events.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    fn mode(&self) -> RelayMode;

    /// Key of the configuration this transport was built from.
    fn config_key(&self) -> &ConfigKey;

    // ─────────────────────────────────────────────────────────────────────────
    // Subscriptions
    // ─────────────────────────────────────────────────────────────────────────

    /// Register `handler` for events on `thread_id`.
    async fn subscribe(&self, thread_id: &ThreadId, handler: EventHandler) -> Result<Subscription>;

    // ─────────────────────────────────────────────────────────────────────────
    // Publishing
    // ─────────────────────────────────────────────────────────────────────────

    /// Publish a chat message.
    ///
    /// Returns once the message is accepted. Delivery is reported later as
    /// an ack to local subscribers when the payload carries an id.
    async fn publish_message(&self, thread_id: &ThreadId, payload: MessagePayload) -> Result<()>;

    async fn publish_ack(&self, thread_id: &ThreadId, payload: AckPayload) -> Result<()>;

    async fn publish_control(&self, thread_id: &ThreadId, action: &str, data: Value) -> Result<()>;

    async fn publish_typing(&self, thread_id: &ThreadId, author: &str, typing: bool) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Telemetry stream: status, heartbeat and reconnect events.
    fn telemetry(&self) -> broadcast::Receiver<TelemetryEvent>;

    /// Stop background work and drop all subscriptions. Idempotent.
    async fn close(&self);

    fn is_closed(&self) -> bool;
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    closed: bool,
    handlers: BTreeMap<ThreadId, BTreeMap<u64, EventHandler>>,
}

/// Handlers by thread, shared between a transport and its subscriptions.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<RwLock<RegistryState>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler. The flag is `true` when it is the first for the thread.
    pub fn add(&self, thread_id: &ThreadId, handler: EventHandler) -> Result<(Subscription, bool)> {
        let mut state = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(TransportError::Closed);
        }
        state.next_id += 1;
        let id = state.next_id;
        let handlers = state.handlers.entry(thread_id.clone()).or_default();
        let first = handlers.is_empty();
        handlers.insert(id, handler);

        let subscription = Subscription {
            thread_id: thread_id.clone(),
            id,
            registry: Arc::downgrade(&self.inner),
        };
        Ok((subscription, first))
    }

    /// Remove one handler. Returns `true` if the thread has none left.
    pub fn remove(&self, thread_id: &ThreadId, id: u64) -> bool {
        let mut state = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        remove_handler(&mut state, thread_id, id)
    }

    /// Call every handler of `thread_id`. Returns how many ran.
    ///
    /// Handlers run outside the lock, so they may subscribe or unsubscribe.
    pub fn dispatch(&self, thread_id: &ThreadId, event: &ThreadEvent) -> usize {
        let handlers: Vec<EventHandler> = {
            let state = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            match state.handlers.get(thread_id) {
                Some(handlers) => handlers.values().cloned().collect(),
                None => return 0,
            }
        };
        for handler in &handlers {
            handler(event);
        }
        handlers.len()
    }

    /// Threads with at least one handler.
    pub fn threads(&self) -> Vec<ThreadId> {
        let state = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        state.handlers.keys().cloned().collect()
    }

    pub fn count(&self, thread_id: &ThreadId) -> usize {
        let state = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        state.handlers.get(thread_id).map_or(0, BTreeMap::len)
    }

    /// Drop every handler and refuse new ones.
    pub fn clear(&self) {
        let mut state = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        state.handlers.clear();
    }
}

fn remove_handler(state: &mut RegistryState, thread_id: &ThreadId, id: u64) -> bool {
    let Some(handlers) = state.handlers.get_mut(thread_id) else {
        return false;
    };
    if handlers.remove(&id).is_none() {
        return false;
    }
    if handlers.is_empty() {
        state.handlers.remove(thread_id);
        return true;
    }
    false
}

/// Token for one registered handler.
#[derive(Debug)]
pub struct Subscription {
    thread_id: ThreadId,
    id: u64,
    registry: Weak<RwLock<RegistryState>>,
}

impl Subscription {
    pub fn thread_id(&self) -> &ThreadId {
        &self.thread_id
    }

    /// Remove the handler. Safe after the transport is closed or dropped.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.registry.upgrade() {
            let mut state = inner.write().unwrap_or_else(PoisonError::into_inner);
            remove_handler(&mut state, &self.thread_id, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::TypingPayload;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, EventHandler) {
        let hits = Arc::new(AtomicUsize::new(0));
        let handler_hits = hits.clone();
        let handler: EventHandler = Arc::new(move |_: &ThreadEvent| {
            handler_hits.fetch_add(1, Ordering::SeqCst);
        });
        (hits, handler)
    }

    fn typing() -> ThreadEvent {
        ThreadEvent::Typing(TypingPayload {
            author: "a".into(),
            typing: true,
        })
    }

    #[test]
    fn test_dispatch_reaches_thread_handlers() {
        let registry = SubscriptionRegistry::new();
        let t1 = ThreadId::new("t1");
        let (hits, handler) = counter();

        let (_sub, first) = registry.add(&t1, handler.clone()).unwrap();
        assert!(first);
        let (_sub2, first) = registry.add(&t1, handler).unwrap();
        assert!(!first);

        assert_eq!(registry.dispatch(&t1, &typing()), 2);
        assert_eq!(registry.dispatch(&ThreadId::new("t2"), &typing()), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe_after_clear_is_harmless() {
        let registry = SubscriptionRegistry::new();
        let t1 = ThreadId::new("t1");
        let (_, handler) = counter();
        let (sub, _) = registry.add(&t1, handler.clone()).unwrap();

        registry.clear();
        sub.unsubscribe();
        assert!(matches!(registry.add(&t1, handler), Err(TransportError::Closed)));
    }

    #[test]
    fn test_unsubscribe_after_drop_is_harmless() {
        let registry = SubscriptionRegistry::new();
        let (_, handler) = counter();
        let (sub, _) = registry.add(&ThreadId::new("t1"), handler).unwrap();
        drop(registry);
        sub.unsubscribe();
    }

    #[test]
    fn test_last_unsubscribe_empties_thread() {
        let registry = SubscriptionRegistry::new();
        let t1 = ThreadId::new("t1");
        let (_, handler) = counter();
        let (a, _) = registry.add(&t1, handler.clone()).unwrap();
        let (b, _) = registry.add(&t1, handler).unwrap();

        a.unsubscribe();
        assert_eq!(registry.count(&t1), 1);
        b.unsubscribe();
        assert!(registry.threads().is_empty());
    }

    #[test]
    fn test_handler_may_subscribe_during_dispatch() {
        let registry = SubscriptionRegistry::new();
        let t1 = ThreadId::new("t1");
        let nested = registry.clone();
        let inner_thread = t1.clone();
        let handler: EventHandler = Arc::new(move |_: &ThreadEvent| {
            let (_, noop) = counter();
            let _ = nested.add(&inner_thread, noop);
        });
        let _sub = registry.add(&t1, handler).unwrap();

        registry.dispatch(&t1, &typing());
        assert_eq!(registry.count(&t1), 2);
    }
}
