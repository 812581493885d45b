//! Ownership of the live transport handle.
//!
//! The application holds one [`TransportManager`] and passes it by reference
//! to whatever needs a transport. Asking for a transport with the same
//! configuration key returns the existing handle; a different key closes the
//! old handle exactly once before a new one is built.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::TransportConfig;
use crate::error::Result;
use crate::link::memory::MemoryRelay;
use crate::mailbox::{HelperCache, Mailbox};
use crate::relay::RelayTransport;
use crate::transport::DeliveryTransport;

/// Builds transports from configuration.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn build(&self, config: &TransportConfig) -> Result<Arc<dyn DeliveryTransport>>;
}

/// Factory for transports over an in-process [`MemoryRelay`].
pub struct MemoryTransportFactory {
    relay: Arc<MemoryRelay>,
    mailbox: Option<Arc<dyn Mailbox>>,
}

impl MemoryTransportFactory {
    pub fn new(relay: Arc<MemoryRelay>) -> Self {
        Self {
            relay,
            mailbox: None,
        }
    }

    pub fn with_mailbox(mut self, mailbox: Arc<dyn Mailbox>) -> Self {
        self.mailbox = Some(mailbox);
        self
    }

    fn cache(&self, config: &TransportConfig) -> HelperCache {
        match &self.mailbox {
            Some(mailbox) => HelperCache::new(
                Arc::clone(mailbox),
                config.mailbox_retry.clone(),
                Duration::from_millis(config.request_timeout_ms),
            ),
            None => HelperCache::disabled(),
        }
    }
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn build(&self, config: &TransportConfig) -> Result<Arc<dyn DeliveryTransport>> {
        let transport =
            RelayTransport::connect(config.clone(), self.relay.create_link(), self.cache(config))
                .await?;
        Ok(Arc::new(transport))
    }
}

/// Caller-owned holder of the live transport.
pub struct TransportManager<F> {
    factory: F,
    current: Mutex<Option<Arc<dyn DeliveryTransport>>>,
}

impl<F: TransportFactory> TransportManager<F> {
    pub fn new(factory: F) -> Self {
        Self {
            factory,
            current: Mutex::new(None),
        }
    }

    /// Return the live transport for `config`, replacing it if the key
    /// differs or the live one was closed.
    pub async fn get_or_connect(&self, config: &TransportConfig) -> Result<Arc<dyn DeliveryTransport>> {
        let key = config.config_key();
        let mut current = self.current.lock().await;

        if let Some(existing) = current.as_ref() {
            if existing.config_key() == &key && !existing.is_closed() {
                return Ok(Arc::clone(existing));
            }
        }

        if let Some(previous) = current.take() {
            tracing::info!(
                from = %previous.config_key(),
                to = %key,
                "replacing transport"
            );
            previous.close().await;
        }

        let transport = self.factory.build(config).await?;
        *current = Some(Arc::clone(&transport));
        Ok(transport)
    }

    /// The live transport, if any.
    pub async fn current(&self) -> Option<Arc<dyn DeliveryTransport>> {
        self.current.lock().await.clone()
    }

    /// Close and forget the live transport.
    pub async fn shutdown(&self) {
        if let Some(previous) = self.current.lock().await.take() {
            previous.close().await;
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigKey, RelayMode};
    use crate::events::{AckPayload, MessagePayload};
    use crate::telemetry::TelemetryEvent;
    use crate::transport::{EventHandler, Subscription, SubscriptionRegistry};
    use serde_json::Value;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use threadkey_core::ThreadId;
    use tokio::sync::broadcast;

    struct StubTransport {
        key: ConfigKey,
        mode: RelayMode,
        closes: Arc<AtomicUsize>,
        closed: AtomicBool,
        registry: SubscriptionRegistry,
    }

    #[async_trait]
    impl DeliveryTransport for StubTransport {
        fn mode(&self) -> RelayMode {
            self.mode
        }

        fn config_key(&self) -> &ConfigKey {
            &self.key
        }

        async fn subscribe(&self, thread_id: &ThreadId, handler: EventHandler) -> Result<Subscription> {
            Ok(self.registry.add(thread_id, handler)?.0)
        }

        async fn publish_message(&self, _: &ThreadId, _: MessagePayload) -> Result<()> {
            Ok(())
        }

        async fn publish_ack(&self, _: &ThreadId, _: AckPayload) -> Result<()> {
            Ok(())
        }

        async fn publish_control(&self, _: &ThreadId, _: &str, _: Value) -> Result<()> {
            Ok(())
        }

        async fn publish_typing(&self, _: &ThreadId, _: &str, _: bool) -> Result<()> {
            Ok(())
        }

        fn telemetry(&self) -> broadcast::Receiver<TelemetryEvent> {
            broadcast::channel(1).1
        }

        async fn close(&self) {
            if !self.closed.swap(true, Ordering::SeqCst) {
                self.closes.fetch_add(1, Ordering::SeqCst);
                self.registry.clear();
            }
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        builds: AtomicUsize,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TransportFactory for CountingFactory {
        async fn build(&self, config: &TransportConfig) -> Result<Arc<dyn DeliveryTransport>> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(StubTransport {
                key: config.config_key(),
                mode: config.mode,
                closes: Arc::clone(&self.closes),
                closed: AtomicBool::new(false),
                registry: SubscriptionRegistry::new(),
            }))
        }
    }

    fn guest() -> TransportConfig {
        TransportConfig::new(RelayMode::DirectRelay, "relay.test", "abcd")
    }

    #[tokio::test]
    async fn test_same_key_reuses_handle() {
        let manager = TransportManager::new(CountingFactory::default());
        let a = manager.get_or_connect(&guest()).await.unwrap();
        // Wallet and tuning changes do not affect the key.
        let mut tuned = guest().with_wallet("w1");
        tuned.heartbeat_interval_ms = 5_000;
        let b = manager.get_or_connect(&tuned).await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(manager.factory().builds.load(Ordering::SeqCst), 1);
        assert_eq!(manager.factory().closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_new_key_closes_previous_once() {
        let manager = TransportManager::new(CountingFactory::default());
        let first = manager.get_or_connect(&guest()).await.unwrap();

        let linked = TransportConfig::new(RelayMode::StoreAndForward, "relay.test", "abcd");
        let second = manager.get_or_connect(&linked).await.unwrap();
        let again = manager.get_or_connect(&linked).await.unwrap();

        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert!(Arc::ptr_eq(&second, &again));
        assert_eq!(second.mode(), RelayMode::StoreAndForward);
        assert_eq!(manager.factory().builds.load(Ordering::SeqCst), 2);
        assert_eq!(manager.factory().closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closed_handle_is_rebuilt() {
        let manager = TransportManager::new(CountingFactory::default());
        let first = manager.get_or_connect(&guest()).await.unwrap();
        first.close().await;

        let second = manager.get_or_connect(&guest()).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(manager.factory().closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_live_handle() {
        let manager = TransportManager::new(CountingFactory::default());
        let live = manager.get_or_connect(&guest()).await.unwrap();
        manager.shutdown().await;
        manager.shutdown().await;

        assert!(live.is_closed());
        assert!(manager.current().await.is_none());
        assert_eq!(manager.factory().closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_memory_factory_builds_relay_transport() {
        let relay = MemoryRelay::new();
        let manager = TransportManager::new(MemoryTransportFactory::new(relay.clone()));
        let transport = manager.get_or_connect(&guest()).await.unwrap();

        assert_eq!(transport.mode(), RelayMode::DirectRelay);
        assert_eq!(relay.connect_count(), 1);
        manager.shutdown().await;
    }
}
