//! Relay-backed delivery transport.
//!
//! [`RelayTransport`] runs over any [`RelayLink`]. It owns two background
//! tasks: a receiver that dispatches incoming frames and drives reconnects,
//! and a heartbeat that pings the relay and drops the link when it stops
//! answering. In store-and-forward mode every durable event is also parked
//! in the thread inbox of the offline mailbox, and inboxes are drained when
//! a thread is first subscribed and after each reconnect.
//!
//! ## Delivery
//!
//! `publish_message` returns once the message is accepted. A task then sends
//! it with retries and, if the payload has an id, reports the outcome as an
//! ack to local subscribers (and best-effort to remote ones):
//!
//! ```text
//! publish_message ──> send (retry) ──┬─> live ok or parked ──> ack delivered
//!                                    └─> both failed ───────> ack failed
//! ```

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use threadkey_core::ThreadId;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{ConfigKey, RelayMode, TransportConfig};
use crate::error::{Result, TransportError};
use crate::events::{
    now_millis, AckPayload, ControlPayload, DeliveryState, Frame, MessagePayload, ThreadEvent,
    TypingPayload,
};
use crate::link::RelayLink;
use crate::mailbox::HelperCache;
use crate::retry::{retry_until_closed, RetryError};
use crate::shutdown::{Shutdown, ShutdownSignal};
use crate::telemetry::{LinkStatus, TelemetryEvent};
use crate::transport::{DeliveryTransport, EventHandler, Subscription, SubscriptionRegistry};

/// Telemetry events buffered per receiver.
const TELEMETRY_CAPACITY: usize = 64;

/// Frame ids remembered for de-duplication.
const SEEN_CAPACITY: usize = 4096;

/// Bounded set of recently seen frame ids.
struct SeenFrames {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenFrames {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    /// Returns `false` if `id` was already seen.
    fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() == SEEN_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.ids.insert(id.to_string());
        true
    }
}

struct Inner<L> {
    config: TransportConfig,
    key: ConfigKey,
    link: L,
    cache: HelperCache,
    registry: SubscriptionRegistry,
    telemetry: broadcast::Sender<TelemetryEvent>,
    shutdown: Shutdown,
    reconnects: AtomicU64,
    seen: Mutex<SeenFrames>,
}

/// Delivery transport over a relay link.
pub struct RelayTransport<L: RelayLink + 'static> {
    inner: Arc<Inner<L>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<L: RelayLink + 'static> RelayTransport<L> {
    /// Validate `config`, connect `link` and start the background tasks.
    ///
    /// Store-and-forward requires a configured `cache`.
    pub async fn connect(config: TransportConfig, link: L, cache: HelperCache) -> Result<Self> {
        config.validate()?;
        if config.mode == RelayMode::StoreAndForward && !cache.is_configured() {
            return Err(TransportError::Misconfigured(
                "store-and-forward requires an offline mailbox".into(),
            ));
        }

        let (telemetry, _) = broadcast::channel(TELEMETRY_CAPACITY);
        let inner = Arc::new(Inner {
            key: config.config_key(),
            config,
            link,
            cache,
            registry: SubscriptionRegistry::new(),
            telemetry,
            shutdown: Shutdown::new(),
            reconnects: AtomicU64::new(0),
            seen: Mutex::new(SeenFrames::new()),
        });

        inner.emit_status(LinkStatus::Connecting);
        inner.link.connect().await.map_err(|err| match err {
            TransportError::Connect(_) => err,
            other => TransportError::Connect(other.to_string()),
        })?;
        inner.emit_status(LinkStatus::Connected);

        let receiver = tokio::spawn(run_receiver(Arc::clone(&inner)));
        let heartbeat = tokio::spawn(run_heartbeat(Arc::clone(&inner)));

        tracing::info!(
            mode = ?inner.config.mode,
            host = %inner.config.relay_host,
            "relay transport connected"
        );

        Ok(Self {
            inner,
            tasks: Mutex::new(vec![receiver, heartbeat]),
        })
    }

    /// Reconnect attempts since this transport was created.
    pub fn reconnect_attempts(&self) -> u64 {
        self.inner.reconnects.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.shutdown.is_triggered() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl<L: RelayLink + 'static> DeliveryTransport for RelayTransport<L> {
    fn mode(&self) -> RelayMode {
        self.inner.config.mode
    }

    fn config_key(&self) -> &ConfigKey {
        &self.inner.key
    }

    async fn subscribe(&self, thread_id: &ThreadId, handler: EventHandler) -> Result<Subscription> {
        self.ensure_open()?;
        let (subscription, first) = self.inner.registry.add(thread_id, handler)?;
        if first {
            if self.inner.link.is_connected() {
                // Rooms are rejoined after a reconnect, so a failure here is recoverable.
                if let Err(err) = self.inner.link.join(thread_id).await {
                    tracing::warn!(thread = %thread_id, error = %err, "join failed");
                }
            }
            self.inner.drain_inbox(thread_id).await;
        }
        Ok(subscription)
    }

    async fn publish_message(&self, thread_id: &ThreadId, payload: MessagePayload) -> Result<()> {
        self.ensure_open()?;
        let message_id = payload.id.clone();
        let frame = Frame::new(&self.inner.config.identity_key, ThreadEvent::Message(payload));
        let bytes = frame.encode()?;

        let inner = Arc::clone(&self.inner);
        let thread_id = thread_id.clone();
        tokio::spawn(async move {
            let Some(delivery) = inner.deliver_message(&thread_id, &frame, bytes).await else {
                return;
            };
            tracing::debug!(thread = %thread_id, frame = %frame.id, ?delivery, "message settled");
            if let Some(message_id) = message_id {
                inner
                    .emit_ack(
                        &thread_id,
                        AckPayload {
                            message_id,
                            delivery,
                            acked_at: now_millis(),
                        },
                    )
                    .await;
            }
        });
        Ok(())
    }

    async fn publish_ack(&self, thread_id: &ThreadId, payload: AckPayload) -> Result<()> {
        self.ensure_open()?;
        self.inner
            .deliver_once(thread_id, ThreadEvent::Ack(payload))
            .await
    }

    async fn publish_control(&self, thread_id: &ThreadId, action: &str, data: Value) -> Result<()> {
        self.ensure_open()?;
        let event = ThreadEvent::Control(ControlPayload {
            action: action.to_string(),
            data,
        });
        self.inner.deliver_once(thread_id, event).await
    }

    async fn publish_typing(&self, thread_id: &ThreadId, author: &str, typing: bool) -> Result<()> {
        self.ensure_open()?;
        let event = ThreadEvent::Typing(TypingPayload {
            author: author.to_string(),
            typing,
        });
        self.inner.deliver_once(thread_id, event).await
    }

    fn telemetry(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.inner.telemetry.subscribe()
    }

    async fn close(&self) {
        if !self.inner.shutdown.trigger() {
            return;
        }
        self.inner.registry.clear();
        self.inner.emit_status(LinkStatus::Closed);
        self.inner.link.disconnect().await;
        self.abort_tasks();
        tracing::info!(host = %self.inner.config.relay_host, "relay transport closed");
    }

    fn is_closed(&self) -> bool {
        self.inner.shutdown.is_triggered()
    }
}

impl<L: RelayLink + 'static> Drop for RelayTransport<L> {
    fn drop(&mut self) {
        self.inner.shutdown.trigger();
        self.abort_tasks();
    }
}

impl<L: RelayLink> Inner<L> {
    fn emit(&self, event: TelemetryEvent) {
        // No receivers is fine.
        let _ = self.telemetry.send(event);
    }

    fn emit_status(&self, status: LinkStatus) {
        self.emit(TelemetryEvent::Status {
            status,
            timestamp: now_millis(),
        });
    }

    fn parks_events(&self) -> bool {
        self.config.mode == RelayMode::StoreAndForward
    }

    /// Send a message frame with retries; returns `None` if cancelled.
    async fn deliver_message(
        &self,
        thread_id: &ThreadId,
        frame: &Frame,
        bytes: Bytes,
    ) -> Option<DeliveryState> {
        let signal = self.shutdown.signal();
        let live = retry_until_closed("relay.send", &self.config.mailbox_retry, &signal, |_| {
            self.link.send(thread_id, bytes.clone())
        })
        .await;

        let live_ok = match live {
            Ok(()) => true,
            Err(RetryError::Cancelled) => return None,
            Err(RetryError::Exhausted(err)) => {
                tracing::warn!(thread = %thread_id, error = %err, "live send failed");
                false
            }
        };

        let parked = if self.parks_events() {
            match self.cache.append_to_inbox(thread_id, frame).await {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(thread = %thread_id, error = %err, "could not park message");
                    false
                }
            }
        } else {
            false
        };

        if signal.is_triggered() {
            return None;
        }
        Some(if live_ok || parked {
            DeliveryState::Delivered
        } else {
            DeliveryState::Failed
        })
    }

    /// Single attempt for non-message events.
    async fn deliver_once(&self, thread_id: &ThreadId, event: ThreadEvent) -> Result<()> {
        let frame = Frame::new(&self.config.identity_key, event);
        let live = self.link.send(thread_id, frame.encode()?).await;

        if self.parks_events() && frame.event.is_durable() {
            self.cache.append_to_inbox(thread_id, &frame).await?;
            if let Err(err) = live {
                tracing::debug!(thread = %thread_id, error = %err, "relay down, event parked");
            }
            return Ok(());
        }
        live.map_err(|err| TransportError::Publish(err.to_string()))
    }

    async fn emit_ack(&self, thread_id: &ThreadId, ack: AckPayload) {
        let event = ThreadEvent::Ack(ack);
        self.registry.dispatch(thread_id, &event);

        let frame = Frame::new(&self.config.identity_key, event);
        if let Ok(bytes) = frame.encode() {
            if let Err(err) = self.link.send(thread_id, bytes).await {
                tracing::debug!(thread = %thread_id, error = %err, "remote ack not sent");
            }
        }
    }

    fn handle_bytes(&self, thread_id: &ThreadId, bytes: &[u8]) {
        match Frame::decode(bytes) {
            Ok(frame) => self.accept_frame(thread_id, frame),
            Err(err) => {
                tracing::warn!(thread = %thread_id, error = %err, "dropping undecodable frame");
            }
        }
    }

    fn accept_frame(&self, thread_id: &ThreadId, frame: Frame) {
        if frame.sender.eq_ignore_ascii_case(&self.config.identity_key) {
            return;
        }
        let fresh = self
            .seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(&frame.id);
        if !fresh {
            return;
        }
        self.registry.dispatch(thread_id, &frame.event);
    }

    async fn drain_inbox(&self, thread_id: &ThreadId) {
        if !self.parks_events() {
            return;
        }
        let reader = &self.config.identity_key;
        let frames = match self.cache.read_inbox_since(thread_id, reader).await {
            Ok(frames) => frames,
            Err(err) => {
                tracing::warn!(thread = %thread_id, error = %err, "inbox drain failed");
                return;
            }
        };
        let Some(last) = frames.last().map(|frame| frame.id.clone()) else {
            return;
        };
        tracing::debug!(thread = %thread_id, count = frames.len(), "draining inbox");
        for frame in frames {
            self.accept_frame(thread_id, frame);
        }
        // A lost cursor only means a replay on the next drain.
        if let Err(err) = self.cache.advance_cursor(thread_id, reader, &last).await {
            tracing::warn!(thread = %thread_id, error = %err, "could not advance inbox cursor");
        }
    }

    /// Reconnect with the configured schedule. Returns `false` on shutdown.
    async fn reconnect(&self, signal: &ShutdownSignal) -> bool {
        self.emit_status(LinkStatus::Disconnected);
        let schedule = self.config.reconnect_schedule();
        let mut attempt = 0u64;
        loop {
            attempt += 1;
            tokio::select! {
                _ = signal.wait() => return false,
                _ = tokio::time::sleep(schedule.delay_for(attempt)) => {}
            }

            let attempts = self.reconnects.fetch_add(1, Ordering::SeqCst) + 1;
            self.emit(TelemetryEvent::Reconnect {
                attempts,
                timestamp: now_millis(),
            });
            self.emit_status(LinkStatus::Connecting);

            match self.link.connect().await {
                Ok(()) => break,
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "reconnect failed");
                    self.emit_status(LinkStatus::Disconnected);
                }
            }
        }
        if signal.is_triggered() {
            return false;
        }

        let threads = self.registry.threads();
        for thread_id in &threads {
            if let Err(err) = self.link.join(thread_id).await {
                tracing::warn!(thread = %thread_id, error = %err, "rejoin failed");
            }
        }
        self.emit_status(LinkStatus::Connected);
        tracing::info!(attempt, threads = threads.len(), "relay link restored");

        for thread_id in &threads {
            self.drain_inbox(thread_id).await;
        }
        true
    }
}

async fn run_receiver<L: RelayLink>(inner: Arc<Inner<L>>) {
    let signal = inner.shutdown.signal();
    loop {
        let next = tokio::select! {
            _ = signal.wait() => return,
            next = inner.link.recv() => next,
        };
        match next {
            Ok((thread_id, bytes)) => inner.handle_bytes(&thread_id, &bytes),
            Err(err) => {
                if !matches!(err, TransportError::Disconnected) {
                    tracing::warn!(error = %err, "relay receive failed");
                }
                if !inner.reconnect(&signal).await {
                    return;
                }
            }
        }
    }
}

async fn run_heartbeat<L: RelayLink>(inner: Arc<Inner<L>>) {
    let signal = inner.shutdown.signal();
    let mut ticker = tokio::time::interval(inner.config.heartbeat_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = signal.wait() => return,
            _ = ticker.tick() => {}
        }
        if !inner.link.is_connected() {
            continue;
        }

        let budget = inner.config.request_timeout();
        match tokio::time::timeout(budget, inner.link.ping()).await {
            Ok(Ok(rtt)) => inner.emit(TelemetryEvent::Heartbeat {
                rtt_ms: rtt.as_millis() as u64,
                timestamp: now_millis(),
            }),
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "heartbeat failed, dropping link");
                inner.link.disconnect().await;
            }
            Err(_) => {
                tracing::warn!(timeout_ms = budget.as_millis() as u64, "heartbeat timed out, dropping link");
                inner.link.disconnect().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::memory::MemoryRelay;

    fn config(mode: RelayMode, identity: &str) -> TransportConfig {
        TransportConfig::new(mode, "relay.test", identity)
    }

    #[test]
    fn test_seen_frames_is_bounded() {
        let mut seen = SeenFrames::new();
        assert!(seen.insert("a"));
        assert!(!seen.insert("a"));
        for i in 0..SEEN_CAPACITY {
            seen.insert(&i.to_string());
        }
        assert_eq!(seen.order.len(), SEEN_CAPACITY);
        assert!(seen.insert("a"));
    }

    #[tokio::test]
    async fn test_store_and_forward_requires_mailbox() {
        let relay = MemoryRelay::new();
        let result = RelayTransport::connect(
            config(RelayMode::StoreAndForward, "alice"),
            relay.create_link(),
            HelperCache::disabled(),
        )
        .await;
        assert!(matches!(result, Err(TransportError::Misconfigured(_))));
    }

    #[tokio::test]
    async fn test_unreachable_relay_fails_connect() {
        let relay = MemoryRelay::new();
        relay.set_reachable(false);
        let result = RelayTransport::connect(
            config(RelayMode::DirectRelay, "alice"),
            relay.create_link(),
            HelperCache::disabled(),
        )
        .await;
        assert!(matches!(result, Err(TransportError::Connect(_))));
    }

    #[tokio::test]
    async fn test_closed_transport_rejects_work() {
        let relay = MemoryRelay::new();
        let transport = RelayTransport::connect(
            config(RelayMode::DirectRelay, "alice"),
            relay.create_link(),
            HelperCache::disabled(),
        )
        .await
        .unwrap();

        transport.close().await;
        transport.close().await;
        assert!(transport.is_closed());

        let thread = ThreadId::new("t1");
        let handler: EventHandler = Arc::new(|_: &ThreadEvent| {});
        assert!(matches!(
            transport.subscribe(&thread, handler).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            transport.publish_typing(&thread, "alice", true).await,
            Err(TransportError::Closed)
        ));
    }
}
