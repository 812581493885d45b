//! Relay link abstraction.
//!
//! A link is one client connection to the relay. It joins thread rooms,
//! sends opaque frames to the other members of a room and receives theirs.
//! Implementations may use WebSockets or any other socket protocol; the
//! transport only needs the operations below.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use threadkey_core::ThreadId;

use crate::error::Result;

/// One connection to the relay.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait RelayLink: Send + Sync {
    /// Open (or reopen) the connection.
    async fn connect(&self) -> Result<()>;

    /// Join the room of `thread_id`. Rooms are forgotten on disconnect.
    async fn join(&self, thread_id: &ThreadId) -> Result<()>;

    /// Leave the room of `thread_id`.
    async fn leave(&self, thread_id: &ThreadId) -> Result<()>;

    /// Send a frame to every other member of the room.
    async fn send(&self, thread_id: &ThreadId, frame: Bytes) -> Result<()>;

    /// Receive the next frame from any joined room.
    ///
    /// Fails with `Disconnected` when the connection is down or drops while
    /// waiting.
    async fn recv(&self) -> Result<(ThreadId, Bytes)>;

    /// Round trip to the relay.
    async fn ping(&self) -> Result<Duration>;

    /// Drop the connection. Pending `recv` calls return `Disconnected`.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;
}

/// An in-process relay for tests and demos.
///
/// Links created from one [`MemoryRelay`] route frames to each other. The
/// relay can be made unreachable or asked to sever every connection to
/// exercise reconnect paths.
pub mod memory {
    use super::*;
    use crate::error::TransportError;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
    use tokio::sync::{mpsc, watch};

    struct Slot {
        tx: mpsc::UnboundedSender<(ThreadId, Bytes)>,
        state: watch::Sender<bool>,
        rooms: HashSet<ThreadId>,
    }

    impl Slot {
        fn is_connected(&self) -> bool {
            *self.state.borrow()
        }

        fn drop_connection(&mut self) {
            self.rooms.clear();
            self.state.send_replace(false);
        }
    }

    /// Shared state of the in-process relay.
    pub struct MemoryRelay {
        slots: Mutex<HashMap<u64, Slot>>,
        next_id: AtomicU64,
        reachable: AtomicBool,
        latency_ms: AtomicU64,
        connects: AtomicU64,
    }

    impl MemoryRelay {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Create a link on this relay. It starts disconnected.
        pub fn create_link(self: &Arc<Self>) -> MemoryLink {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::unbounded_channel();
            let (state, state_rx) = watch::channel(false);
            self.slots().insert(
                id,
                Slot {
                    tx,
                    state,
                    rooms: HashSet::new(),
                },
            );
            MemoryLink {
                id,
                relay: Arc::clone(self),
                inbox: tokio::sync::Mutex::new(rx),
                state: state_rx,
            }
        }

        /// Simulate an outage. While unreachable, live links are dropped and
        /// new connections are refused.
        pub fn set_reachable(&self, reachable: bool) {
            self.reachable.store(reachable, Ordering::SeqCst);
            if !reachable {
                self.sever_all();
            }
        }

        pub fn is_reachable(&self) -> bool {
            self.reachable.load(Ordering::SeqCst)
        }

        /// Drop every live connection without refusing new ones.
        pub fn sever_all(&self) {
            for slot in self.slots().values_mut() {
                slot.drop_connection();
            }
        }

        /// Delay added to every ping.
        pub fn set_latency(&self, latency: Duration) {
            self.latency_ms
                .store(latency.as_millis() as u64, Ordering::SeqCst);
        }

        /// Successful connects across all links.
        pub fn connect_count(&self) -> u64 {
            self.connects.load(Ordering::SeqCst)
        }

        /// Number of connected links in the room of `thread_id`.
        pub fn room_size(&self, thread_id: &ThreadId) -> usize {
            self.slots()
                .values()
                .filter(|slot| slot.is_connected() && slot.rooms.contains(thread_id))
                .count()
        }

        fn slots(&self) -> MutexGuard<'_, HashMap<u64, Slot>> {
            self.slots.lock().unwrap_or_else(PoisonError::into_inner)
        }

        fn latency(&self) -> Duration {
            Duration::from_millis(self.latency_ms.load(Ordering::SeqCst))
        }
    }

    impl Default for MemoryRelay {
        fn default() -> Self {
            Self {
                slots: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                reachable: AtomicBool::new(true),
                latency_ms: AtomicU64::new(0),
                connects: AtomicU64::new(0),
            }
        }
    }

    /// A link created by [`MemoryRelay::create_link`].
    pub struct MemoryLink {
        id: u64,
        relay: Arc<MemoryRelay>,
        inbox: tokio::sync::Mutex<mpsc::UnboundedReceiver<(ThreadId, Bytes)>>,
        state: watch::Receiver<bool>,
    }

    impl MemoryLink {
        fn with_slot<T>(&self, f: impl FnOnce(&mut Slot) -> Result<T>) -> Result<T> {
            let mut slots = self.relay.slots();
            let slot = slots.get_mut(&self.id).ok_or(TransportError::Closed)?;
            if !slot.is_connected() {
                return Err(TransportError::Disconnected);
            }
            f(slot)
        }
    }

    #[async_trait]
    impl RelayLink for MemoryLink {
        async fn connect(&self) -> Result<()> {
            if !self.relay.is_reachable() {
                return Err(TransportError::Connect("relay unreachable".into()));
            }
            let mut slots = self.relay.slots();
            let slot = slots.get_mut(&self.id).ok_or(TransportError::Closed)?;
            slot.state.send_replace(true);
            self.relay.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn join(&self, thread_id: &ThreadId) -> Result<()> {
            self.with_slot(|slot| {
                slot.rooms.insert(thread_id.clone());
                Ok(())
            })
        }

        async fn leave(&self, thread_id: &ThreadId) -> Result<()> {
            self.with_slot(|slot| {
                slot.rooms.remove(thread_id);
                Ok(())
            })
        }

        async fn send(&self, thread_id: &ThreadId, frame: Bytes) -> Result<()> {
            let mut slots = self.relay.slots();
            match slots.get(&self.id) {
                Some(slot) if slot.is_connected() => {}
                Some(_) => return Err(TransportError::Disconnected),
                None => return Err(TransportError::Closed),
            }
            for (id, slot) in slots.iter_mut() {
                if *id == self.id || !slot.is_connected() || !slot.rooms.contains(thread_id) {
                    continue;
                }
                // A dropped receiver means the peer link is gone.
                let _ = slot.tx.send((thread_id.clone(), frame.clone()));
            }
            Ok(())
        }

        async fn recv(&self) -> Result<(ThreadId, Bytes)> {
            let mut state = self.state.clone();
            if !*state.borrow_and_update() {
                return Err(TransportError::Disconnected);
            }
            let mut inbox = self.inbox.lock().await;
            tokio::select! {
                item = inbox.recv() => item.ok_or(TransportError::Closed),
                _ = wait_down(&mut state) => Err(TransportError::Disconnected),
            }
        }

        async fn ping(&self) -> Result<Duration> {
            if !self.is_connected() {
                return Err(TransportError::Disconnected);
            }
            let started = tokio::time::Instant::now();
            let latency = self.relay.latency();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if !self.is_connected() {
                return Err(TransportError::Disconnected);
            }
            Ok(started.elapsed())
        }

        async fn disconnect(&self) {
            if let Some(slot) = self.relay.slots().get_mut(&self.id) {
                slot.drop_connection();
            }
        }

        fn is_connected(&self) -> bool {
            *self.state.borrow()
        }
    }

    impl Drop for MemoryLink {
        fn drop(&mut self) {
            self.relay.slots().remove(&self.id);
        }
    }

    async fn wait_down(state: &mut watch::Receiver<bool>) {
        loop {
            if state.changed().await.is_err() || !*state.borrow() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryRelay;
    use super::*;
    use crate::error::TransportError;

    #[tokio::test]
    async fn test_frames_reach_room_members_only() {
        let relay = MemoryRelay::new();
        let a = relay.create_link();
        let b = relay.create_link();
        let c = relay.create_link();
        let thread = ThreadId::new("t1");

        for link in [&a, &b, &c] {
            link.connect().await.unwrap();
        }
        a.join(&thread).await.unwrap();
        b.join(&thread).await.unwrap();
        assert_eq!(relay.room_size(&thread), 2);

        a.send(&thread, Bytes::from_static(b"hello")).await.unwrap();
        let (from_thread, frame) = b.recv().await.unwrap();
        assert_eq!(from_thread, thread);
        assert_eq!(&frame[..], b"hello");

        let nothing =
            tokio::time::timeout(Duration::from_millis(20), c.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_sever_wakes_receiver_and_forgets_rooms() {
        let relay = MemoryRelay::new();
        let a = relay.create_link();
        let thread = ThreadId::new("t1");
        a.connect().await.unwrap();
        a.join(&thread).await.unwrap();

        let relay_ref = relay.clone();
        let severer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            relay_ref.sever_all();
        });
        assert!(matches!(a.recv().await, Err(TransportError::Disconnected)));
        severer.await.unwrap();

        assert!(!a.is_connected());
        a.connect().await.unwrap();
        assert_eq!(relay.room_size(&thread), 0);
        assert_eq!(relay.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_relay_refuses_connect() {
        let relay = MemoryRelay::new();
        let a = relay.create_link();
        relay.set_reachable(false);

        assert!(matches!(a.connect().await, Err(TransportError::Connect(_))));
        assert!(matches!(a.ping().await, Err(TransportError::Disconnected)));

        relay.set_reachable(true);
        a.connect().await.unwrap();
        assert!(a.ping().await.is_ok());
    }
}
