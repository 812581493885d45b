//! Ack de-duplication.
//!
//! Acks can arrive more than once: locally and from the relay, or again when
//! a mailbox is drained. The ledger keeps the first terminal state per
//! `(thread, message)` pair and tells callers to ignore the rest. Message ids
//! are only assumed unique within a thread.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use threadkey_core::ThreadId;

use crate::events::{AckPayload, DeliveryState, MessageId};

/// Pairs a ledger remembers by default.
pub const ACK_LEDGER_CAPACITY: usize = 4096;

type AckKey = (ThreadId, MessageId);

#[derive(Debug, Default)]
struct Entries {
    states: HashMap<AckKey, DeliveryState>,
    order: VecDeque<AckKey>,
}

/// First terminal delivery state per `(thread, message)`, oldest forgotten
/// first once `capacity` pairs are held.
#[derive(Debug)]
pub struct AckLedger {
    entries: Mutex<Entries>,
    capacity: usize,
}

impl Default for AckLedger {
    fn default() -> Self {
        Self::with_capacity(ACK_LEDGER_CAPACITY)
    }
}

impl AckLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::default(),
            capacity: capacity.max(1),
        }
    }

    /// Record an ack. Returns `true` if it is the first for its pair and
    /// should be acted on.
    pub fn record(&self, thread_id: &ThreadId, ack: &AckPayload) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (thread_id.clone(), ack.message_id.clone());
        if entries.states.contains_key(&key) {
            return false;
        }
        if entries.order.len() == self.capacity {
            if let Some(oldest) = entries.order.pop_front() {
                entries.states.remove(&oldest);
            }
        }
        entries.order.push_back(key.clone());
        entries.states.insert(key, ack.delivery);
        true
    }

    pub fn state(&self, thread_id: &ThreadId, message_id: &MessageId) -> Option<DeliveryState> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .states
            .get(&(thread_id.clone(), message_id.clone()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .states
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(id: &str, delivery: DeliveryState) -> AckPayload {
        AckPayload {
            message_id: MessageId::new(id),
            delivery,
            acked_at: 0,
        }
    }

    #[test]
    fn test_first_terminal_state_wins() {
        let ledger = AckLedger::new();
        let t = ThreadId::new("t1");

        assert!(ledger.record(&t, &ack("m1", DeliveryState::Failed)));
        assert!(!ledger.record(&t, &ack("m1", DeliveryState::Delivered)));
        assert_eq!(
            ledger.state(&t, &MessageId::new("m1")),
            Some(DeliveryState::Failed)
        );
    }

    #[test]
    fn test_same_id_in_other_thread_is_distinct() {
        let ledger = AckLedger::new();
        assert!(ledger.record(&ThreadId::new("t1"), &ack("m1", DeliveryState::Delivered)));
        assert!(ledger.record(&ThreadId::new("t2"), &ack("m1", DeliveryState::Delivered)));
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_oldest_pairs_are_forgotten_at_capacity() {
        let ledger = AckLedger::with_capacity(2);
        let t = ThreadId::new("t1");
        assert!(ledger.record(&t, &ack("m1", DeliveryState::Delivered)));
        assert!(ledger.record(&t, &ack("m2", DeliveryState::Delivered)));
        assert!(ledger.record(&t, &ack("m3", DeliveryState::Failed)));

        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.state(&t, &MessageId::new("m1")), None);
        assert!(!ledger.record(&t, &ack("m3", DeliveryState::Delivered)));
        assert_eq!(
            ledger.state(&t, &MessageId::new("m3")),
            Some(DeliveryState::Failed)
        );
    }
}
