//! Store traits: the read/write contract for local state.
//!
//! Receipts are written by external token-issuance and burn flows and read by
//! access checks. Contacts and conversations back the safety-number monitor
//! and the message history.

use async_trait::async_trait;
use threadkey_core::{ChatMessage, Contact, ContactUpdate, Conversation, JoinReceipt, ThreadId};

use crate::error::Result;

/// Keyed persistence of join receipts.
#[async_trait]
pub trait ReceiptStore: Send + Sync {
    /// Insert or replace the receipt for `receipt.thread_id`.
    async fn put_receipt(&self, receipt: &JoinReceipt) -> Result<()>;

    /// Get the receipt for a thread.
    async fn get_receipt(&self, thread_id: &ThreadId) -> Result<Option<JoinReceipt>>;

    /// All thread ids with a stored receipt, sorted.
    async fn list_threads(&self) -> Result<Vec<ThreadId>>;
}

/// Contact verification state.
#[async_trait]
pub trait ContactStore: Send + Sync {
    async fn get_contact(&self, pubkey: &str) -> Result<Option<Contact>>;

    /// Insert or fully replace a contact.
    async fn put_contact(&self, contact: &Contact) -> Result<()>;

    /// Apply `update` to the contact, creating it if absent.
    ///
    /// Returns the contact as stored.
    async fn upsert_contact(&self, pubkey: &str, update: &ContactUpdate) -> Result<Contact>;

    async fn list_contacts(&self) -> Result<Vec<Contact>>;
}

/// Conversations and their message history.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Conversations
    // ─────────────────────────────────────────────────────────────────────────

    async fn put_conversation(&self, conversation: &Conversation) -> Result<()>;

    async fn get_conversation(&self, thread_id: &ThreadId) -> Result<Option<Conversation>>;

    async fn list_conversations(&self) -> Result<Vec<Conversation>>;

    /// Set the "safety warning sent" flag. Fails with `NotFound` for an
    /// unknown thread.
    async fn mark_safety_warning(&self, thread_id: &ThreadId) -> Result<()>;

    // ─────────────────────────────────────────────────────────────────────────
    // Messages
    // ─────────────────────────────────────────────────────────────────────────

    /// Append to a thread's history.
    async fn append_message(&self, thread_id: &ThreadId, message: &ChatMessage) -> Result<()>;

    /// A thread's history in append order.
    async fn messages(&self, thread_id: &ThreadId) -> Result<Vec<ChatMessage>>;

    /// Whether the thread's history holds a message with `message_id`.
    async fn has_message(&self, thread_id: &ThreadId, message_id: &str) -> Result<bool>;
}

/// Everything a client persists.
pub trait Store: ReceiptStore + ContactStore + ConversationStore {}

impl<T: ReceiptStore + ContactStore + ConversationStore> Store for T {}
