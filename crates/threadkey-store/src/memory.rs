//! In-memory implementation of the store traits.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use threadkey_core::{ChatMessage, Contact, ContactUpdate, Conversation, JoinReceipt, ThreadId};

use crate::error::{Result, StoreError};
use crate::traits::{ContactStore, ConversationStore, ReceiptStore};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    receipts: BTreeMap<ThreadId, JoinReceipt>,
    contacts: BTreeMap<String, Contact>,
    conversations: BTreeMap<ThreadId, Conversation>,
    messages: HashMap<ThreadId, Vec<ChatMessage>>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReceiptStore for MemoryStore {
    async fn put_receipt(&self, receipt: &JoinReceipt) -> Result<()> {
        self.write()?
            .receipts
            .insert(receipt.thread_id.clone(), receipt.clone());
        Ok(())
    }

    async fn get_receipt(&self, thread_id: &ThreadId) -> Result<Option<JoinReceipt>> {
        Ok(self.read()?.receipts.get(thread_id).cloned())
    }

    async fn list_threads(&self) -> Result<Vec<ThreadId>> {
        Ok(self.read()?.receipts.keys().cloned().collect())
    }
}

#[async_trait]
impl ContactStore for MemoryStore {
    async fn get_contact(&self, pubkey: &str) -> Result<Option<Contact>> {
        Ok(self.read()?.contacts.get(pubkey).cloned())
    }

    async fn put_contact(&self, contact: &Contact) -> Result<()> {
        self.write()?
            .contacts
            .insert(contact.pubkey.clone(), contact.clone());
        Ok(())
    }

    async fn upsert_contact(&self, pubkey: &str, update: &ContactUpdate) -> Result<Contact> {
        let mut inner = self.write()?;
        let contact = inner
            .contacts
            .entry(pubkey.to_string())
            .or_insert_with(|| Contact::new(pubkey));
        contact.apply(update);
        Ok(contact.clone())
    }

    async fn list_contacts(&self) -> Result<Vec<Contact>> {
        Ok(self.read()?.contacts.values().cloned().collect())
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn put_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.write()?
            .conversations
            .insert(conversation.thread_id.clone(), conversation.clone());
        Ok(())
    }

    async fn get_conversation(&self, thread_id: &ThreadId) -> Result<Option<Conversation>> {
        Ok(self.read()?.conversations.get(thread_id).cloned())
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        Ok(self.read()?.conversations.values().cloned().collect())
    }

    async fn mark_safety_warning(&self, thread_id: &ThreadId) -> Result<()> {
        let mut inner = self.write()?;
        let conversation = inner
            .conversations
            .get_mut(thread_id)
            .ok_or_else(|| StoreError::NotFound(format!("conversation {thread_id}")))?;
        conversation.safety_warning_sent = true;
        Ok(())
    }

    async fn append_message(&self, thread_id: &ThreadId, message: &ChatMessage) -> Result<()> {
        self.write()?
            .messages
            .entry(thread_id.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn messages(&self, thread_id: &ThreadId) -> Result<Vec<ChatMessage>> {
        Ok(self
            .read()?
            .messages
            .get(thread_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn has_message(&self, thread_id: &ThreadId, message_id: &str) -> Result<bool> {
        Ok(self
            .read()?
            .messages
            .get(thread_id)
            .is_some_and(|history| history.iter().any(|m| m.id.as_deref() == Some(message_id))))
    }
}
