//! SQLite implementation of the store traits.
//!
//! rusqlite with bundled SQLite, wrapped in async via
//! `tokio::task::spawn_blocking`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use threadkey_core::{
    ChatMessage, Contact, ContactUpdate, Conversation, JoinReceipt, JoinReceiptRecord, ThreadId,
};

use crate::error::{Result, StoreError};
use crate::migration::{self, now_millis};
use crate::traits::{ContactStore, ConversationStore, ReceiptStore};

/// SQLite-based store.
///
/// Thread-safe via internal Mutex. All operations run on the blocking pool.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path.as_ref())?;
        migration::migrate(&mut conn)?;
        tracing::debug!(path = %path.as_ref().display(), "opened sqlite store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| StoreError::Poisoned(e.to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn encode_receipt(receipt: &JoinReceipt) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(receipt, &mut buf)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn decode_receipt(bytes: &[u8]) -> Result<JoinReceipt> {
    let record: JoinReceiptRecord =
        ciborium::from_reader(bytes).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(JoinReceipt::try_from(record)?)
}

fn row_to_contact(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
    Ok(Contact {
        pubkey: row.get("pubkey")?,
        verified: row.get::<_, i64>("verified")? != 0,
        verified_safety_number: row.get("verified_safety_number")?,
        last_verified_safety_number: row.get("last_verified_safety_number")?,
    })
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        thread_id: ThreadId::new(row.get::<_, String>("thread_id")?),
        peer_public_key: row.get("peer_public_key")?,
        self_public_key: row.get("self_public_key")?,
        safety_warning_sent: row.get::<_, i64>("safety_warning_sent")? != 0,
    })
}

#[async_trait]
impl ReceiptStore for SqliteStore {
    async fn put_receipt(&self, receipt: &JoinReceipt) -> Result<()> {
        if receipt.thread_id.is_empty() {
            return Err(threadkey_core::ValidationError::EmptyIdentifier("threadId").into());
        }
        let record = encode_receipt(receipt)?;
        let thread_id = receipt.thread_id.to_string();
        let status = receipt.status.as_str();

        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO join_receipts (thread_id, status, record, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(thread_id) DO UPDATE SET
                    status = excluded.status,
                    record = excluded.record,
                    updated_at = excluded.updated_at",
                params![thread_id, status, record, now_millis()],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_receipt(&self, thread_id: &ThreadId) -> Result<Option<JoinReceipt>> {
        let thread_id = thread_id.to_string();
        let bytes: Option<Vec<u8>> = self
            .blocking(move |conn| {
                Ok(conn
                    .query_row(
                        "SELECT record FROM join_receipts WHERE thread_id = ?1",
                        params![thread_id],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;

        bytes.as_deref().map(decode_receipt).transpose()
    }

    async fn list_threads(&self) -> Result<Vec<ThreadId>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare("SELECT thread_id FROM join_receipts ORDER BY thread_id")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .map(|r| r.map(ThreadId::new))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
        .await
    }
}

#[async_trait]
impl ContactStore for SqliteStore {
    async fn get_contact(&self, pubkey: &str) -> Result<Option<Contact>> {
        let pubkey = pubkey.to_string();
        self.blocking(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM contacts WHERE pubkey = ?1",
                    params![pubkey],
                    row_to_contact,
                )
                .optional()?)
        })
        .await
    }

    async fn put_contact(&self, contact: &Contact) -> Result<()> {
        let contact = contact.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO contacts
                    (pubkey, verified, verified_safety_number, last_verified_safety_number)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    contact.pubkey,
                    contact.verified as i64,
                    contact.verified_safety_number,
                    contact.last_verified_safety_number
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn upsert_contact(&self, pubkey: &str, update: &ContactUpdate) -> Result<Contact> {
        let pubkey = pubkey.to_string();
        let update = update.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO contacts
                    (pubkey, verified, verified_safety_number, last_verified_safety_number)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(pubkey) DO UPDATE SET
                    verified = excluded.verified,
                    verified_safety_number = excluded.verified_safety_number,
                    last_verified_safety_number = excluded.last_verified_safety_number",
                params![
                    pubkey,
                    update.verified as i64,
                    update.verified_safety_number,
                    update.last_verified_safety_number
                ],
            )?;
            Ok(conn.query_row(
                "SELECT * FROM contacts WHERE pubkey = ?1",
                params![pubkey],
                row_to_contact,
            )?)
        })
        .await
    }

    async fn list_contacts(&self) -> Result<Vec<Contact>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM contacts ORDER BY pubkey")?;
            let contacts = stmt
                .query_map([], row_to_contact)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(contacts)
        })
        .await
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn put_conversation(&self, conversation: &Conversation) -> Result<()> {
        let c = conversation.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO conversations
                    (thread_id, peer_public_key, self_public_key, safety_warning_sent)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    c.thread_id.as_str(),
                    c.peer_public_key,
                    c.self_public_key,
                    c.safety_warning_sent as i64
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_conversation(&self, thread_id: &ThreadId) -> Result<Option<Conversation>> {
        let thread_id = thread_id.to_string();
        self.blocking(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT * FROM conversations WHERE thread_id = ?1",
                    params![thread_id],
                    row_to_conversation,
                )
                .optional()?)
        })
        .await
    }

    async fn list_conversations(&self) -> Result<Vec<Conversation>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM conversations ORDER BY thread_id")?;
            let conversations = stmt
                .query_map([], row_to_conversation)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(conversations)
        })
        .await
    }

    async fn mark_safety_warning(&self, thread_id: &ThreadId) -> Result<()> {
        let thread_id = thread_id.to_string();
        self.blocking(move |conn| {
            let changed = conn.execute(
                "UPDATE conversations SET safety_warning_sent = 1 WHERE thread_id = ?1",
                params![thread_id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("conversation {thread_id}")));
            }
            Ok(())
        })
        .await
    }

    async fn append_message(&self, thread_id: &ThreadId, message: &ChatMessage) -> Result<()> {
        let thread_id = thread_id.to_string();
        let m = message.clone();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO messages (thread_id, message_id, author, text, sent_at, system)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![thread_id, m.id, m.author, m.text, m.sent_at, m.system as i64],
            )?;
            Ok(())
        })
        .await
    }

    async fn messages(&self, thread_id: &ThreadId) -> Result<Vec<ChatMessage>> {
        let thread_id = thread_id.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT message_id, author, text, sent_at, system FROM messages
                 WHERE thread_id = ?1 ORDER BY rowid_seq",
            )?;
            let messages = stmt
                .query_map(params![thread_id], |row| {
                    Ok(ChatMessage {
                        id: row.get(0)?,
                        author: row.get(1)?,
                        text: row.get(2)?,
                        sent_at: row.get(3)?,
                        system: row.get::<_, i64>(4)? != 0,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(messages)
        })
        .await
    }

    async fn has_message(&self, thread_id: &ThreadId, message_id: &str) -> Result<bool> {
        let thread_id = thread_id.to_string();
        let message_id = message_id.to_string();
        self.blocking(move |conn| {
            let found: i64 = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM messages WHERE thread_id = ?1 AND message_id = ?2)",
                params![thread_id, message_id],
                |row| row.get(0),
            )?;
            Ok(found != 0)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use threadkey_core::{BurnProof, DtIssuance, IdentityKind};

    #[tokio::test]
    async fn test_receipt_roundtrip_keeps_burn_proof() {
        let store = SqliteStore::open_memory().unwrap();
        let mut receipt = JoinReceipt::new("t1", IdentityKind::Holder)
            .with_control_token("ct1", 1)
            .with_issuance(DtIssuance::new("dt1", [("U", 0)]));
        receipt.record_burn(BurnProof {
            burn_txid: "burn".into(),
            burned_at: 42,
            burned_by: "owner".into(),
        });

        store.put_receipt(&receipt).await.unwrap();
        let loaded = store.get_receipt(&ThreadId::new("t1")).await.unwrap();
        assert_eq!(loaded, Some(receipt));
        assert!(store.get_receipt(&ThreadId::new("t2")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_contact_overwrites_fields() {
        let store = SqliteStore::open_memory().unwrap();
        let mut contact = Contact::new("aa");
        contact.mark_verified("123");
        store.put_contact(&contact).await.unwrap();

        let stored = store
            .upsert_contact("aa", &contact.deverify_update())
            .await
            .unwrap();
        assert!(!stored.verified);
        assert_eq!(stored.verified_safety_number, None);
        assert_eq!(stored.last_verified_safety_number.as_deref(), Some("123"));
    }

    #[tokio::test]
    async fn test_warning_flag_persists() {
        let store = SqliteStore::open_memory().unwrap();
        let t = ThreadId::new("t1");
        store
            .put_conversation(&Conversation::new("t1", "peer", "me"))
            .await
            .unwrap();
        store.mark_safety_warning(&t).await.unwrap();

        let conv = store.get_conversation(&t).await.unwrap().unwrap();
        assert!(conv.safety_warning_sent);
        assert!(matches!(
            store.mark_safety_warning(&ThreadId::new("t2")).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
