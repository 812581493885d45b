//! Safety-number change detection.
//!
//! A verified contact carries the safety number the user compared out of
//! band. When the number derived today differs, the contact is de-verified
//! (keeping the old number for display) and every conversation with that
//! peer receives one system warning.
//!
//! Re-running is harmless: de-verified contacts are no longer checked, and a
//! thread that already carries a warning never gets a second one.

use std::sync::Arc;

use async_trait::async_trait;
use threadkey_core::{
    safety_numbers_match, ChatMessage, Contact, ContactUpdate, Conversation, SafetyNumber,
    ThreadId,
};
use threadkey_relay::now_millis;
use threadkey_store::Store;

/// Computes the current safety number for a contact.
#[async_trait]
pub trait SafetyNumberSource: Send + Sync {
    async fn current_safety_number(&self, contact: &Contact) -> anyhow::Result<String>;
}

/// Side effects of the monitor.
#[async_trait]
pub trait SafetyPorts: Send + Sync {
    /// Replace the verification fields of a contact.
    async fn upsert_contact(&self, pubkey: &str, update: &ContactUpdate) -> anyhow::Result<()>;

    /// Whether the thread history already holds a safety warning.
    async fn has_safety_warning(&self, thread_id: &ThreadId) -> anyhow::Result<bool>;

    async fn post_system_message(&self, thread_id: &ThreadId, message: &ChatMessage) -> anyhow::Result<()>;

    /// Remember that `thread_id` was warned.
    async fn mark_warning_sent(&self, thread_id: &ThreadId) -> anyhow::Result<()>;
}

/// Input of one monitor run.
#[derive(Debug, Clone, Default)]
pub struct SafetyScan {
    pub contacts: Vec<Contact>,
    pub conversations: Vec<Conversation>,
}

impl SafetyScan {
    /// Snapshot contacts and conversations from a store.
    pub async fn from_store<S: Store + ?Sized>(store: &S) -> threadkey_store::Result<Self> {
        Ok(Self {
            contacts: store.list_contacts().await?,
            conversations: store.list_conversations().await?,
        })
    }
}

/// Outcome of one monitor run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SafetyReport {
    /// Verified contacts whose number was compared.
    pub checked: usize,
    /// Contacts de-verified in this run.
    pub deverified: Vec<String>,
    /// Threads that received a warning in this run.
    pub warned: Vec<ThreadId>,
    /// Isolated failures that were logged and skipped.
    pub failures: usize,
}

impl SafetyReport {
    pub fn is_quiet(&self) -> bool {
        self.deverified.is_empty() && self.warned.is_empty()
    }
}

/// Run one detection pass. Never fails; failures are counted and logged.
pub async fn detect_safety_number_changes(
    scan: &SafetyScan,
    source: &dyn SafetyNumberSource,
    ports: &dyn SafetyPorts,
) -> SafetyReport {
    let mut report = SafetyReport::default();

    for contact in scan.contacts.iter().filter(|c| c.is_tracked()) {
        report.checked += 1;
        let Some(recorded) = contact.verified_safety_number.as_deref() else {
            continue;
        };

        let current = match source.current_safety_number(contact).await {
            Ok(current) => current,
            Err(err) => {
                tracing::warn!(contact = %contact.pubkey, error = %err, "could not compute safety number");
                report.failures += 1;
                continue;
            }
        };
        if safety_numbers_match(&current, recorded) {
            continue;
        }

        tracing::info!(contact = %contact.pubkey, "safety number changed, de-verifying contact");
        match ports.upsert_contact(&contact.pubkey, &contact.deverify_update()).await {
            Ok(()) => report.deverified.push(contact.pubkey.clone()),
            Err(err) => {
                tracing::warn!(contact = %contact.pubkey, error = %err, "could not de-verify contact");
                report.failures += 1;
            }
        }

        for conversation in scan.conversations.iter().filter(|c| c.has_peer(&contact.pubkey)) {
            match warn_thread(conversation, ports).await {
                Ok(true) => report.warned.push(conversation.thread_id.clone()),
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(
                        thread = %conversation.thread_id,
                        error = %err,
                        "could not post safety warning"
                    );
                    report.failures += 1;
                }
            }
        }
    }

    report
}

/// Post the warning unless the thread has one. Returns whether it posted.
async fn warn_thread(conversation: &Conversation, ports: &dyn SafetyPorts) -> anyhow::Result<bool> {
    if conversation.safety_warning_sent {
        return Ok(false);
    }
    let thread_id = &conversation.thread_id;
    if ports.has_safety_warning(thread_id).await? {
        // History predates the flag; record it so the scan stays cheap.
        ports.mark_warning_sent(thread_id).await?;
        return Ok(false);
    }

    let warning = ChatMessage::system(
        &conversation.self_public_key,
        threadkey_core::SAFETY_NUMBER_WARNING,
        now_millis(),
    );
    ports.post_system_message(thread_id, &warning).await?;
    ports.mark_warning_sent(thread_id).await?;
    Ok(true)
}

/// Safety numbers derived from the local identity key.
#[derive(Debug, Clone)]
pub struct DerivedSafetyNumbers {
    local_pubkey: String,
}

impl DerivedSafetyNumbers {
    pub fn new(local_pubkey: impl Into<String>) -> Self {
        Self {
            local_pubkey: local_pubkey.into(),
        }
    }
}

#[async_trait]
impl SafetyNumberSource for DerivedSafetyNumbers {
    async fn current_safety_number(&self, contact: &Contact) -> anyhow::Result<String> {
        let number = SafetyNumber::derive(&self.local_pubkey, &contact.pubkey)?;
        Ok(number.digits().to_string())
    }
}

/// [`SafetyPorts`] backed by a [`Store`].
///
/// Warnings are written to the local history only; the client wraps these
/// ports to publish them as well.
pub struct StoreSafetyPorts<S: ?Sized> {
    store: Arc<S>,
}

impl<S: Store + ?Sized> StoreSafetyPorts<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: Store + ?Sized + 'static> SafetyPorts for StoreSafetyPorts<S> {
    async fn upsert_contact(&self, pubkey: &str, update: &ContactUpdate) -> anyhow::Result<()> {
        self.store.upsert_contact(pubkey, update).await?;
        Ok(())
    }

    async fn has_safety_warning(&self, thread_id: &ThreadId) -> anyhow::Result<bool> {
        let history = self.store.messages(thread_id).await?;
        Ok(history.iter().any(ChatMessage::is_safety_warning))
    }

    async fn post_system_message(&self, thread_id: &ThreadId, message: &ChatMessage) -> anyhow::Result<()> {
        self.store.append_message(thread_id, message).await?;
        Ok(())
    }

    async fn mark_warning_sent(&self, thread_id: &ThreadId) -> anyhow::Result<()> {
        self.store.mark_safety_warning(thread_id).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const ALICE: &str = "aa11";
    const BOB: &str = "BB22";

    /// Fixed numbers per contact; missing entries fail.
    struct FixedSource(HashMap<String, String>);

    #[async_trait]
    impl SafetyNumberSource for FixedSource {
        async fn current_safety_number(&self, contact: &Contact) -> anyhow::Result<String> {
            self.0
                .get(&contact.pubkey)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("no number for {}", contact.pubkey))
        }
    }

    #[derive(Default)]
    struct RecordingPorts {
        upserts: Mutex<Vec<(String, ContactUpdate)>>,
        posts: Mutex<Vec<(ThreadId, ChatMessage)>>,
        marked: Mutex<Vec<ThreadId>>,
        warned_history: Vec<ThreadId>,
        fail_posts_for: Option<ThreadId>,
    }

    #[async_trait]
    impl SafetyPorts for RecordingPorts {
        async fn upsert_contact(&self, pubkey: &str, update: &ContactUpdate) -> anyhow::Result<()> {
            self.upserts
                .lock()
                .unwrap()
                .push((pubkey.to_string(), update.clone()));
            Ok(())
        }

        async fn has_safety_warning(&self, thread_id: &ThreadId) -> anyhow::Result<bool> {
            Ok(self.warned_history.contains(thread_id))
        }

        async fn post_system_message(&self, thread_id: &ThreadId, message: &ChatMessage) -> anyhow::Result<()> {
            if self.fail_posts_for.as_ref() == Some(thread_id) {
                anyhow::bail!("relay down");
            }
            self.posts
                .lock()
                .unwrap()
                .push((thread_id.clone(), message.clone()));
            Ok(())
        }

        async fn mark_warning_sent(&self, thread_id: &ThreadId) -> anyhow::Result<()> {
            self.marked.lock().unwrap().push(thread_id.clone());
            Ok(())
        }
    }

    fn verified(pubkey: &str, number: &str) -> Contact {
        let mut contact = Contact::new(pubkey);
        contact.mark_verified(number);
        contact
    }

    #[tokio::test]
    async fn test_changed_number_deverifies_and_warns_once() {
        let scan = SafetyScan {
            contacts: vec![verified(BOB, "11111 22222")],
            conversations: vec![
                Conversation::new("t1", "bb22", ALICE),
                Conversation::new("t2", "cc33", ALICE),
            ],
        };
        let source = FixedSource(HashMap::from([(BOB.to_string(), "9999922222".to_string())]));
        let ports = RecordingPorts::default();

        let report = detect_safety_number_changes(&scan, &source, &ports).await;
        assert_eq!(report.checked, 1);
        assert_eq!(report.deverified, vec![BOB.to_string()]);
        assert_eq!(report.warned, vec![ThreadId::new("t1")]);

        let upserts = ports.upserts.lock().unwrap();
        assert_eq!(upserts.len(), 1);
        assert_eq!(
            upserts[0].1,
            ContactUpdate {
                verified: false,
                verified_safety_number: None,
                last_verified_safety_number: Some("11111 22222".to_string()),
            }
        );

        let posts = ports.posts.lock().unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].1.author, ALICE);
        assert_eq!(posts[0].1.text, threadkey_core::SAFETY_NUMBER_WARNING);
        assert!(posts[0].1.system);
        assert_eq!(*ports.marked.lock().unwrap(), vec![ThreadId::new("t1")]);
    }

    #[tokio::test]
    async fn test_matching_number_ignoring_spaces_is_quiet() {
        let scan = SafetyScan {
            contacts: vec![verified(BOB, "11111 22222")],
            conversations: vec![Conversation::new("t1", BOB, ALICE)],
        };
        let source = FixedSource(HashMap::from([(BOB.to_string(), "1111122222".to_string())]));
        let ports = RecordingPorts::default();

        let report = detect_safety_number_changes(&scan, &source, &ports).await;
        assert!(report.is_quiet());
        assert_eq!(report.checked, 1);
    }

    #[tokio::test]
    async fn test_unverified_contacts_are_skipped() {
        let scan = SafetyScan {
            contacts: vec![Contact::new(BOB)],
            conversations: vec![Conversation::new("t1", BOB, ALICE)],
        };
        let ports = RecordingPorts::default();
        let report = detect_safety_number_changes(&scan, &FixedSource(HashMap::new()), &ports).await;
        assert_eq!(report, SafetyReport::default());
    }

    #[tokio::test]
    async fn test_existing_warning_is_not_repeated() {
        let mut flagged = Conversation::new("t1", BOB, ALICE);
        flagged.safety_warning_sent = true;
        let scan = SafetyScan {
            contacts: vec![verified(BOB, "1")],
            conversations: vec![flagged, Conversation::new("t2", BOB, ALICE)],
        };
        let source = FixedSource(HashMap::from([(BOB.to_string(), "2".to_string())]));
        let ports = RecordingPorts {
            warned_history: vec![ThreadId::new("t2")],
            ..RecordingPorts::default()
        };

        let report = detect_safety_number_changes(&scan, &source, &ports).await;
        assert_eq!(report.deverified.len(), 1);
        assert!(report.warned.is_empty());
        assert!(ports.posts.lock().unwrap().is_empty());
        // The legacy marker is migrated to the flag.
        assert_eq!(*ports.marked.lock().unwrap(), vec![ThreadId::new("t2")]);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let carol = "cc33";
        let scan = SafetyScan {
            contacts: vec![verified(BOB, "1"), verified(carol, "1"), verified("dd44", "1")],
            conversations: vec![
                Conversation::new("t-bob", BOB, ALICE),
                Conversation::new("t-carol", carol, ALICE),
            ],
        };
        // No number for dd44: the source fails for that contact only.
        let source = FixedSource(HashMap::from([
            (BOB.to_string(), "2".to_string()),
            (carol.to_string(), "2".to_string()),
        ]));
        let ports = RecordingPorts {
            fail_posts_for: Some(ThreadId::new("t-bob")),
            ..RecordingPorts::default()
        };

        let report = detect_safety_number_changes(&scan, &source, &ports).await;
        assert_eq!(report.checked, 3);
        assert_eq!(report.deverified.len(), 2);
        assert_eq!(report.warned, vec![ThreadId::new("t-carol")]);
        assert_eq!(report.failures, 2);
    }

    #[tokio::test]
    async fn test_derived_source_matches_core_derivation() {
        let source = DerivedSafetyNumbers::new("aa".repeat(32));
        let contact = Contact::new("bb".repeat(32));
        let number = source.current_safety_number(&contact).await.unwrap();
        let expected = SafetyNumber::derive(&"bb".repeat(32), &"aa".repeat(32)).unwrap();
        assert_eq!(number, expected.digits());
    }
}
