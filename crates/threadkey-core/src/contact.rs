//! Contacts, conversations and chat messages.

use serde::{Deserialize, Serialize};

/// Literal tag carried by every safety-number warning message.
pub const SAFETY_WARNING_MARKER: &str = "[safety-number-changed]";

/// System message posted when a verified contact's safety number drifts.
pub const SAFETY_NUMBER_WARNING: &str = "[safety-number-changed] The safety number for this \
contact has changed. Verify it again before trusting new messages.";

/// A known peer identity and its verification state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub pubkey: String,
    pub verified: bool,
    pub verified_safety_number: Option<String>,
    pub last_verified_safety_number: Option<String>,
}

impl Contact {
    /// An unverified contact.
    pub fn new(pubkey: impl Into<String>) -> Self {
        Self {
            pubkey: pubkey.into(),
            verified: false,
            verified_safety_number: None,
            last_verified_safety_number: None,
        }
    }

    /// Record an explicit out-of-band verification.
    pub fn mark_verified(&mut self, safety_number: impl Into<String>) {
        self.verified = true;
        self.verified_safety_number = Some(safety_number.into());
    }

    /// Whether the contact is verified against a recorded safety number.
    pub fn is_tracked(&self) -> bool {
        self.verified && self.verified_safety_number.is_some()
    }

    /// The update that de-verifies this contact, keeping the prior number.
    pub fn deverify_update(&self) -> ContactUpdate {
        ContactUpdate {
            verified: false,
            verified_safety_number: None,
            last_verified_safety_number: self.verified_safety_number.clone(),
        }
    }

    /// Apply an update in place.
    pub fn apply(&mut self, update: &ContactUpdate) {
        self.verified = update.verified;
        self.verified_safety_number = update.verified_safety_number.clone();
        self.last_verified_safety_number = update.last_verified_safety_number.clone();
    }
}

/// Full replacement of a contact's verification fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactUpdate {
    pub verified: bool,
    pub verified_safety_number: Option<String>,
    pub last_verified_safety_number: Option<String>,
}

/// A local view of one thread with one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub thread_id: crate::types::ThreadId,
    pub peer_public_key: String,
    pub self_public_key: String,
    /// Set once a safety-number warning was posted to this thread.
    #[serde(default)]
    pub safety_warning_sent: bool,
}

impl Conversation {
    pub fn new(
        thread_id: impl Into<crate::types::ThreadId>,
        peer_public_key: impl Into<String>,
        self_public_key: impl Into<String>,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            peer_public_key: peer_public_key.into(),
            self_public_key: self_public_key.into(),
            safety_warning_sent: false,
        }
    }

    /// Case-insensitive peer match; hex keys arrive in either case.
    pub fn has_peer(&self, pubkey: &str) -> bool {
        self.peer_public_key.eq_ignore_ascii_case(pubkey)
    }
}

/// One entry in a thread's message history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub author: String,
    pub text: String,
    /// Unix milliseconds.
    pub sent_at: i64,
    #[serde(default)]
    pub system: bool,
}

impl ChatMessage {
    pub fn new(author: impl Into<String>, text: impl Into<String>, sent_at: i64) -> Self {
        Self {
            id: None,
            author: author.into(),
            text: text.into(),
            sent_at,
            system: false,
        }
    }

    /// A system message, as posted by the safety monitor.
    pub fn system(author: impl Into<String>, text: impl Into<String>, sent_at: i64) -> Self {
        Self {
            system: true,
            ..Self::new(author, text, sent_at)
        }
    }

    pub fn is_safety_warning(&self) -> bool {
        self.text.contains(SAFETY_WARNING_MARKER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deverify_keeps_previous_number() {
        let mut contact = Contact::new("aa11");
        contact.mark_verified("12345 67890");
        assert!(contact.is_tracked());

        let update = contact.deverify_update();
        contact.apply(&update);

        assert!(!contact.verified);
        assert_eq!(contact.verified_safety_number, None);
        assert_eq!(
            contact.last_verified_safety_number.as_deref(),
            Some("12345 67890")
        );
    }

    #[test]
    fn test_peer_match_ignores_case() {
        let conv = Conversation::new("t1", "ABCDEF", "me");
        assert!(conv.has_peer("abcdef"));
        assert!(!conv.has_peer("abcde0"));
    }

    #[test]
    fn test_warning_text_carries_marker() {
        let msg = ChatMessage::system("me", SAFETY_NUMBER_WARNING, 0);
        assert!(msg.is_safety_warning());
        assert!(!ChatMessage::new("me", "hello", 0).is_safety_warning());
    }
}
