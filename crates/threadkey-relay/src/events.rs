//! Typed thread events and the frame that carries them.
//!
//! Every event published on a thread is one of four variants: a chat
//! message, a delivery acknowledgement, a control instruction or a typing
//! indicator. On the relay each event travels inside a [`Frame`] that names
//! its sender and carries a unique id used for de-duplication.

use bytes::Bytes;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Result;

/// Identifier of a published chat message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A random 128-bit id, hex encoded.
    pub fn generate() -> Self {
        Self(random_hex16())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Terminal delivery state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Delivered,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    /// Messages without an id are never acknowledged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    pub author: String,
    /// Sealed body text.
    pub body: String,
    pub sent_at: i64,
    /// Posted by the client itself rather than typed by a person.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub system: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    pub message_id: MessageId,
    pub delivery: DeliveryState,
    pub acked_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPayload {
    pub action: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    pub author: String,
    pub typing: bool,
}

/// An event on one thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "lowercase")]
pub enum ThreadEvent {
    Message(MessagePayload),
    Ack(AckPayload),
    Control(ControlPayload),
    Typing(TypingPayload),
}

impl ThreadEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ThreadEvent::Message(_) => "message",
            ThreadEvent::Ack(_) => "ack",
            ThreadEvent::Control(_) => "control",
            ThreadEvent::Typing(_) => "typing",
        }
    }

    /// Whether offline peers should receive this event later.
    ///
    /// Typing indicators are only meaningful live.
    pub fn is_durable(&self) -> bool {
        !matches!(self, ThreadEvent::Typing(_))
    }
}

/// Relay envelope of one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub id: String,
    /// Sender identity key.
    pub sender: String,
    pub event: ThreadEvent,
}

impl Frame {
    pub fn new(sender: impl Into<String>, event: ThreadEvent) -> Self {
        Self {
            id: random_hex16(),
            sender: sender.into(),
            event,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

fn random_hex16() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Current time in unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
