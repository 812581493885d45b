//! Error types for the relay module.

use std::time::Duration;

use thiserror::Error;

/// Errors reported by an offline mailbox.
#[derive(Debug, Error)]
pub enum MailboxError {
    /// Key is absent (HTTP 404 on a remote mailbox).
    #[error("mailbox key not found: {0}")]
    NotFound(String),

    /// Mailbox could not be reached.
    #[error("mailbox unreachable: {0}")]
    Unavailable(String),

    /// Mailbox answered with an error status.
    #[error("mailbox returned {status}: {message}")]
    Http { status: u16, message: String },

    /// Entry or byte quota exhausted.
    #[error("mailbox quota exceeded: {0}")]
    QuotaExceeded(String),

    /// A single call exceeded its budget.
    #[error("mailbox call timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors that can occur during transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Configuration rejected at construction time.
    #[error("transport misconfigured: {0}")]
    Misconfigured(String),

    /// Initial connection to the relay failed.
    #[error("connect failed: {0}")]
    Connect(String),

    /// Event could not be handed to the relay.
    #[error("publish failed: {0}")]
    Publish(String),

    /// Relay link is down.
    #[error("relay link disconnected")]
    Disconnected,

    /// Transport was closed.
    #[error("transport closed")]
    Closed,

    /// A call exceeded its budget.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Offline mailbox unreachable or not configured.
    #[error("offline mailbox unavailable: {0}")]
    CacheUnavailable(String),

    /// Other offline mailbox failure.
    #[error("offline mailbox error: {0}")]
    Cache(MailboxError),

    /// Error response from an RPC peer.
    #[error("rpc error {code}: {description}")]
    Rpc { code: String, description: String },

    /// Frame or message encoding failed.
    #[error("codec error: {0}")]
    Codec(String),
}

impl From<MailboxError> for TransportError {
    fn from(err: MailboxError) -> Self {
        match err {
            MailboxError::Unavailable(msg) => TransportError::CacheUnavailable(msg),
            MailboxError::Timeout(budget) => TransportError::Timeout(budget),
            other => TransportError::Cache(other),
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Codec(err.to_string())
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
