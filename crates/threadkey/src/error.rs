//! Error types for the client.

use threadkey_core::{AccessDecision, ThreadId, ValidationError};
use threadkey_keys::KeyError;
use threadkey_relay::TransportError;
use threadkey_store::StoreError;
use thiserror::Error;

/// Errors that can occur during client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Validation error.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Key wrapping, sealing or invite error.
    #[error("key error: {0}")]
    Key(#[from] KeyError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The local identity may not use the thread.
    #[error("access denied ({}): {}", .0.reason.as_str(), .0.details)]
    AccessDenied(Box<AccessDecision>),

    /// No join receipt is recorded for the thread.
    #[error("no join receipt for thread {0}")]
    MissingReceipt(ThreadId),

    /// The thread key is not known locally.
    #[error("no key for thread {0}")]
    MissingThreadKey(ThreadId),

    /// Configuration could not be read or is invalid.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
