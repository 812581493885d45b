//! Error types for key wrapping and invites.

use thiserror::Error;

/// Errors from key wrapping, sealing and invite handling.
#[derive(Debug, Error)]
pub enum KeyError {
    /// Authenticated decryption failed: tampering, wrong key or corrupt encoding.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Encryption failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Malformed hex or base64 input.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Invite payload is structurally invalid.
    #[error("invalid invite: {0}")]
    InvalidInvite(String),

    /// Invite is past its expiry.
    #[error("invite expired at {exp} (now {now})")]
    InviteExpired { exp: u64, now: u64 },

    /// Invite signature or inviter key rejected.
    #[error("signature error: {0}")]
    Signature(#[from] threadkey_core::CoreError),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Result type for key operations.
pub type Result<T> = std::result::Result<T, KeyError>;
