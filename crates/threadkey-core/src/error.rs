//! Error types for Threadkey core.

use thiserror::Error;

/// Errors from identity key handling and signature checks.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("encoding error: {0}")]
    EncodingError(String),
}

/// Malformed input shapes: receipts, outpoints, safety numbers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("burn fields present on a receipt with status {status}")]
    UnexpectedBurnFields { status: &'static str },

    #[error("ctVout present without ctTxid")]
    OrphanVout,

    #[error("invalid outpoint: {0}")]
    InvalidOutpoint(String),

    #[error("invalid safety number: {0}")]
    InvalidSafetyNumber(String),

    #[error("empty identifier: {0}")]
    EmptyIdentifier(&'static str),
}
