//! # Threadkey Core
//!
//! Pure primitives for token-anchored encrypted threads: join receipts,
//! access decisions, contacts and safety numbers.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`JoinReceipt`] - Resolved CT/DT state of one thread
//! - [`ReceiptStatus`] - `ready | blocked | burned`, with burn proof only when burned
//! - [`AccessDecision`] - Verdict of [`validate_thread_access`]
//! - [`Contact`] / [`Conversation`] - Verification state and thread views
//! - [`SafetyNumber`] - Pairwise identity fingerprint
//!
//! ## Usage
//!
//! ```rust,no_run
//! use threadkey_core::{
//!     validate_thread_access, AccessReason, DtIssuance, IdentityKind, JoinReceipt, ThreadId,
//! };
//!
//! let receipt = JoinReceipt::new("t1", IdentityKind::Guest)
//!     .with_control_token("ct1", 1)
//!     .with_issuance(DtIssuance::new("dt1", [("U", 0)]));
//!
//! let decision = validate_thread_access(&ThreadId::new("t1"), "U", &receipt);
//! assert_eq!(decision.reason, AccessReason::ValidDt);
//! ```

pub mod access;
pub mod contact;
pub mod crypto;
pub mod error;
pub mod receipt;
pub mod safety_number;
pub mod types;

pub use access::{validate_thread_access, AccessDecision, AccessReason};
pub use contact::{
    ChatMessage, Contact, ContactUpdate, Conversation, SAFETY_NUMBER_WARNING,
    SAFETY_WARNING_MARKER,
};
pub use crypto::{IdentityKeypair, IdentityPublicKey, IdentitySignature};
pub use error::{CoreError, ValidationError};
pub use receipt::{
    BurnProof, DtIssuance, DtOutput, IdentityKind, JoinReceipt, JoinReceiptRecord, ReceiptStatus,
    RecordStatus,
};
pub use safety_number::{safety_numbers_match, SafetyNumber, SAFETY_NUMBER_DIGITS};
pub use types::{Outpoint, ThreadId};
