//! # Threadkey Testkit
//!
//! Testing utilities for Threadkey.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: Deterministic participants, shared threads and wired-up clients
//! - **Generators**: Proptest strategies for receipts, keys and identities
//! - **Benchmarks**: Criterion benches for key wrapping and sealing (`cargo bench`)
//!
//! ## Property Testing
//!
//! Use the generators with proptest:
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use threadkey_core::validate_thread_access;
//! use threadkey_testkit::generators::{receipt_from_params, ReceiptParams};
//!
//! proptest! {
//!     #[test]
//!     fn burned_receipts_deny_everyone(params: ReceiptParams) {
//!         prop_assume!(params.burn.is_some());
//!         let receipt = receipt_from_params(&params);
//!         for user in params.recipients() {
//!             prop_assert!(!validate_thread_access(&params.thread_id, &user, &receipt).has_access);
//!         }
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! Quickly set up test scenarios:
//!
//! ```rust
//! use threadkey_testkit::fixtures::ThreadFixture;
//!
//! let fixture = ThreadFixture::new("t1", 2);
//! let receipt = fixture.receipt();
//! let invite = fixture.invite(0, 1);
//! assert_eq!(invite.thread_id, receipt.thread_id);
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{multi_party, MemoryClient, TestParticipant, ThreadFixture};
pub use generators::{receipt_from_params, ReceiptParams};
