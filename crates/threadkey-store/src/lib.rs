//! # Threadkey Store
//!
//! Persistence contracts for Threadkey with SQLite and in-memory
//! implementations.
//!
//! ## Overview
//!
//! Join receipts are written by external token flows and read by access
//! checks; contacts, conversations and messages back the client and the
//! safety-number monitor. Each concern has its own async trait
//! ([`ReceiptStore`], [`ContactStore`], [`ConversationStore`]) and [`Store`]
//! is implemented for anything that provides all three.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use threadkey_core::{IdentityKind, JoinReceipt, ThreadId};
//! use threadkey_store::{ReceiptStore, SqliteStore};
//!
//! async fn example() {
//!     let store = SqliteStore::open("threadkey.db").unwrap();
//!     store
//!         .put_receipt(&JoinReceipt::new("t1", IdentityKind::Guest))
//!         .await
//!         .unwrap();
//!     let receipt = store.get_receipt(&ThreadId::new("t1")).await.unwrap();
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Checked on load**: receipts are stored in their loose record form and
//!   re-validated into [`threadkey_core::JoinReceipt`] when read back.
//! - **Full-replacement contact updates**: `upsert_contact` overwrites all
//!   verification fields at once.

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{ContactStore, ConversationStore, ReceiptStore, Store};
