//! # Threadkey
//!
//! Token-gated, end-to-end encrypted conversation threads.
//!
//! ## Overview
//!
//! A thread is anchored by a control token (CT). Each participant holds a
//! data token (DT) issued against it, recorded in a join receipt. This crate
//! brings together:
//!
//! - **Access**: a participant may read and write only while a DT naming
//!   them resolves against a live CT
//! - **Keys**: the thread key travels inside signed invite links, wrapped
//!   for the invitee's X25519 key
//! - **Delivery**: sealed messages, acks, control and typing events over a
//!   relay, optionally with an offline mailbox
//! - **Safety numbers**: verified contacts whose number changes are
//!   de-verified and their threads receive a warning
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use threadkey::{ClientConfig, ThreadClient};
//! use threadkey::core::{DtIssuance, IdentityKeypair, IdentityKind, JoinReceipt, ThreadId};
//! use threadkey::keys::X25519StaticSecret;
//! use threadkey::relay::{MemoryRelay, MemoryTransportFactory, TransportManager};
//! use threadkey::store::SqliteStore;
//!
//! async fn example() {
//!     let relay = MemoryRelay::new();
//!     let transports = Arc::new(TransportManager::new(MemoryTransportFactory::new(relay)));
//!
//!     let mut config = ClientConfig::default();
//!     config.transport.relay_host = "relay.example".into();
//!
//!     let identity = IdentityKeypair::generate();
//!     let me = identity.public_key().to_hex();
//!     let client = ThreadClient::new(
//!         identity,
//!         X25519StaticSecret::generate(),
//!         SqliteStore::open("threadkey.db").unwrap(),
//!         transports,
//!         config,
//!     )
//!     .unwrap();
//!
//!     let receipt = JoinReceipt::new("t1", IdentityKind::Guest)
//!         .with_control_token("ct-txid", 0)
//!         .with_issuance(DtIssuance::new("dt-txid", [(me, 1)]));
//!     client.open_thread(&receipt).await.unwrap();
//!     client.send_message(&ThreadId::new("t1"), "hello").await.unwrap();
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `threadkey::core` - Receipts, access decisions, contacts, safety numbers
//! - `threadkey::keys` - Key wrapping, sealed bodies and invites
//! - `threadkey::store` - Storage abstraction and SQLite
//! - `threadkey::relay` - Delivery transport, mailbox and telemetry

pub mod client;
pub mod config;
pub mod error;
pub mod safety;

// Re-export component crates
pub use threadkey_core as core;
pub use threadkey_keys as keys;
pub use threadkey_relay as relay;
pub use threadkey_store as store;

// Re-export main types for convenience
pub use client::{Incoming, JoinedThread, ThreadClient, ThreadFeed};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use safety::{
    detect_safety_number_changes, DerivedSafetyNumbers, SafetyNumberSource, SafetyPorts,
    SafetyReport, SafetyScan, StoreSafetyPorts,
};

// Re-export commonly used core types
pub use threadkey_core::{
    validate_thread_access, AccessDecision, AccessReason, ChatMessage, Contact, IdentityKeypair,
    IdentityKind, JoinReceipt, SafetyNumber, ThreadId,
};
