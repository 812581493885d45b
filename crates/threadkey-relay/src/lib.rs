//! # Threadkey Relay
//!
//! Event delivery for Threadkey threads.
//!
//! ## Overview
//!
//! Participants exchange typed [`ThreadEvent`]s (messages, acks, control
//! instructions and typing indicators) through a relay. Two modes exist:
//!
//! - **direct-relay**: events go over the live relay link only.
//! - **store-and-forward**: events are also parked in an offline mailbox so
//!   peers that were away receive them when they subscribe or reconnect.
//!
//! The relay itself never sees plaintext; message bodies are sealed before
//! they reach this crate.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use threadkey_core::ThreadId;
//! use threadkey_relay::{
//!     MemoryRelay, MemoryTransportFactory, RelayMode, ThreadEvent, TransportConfig,
//!     TransportManager,
//! };
//!
//! async fn example() {
//!     let relay = MemoryRelay::new();
//!     let manager = TransportManager::new(MemoryTransportFactory::new(relay));
//!
//!     let config = TransportConfig::new(RelayMode::DirectRelay, "relay.example", "ab12");
//!     let transport = manager.get_or_connect(&config).await.unwrap();
//!
//!     let thread = ThreadId::new("t1");
//!     let _subscription = transport
//!         .subscribe(&thread, Arc::new(|event: &ThreadEvent| println!("{}", event.kind())))
//!         .await
//!         .unwrap();
//!     transport.publish_typing(&thread, "ab12", true).await.unwrap();
//! }
//! ```
//!
//! ## Lifecycle
//!
//! ```text
//! connecting ──> connected ──(link drop / missed heartbeat)──> disconnected
//!                    ^                                              │
//!                    └──── reconnect (2s, 5s, 10s, 10s, ...) <──────┘
//! close() ──> closed
//! ```
//!
//! ## Design Notes
//!
//! - **One live handle**: [`TransportManager`] is owned by the caller and
//!   replaces the handle only when the configuration key changes.
//! - **Acks are advisory**: consumers de-duplicate them with [`AckLedger`].
//! - **Bounded calls**: mailbox calls and RPC round trips always carry a
//!   timeout and go through [`retry_async`].

pub mod acks;
pub mod config;
pub mod error;
pub mod events;
pub mod link;
pub mod mailbox;
pub mod manager;
pub mod relay;
pub mod retry;
pub mod rpc;
pub mod shutdown;
pub mod telemetry;
pub mod transport;

pub use acks::{AckLedger, ACK_LEDGER_CAPACITY};
pub use config::{ConfigKey, RelayMode, TransportConfig, WalletHandle};
pub use error::{MailboxError, Result, TransportError};
pub use events::{
    now_millis, AckPayload, ControlPayload, DeliveryState, Frame, MessageId, MessagePayload,
    ThreadEvent, TypingPayload,
};
pub use link::{memory::MemoryLink, memory::MemoryRelay, RelayLink};
pub use mailbox::{
    cursor_key, inbox_key, HelperCache, Mailbox, MailboxLimits, MailboxQuota, MailboxStatus, MemoryMailbox,
    INBOX_CAPACITY,
};
pub use manager::{MemoryTransportFactory, TransportFactory, TransportManager};
pub use relay::RelayTransport;
pub use retry::{retry_async, retry_until_closed, RetryError, RetryPolicy};
pub use rpc::{RpcBridge, RpcChannel, RpcErrorStatus, RpcRequest, RpcResponse, DEFAULT_RPC_TIMEOUT};
pub use shutdown::{Shutdown, ShutdownSignal};
pub use telemetry::{LinkStatus, ReconnectSchedule, RttWindow, TelemetryEvent, TelemetryMonitor};
pub use transport::{DeliveryTransport, EventHandler, Subscription, SubscriptionRegistry};
