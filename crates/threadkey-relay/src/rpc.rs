//! Request/response bridge over a message channel.
//!
//! Wallet and helper processes speak a small JSON RPC: requests carry a
//! correlation id, responses echo it. The bridge keeps a pending table keyed
//! by id; every call is bounded by a timeout that also removes its entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Result, TransportError};
use crate::retry::{retry_async, RetryPolicy};

/// Default budget for one call.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    /// Older peers name this field `call`.
    #[serde(alias = "call")]
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcErrorStatus {
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcResponse {
    Error {
        id: u64,
        status: RpcErrorStatus,
        code: String,
        description: String,
    },
    Success {
        id: u64,
        result: Value,
    },
}

impl RpcResponse {
    pub fn success(id: u64, result: Value) -> Self {
        RpcResponse::Success { id, result }
    }

    pub fn error(id: u64, code: impl Into<String>, description: impl Into<String>) -> Self {
        RpcResponse::Error {
            id,
            status: RpcErrorStatus::Error,
            code: code.into(),
            description: description.into(),
        }
    }

    pub fn id(&self) -> u64 {
        match self {
            RpcResponse::Error { id, .. } | RpcResponse::Success { id, .. } => *id,
        }
    }

    pub fn into_result(self) -> Result<Value> {
        match self {
            RpcResponse::Success { result, .. } => Ok(result),
            RpcResponse::Error {
                code, description, ..
            } => Err(TransportError::Rpc { code, description }),
        }
    }
}

/// Outbound half of an RPC connection.
#[async_trait]
pub trait RpcChannel: Send + Sync {
    async fn send(&self, request: RpcRequest) -> Result<()>;
}

type PendingTable = Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>;

/// Correlates requests with responses arriving on another path.
pub struct RpcBridge<C> {
    channel: C,
    pending: PendingTable,
    next_id: AtomicU64,
    timeout: Duration,
}

impl<C: RpcChannel> RpcBridge<C> {
    pub fn new(channel: C) -> Self {
        Self::with_timeout(channel, DEFAULT_RPC_TIMEOUT)
    }

    pub fn with_timeout(channel: C, timeout: Duration) -> Self {
        Self {
            channel,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            timeout,
        }
    }

    /// Send `method` and wait for its response.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending_table().insert(id, tx);
        let _entry = PendingEntry { pending: &self.pending, id };

        let request = RpcRequest {
            id,
            method: method.to_string(),
            params,
        };
        self.channel.send(request).await?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => response.into_result(),
            // Sender dropped by cancel_all.
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                tracing::warn!(method, id, "rpc call timed out");
                Err(TransportError::Timeout(self.timeout))
            }
        }
    }

    /// [`call`](Self::call) with retries. Error responses from the peer are
    /// final and not retried.
    pub async fn call_with_retry(&self, method: &str, params: Value, policy: &RetryPolicy) -> Result<Value> {
        let label = format!("rpc.{method}");
        retry_async(&label, policy, |_| {
            let params = params.clone();
            async move {
                match self.call(method, params).await {
                    Err(err @ TransportError::Rpc { .. }) => Ok(Err(err)),
                    other => other.map(Ok),
                }
            }
        })
        .await
        .and_then(|outcome| outcome)
    }

    /// Complete the pending call for `response`. Returns `false` for
    /// unknown or already settled ids.
    pub fn handle_response(&self, response: RpcResponse) -> bool {
        let Some(tx) = self.pending_table().remove(&response.id()) else {
            tracing::debug!(id = response.id(), "response for unknown rpc id");
            return false;
        };
        tx.send(response).is_ok()
    }

    /// Decode and route a raw response.
    pub fn handle_message(&self, raw: &[u8]) -> Result<bool> {
        let response: RpcResponse = serde_json::from_slice(raw)?;
        Ok(self.handle_response(response))
    }

    pub fn pending_count(&self) -> usize {
        self.pending_table().len()
    }

    /// Fail every pending call with `Closed`.
    pub fn cancel_all(&self) {
        self.pending_table().clear();
    }

    fn pending_table(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<RpcResponse>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a call's entry from the pending table however the call ends,
/// including when the caller drops it.
struct PendingEntry<'a> {
    pending: &'a PendingTable,
    id: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}
