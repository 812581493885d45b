//! Join receipts: the resolved CT/DT state of one thread.
//!
//! A [`JoinReceipt`] is created when a participant joins a thread and is
//! afterwards changed only by externally observed chain events (a DT
//! issuance or the CT burn). Burn data exists only on the burned variant of
//! [`ReceiptStatus`]; the loosely typed storage shape is [`JoinReceiptRecord`]
//! and conversion between the two enforces that.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::types::{Outpoint, ThreadId};

/// How the participant entered the thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityKind {
    /// Invited participant without a token-holding wallet.
    Guest,
    /// Wallet-linked participant holding tokens.
    Holder,
}

/// One recipient output inside a DT issuance transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtOutput {
    /// Identity public key the DT was issued to.
    pub recipient_pubkey: String,
    /// Output index carrying the DT.
    pub vout: u32,
}

/// A DT issuance transaction and its recipient outputs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtIssuance {
    pub txid: String,
    pub outputs: Vec<DtOutput>,
}

impl DtIssuance {
    /// Create an issuance from `(recipient, vout)` pairs.
    pub fn new<I, S>(txid: impl Into<String>, outputs: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        Self {
            txid: txid.into(),
            outputs: outputs
                .into_iter()
                .map(|(recipient, vout)| DtOutput {
                    recipient_pubkey: recipient.into(),
                    vout,
                })
                .collect(),
        }
    }
}

/// Evidence that a thread's control token was destroyed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BurnProof {
    pub burn_txid: String,
    /// Unix milliseconds of the burn, as reported by the indexer.
    pub burned_at: i64,
    /// Identity that broadcast the burn.
    pub burned_by: String,
}

/// Token state of a thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptStatus {
    /// CT alive; DTs resolve normally.
    Ready,
    /// Locally blocked by the participant; token state is unaffected.
    Blocked,
    /// CT burned; every DT derived from it is void.
    Burned(BurnProof),
}

impl ReceiptStatus {
    /// Wire name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Ready => "ready",
            ReceiptStatus::Blocked => "blocked",
            ReceiptStatus::Burned(_) => "burned",
        }
    }

    /// The burn proof, if burned.
    pub fn burn_proof(&self) -> Option<&BurnProof> {
        match self {
            ReceiptStatus::Burned(proof) => Some(proof),
            _ => None,
        }
    }

    pub fn is_burned(&self) -> bool {
        matches!(self, ReceiptStatus::Burned(_))
    }
}

/// Resolved token state of one thread, as seen by one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "JoinReceiptRecord", into = "JoinReceiptRecord")]
pub struct JoinReceipt {
    pub thread_id: ThreadId,
    pub identity_kind: IdentityKind,
    pub status: ReceiptStatus,
    /// The thread's control token, once minted.
    pub ct_outpoint: Option<Outpoint>,
    /// DT issuances in chain order.
    pub dt_issuances: Vec<DtIssuance>,
    pub last_mint_txid: Option<String>,
}

impl JoinReceipt {
    /// A fresh receipt in `ready` state with no tokens recorded yet.
    pub fn new(thread_id: impl Into<ThreadId>, identity_kind: IdentityKind) -> Self {
        Self {
            thread_id: thread_id.into(),
            identity_kind,
            status: ReceiptStatus::Ready,
            ct_outpoint: None,
            dt_issuances: Vec::new(),
            last_mint_txid: None,
        }
    }

    /// Set the control token outpoint.
    pub fn with_control_token(mut self, txid: impl Into<String>, vout: u32) -> Self {
        let txid = txid.into();
        self.last_mint_txid = Some(txid.clone());
        self.ct_outpoint = Some(Outpoint::new(txid, vout));
        self
    }

    /// Append a DT issuance.
    pub fn with_issuance(mut self, issuance: DtIssuance) -> Self {
        self.record_issuance(issuance);
        self
    }

    /// Record a DT issuance observed on chain.
    pub fn record_issuance(&mut self, issuance: DtIssuance) {
        self.last_mint_txid = Some(issuance.txid.clone());
        self.dt_issuances.push(issuance);
    }

    /// Record the CT burn. Issuances are kept for audit.
    pub fn record_burn(&mut self, proof: BurnProof) {
        self.status = ReceiptStatus::Burned(proof);
    }

    /// Mark the thread blocked locally. A burned thread stays burned.
    pub fn block(&mut self) {
        if !self.status.is_burned() {
            self.status = ReceiptStatus::Blocked;
        }
    }
}

/// Storage and wire shape of a join receipt.
///
/// Every status-specific field is optional here; [`JoinReceipt`] is the
/// checked form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinReceiptRecord {
    pub thread_id: ThreadId,
    pub identity_kind: IdentityKind,
    pub status: RecordStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ct_txid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ct_vout: Option<u32>,
    #[serde(default)]
    pub dt_issuances: Vec<DtIssuance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_mint_txid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burn_txid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burned_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burned_by: Option<String>,
}

/// Status discriminator of a [`JoinReceiptRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Ready,
    Burned,
    Blocked,
}

impl TryFrom<JoinReceiptRecord> for JoinReceipt {
    type Error = ValidationError;

    fn try_from(record: JoinReceiptRecord) -> Result<Self, Self::Error> {
        if record.thread_id.is_empty() {
            return Err(ValidationError::EmptyIdentifier("threadId"));
        }

        let has_burn_fields =
            record.burn_txid.is_some() || record.burned_at.is_some() || record.burned_by.is_some();

        let status = match record.status {
            RecordStatus::Burned => ReceiptStatus::Burned(BurnProof {
                burn_txid: record
                    .burn_txid
                    .ok_or(ValidationError::MissingField("burnTxid"))?,
                burned_at: record
                    .burned_at
                    .ok_or(ValidationError::MissingField("burnedAt"))?,
                burned_by: record
                    .burned_by
                    .ok_or(ValidationError::MissingField("burnedBy"))?,
            }),
            RecordStatus::Ready if has_burn_fields => {
                return Err(ValidationError::UnexpectedBurnFields { status: "ready" })
            }
            RecordStatus::Blocked if has_burn_fields => {
                return Err(ValidationError::UnexpectedBurnFields { status: "blocked" })
            }
            RecordStatus::Ready => ReceiptStatus::Ready,
            RecordStatus::Blocked => ReceiptStatus::Blocked,
        };

        // A missing vout defaults to output 0, the minting convention.
        let ct_outpoint = match (record.ct_txid, record.ct_vout) {
            (Some(txid), vout) => Some(Outpoint::new(txid, vout.unwrap_or(0))),
            (None, Some(_)) => return Err(ValidationError::OrphanVout),
            (None, None) => None,
        };

        Ok(Self {
            thread_id: record.thread_id,
            identity_kind: record.identity_kind,
            status,
            ct_outpoint,
            dt_issuances: record.dt_issuances,
            last_mint_txid: record.last_mint_txid,
        })
    }
}

impl From<JoinReceipt> for JoinReceiptRecord {
    fn from(receipt: JoinReceipt) -> Self {
        let (status, burn) = match receipt.status {
            ReceiptStatus::Ready => (RecordStatus::Ready, None),
            ReceiptStatus::Blocked => (RecordStatus::Blocked, None),
            ReceiptStatus::Burned(proof) => (RecordStatus::Burned, Some(proof)),
        };
        let (ct_txid, ct_vout) = match receipt.ct_outpoint {
            Some(op) => (Some(op.txid), Some(op.vout)),
            None => (None, None),
        };

        Self {
            thread_id: receipt.thread_id,
            identity_kind: receipt.identity_kind,
            status,
            ct_txid,
            ct_vout,
            dt_issuances: receipt.dt_issuances,
            last_mint_txid: receipt.last_mint_txid,
            burn_txid: burn.as_ref().map(|b| b.burn_txid.clone()),
            burned_at: burn.as_ref().map(|b| b.burned_at),
            burned_by: burn.map(|b| b.burned_by),
        }
    }
}
