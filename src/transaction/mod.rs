//! Transaction lifecycle records.
//!
//! A `TransactionMeta` is created `unapproved` when a page asks for a
//! transaction and only ever moves forward through `TxStatus`. Every change
//! is appended to its `history`, which is never rewritten.

pub mod nonce;
pub mod state_manager;

pub use nonce::{NonceLock, NonceTracker};
pub use state_manager::TxStateManager;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Transaction identifier, unique for the lifetime of the wallet.
pub type TxId = u64;

/// Lifecycle status of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    /// Waiting for the user.
    Unapproved,
    /// The user approved; signing is in progress.
    Approved,
    Signed,
    /// Broadcast to the node, waiting for a receipt.
    Submitted,
    Confirmed,
    /// Replaced or evicted: the account's nonce moved past it without a receipt.
    Dropped,
    Failed,
    Rejected,
}

impl TxStatus {
    /// No transition leaves a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TxStatus::Confirmed | TxStatus::Dropped | TxStatus::Failed | TxStatus::Rejected
        )
    }

    /// Whether `self -> next` is a legal forward transition.
    pub fn can_transition_to(self, next: TxStatus) -> bool {
        use TxStatus::*;
        matches!(
            (self, next),
            (Unapproved, Approved)
                | (Unapproved, Rejected)
                | (Unapproved, Failed)
                | (Approved, Signed)
                | (Approved, Failed)
                | (Signed, Submitted)
                | (Signed, Failed)
                | (Submitted, Confirmed)
                | (Submitted, Dropped)
                | (Submitted, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TxStatus::Unapproved => "unapproved",
            TxStatus::Approved => "approved",
            TxStatus::Signed => "signed",
            TxStatus::Submitted => "submitted",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Dropped => "dropped",
            TxStatus::Failed => "failed",
            TxStatus::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for TxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters as passed to the network, hex-encoded quantities.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxParams {
    #[serde(default)]
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl TxParams {
    /// Lower-case addresses; a wallet compares them as plain strings.
    pub fn normalize(mut self) -> Self {
        self.from = self.from.to_lowercase();
        self.to = self.to.map(|t| t.to_lowercase());
        self
    }

    pub fn has_data(&self) -> bool {
        self.data
            .as_deref()
            .map(|d| !d.is_empty() && d != "0x")
            .unwrap_or(false)
    }
}

/// How the nonce of a transaction was chosen.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonceDetails {
    /// Pending transaction count reported by the node.
    pub network_nonce: u64,
    /// Highest nonce among this wallet's in-flight or confirmed transactions.
    pub highest_local_nonce: Option<u64>,
    pub next_nonce: u64,
}

/// Receipt fields kept once a transaction is mined.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxReceipt {
    pub block_hash: Option<String>,
    pub block_number: Option<String>,
    pub transaction_index: Option<String>,
    pub status: Option<String>,
}

/// Why a transaction failed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxErrorRecord {
    pub message: String,
}

impl From<&TxError> for TxErrorRecord {
    fn from(e: &TxError) -> Self {
        TxErrorRecord {
            message: e.to_string(),
        }
    }
}

/// One field that changed in a history update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub from: Value,
    pub to: Value,
}

/// An entry in a transaction's audit trail.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum HistoryEntry {
    /// Full copy of the transaction at creation.
    Snapshot { timestamp: u64, snapshot: Value },
    /// The fields one mutation touched.
    Update {
        timestamp: u64,
        note: String,
        changes: Vec<FieldChange>,
    },
}

/// Full lifecycle record of one transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMeta {
    pub id: TxId,
    /// When the transaction was first suggested (Unix ms).
    pub time: u64,
    pub status: TxStatus,
    #[serde(rename = "iTrustNetworkId")]
    pub network_id: String,
    pub tx_params: TxParams,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// The page chose a gas price; no auto-fill.
    #[serde(default)]
    pub gas_price_specified: bool,
    /// The page chose a gas limit; no estimation.
    #[serde(default)]
    pub gas_limit_specified: bool,
    #[serde(default)]
    pub estimated_gas: Option<String>,
    #[serde(default)]
    pub simulation_fails: Option<String>,
    #[serde(default)]
    pub loading_defaults: bool,
    pub origin: String,
    #[serde(default)]
    pub nonce_details: Option<NonceDetails>,
    #[serde(default)]
    pub raw_tx: Option<String>,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub submitted_time: Option<u64>,
    #[serde(default)]
    pub tx_receipt: Option<TxReceipt>,
    #[serde(default)]
    pub err: Option<TxErrorRecord>,
}

impl TransactionMeta {
    /// A new `unapproved` transaction with its creation snapshot recorded.
    pub fn new(id: TxId, tx_params: TxParams, origin: &str, network_id: &str) -> Self {
        let mut tx = TransactionMeta {
            id,
            time: crate::now_ms(),
            status: TxStatus::Unapproved,
            network_id: network_id.into(),
            tx_params,
            history: Vec::new(),
            gas_price_specified: false,
            gas_limit_specified: false,
            estimated_gas: None,
            simulation_fails: None,
            loading_defaults: true,
            origin: origin.into(),
            nonce_details: None,
            raw_tx: None,
            hash: None,
            submitted_time: None,
            tx_receipt: None,
            err: None,
        };
        let snapshot = tx.snapshot();
        tx.history.push(HistoryEntry::Snapshot {
            timestamp: tx.time,
            snapshot,
        });
        tx
    }

    /// The record as JSON without its history.
    pub fn snapshot(&self) -> Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Value::Object(map) = &mut value {
            map.remove("history");
        }
        value
    }

    /// Nonce as a number, once assigned.
    pub fn nonce(&self) -> Option<u64> {
        self.tx_params
            .nonce
            .as_deref()
            .and_then(crate::parse_hex_quantity)
    }
}

/// A wallet transaction in `eth_getTransactionByHash` result form.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcTransaction {
    pub block_hash: Option<String>,
    pub block_number: Option<String>,
    pub from: String,
    pub gas: Option<String>,
    pub gas_price: Option<String>,
    pub hash: Option<String>,
    pub input: String,
    pub nonce: Option<String>,
    pub to: Option<String>,
    pub transaction_index: Option<String>,
    pub value: String,
}

impl From<&TransactionMeta> for RpcTransaction {
    fn from(tx: &TransactionMeta) -> Self {
        let receipt = tx.tx_receipt.as_ref();
        RpcTransaction {
            block_hash: receipt.and_then(|r| r.block_hash.clone()),
            block_number: receipt.and_then(|r| r.block_number.clone()),
            from: tx.tx_params.from.clone(),
            gas: tx.tx_params.gas.clone(),
            gas_price: tx.tx_params.gas_price.clone(),
            hash: tx.hash.clone(),
            input: tx.tx_params.data.clone().unwrap_or_else(|| "0x".into()),
            nonce: tx.tx_params.nonce.clone(),
            to: tx.tx_params.to.clone(),
            transaction_index: receipt.and_then(|r| r.transaction_index.clone()),
            value: tx.tx_params.value.clone().unwrap_or_else(|| "0x0".into()),
        }
    }
}

/// Errors from transaction operations.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TxError {
    #[error("transaction {0} not found")]
    NotFound(TxId),
    #[error("transaction {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: TxId,
        from: TxStatus,
        to: TxStatus,
    },
    #[error("invalid transaction params: {0}")]
    InvalidParams(String),
    #[error("unknown account {0}")]
    UnknownAccount(String),
    #[error("user rejected transaction {0}")]
    Rejected(TxId),
    #[error("transaction {id} failed: {reason}")]
    Failed { id: TxId, reason: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("signing failed: {0}")]
    Signer(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_only_move_forward() {
        use TxStatus::*;
        assert!(Unapproved.can_transition_to(Approved));
        assert!(Unapproved.can_transition_to(Rejected));
        assert!(Unapproved.can_transition_to(Failed));
        assert!(Approved.can_transition_to(Signed));
        assert!(Signed.can_transition_to(Submitted));
        assert!(Submitted.can_transition_to(Confirmed));
        assert!(!Signed.can_transition_to(Unapproved));
        assert!(!Unapproved.can_transition_to(Submitted));
        for terminal in [Confirmed, Dropped, Failed, Rejected] {
            assert!(terminal.is_terminal());
            for next in [
                Unapproved, Approved, Signed, Submitted, Confirmed, Dropped, Failed, Rejected,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn new_transaction_records_snapshot() {
        let tx = TransactionMeta::new(1, TxParams::default(), "https://dapp.example", "1256");
        assert_eq!(tx.status, TxStatus::Unapproved);
        assert_eq!(tx.history.len(), 1);
        match &tx.history[0] {
            HistoryEntry::Snapshot { snapshot, .. } => {
                assert_eq!(snapshot["id"], 1);
                assert!(snapshot.get("history").is_none());
            }
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(TxStatus::Submitted).unwrap(),
            serde_json::json!("submitted")
        );
    }

    #[test]
    fn rpc_result_defaults() {
        let params = TxParams {
            from: "0xaaa".into(),
            to: Some("0xbbb".into()),
            ..Default::default()
        };
        let mut tx = TransactionMeta::new(2, params, "https://dapp.example", "1256");
        tx.hash = Some("0xfeed".into());
        let rpc = RpcTransaction::from(&tx);
        assert_eq!(rpc.input, "0x");
        assert_eq!(rpc.value, "0x0");
        assert_eq!(rpc.hash.as_deref(), Some("0xfeed"));
        assert!(rpc.block_hash.is_none());
    }

    #[test]
    fn params_normalize_lowercases_addresses() {
        let params = TxParams {
            from: "0xABC".into(),
            to: Some("0xDEF".into()),
            ..Default::default()
        }
        .normalize();
        assert_eq!(params.from, "0xabc");
        assert_eq!(params.to.as_deref(), Some("0xdef"));
        assert!(!params.has_data());
    }
}
