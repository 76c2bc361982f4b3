//! In-memory store of transaction records with guarded status transitions.
//!
//! Transactions are kept in creation order. Every mutation goes through
//! `update`, which diffs the record before and after and appends the
//! changed fields to its history. Status changes additionally go through
//! `set_status`, which rejects anything that isn't a legal forward move.

use std::collections::BTreeMap;

use serde_json::Value;

use super::{
    FieldChange, HistoryEntry, TransactionMeta, TxError, TxErrorRecord, TxId, TxStatus,
};

/// Finished transactions kept before the oldest are pruned.
pub const TX_HISTORY_LIMIT: usize = 40;

/// Transaction store owned by the controller.
#[derive(Debug, Default)]
pub struct TxStateManager {
    /// Creation order, oldest first.
    txs: Vec<TransactionMeta>,
}

impl TxStateManager {
    pub fn new(txs: Vec<TransactionMeta>) -> Self {
        let mut txs = txs;
        txs.sort_by_key(|tx| tx.id);
        TxStateManager { txs }
    }

    /// Insert a new record, pruning the oldest finished ones past the limit.
    pub fn add(&mut self, tx: TransactionMeta) {
        self.txs.push(tx);
        let mut excess = self.txs.len().saturating_sub(TX_HISTORY_LIMIT);
        if excess > 0 {
            self.txs.retain(|tx| {
                if excess > 0 && tx.status.is_terminal() {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
        }
    }

    pub fn get(&self, id: TxId) -> Option<&TransactionMeta> {
        self.txs.iter().find(|tx| tx.id == id)
    }

    pub fn all(&self) -> &[TransactionMeta] {
        &self.txs
    }

    pub fn find_by_hash(&self, hash: &str) -> Option<&TransactionMeta> {
        self.txs.iter().find(|tx| {
            tx.hash
                .as_deref()
                .map(|h| h.eq_ignore_ascii_case(hash))
                .unwrap_or(false)
        })
    }

    pub fn with_status(&self, status: TxStatus) -> impl Iterator<Item = &TransactionMeta> {
        self.txs.iter().filter(move |tx| tx.status == status)
    }

    /// Unapproved transactions keyed by id.
    pub fn unapproved(&self) -> BTreeMap<TxId, TransactionMeta> {
        self.with_status(TxStatus::Unapproved)
            .map(|tx| (tx.id, tx.clone()))
            .collect()
    }

    pub fn unapproved_count(&self) -> usize {
        self.with_status(TxStatus::Unapproved).count()
    }

    /// Nonces already spoken for by `address` (signed, submitted or confirmed).
    pub fn local_nonces(&self, address: &str) -> Vec<u64> {
        let address = address.to_lowercase();
        self.txs
            .iter()
            .filter(|tx| tx.tx_params.from == address)
            .filter(|tx| {
                matches!(
                    tx.status,
                    TxStatus::Signed | TxStatus::Submitted | TxStatus::Confirmed
                )
            })
            .filter_map(|tx| tx.nonce())
            .collect()
    }

    /// Apply `f` to a record and append the fields it changed to history.
    ///
    /// `f` must not touch `status`; use `set_status` for that.
    pub fn update<F>(&mut self, id: TxId, note: &str, f: F) -> Result<&TransactionMeta, TxError>
    where
        F: FnOnce(&mut TransactionMeta),
    {
        let tx = self
            .txs
            .iter_mut()
            .find(|tx| tx.id == id)
            .ok_or(TxError::NotFound(id))?;
        let status = tx.status;
        let before = tx.snapshot();
        f(tx);
        tx.status = status;
        let after = tx.snapshot();
        let changes = diff_fields(&before, &after);
        if !changes.is_empty() {
            tx.history.push(HistoryEntry::Update {
                timestamp: crate::now_ms(),
                note: note.into(),
                changes,
            });
        }
        Ok(&*tx)
    }

    /// Move a record to `next`, returning its previous status.
    pub fn set_status(&mut self, id: TxId, next: TxStatus, note: &str) -> Result<TxStatus, TxError> {
        let tx = self
            .txs
            .iter_mut()
            .find(|tx| tx.id == id)
            .ok_or(TxError::NotFound(id))?;
        let from = tx.status;
        if !from.can_transition_to(next) {
            return Err(TxError::InvalidTransition { id, from, to: next });
        }
        tx.status = next;
        tx.history.push(HistoryEntry::Update {
            timestamp: crate::now_ms(),
            note: note.into(),
            changes: vec![FieldChange {
                field: "status".into(),
                from: Value::String(from.as_str().into()),
                to: Value::String(next.as_str().into()),
            }],
        });
        Ok(from)
    }

    /// Record `error` and move the record to `failed`.
    pub fn set_failed(&mut self, id: TxId, error: &TxError) -> Result<TxStatus, TxError> {
        let record = TxErrorRecord::from(error);
        self.update(id, "transactions/failed", |tx| tx.err = Some(record))?;
        self.set_status(id, TxStatus::Failed, "transactions/failed")
    }

    /// Fail everything caught mid-approval by a restart. Returns their ids.
    pub fn fail_interrupted(&mut self) -> Vec<TxId> {
        let interrupted: Vec<TxId> = self
            .txs
            .iter()
            .filter(|tx| matches!(tx.status, TxStatus::Approved | TxStatus::Signed))
            .map(|tx| tx.id)
            .collect();
        for id in &interrupted {
            let error = TxError::Failed {
                id: *id,
                reason: "interrupted by restart before submission".into(),
            };
            if let Err(e) = self.set_failed(*id, &error) {
                tracing::warn!("Could not fail interrupted transaction {}: {}", id, e);
            }
        }
        interrupted
    }
}

fn diff_fields(before: &Value, after: &Value) -> Vec<FieldChange> {
    let (Value::Object(before), Value::Object(after)) = (before, after) else {
        return Vec::new();
    };
    let mut changes = Vec::new();
    for (field, to) in after {
        let from = before.get(field).cloned().unwrap_or(Value::Null);
        if &from != to {
            changes.push(FieldChange {
                field: field.clone(),
                from,
                to: to.clone(),
            });
        }
    }
    changes
}
