//! Site-connection approvals.
//!
//! A page must be approved before it can see account addresses. Requests
//! are queued one per origin; repeated asks from the same origin while one
//! is pending join the existing request. Approved origins are kept apart
//! from transaction history so they can be listed and revoked on their own.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::constants::INTERNAL_ORIGIN;
use crate::state::ApprovedOrigin;

/// A page waiting for the user to allow the connection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRequest {
    pub origin: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<u64>,
    pub time: u64,
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum ApprovalError {
    #[error("no pending connection request from {0}")]
    NotPending(String),
    #[error("user rejected the connection from {0}")]
    Rejected(String),
    #[error("origin {0} is not approved")]
    Unauthorized(String),
}

/// Either an immediate answer or a wait for the user.
pub enum ApprovalOutcome {
    AlreadyApproved,
    Pending(oneshot::Receiver<Result<(), ApprovalError>>),
}

#[derive(Debug, Default)]
pub struct ProviderApprovalController {
    approved: BTreeMap<String, ApprovedOrigin>,
    pending: BTreeMap<String, ProviderRequest>,
    waiters: HashMap<String, Vec<oneshot::Sender<Result<(), ApprovalError>>>>,
}

impl ProviderApprovalController {
    pub fn new(approved: BTreeMap<String, ApprovedOrigin>) -> Self {
        ProviderApprovalController {
            approved,
            ..Default::default()
        }
    }

    /// The wallet's own UI is always approved.
    pub fn is_approved(&self, origin: &str) -> bool {
        origin == INTERNAL_ORIGIN || self.approved.contains_key(origin)
    }

    pub fn request(&mut self, request: ProviderRequest) -> ApprovalOutcome {
        if self.is_approved(&request.origin) {
            return ApprovalOutcome::AlreadyApproved;
        }
        let (tx, rx) = oneshot::channel();
        self.waiters
            .entry(request.origin.clone())
            .or_default()
            .push(tx);
        self.pending.entry(request.origin.clone()).or_insert(request);
        ApprovalOutcome::Pending(rx)
    }

    pub fn approve_by_origin(&mut self, origin: &str) -> Result<(), ApprovalError> {
        self.pending
            .remove(origin)
            .ok_or_else(|| ApprovalError::NotPending(origin.into()))?;
        self.approved.insert(
            origin.into(),
            ApprovedOrigin {
                approved_at: crate::now_ms(),
            },
        );
        tracing::info!("Approved provider access for {}", origin);
        self.resolve(origin, Ok(()));
        Ok(())
    }

    pub fn reject_by_origin(&mut self, origin: &str) -> Result<(), ApprovalError> {
        self.pending
            .remove(origin)
            .ok_or_else(|| ApprovalError::NotPending(origin.into()))?;
        self.resolve(origin, Err(ApprovalError::Rejected(origin.into())));
        Ok(())
    }

    /// Forget an approval. Returns whether the origin was approved.
    pub fn revoke(&mut self, origin: &str) -> bool {
        self.approved.remove(origin).is_some()
    }

    pub fn clear_approved(&mut self) {
        self.approved.clear();
    }

    pub fn approved(&self) -> &BTreeMap<String, ApprovedOrigin> {
        &self.approved
    }

    pub fn pending(&self) -> Vec<ProviderRequest> {
        self.pending.values().cloned().collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn resolve(&mut self, origin: &str, result: Result<(), ApprovalError>) {
        for waiter in self.waiters.remove(origin).unwrap_or_default() {
            let _ = waiter.send(result.clone());
        }
    }
}
