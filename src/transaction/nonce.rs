//! Nonce assignment.
//!
//! The next nonce for an address is the larger of what the node reports as
//! pending and one past the highest nonce this wallet has already used. A
//! per-address async lock is held from assignment until the transaction is
//! either submitted or failed, so two approvals never pick the same nonce.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;

use super::NonceDetails;

/// Held while a nonce is assigned but not yet broadcast.
pub struct NonceLock {
    pub details: NonceDetails,
    _guard: OwnedMutexGuard<()>,
}

impl NonceLock {
    pub fn next_nonce(&self) -> u64 {
        self.details.next_nonce
    }
}

/// Per-address nonce locks.
#[derive(Default)]
pub struct NonceTracker {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl NonceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive nonce assignment on `address`.
    pub async fn acquire(&self, address: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(locks) => locks,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks
                .entry(address.to_lowercase())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Bind computed details to a held guard.
    pub fn lock_with(guard: OwnedMutexGuard<()>, details: NonceDetails) -> NonceLock {
        NonceLock {
            details,
            _guard: guard,
        }
    }
}

/// Pick the next nonce from the node's pending count and local history.
pub fn compute_next_nonce(network_nonce: u64, local_nonces: &[u64]) -> NonceDetails {
    let highest_local_nonce = local_nonces.iter().copied().max();
    let local_next = highest_local_nonce.map(|n| n + 1).unwrap_or(0);
    NonceDetails {
        network_nonce,
        highest_local_nonce,
        next_nonce: network_nonce.max(local_next),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn network_nonce_wins_when_ahead() {
        let details = compute_next_nonce(7, &[2, 3]);
        assert_eq!(details.next_nonce, 7);
        assert_eq!(details.highest_local_nonce, Some(3));
    }

    #[test]
    fn local_nonce_wins_when_node_lags() {
        let details = compute_next_nonce(3, &[3, 4, 5]);
        assert_eq!(details.next_nonce, 6);
    }

    #[test]
    fn no_history_uses_network() {
        let details = compute_next_nonce(0, &[]);
        assert_eq!(details.next_nonce, 0);
        assert_eq!(details.highest_local_nonce, None);
    }

    #[tokio::test]
    async fn lock_is_exclusive_per_address() {
        let tracker = Arc::new(NonceTracker::new());
        let guard = tracker.acquire("0xAAA").await;

        let t = tracker.clone();
        let waiter = tokio::spawn(async move {
            let _g = t.acquire("0xaaa").await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        // A different address is not blocked.
        let _other = tokio::time::timeout(Duration::from_millis(200), tracker.acquire("0xbbb"))
            .await
            .unwrap();

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
