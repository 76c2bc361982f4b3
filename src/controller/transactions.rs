//! Transaction request and approval flows.

use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;

use super::{BadgeSource, Controller, ControllerError, ControllerEvent};
use crate::constants::{FALLBACK_GAS_LIMIT, SIMPLE_GAS_COST};
use crate::transaction::nonce::compute_next_nonce;
use crate::transaction::{NonceTracker, TransactionMeta, TxError, TxId, TxParams, TxStatus};

impl Controller {
    /// Record a new `unapproved` transaction and ask for the user.
    pub async fn submit_transaction_request(
        &self,
        params: TxParams,
        origin: &str,
    ) -> Result<TxId, ControllerError> {
        let params = params.normalize();
        if !self.signer.accounts().contains(&params.from) {
            return Err(TxError::UnknownAccount(params.from).into());
        }
        if params.to.is_none() && !params.has_data() {
            return Err(TxError::InvalidParams("contract creation requires data".into()).into());
        }
        let id = self.ids.next_id();
        let tx = TransactionMeta::new(id, params, origin, &self.network.network_id());
        self.state.write().await.txs.add(tx);
        tracing::info!("New unapproved transaction {} from {}", id, origin);
        self.emit_status(id, TxStatus::Unapproved);
        self.emit_badge(BadgeSource::Transactions);

        if let Err(e) = self.add_tx_defaults(id).await {
            tracing::error!("Could not fill defaults for transaction {}: {}", id, e);
            self.fail_transaction(id, &e).await;
            self.emit_badge(BadgeSource::Transactions);
            return Err(e);
        }
        self.confirmation.trigger_ui().await;
        Ok(id)
    }

    /// Submit and wait until the transaction is broadcast, returning its hash.
    pub async fn new_unapproved_transaction(
        &self,
        params: TxParams,
        origin: &str,
    ) -> Result<String, ControllerError> {
        let id = self.submit_transaction_request(params, origin).await?;
        self.wait_for_transaction_finished(id).await
    }

    /// Fill gas price and gas limit the page left out.
    async fn add_tx_defaults(&self, id: TxId) -> Result<(), ControllerError> {
        let params = self
            .transaction(id)
            .await
            .ok_or(TxError::NotFound(id))?
            .tx_params;

        let gas_price_specified = params.gas_price.is_some();
        let gas_price = match &params.gas_price {
            Some(price) => price.clone(),
            None => self.network.gas_price().await?,
        };

        let gas_limit_specified = params.gas.is_some();
        let mut estimated_gas = None;
        let mut simulation_fails = None;
        let gas = match &params.gas {
            Some(gas) => gas.clone(),
            None => {
                let plain_transfer = match (&params.to, params.has_data()) {
                    (Some(to), false) => self
                        .network
                        .get_code(to)
                        .await
                        .map(|code| code == "0x" || code == "0x0")
                        .unwrap_or(false),
                    _ => false,
                };
                if plain_transfer {
                    SIMPLE_GAS_COST.to_string()
                } else {
                    match self.network.estimate_gas(estimate_request(&params)).await {
                        Ok(estimate) => {
                            estimated_gas = Some(estimate.clone());
                            estimate
                        }
                        Err(e) => {
                            tracing::warn!("Gas estimation for transaction {} failed: {}", id, e);
                            simulation_fails = Some(e.to_string());
                            FALLBACK_GAS_LIMIT.to_string()
                        }
                    }
                }
            }
        };

        self.state
            .write()
            .await
            .txs
            .update(id, "Added new unapproved transaction.", |tx| {
                tx.tx_params.gas_price = Some(gas_price);
                tx.tx_params.gas = Some(gas);
                tx.gas_price_specified = gas_price_specified;
                tx.gas_limit_specified = gas_limit_specified;
                tx.estimated_gas = estimated_gas;
                tx.simulation_fails = simulation_fails;
                tx.loading_defaults = false;
            })?;
        self.emit(ControllerEvent::StateChanged);
        Ok(())
    }

    /// Sign and broadcast an `unapproved` transaction.
    ///
    /// The move to `approved` happens under the write lock and fails for
    /// anything not `unapproved`, so a second approve or a racing reject
    /// gets `InvalidTransition` and never reaches the signer.
    pub async fn approve_transaction(&self, id: TxId) -> Result<String, ControllerError> {
        let params = {
            let mut state = self.state.write().await;
            state
                .txs
                .set_status(id, TxStatus::Approved, "txStateManager: approved")?;
            state.txs.get(id).ok_or(TxError::NotFound(id))?.tx_params.clone()
        };
        self.emit_status(id, TxStatus::Approved);
        self.emit_badge(BadgeSource::Transactions);

        match self.sign_and_publish(id, params).await {
            Ok(hash) => Ok(hash),
            Err(e) => {
                tracing::error!("Transaction {} failed: {}", id, e);
                self.fail_transaction(id, &e).await;
                Err(e)
            }
        }
    }

    /// Assign a nonce, sign and broadcast. The sender's nonce lock is held
    /// until this returns, whether or not it succeeded.
    async fn sign_and_publish(&self, id: TxId, params: TxParams) -> Result<String, ControllerError> {
        let guard = self.nonces.acquire(&params.from).await;
        let network_nonce = self.network.transaction_count(&params.from).await?;
        let local_nonces = self.state.read().await.txs.local_nonces(&params.from);
        let lock = NonceTracker::lock_with(guard, compute_next_nonce(network_nonce, &local_nonces));
        let nonce = crate::format_hex_quantity(lock.next_nonce());

        let signed_params = {
            let mut state = self.state.write().await;
            let tx = state.txs.update(id, "transactions#approveTransaction", |tx| {
                tx.tx_params.nonce = Some(nonce.clone());
                tx.nonce_details = Some(lock.details.clone());
            })?;
            tx.tx_params.clone()
        };

        let raw_tx = self
            .signer
            .sign_transaction(&signed_params, &self.network.chain_id())
            .map_err(|e| TxError::Signer(e.to_string()))?;
        {
            let mut state = self.state.write().await;
            state
                .txs
                .update(id, "transactions#signTransaction", |tx| tx.raw_tx = Some(raw_tx.clone()))?;
            state
                .txs
                .set_status(id, TxStatus::Signed, "transactions#signTransaction")?;
        }
        self.emit_status(id, TxStatus::Signed);

        let hash = self
            .network
            .send_raw_transaction(&raw_tx)
            .await
            .map_err(|e| TxError::Network(e.to_string()))?;
        {
            let mut state = self.state.write().await;
            state.txs.update(id, "transactions#publishTransaction", |tx| {
                tx.hash = Some(hash.clone());
                tx.submitted_time = Some(crate::now_ms());
            })?;
            state
                .txs
                .set_status(id, TxStatus::Submitted, "transactions#publishTransaction")?;
        }
        tracing::info!("Transaction {} submitted as {}", id, hash);
        self.emit_status(id, TxStatus::Submitted);
        Ok(hash)
    }

    pub async fn reject_transaction(&self, id: TxId) -> Result<(), ControllerError> {
        self.state
            .write()
            .await
            .txs
            .set_status(id, TxStatus::Rejected, "txStateManager: rejected")?;
        tracing::info!("Transaction {} rejected", id);
        self.emit_status(id, TxStatus::Rejected);
        self.emit_badge(BadgeSource::Transactions);
        Ok(())
    }

    /// Move a transaction to `status`, appending to its history.
    pub async fn update_transaction_status(
        &self,
        id: TxId,
        status: TxStatus,
        note: &str,
    ) -> Result<(), ControllerError> {
        self.state.write().await.txs.set_status(id, status, note)?;
        self.emit_status(id, status);
        Ok(())
    }

    /// Resolve with the hash once broadcast, or the reason it never was.
    pub async fn wait_for_transaction_finished(&self, id: TxId) -> Result<String, ControllerError> {
        let mut events = self.subscribe();
        loop {
            if let Some(result) = self.finished_result(id).await? {
                return result;
            }
            loop {
                match events.recv().await {
                    Ok(ControllerEvent::TxStatusUpdate { id: updated, .. }) if updated == id => break,
                    Ok(_) => continue,
                    Err(RecvError::Lagged(_)) => break,
                    Err(RecvError::Closed) => return Err(ControllerError::Shutdown),
                }
            }
        }
    }

    async fn finished_result(
        &self,
        id: TxId,
    ) -> Result<Option<Result<String, ControllerError>>, ControllerError> {
        let tx = self.transaction(id).await.ok_or(TxError::NotFound(id))?;
        let reason = || {
            tx.err
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_else(|| "unknown error".into())
        };
        Ok(match tx.status {
            TxStatus::Submitted | TxStatus::Confirmed => {
                Some(tx.hash.clone().ok_or_else(|| {
                    ControllerError::from(TxError::Failed {
                        id,
                        reason: "submitted without a hash".into(),
                    })
                }))
            }
            TxStatus::Rejected => Some(Err(TxError::Rejected(id).into())),
            TxStatus::Failed => Some(Err(TxError::Failed { id, reason: reason() }.into())),
            TxStatus::Dropped => Some(Err(TxError::Failed {
                id,
                reason: "transaction was dropped".into(),
            }
            .into())),
            TxStatus::Unapproved | TxStatus::Approved | TxStatus::Signed => None,
        })
    }

    /// Check receipts of submitted transactions.
    ///
    /// A receipt confirms the transaction. Without one, an account nonce
    /// that has moved past the transaction's nonce means another
    /// transaction took its place and it is dropped.
    pub async fn check_pending_transactions(&self) {
        let submitted: Vec<TransactionMeta> = self
            .state
            .read()
            .await
            .txs
            .with_status(TxStatus::Submitted)
            .cloned()
            .collect();
        for tx in submitted {
            let Some(hash) = tx.hash.clone() else { continue };
            match self.network.transaction_receipt(&hash).await {
                Ok(Some(receipt)) => {
                    let mut state = self.state.write().await;
                    let updated = state
                        .txs
                        .update(tx.id, "txStateManager: confirmed", |t| t.tx_receipt = Some(receipt))
                        .map(|_| ());
                    let confirmed = updated.and_then(|()| {
                        state
                            .txs
                            .set_status(tx.id, TxStatus::Confirmed, "txStateManager: confirmed")
                    });
                    drop(state);
                    match confirmed {
                        Ok(_) => self.emit_status(tx.id, TxStatus::Confirmed),
                        Err(e) => tracing::debug!("Skipping confirmation of {}: {}", tx.id, e),
                    }
                }
                Ok(None) => {
                    let Some(nonce) = tx.nonce() else { continue };
                    match self.network.confirmed_transaction_count(&tx.tx_params.from).await {
                        Ok(count) if count > nonce => {
                            let dropped = self.state.write().await.txs.set_status(
                                tx.id,
                                TxStatus::Dropped,
                                "txStateManager: dropped",
                            );
                            if dropped.is_ok() {
                                tracing::warn!("Transaction {} dropped", tx.id);
                                self.emit_status(tx.id, TxStatus::Dropped);
                            }
                        }
                        Ok(_) => {}
                        Err(e) => tracing::debug!("Nonce check for {} failed: {}", tx.id, e),
                    }
                }
                Err(e) => tracing::debug!("Receipt check for {} failed: {}", tx.id, e),
            }
        }
    }

    /// Move `id` to `failed`, recording `error` on it.
    async fn fail_transaction(&self, id: TxId, error: &ControllerError) {
        let tx_error = match error {
            ControllerError::Tx(tx_error) => tx_error.clone(),
            other => TxError::Failed {
                id,
                reason: other.to_string(),
            },
        };
        if let Err(fail_error) = self.state.write().await.txs.set_failed(id, &tx_error) {
            tracing::warn!("Could not mark transaction {} failed: {}", id, fail_error);
        } else {
            self.emit_status(id, TxStatus::Failed);
        }
    }

    fn emit_status(&self, id: TxId, status: TxStatus) {
        self.emit(ControllerEvent::TxStatusUpdate { id, status });
        self.emit(ControllerEvent::StateChanged);
    }

    /// `eth_getTransactionByHash` answered from wallet records.
    pub async fn local_transaction_by_hash(&self, hash: &str) -> Option<Value> {
        let state = self.state.read().await;
        let tx = state.txs.find_by_hash(hash)?;
        serde_json::to_value(crate::transaction::RpcTransaction::from(tx)).ok()
    }
}

fn estimate_request(params: &TxParams) -> Value {
    let mut request = json!({ "from": params.from });
    if let Some(to) = &params.to {
        request["to"] = json!(to);
    }
    if let Some(value) = &params.value {
        request["value"] = json!(value);
    }
    if let Some(data) = &params.data {
        request["data"] = json!(data);
    }
    request
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;
    use crate::controller::testing::{harness, harness_with};
    use crate::network::testing::happy_node;
    use crate::network::NetworkError;

    fn transfer(from: &str) -> TxParams {
        TxParams {
            from: from.into(),
            to: Some("0x6b175474e89094c44da98b954eedeac495271d0f".into()),
            value: Some("0x1".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn ids_are_unique_and_ordered() {
        let h = harness();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(
                h.controller
                    .submit_transaction_request(transfer(&h.account), "https://dapp.example")
                    .await
                    .unwrap(),
            );
        }
        let unique: HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), 5);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(h.controller.badge_counts().await.unapproved_txs, 5);
        assert_eq!(
            h.confirmation
                .triggered
                .load(std::sync::atomic::Ordering::SeqCst),
            5
        );
    }

    #[tokio::test]
    async fn plain_transfer_uses_simple_gas() {
        let h = harness();
        let id = h
            .controller
            .submit_transaction_request(transfer(&h.account), "https://dapp.example")
            .await
            .unwrap();
        let tx = h.controller.transaction(id).await.unwrap();
        assert_eq!(tx.tx_params.gas.as_deref(), Some(SIMPLE_GAS_COST));
        assert_eq!(tx.tx_params.gas_price.as_deref(), Some("0x3b9aca00"));
        assert!(!tx.gas_limit_specified);
        assert!(!tx.loading_defaults);
        assert_eq!(h.node.calls_to("eth_estimateGas"), 0);
    }

    #[tokio::test]
    async fn failed_gas_price_fails_the_request() {
        let h = harness();
        h.node.set(
            "eth_gasPrice",
            Err(NetworkError::Rpc {
                code: -32000,
                message: "node unavailable".into(),
            }),
        );
        let mut events = h.controller.subscribe();
        let err = h
            .controller
            .submit_transaction_request(transfer(&h.account), "https://dapp.example")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("node unavailable"));

        assert_eq!(h.controller.badge_counts().await.total(), 0);
        assert_eq!(
            h.confirmation
                .triggered
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );
        let tx = &h.controller.persisted_state().await.transactions[0];
        assert_eq!(tx.status, TxStatus::Failed);
        assert!(tx.err.as_ref().unwrap().message.contains("node unavailable"));

        let mut failed_seen = false;
        while let Ok(event) = events.try_recv() {
            if let ControllerEvent::TxStatusUpdate { id, status: TxStatus::Failed } = event {
                assert_eq!(id, tx.id);
                failed_seen = true;
            }
        }
        assert!(failed_seen);
    }

    #[tokio::test]
    async fn failed_estimate_falls_back() {
        let h = harness();
        h.node.set(
            "eth_estimateGas",
            Err(NetworkError::Rpc {
                code: -32000,
                message: "execution reverted".into(),
            }),
        );
        let params = TxParams {
            data: Some("0xa9059cbb".into()),
            ..transfer(&h.account)
        };
        let id = h
            .controller
            .submit_transaction_request(params, "https://dapp.example")
            .await
            .unwrap();
        let tx = h.controller.transaction(id).await.unwrap();
        assert_eq!(tx.tx_params.gas.as_deref(), Some(FALLBACK_GAS_LIMIT));
        assert!(tx.simulation_fails.unwrap().contains("execution reverted"));
    }

    #[tokio::test]
    async fn specified_gas_is_kept() {
        let h = harness();
        let params = TxParams {
            gas: Some("0x7530".into()),
            gas_price: Some("0x2".into()),
            ..transfer(&h.account)
        };
        let id = h
            .controller
            .submit_transaction_request(params, "https://dapp.example")
            .await
            .unwrap();
        let tx = h.controller.transaction(id).await.unwrap();
        assert!(tx.gas_limit_specified && tx.gas_price_specified);
        assert_eq!(tx.tx_params.gas.as_deref(), Some("0x7530"));
        assert_eq!(h.node.calls_to("eth_gasPrice"), 0);
    }

    #[tokio::test]
    async fn unknown_sender_is_refused() {
        let h = harness();
        let err = h
            .controller
            .submit_transaction_request(transfer("0xdead"), "https://dapp.example")
            .await
            .unwrap_err();
        assert_eq!(err.rpc_code(), -32602);
    }

    #[tokio::test]
    async fn approve_signs_and_submits() {
        let h = harness();
        let id = h
            .controller
            .submit_transaction_request(transfer(&h.account), "https://dapp.example")
            .await
            .unwrap();
        let hash = h.controller.approve_transaction(id).await.unwrap();
        assert_eq!(hash, "0xhash");
        let tx = h.controller.transaction(id).await.unwrap();
        assert_eq!(tx.status, TxStatus::Submitted);
        assert_eq!(tx.tx_params.nonce.as_deref(), Some("0x0"));
        assert!(tx.raw_tx.is_some());
        assert!(tx.submitted_time.is_some());
        assert_eq!(tx.nonce_details.unwrap().next_nonce, 0);
        assert_eq!(h.controller.badge_counts().await.unapproved_txs, 0);
    }

    #[tokio::test]
    async fn second_transaction_takes_next_nonce() {
        let h = harness();
        let a = h
            .controller
            .submit_transaction_request(transfer(&h.account), "o")
            .await
            .unwrap();
        let b = h
            .controller
            .submit_transaction_request(transfer(&h.account), "o")
            .await
            .unwrap();
        h.controller.approve_transaction(a).await.unwrap();
        h.controller.approve_transaction(b).await.unwrap();
        let tx = h.controller.transaction(b).await.unwrap();
        assert_eq!(tx.tx_params.nonce.as_deref(), Some("0x1"));
    }

    #[tokio::test]
    async fn approve_after_reject_is_invalid() {
        let h = harness();
        let id = h
            .controller
            .submit_transaction_request(transfer(&h.account), "o")
            .await
            .unwrap();
        h.controller.reject_transaction(id).await.unwrap();
        let err = h.controller.approve_transaction(id).await.unwrap_err();
        assert!(matches!(
            err,
            ControllerError::Tx(TxError::InvalidTransition {
                from: TxStatus::Rejected,
                to: TxStatus::Approved,
                ..
            })
        ));
        assert!(h.controller.reject_transaction(id).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_approve_and_reject_only_one_wins() {
        let h = harness();
        let id = h
            .controller
            .submit_transaction_request(transfer(&h.account), "o")
            .await
            .unwrap();
        let (a, b) = (h.controller.clone(), h.controller.clone());
        let approve = tokio::spawn(async move { a.approve_transaction(id).await.is_ok() });
        let reject = tokio::spawn(async move { b.reject_transaction(id).await.is_ok() });
        let (approved, rejected) = (approve.await.unwrap(), reject.await.unwrap());
        assert!(approved ^ rejected);
    }

    #[tokio::test]
    async fn broadcast_failure_marks_failed() {
        let h = harness();
        h.node.set(
            "eth_sendRawTransaction",
            Err(NetworkError::Rpc {
                code: -32000,
                message: "nonce too low".into(),
            }),
        );
        let id = h
            .controller
            .submit_transaction_request(transfer(&h.account), "o")
            .await
            .unwrap();
        let mut events = h.controller.subscribe();
        assert!(h.controller.approve_transaction(id).await.is_err());
        let tx = h.controller.transaction(id).await.unwrap();
        assert_eq!(tx.status, TxStatus::Failed);
        assert!(tx.err.unwrap().message.contains("nonce too low"));
        let mut saw_failed = false;
        while let Ok(event) = events.try_recv() {
            if event == (ControllerEvent::TxStatusUpdate { id, status: TxStatus::Failed }) {
                saw_failed = true;
            }
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn new_unapproved_transaction_resolves_with_hash() {
        let h = harness();
        let c = h.controller.clone();
        let account = h.account.clone();
        let request = tokio::spawn(async move {
            c.new_unapproved_transaction(transfer(&account), "https://dapp.example")
                .await
        });
        let id = loop {
            if let Some(id) = h.controller.ui_state().await.unapproved_txs.keys().next().copied() {
                break id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        h.controller.approve_transaction(id).await.unwrap();
        assert_eq!(request.await.unwrap().unwrap(), "0xhash");
    }

    #[tokio::test]
    async fn new_unapproved_transaction_rejected_is_4001() {
        let h = harness();
        let c = h.controller.clone();
        let account = h.account.clone();
        let request = tokio::spawn(async move {
            c.new_unapproved_transaction(transfer(&account), "https://dapp.example")
                .await
        });
        let id = loop {
            if let Some(id) = h.controller.ui_state().await.unapproved_txs.keys().next().copied() {
                break id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        h.controller.reject_transaction(id).await.unwrap();
        assert_eq!(request.await.unwrap().unwrap_err().rpc_code(), 4001);
    }

    #[tokio::test]
    async fn receipt_confirms_submitted_transaction() {
        let h = harness();
        let id = h
            .controller
            .submit_transaction_request(transfer(&h.account), "o")
            .await
            .unwrap();
        h.controller.approve_transaction(id).await.unwrap();
        h.node.set(
            "eth_getTransactionReceipt",
            Ok(json!({ "blockHash": "0xblock", "blockNumber": "0x10", "transactionIndex": "0x0", "status": "0x1" })),
        );
        h.controller.check_pending_transactions().await;
        let tx = h.controller.transaction(id).await.unwrap();
        assert_eq!(tx.status, TxStatus::Confirmed);
        assert_eq!(tx.tx_receipt.unwrap().block_hash.as_deref(), Some("0xblock"));
        let rpc = h.controller.local_transaction_by_hash("0xHASH").await.unwrap();
        assert_eq!(rpc["blockNumber"], "0x10");
    }

    #[tokio::test]
    async fn passed_nonce_without_receipt_is_dropped() {
        let h = harness_with(happy_node());
        let id = h
            .controller
            .submit_transaction_request(transfer(&h.account), "o")
            .await
            .unwrap();
        h.controller.approve_transaction(id).await.unwrap();
        h.node.set("eth_getTransactionCount", Ok(json!("0x5")));
        h.controller.check_pending_transactions().await;
        assert_eq!(
            h.controller.transaction(id).await.unwrap().status,
            TxStatus::Dropped
        );
        assert!(h
            .controller
            .update_transaction_status(id, TxStatus::Confirmed, "late")
            .await
            .is_err());
    }
}
