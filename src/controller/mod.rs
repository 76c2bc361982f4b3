//! The controller: sole owner and mutator of wallet state.
//!
//! Everything that changes the wallet goes through here. State lives behind
//! one async `RwLock` that is only ever held for in-memory work; node calls,
//! signing and waits for the user happen with the lock released. Changes are
//! announced on a broadcast channel of `ControllerEvent`s which persistence,
//! the badge and every connected session subscribe to independently.

pub mod dispatch;
pub mod signing;
pub mod streams;
pub mod transactions;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};

use crate::badge::BadgeCounts;
use crate::keyring::{SignerError, TxSigner};
use crate::messages::{Message, MessageError, MessageKind, MessageManager};
use crate::network::{NetworkController, NetworkError};
use crate::notification::UserConfirmation;
use crate::provider_approval::{
    ApprovalError, ApprovalOutcome, ProviderApprovalController, ProviderRequest,
};
use crate::state::{ApprovedOrigin, WalletState};
use crate::tokens::{Token, TokenError, SuggestedTokens};
use crate::transaction::{NonceTracker, TransactionMeta, TxError, TxId, TxStateManager, TxStatus};
use crate::IdGenerator;

// ── Events ──

/// Which pending queue a badge update came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BadgeSource {
    Transactions,
    Messages,
    PersonalMessages,
    TypedMessages,
    ProviderRequests,
}

impl From<MessageKind> for BadgeSource {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::EthSign => BadgeSource::Messages,
            MessageKind::PersonalSign => BadgeSource::PersonalMessages,
            MessageKind::TypedData => BadgeSource::TypedMessages,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ControllerEvent {
    /// Something persisted or shown to the UI changed.
    StateChanged,
    TxStatusUpdate { id: TxId, status: TxStatus },
    BadgeUpdate(BadgeSource),
    ClientOpen(bool),
}

// ── Errors ──

#[derive(Clone, Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error("the method {0} does not exist")]
    MethodNotFound(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("origin {0} is not authorized")]
    Unauthorized(String),
    #[error("controller is shutting down")]
    Shutdown,
}

impl ControllerError {
    /// JSON-RPC error code reported to the requesting session.
    pub fn rpc_code(&self) -> i64 {
        match self {
            ControllerError::Tx(TxError::Rejected(_))
            | ControllerError::Message(MessageError::Rejected(_))
            | ControllerError::Approval(ApprovalError::Rejected(_)) => 4001,
            ControllerError::Unauthorized(_)
            | ControllerError::Approval(ApprovalError::Unauthorized(_)) => 4100,
            ControllerError::MethodNotFound(_) => -32601,
            ControllerError::InvalidParams(_)
            | ControllerError::Tx(TxError::InvalidParams(_))
            | ControllerError::Tx(TxError::UnknownAccount(_))
            | ControllerError::Message(MessageError::InvalidParams(_))
            | ControllerError::Token(_) => -32602,
            ControllerError::Network(NetworkError::Rpc { code, .. }) => *code,
            _ => -32603,
        }
    }
}

// ── State ──

/// Everything the controller owns, behind one lock.
pub(crate) struct ControllerState {
    /// Persisted wallet fields. `transactions` and `approved_origins` live
    /// in their managers and are folded back in on snapshot.
    pub wallet: WalletState,
    pub txs: TxStateManager,
    pub messages: MessageManager,
    pub personal_messages: MessageManager,
    pub typed_messages: MessageManager,
    pub approvals: ProviderApprovalController,
    pub suggested_tokens: SuggestedTokens,
    pub client_open: bool,
}

impl ControllerState {
    pub fn queue(&mut self, kind: MessageKind) -> &mut MessageManager {
        match kind {
            MessageKind::EthSign => &mut self.messages,
            MessageKind::PersonalSign => &mut self.personal_messages,
            MessageKind::TypedData => &mut self.typed_messages,
        }
    }

    fn persisted(&self) -> WalletState {
        let mut wallet = self.wallet.clone();
        wallet.transactions = self.txs.all().to_vec();
        wallet.approved_origins = self.approvals.approved().clone();
        wallet
    }
}

/// Read-only snapshot pushed to trusted sessions.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UiState {
    #[serde(flatten)]
    pub wallet: WalletState,
    pub unapproved_txs: BTreeMap<TxId, TransactionMeta>,
    pub unapproved_msgs: BTreeMap<u64, Message>,
    pub unapproved_msg_count: usize,
    pub unapproved_personal_msgs: BTreeMap<u64, Message>,
    pub unapproved_personal_msg_count: usize,
    pub unapproved_typed_messages: BTreeMap<u64, Message>,
    pub unapproved_typed_messages_count: usize,
    pub provider_requests: Vec<ProviderRequest>,
    pub suggested_tokens: Vec<Token>,
    pub is_client_open: bool,
}

/// Collaborators the controller is built with.
pub struct ControllerDeps {
    pub network: Arc<NetworkController>,
    pub signer: Arc<dyn TxSigner>,
    pub confirmation: Arc<dyn UserConfirmation>,
    pub polling_interval: Duration,
}

pub struct Controller {
    state: RwLock<ControllerState>,
    events: broadcast::Sender<ControllerEvent>,
    network: Arc<NetworkController>,
    signer: Arc<dyn TxSigner>,
    confirmation: Arc<dyn UserConfirmation>,
    ids: IdGenerator,
    nonces: NonceTracker,
    polling_interval: Duration,
    /// Transactions failed by `new` because a restart cut them off.
    interrupted: Vec<TxId>,
}

impl Controller {
    /// Take ownership of loaded wallet state.
    ///
    /// Transactions caught between approval and submission by a restart are
    /// failed here, since their signing flow no longer exists.
    pub fn new(mut wallet: WalletState, deps: ControllerDeps) -> Arc<Self> {
        let ids = IdGenerator::seeded_above(wallet.max_transaction_id());
        let mut txs = TxStateManager::new(std::mem::take(&mut wallet.transactions));
        let interrupted = txs.fail_interrupted();
        if !interrupted.is_empty() {
            tracing::warn!(
                "Failed {} transaction(s) interrupted before submission",
                interrupted.len()
            );
        }
        let approvals = ProviderApprovalController::new(std::mem::take(&mut wallet.approved_origins));
        let (events, _) = broadcast::channel(1024);
        Arc::new(Controller {
            state: RwLock::new(ControllerState {
                wallet,
                txs,
                messages: MessageManager::new(MessageKind::EthSign),
                personal_messages: MessageManager::new(MessageKind::PersonalSign),
                typed_messages: MessageManager::new(MessageKind::TypedData),
                approvals,
                suggested_tokens: SuggestedTokens::default(),
                client_open: false,
            }),
            events,
            network: deps.network,
            signer: deps.signer,
            confirmation: deps.confirmation,
            ids,
            nonces: NonceTracker::new(),
            polling_interval: deps.polling_interval,
            interrupted,
        })
    }

    /// Ids failed at construction. Nobody was subscribed yet to see them go.
    pub fn interrupted_at_boot(&self) -> &[TxId] {
        &self.interrupted
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ControllerEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn emit_badge(&self, source: BadgeSource) {
        self.emit(ControllerEvent::BadgeUpdate(source));
        self.emit(ControllerEvent::StateChanged);
    }

    pub fn network(&self) -> &Arc<NetworkController> {
        &self.network
    }

    // ── Snapshots ──

    /// What gets written to storage.
    pub async fn persisted_state(&self) -> WalletState {
        self.state.read().await.persisted()
    }

    pub async fn ui_state(&self) -> UiState {
        let state = self.state.read().await;
        UiState {
            wallet: state.persisted(),
            unapproved_txs: state.txs.unapproved(),
            unapproved_msgs: state.messages.unapproved(),
            unapproved_msg_count: state.messages.unapproved_count(),
            unapproved_personal_msgs: state.personal_messages.unapproved(),
            unapproved_personal_msg_count: state.personal_messages.unapproved_count(),
            unapproved_typed_messages: state.typed_messages.unapproved(),
            unapproved_typed_messages_count: state.typed_messages.unapproved_count(),
            provider_requests: state.approvals.pending(),
            suggested_tokens: state.suggested_tokens.all().to_vec(),
            is_client_open: state.client_open,
        }
    }

    pub async fn badge_counts(&self) -> BadgeCounts {
        let state = self.state.read().await;
        BadgeCounts {
            unapproved_txs: state.txs.unapproved_count(),
            unapproved_msgs: state.messages.unapproved_count(),
            unapproved_personal_msgs: state.personal_messages.unapproved_count(),
            unapproved_typed_msgs: state.typed_messages.unapproved_count(),
            provider_requests: state.approvals.pending_count(),
        }
    }

    pub async fn transaction(&self, id: TxId) -> Option<TransactionMeta> {
        self.state.read().await.txs.get(id).cloned()
    }

    pub async fn is_client_open(&self) -> bool {
        self.state.read().await.client_open
    }

    /// Called when the aggregate "any wallet surface open" flips.
    pub async fn set_client_open(&self, open: bool) {
        self.state.write().await.client_open = open;
        tracing::debug!("Client open: {}", open);
        self.emit(ControllerEvent::ClientOpen(open));
    }

    /// Values every page may see: `selectedAddress` only once approved.
    pub async fn public_config(&self, origin: &str) -> Value {
        let state = self.state.read().await;
        let selected = if state.approvals.is_approved(origin) {
            state.wallet.selected_address.clone()
        } else {
            None
        };
        json!({
            "selectedAddress": selected,
            "networkVersion": self.network.network_id(),
            "chainId": self.network.chain_id(),
        })
    }

    // ── Provider approvals ──

    pub async fn is_origin_approved(&self, origin: &str) -> bool {
        self.state.read().await.approvals.is_approved(origin)
    }

    pub async fn selected_address(&self) -> Option<String> {
        self.state.read().await.wallet.selected_address.clone()
    }

    /// Accounts `origin` may see; empty when it isn't approved.
    pub async fn accounts_for(&self, origin: &str) -> Vec<String> {
        let state = self.state.read().await;
        if !state.approvals.is_approved(origin) {
            return Vec::new();
        }
        state.wallet.selected_address.iter().cloned().collect()
    }

    /// `eth_requestAccounts`: ask the user once per origin.
    pub async fn request_accounts(
        &self,
        origin: &str,
        site_title: Option<String>,
        tab_id: Option<u64>,
    ) -> Result<Vec<String>, ControllerError> {
        let outcome = self.state.write().await.approvals.request(ProviderRequest {
            origin: origin.into(),
            site_title,
            tab_id,
            time: crate::now_ms(),
        });
        if let ApprovalOutcome::Pending(waiter) = outcome {
            self.emit_badge(BadgeSource::ProviderRequests);
            self.confirmation.trigger_ui().await;
            waiter.await.map_err(|_| ControllerError::Shutdown)??;
        }
        Ok(self.accounts_for(origin).await)
    }

    pub async fn approve_provider_request_by_origin(&self, origin: &str) -> Result<(), ControllerError> {
        self.state.write().await.approvals.approve_by_origin(origin)?;
        self.emit_badge(BadgeSource::ProviderRequests);
        Ok(())
    }

    pub async fn reject_provider_request_by_origin(&self, origin: &str) -> Result<(), ControllerError> {
        self.state.write().await.approvals.reject_by_origin(origin)?;
        self.emit_badge(BadgeSource::ProviderRequests);
        Ok(())
    }

    pub async fn approved_origins(&self) -> BTreeMap<String, ApprovedOrigin> {
        self.state.read().await.approvals.approved().clone()
    }

    pub async fn revoke_origin(&self, origin: &str) -> bool {
        let revoked = self.state.write().await.approvals.revoke(origin);
        if revoked {
            self.emit(ControllerEvent::StateChanged);
        }
        revoked
    }

    pub async fn clear_approved_origins(&self) {
        self.state.write().await.approvals.clear_approved();
        self.emit(ControllerEvent::StateChanged);
    }

    // ── Preferences ──

    pub async fn set_selected_address(&self, address: &str) -> Result<(), ControllerError> {
        let address = address.to_lowercase();
        let mut state = self.state.write().await;
        if !state.wallet.identities.contains_key(&address) {
            return Err(TxError::UnknownAccount(address).into());
        }
        state.wallet.selected_address = Some(address);
        drop(state);
        self.emit(ControllerEvent::StateChanged);
        Ok(())
    }

    pub async fn set_account_label(&self, address: &str, label: &str) -> Result<(), ControllerError> {
        let address = address.to_lowercase();
        let mut state = self.state.write().await;
        let identity = state
            .wallet
            .identities
            .get_mut(&address)
            .ok_or_else(|| TxError::UnknownAccount(address.clone()))?;
        identity.name = label.into();
        drop(state);
        self.emit(ControllerEvent::StateChanged);
        Ok(())
    }

    /// Switch to a custom RPC endpoint and look up its network id.
    pub async fn set_rpc_target(
        &self,
        rpc_target: &str,
        chain_id: Option<&str>,
        nickname: Option<&str>,
    ) -> Result<(), ControllerError> {
        let provider = self.network.set_rpc_target(rpc_target, chain_id, nickname)?;
        let network_id = match self.network.send("net_version", json!([])).await {
            Ok(Value::String(id)) => id,
            Ok(other) => other.to_string(),
            Err(e) => {
                tracing::warn!("Could not read network id from {}: {}", rpc_target, e);
                "loading".into()
            }
        };
        self.network.set_network_id(&network_id);
        let mut state = self.state.write().await;
        state.wallet.provider = provider;
        state.wallet.network = network_id;
        drop(state);
        self.emit(ControllerEvent::StateChanged);
        Ok(())
    }

    // ── Tokens ──

    /// `wallet_watchAsset`: returns whether the token ended up in the wallet.
    pub async fn watch_asset(&self, params: &Value) -> Result<bool, ControllerError> {
        let token = crate::tokens::parse_watch_asset(params)?;
        let address = token.address.clone();
        let resolved = self.state.write().await.suggested_tokens.suggest(token);
        self.emit(ControllerEvent::StateChanged);
        tokio::select! {
            _ = resolved => {}
            _ = self.confirmation.open_popup() => {}
        }
        let state = self.state.read().await;
        Ok(state.wallet.tokens.iter().any(|t| t.address == address))
    }

    pub async fn add_token(&self, token: Token) -> Result<(), ControllerError> {
        let token = Token {
            address: token.address.to_lowercase(),
            ..token
        };
        let mut state = self.state.write().await;
        let address = token.address.clone();
        match state.wallet.tokens.iter_mut().find(|t| t.address == address) {
            Some(existing) => *existing = token,
            None => state.wallet.tokens.push(token),
        }
        state.suggested_tokens.resolve(&address);
        drop(state);
        self.emit(ControllerEvent::StateChanged);
        Ok(())
    }

    pub async fn remove_token(&self, address: &str) {
        let address = address.to_lowercase();
        self.state
            .write()
            .await
            .wallet
            .tokens
            .retain(|t| t.address != address);
        self.emit(ControllerEvent::StateChanged);
    }

    pub async fn remove_suggested_tokens(&self) {
        self.state.write().await.suggested_tokens.clear();
        self.emit(ControllerEvent::StateChanged);
    }

    // ── Background polling ──

    /// Refresh cached balances of every known account.
    pub async fn refresh_balances(&self) {
        let addresses: Vec<String> = self.state.read().await.wallet.accounts.keys().cloned().collect();
        let mut changed = false;
        for address in addresses {
            match self.network.balance(&address).await {
                Ok(balance) => {
                    let mut state = self.state.write().await;
                    if let Some(account) = state.wallet.accounts.get_mut(&address) {
                        if account.balance.as_deref() != Some(balance.as_str()) {
                            account.balance = Some(balance);
                            changed = true;
                        }
                    }
                }
                Err(e) => tracing::debug!("Balance refresh for {} failed: {}", address, e),
            }
        }
        if changed {
            self.emit(ControllerEvent::StateChanged);
        }
    }

    /// Poll pending transactions, and balances while a client is open,
    /// until `cancel` fires.
    pub fn spawn_polling(
        self: &Arc<Self>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(controller.polling_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        controller.check_pending_transactions().await;
                        if controller.is_client_open().await {
                            controller.refresh_balances().await;
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
            tracing::debug!("Polling stopped");
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::config::NetworkConfig;
    use crate::keyring::DevKeyring;
    use crate::network::testing::{happy_node, MockNetwork};
    use crate::state::first_time_state;

    /// Counts UI requests. `open_popup` never returns, like a window the
    /// user leaves open.
    #[derive(Default)]
    pub struct CountingConfirmation {
        pub triggered: AtomicUsize,
        pub popups: AtomicUsize,
    }

    #[async_trait]
    impl UserConfirmation for CountingConfirmation {
        async fn trigger_ui(&self) {
            self.triggered.fetch_add(1, Ordering::SeqCst);
        }

        async fn open_popup(&self) {
            self.popups.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await
        }
    }

    pub struct Harness {
        pub controller: Arc<Controller>,
        pub node: Arc<MockNetwork>,
        pub confirmation: Arc<CountingConfirmation>,
        pub account: String,
    }

    pub fn harness_with(node: MockNetwork) -> Harness {
        let keyring = Arc::new(DevKeyring::from_seed("test seed", 2));
        let accounts = keyring.accounts();
        let network_config = NetworkConfig::default();
        let wallet: WalletState = serde_json::from_value(first_time_state(
            &network_config,
            &accounts,
            &json!({}),
        ))
        .unwrap();
        let node = Arc::new(node);
        let network = Arc::new(NetworkController::new(
            node.clone(),
            wallet.provider.clone(),
            &wallet.network,
        ));
        let confirmation = Arc::new(CountingConfirmation::default());
        let controller = Controller::new(
            wallet,
            ControllerDeps {
                network,
                signer: keyring,
                confirmation: confirmation.clone(),
                polling_interval: Duration::from_millis(20),
            },
        );
        Harness {
            controller,
            node,
            confirmation,
            account: accounts[0].clone(),
        }
    }

    pub fn harness() -> Harness {
        harness_with(happy_node())
    }
}

#[cfg(test)]
mod tests {
    use super::testing::harness;
    use super::*;

    #[tokio::test]
    async fn provider_request_waits_for_approval() {
        let h = harness();
        let c = h.controller.clone();
        let request =
            tokio::spawn(async move { c.request_accounts("https://dapp.example", None, None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.controller.badge_counts().await.provider_requests, 1);
        h.controller
            .approve_provider_request_by_origin("https://dapp.example")
            .await
            .unwrap();
        let accounts = request.await.unwrap().unwrap();
        assert_eq!(accounts, vec![h.account.clone()]);
        assert_eq!(h.controller.badge_counts().await.total(), 0);
        assert!(h
            .controller
            .approved_origins()
            .await
            .contains_key("https://dapp.example"));
    }

    #[tokio::test]
    async fn rejected_provider_request_maps_to_4001() {
        let h = harness();
        let c = h.controller.clone();
        let request =
            tokio::spawn(async move { c.request_accounts("https://evil.example", None, None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.controller
            .reject_provider_request_by_origin("https://evil.example")
            .await
            .unwrap();
        let err = request.await.unwrap().unwrap_err();
        assert_eq!(err.rpc_code(), 4001);
        assert!(h.controller.accounts_for("https://evil.example").await.is_empty());
    }

    #[tokio::test]
    async fn public_config_hides_address_until_approved() {
        let h = harness();
        let config = h.controller.public_config("https://dapp.example").await;
        assert!(config["selectedAddress"].is_null());
        assert_eq!(config["chainId"], "0x4e8");
        assert_eq!(config["networkVersion"], "1256");
        let internal = h
            .controller
            .public_config(crate::constants::INTERNAL_ORIGIN)
            .await;
        assert_eq!(internal["selectedAddress"], h.account);
    }

    #[tokio::test]
    async fn revoked_origin_is_persisted() {
        let h = harness();
        let c = h.controller.clone();
        let request = tokio::spawn(async move { c.request_accounts("https://a.example", None, None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.controller
            .approve_provider_request_by_origin("https://a.example")
            .await
            .unwrap();
        request.await.unwrap().unwrap();
        assert!(h
            .controller
            .persisted_state()
            .await
            .approved_origins
            .contains_key("https://a.example"));
        assert!(h.controller.revoke_origin("https://a.example").await);
        assert!(h.controller.persisted_state().await.approved_origins.is_empty());
    }

    #[tokio::test]
    async fn selected_address_must_be_known() {
        let h = harness();
        assert!(h.controller.set_selected_address("0xdead").await.is_err());
        h.controller
            .set_account_label(&h.account, "Savings")
            .await
            .unwrap();
        let state = h.controller.persisted_state().await;
        assert_eq!(state.identities[&h.account].name, "Savings");
    }

    #[tokio::test]
    async fn add_token_resolves_watch_asset() {
        let h = harness();
        let params = json!({
            "type": "ERC20",
            "options": {
                "address": "0x6b175474e89094c44da98b954eedeac495271d0f",
                "symbol": "DAI",
                "decimals": 18
            }
        });
        let c = h.controller.clone();
        let p = params.clone();
        let watch = tokio::spawn(async move { c.watch_asset(&p).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.controller.ui_state().await.suggested_tokens.len(), 1);
        let token = crate::tokens::parse_watch_asset(&params).unwrap();
        h.controller.add_token(token).await.unwrap();
        assert!(watch.await.unwrap().unwrap());
        assert!(h.controller.ui_state().await.suggested_tokens.is_empty());
    }

    #[tokio::test]
    async fn dismissed_suggestion_resolves_false() {
        let h = harness();
        let params = json!({
            "type": "ERC20",
            "options": {
                "address": "0x6b175474e89094c44da98b954eedeac495271d0f",
                "symbol": "DAI",
                "decimals": 18
            }
        });
        let c = h.controller.clone();
        let watch = tokio::spawn(async move { c.watch_asset(&params).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.controller.remove_suggested_tokens().await;
        assert!(!watch.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn balances_refresh() {
        let h = harness();
        h.controller.refresh_balances().await;
        let state = h.controller.persisted_state().await;
        assert_eq!(
            state.accounts[&h.account].balance.as_deref(),
            Some("0xde0b6b3a7640000")
        );
    }

    #[tokio::test]
    async fn client_open_event() {
        let h = harness();
        let mut events = h.controller.subscribe();
        h.controller.set_client_open(true).await;
        assert_eq!(events.recv().await.unwrap(), ControllerEvent::ClientOpen(true));
        assert!(h.controller.ui_state().await.is_client_open);
    }

    #[test]
    fn error_codes() {
        assert_eq!(ControllerError::Tx(TxError::Rejected(1)).rpc_code(), 4001);
        assert_eq!(ControllerError::Unauthorized("x".into()).rpc_code(), 4100);
        assert_eq!(ControllerError::MethodNotFound("x".into()).rpc_code(), -32601);
        assert_eq!(ControllerError::InvalidParams("x".into()).rpc_code(), -32602);
        assert_eq!(ControllerError::Shutdown.rpc_code(), -32603);
    }
}
