//! Node RPC access for the background process.
//!
//! The controller never speaks HTTP itself. It goes through a
//! `NetworkController`, which knows the selected provider, forwards calls to
//! a `NetworkClient` and announces every outbound call on a broadcast
//! channel so a metrics sink can record it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use url::Url;

use crate::state::ProviderConfig;
use crate::transaction::TxReceipt;

/// Errors from node communication.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum NetworkError {
    #[error("invalid rpc target `{0}`")]
    InvalidTarget(String),
    #[error("http error: {0}")]
    Http(String),
    #[error("node error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Sends one JSON-RPC call to a node.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    async fn request(&self, target: &Url, method: &str, params: Value)
        -> Result<Value, NetworkError>;
}

/// JSON-RPC 2.0 over HTTP POST.
pub struct HttpNetworkClient {
    http: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpNetworkClient {
    pub fn new() -> Self {
        HttpNetworkClient {
            http: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
        }
    }
}

impl Default for HttpNetworkClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkClient for HttpNetworkClient {
    async fn request(
        &self,
        target: &Url,
        method: &str,
        params: Value,
    ) -> Result<Value, NetworkError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
            "method": method,
            "params": params,
        });
        let response = self
            .http
            .post(target.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| NetworkError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(NetworkError::Http(format!("status {}", response.status())));
        }
        let reply: Value = response
            .json()
            .await
            .map_err(|e| NetworkError::InvalidResponse(e.to_string()))?;
        parse_rpc_reply(reply)
    }
}

/// Pull `result` out of a JSON-RPC reply, turning `error` into `NetworkError::Rpc`.
pub fn parse_rpc_reply(mut reply: Value) -> Result<Value, NetworkError> {
    if let Some(error) = reply.get("error").filter(|e| !e.is_null()) {
        return Err(NetworkError::Rpc {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(-32603),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    match reply.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(NetworkError::InvalidResponse("missing result".into())),
    }
}

/// Selected provider plus the client used to reach it.
pub struct NetworkController {
    client: Arc<dyn NetworkClient>,
    provider: RwLock<ProviderConfig>,
    network_id: RwLock<String>,
    requests: broadcast::Sender<Value>,
}

impl NetworkController {
    pub fn new(client: Arc<dyn NetworkClient>, provider: ProviderConfig, network_id: &str) -> Self {
        let (requests, _) = broadcast::channel(256);
        NetworkController {
            client,
            provider: RwLock::new(provider),
            network_id: RwLock::new(network_id.to_string()),
            requests,
        }
    }

    /// Every outbound call as `{ method, params, target }`.
    pub fn subscribe_requests(&self) -> broadcast::Receiver<Value> {
        self.requests.subscribe()
    }

    pub fn provider(&self) -> ProviderConfig {
        match self.provider.read() {
            Ok(p) => p.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn network_id(&self) -> String {
        match self.network_id.read() {
            Ok(n) => n.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Hex chain id of the selected network.
    pub fn chain_id(&self) -> String {
        select_chain_id(&self.network_id(), &self.provider().chain_id)
    }

    /// Point at a custom RPC endpoint.
    pub fn set_rpc_target(
        &self,
        rpc_target: &str,
        chain_id: Option<&str>,
        nickname: Option<&str>,
    ) -> Result<ProviderConfig, NetworkError> {
        Url::parse(rpc_target).map_err(|_| NetworkError::InvalidTarget(rpc_target.into()))?;
        let mut provider = match self.provider.write() {
            Ok(p) => p,
            Err(poisoned) => poisoned.into_inner(),
        };
        provider.kind = "rpc".into();
        provider.rpc_target = rpc_target.into();
        if let Some(chain_id) = chain_id {
            provider.chain_id = chain_id.into();
        }
        if let Some(nickname) = nickname {
            provider.nickname = nickname.into();
        }
        tracing::info!("Switched rpc target to {}", rpc_target);
        Ok(provider.clone())
    }

    pub fn set_network_id(&self, network_id: &str) {
        match self.network_id.write() {
            Ok(mut n) => *n = network_id.into(),
            Err(poisoned) => *poisoned.into_inner() = network_id.into(),
        }
    }

    /// Forward one call to the selected node.
    pub async fn send(&self, method: &str, params: Value) -> Result<Value, NetworkError> {
        let target = self.provider().rpc_target;
        let url = Url::parse(&target).map_err(|_| NetworkError::InvalidTarget(target.clone()))?;
        let _ = self.requests.send(json!({
            "method": method,
            "params": params,
            "target": target,
        }));
        self.client.request(&url, method, params).await
    }

    pub async fn gas_price(&self) -> Result<String, NetworkError> {
        let result = self.send("eth_gasPrice", json!([])).await?;
        as_quantity(result)
    }

    pub async fn estimate_gas(&self, tx: Value) -> Result<String, NetworkError> {
        let result = self.send("eth_estimateGas", json!([tx])).await?;
        as_quantity(result)
    }

    pub async fn get_code(&self, address: &str) -> Result<String, NetworkError> {
        let result = self.send("eth_getCode", json!([address, "latest"])).await?;
        as_quantity(result)
    }

    /// Pending transaction count of `address`.
    pub async fn transaction_count(&self, address: &str) -> Result<u64, NetworkError> {
        let result = self
            .send("eth_getTransactionCount", json!([address, "pending"]))
            .await?;
        let hex = as_quantity(result)?;
        crate::parse_hex_quantity(&hex)
            .ok_or_else(|| NetworkError::InvalidResponse(format!("bad nonce {}", hex)))
    }

    /// Latest-block transaction count of `address`.
    pub async fn confirmed_transaction_count(&self, address: &str) -> Result<u64, NetworkError> {
        let result = self
            .send("eth_getTransactionCount", json!([address, "latest"]))
            .await?;
        let hex = as_quantity(result)?;
        crate::parse_hex_quantity(&hex)
            .ok_or_else(|| NetworkError::InvalidResponse(format!("bad nonce {}", hex)))
    }

    /// Broadcast a signed transaction, returning its hash.
    pub async fn send_raw_transaction(&self, raw: &str) -> Result<String, NetworkError> {
        let result = self.send("eth_sendRawTransaction", json!([raw])).await?;
        as_quantity(result)
    }

    pub async fn transaction_receipt(&self, hash: &str) -> Result<Option<TxReceipt>, NetworkError> {
        let result = self.send("eth_getTransactionReceipt", json!([hash])).await?;
        if result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(result)
            .map(Some)
            .map_err(|e| NetworkError::InvalidResponse(e.to_string()))
    }

    pub async fn balance(&self, address: &str) -> Result<String, NetworkError> {
        let result = self.send("eth_getBalance", json!([address, "latest"])).await?;
        as_quantity(result)
    }
}

fn as_quantity(value: Value) -> Result<String, NetworkError> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(NetworkError::InvalidResponse(format!(
            "expected hex string, got {}",
            other
        ))),
    }
}

// ── Naming ──

/// Human-readable name for a network type or numeric network id.
pub fn network_display_name(key: &str) -> Option<&'static str> {
    match key {
        "ropsten" | "3" => Some("Ropsten"),
        "rinkeby" | "4" => Some("Rinkeby"),
        "kovan" | "42" => Some("Kovan"),
        "mainnet" => Some("Ethereum Mainnet"),
        "goerli" | "5" => Some("Goerli"),
        "itrust" | "1256" => Some("iTrust"),
        _ => None,
    }
}

/// Hex chain id for a network id, falling back to the provider's decimal chain id.
pub fn select_chain_id(network_id: &str, provider_chain_id: &str) -> String {
    match network_id {
        "1" => "0x1".into(),
        "3" => "0x3".into(),
        "4" => "0x4".into(),
        "42" => "0x2a".into(),
        "5" => "0x5".into(),
        "1256" => crate::constants::ITRUST_CHAIN_ID.into(),
        _ => {
            if provider_chain_id.starts_with("0x") {
                return provider_chain_id.to_lowercase();
            }
            provider_chain_id
                .parse::<u64>()
                .map(crate::format_hex_quantity)
                .unwrap_or_else(|_| "0x0".into())
        }
    }
}
