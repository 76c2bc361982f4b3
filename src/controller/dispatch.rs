//! JSON-RPC dispatch for the `provider` and `controller` substreams.
//!
//! Requests arrive as `{id, method, params}` frames. Replies carry the same
//! `id` and either a `result` or an `error: {code, message}` whose code comes
//! from `ControllerError::rpc_code`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{Controller, ControllerError};
use crate::constants::INTERNAL_ORIGIN;
use crate::messages::{MessageKind, MsgParams, TypedDataVersion};
use crate::tokens::Token;
use crate::transaction::{TxId, TxParams, TxStatus};

/// One request read off a substream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Who a provider request came from.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestOrigin {
    pub origin: String,
    pub site_title: Option<String>,
    pub tab_id: Option<u64>,
}

/// Wrap a handler result as a JSON-RPC reply.
pub fn response(id: Value, result: Result<Value, ControllerError>) -> Value {
    match result {
        Ok(result) => json!({ "id": id, "jsonrpc": "2.0", "result": result }),
        Err(e) => json!({
            "id": id,
            "jsonrpc": "2.0",
            "error": { "code": e.rpc_code(), "message": e.to_string() },
        }),
    }
}

/// Positional parameter `index`, deserialized.
pub fn param<T: DeserializeOwned>(params: &Value, index: usize) -> Result<T, ControllerError> {
    let value = match params {
        Value::Array(items) => items.get(index).cloned(),
        other if index == 0 => Some(other.clone()),
        _ => None,
    }
    .ok_or_else(|| ControllerError::InvalidParams(format!("missing parameter {}", index)))?;
    serde_json::from_value(value)
        .map_err(|e| ControllerError::InvalidParams(format!("parameter {}: {}", index, e)))
}

fn to_value<T: Serialize>(value: T) -> Result<Value, ControllerError> {
    serde_json::to_value(value).map_err(|e| ControllerError::InvalidParams(e.to_string()))
}

impl Controller {
    /// Methods a page (or a trusted surface acting as a page) may call.
    pub async fn handle_provider_request(
        &self,
        from: &RequestOrigin,
        req: RpcRequest,
    ) -> Result<Value, ControllerError> {
        let origin = from.origin.as_str();
        let params = &req.params;
        match req.method.as_str() {
            "eth_requestAccounts" => to_value(
                self.request_accounts(origin, from.site_title.clone(), from.tab_id)
                    .await?,
            ),
            "eth_accounts" => to_value(self.accounts_for(origin).await),
            "net_version" => Ok(json!(self.network.network_id())),
            "eth_chainId" => Ok(json!(self.network.chain_id())),
            "eth_sendTransaction" => {
                self.require_approved(origin).await?;
                let mut tx: TxParams = param(params, 0)?;
                if tx.from.is_empty() {
                    tx.from = self.selected_address().await.unwrap_or_default();
                }
                // Pages may only spend from accounts exposed to them.
                if origin != INTERNAL_ORIGIN {
                    let from = tx.from.to_lowercase();
                    if !self.accounts_for(origin).await.contains(&from) {
                        return Err(ControllerError::Unauthorized(format!(
                            "{} for account {}",
                            origin, tx.from
                        )));
                    }
                }
                Ok(json!(self.new_unapproved_transaction(tx, origin).await?))
            }
            "eth_sign" => {
                self.require_approved(origin).await?;
                let msg = MsgParams {
                    from: param(params, 0)?,
                    data: param(params, 1)?,
                    version: None,
                };
                Ok(json!(self.new_unsigned_message(MessageKind::EthSign, msg, origin).await?))
            }
            "personal_sign" => {
                self.require_approved(origin).await?;
                let msg = MsgParams {
                    data: param(params, 0)?,
                    from: param(params, 1)?,
                    version: None,
                };
                Ok(json!(
                    self.new_unsigned_message(MessageKind::PersonalSign, msg, origin)
                        .await?
                ))
            }
            method @ ("eth_signTypedData" | "eth_signTypedData_v3" | "eth_signTypedData_v4") => {
                self.require_approved(origin).await?;
                let msg = match method {
                    "eth_signTypedData" => MsgParams {
                        data: param(params, 0)?,
                        from: param(params, 1)?,
                        version: Some(TypedDataVersion::V1),
                    },
                    "eth_signTypedData_v3" => MsgParams {
                        from: param(params, 0)?,
                        data: param(params, 1)?,
                        version: Some(TypedDataVersion::V3),
                    },
                    _ => MsgParams {
                        from: param(params, 0)?,
                        data: param(params, 1)?,
                        version: Some(TypedDataVersion::V4),
                    },
                };
                Ok(json!(
                    self.new_unsigned_message(MessageKind::TypedData, msg, origin)
                        .await?
                ))
            }
            "wallet_watchAsset" => Ok(json!(self.watch_asset(params).await?)),
            "eth_getTransactionByHash" => {
                let hash: String = param(params, 0)?;
                match self.local_transaction_by_hash(&hash).await {
                    Some(tx) => Ok(tx),
                    None => Ok(self.network.send(&req.method, req.params.clone()).await?),
                }
            }
            _ => Ok(self.network.send(&req.method, req.params.clone()).await?),
        }
    }

    /// Methods only trusted wallet surfaces may call.
    pub async fn handle_controller_request(&self, req: RpcRequest) -> Result<Value, ControllerError> {
        let params = &req.params;
        match req.method.as_str() {
            "getState" => to_value(self.ui_state().await),
            "approveTransaction" => {
                let id: TxId = param(params, 0)?;
                Ok(json!(self.approve_transaction(id).await?))
            }
            "rejectTransaction" => {
                self.reject_transaction(param(params, 0)?).await?;
                Ok(Value::Null)
            }
            "updateTransactionStatus" => {
                let id: TxId = param(params, 0)?;
                let status: TxStatus = param(params, 1)?;
                self.update_transaction_status(id, status, "updated by wallet UI")
                    .await?;
                Ok(Value::Null)
            }
            "signMessage" => Ok(json!(self.sign_message(MessageKind::EthSign, param(params, 0)?).await?)),
            "cancelMessage" => {
                self.cancel_message(MessageKind::EthSign, param(params, 0)?).await?;
                Ok(Value::Null)
            }
            "signPersonalMessage" => Ok(json!(
                self.sign_message(MessageKind::PersonalSign, param(params, 0)?)
                    .await?
            )),
            "cancelPersonalMessage" => {
                self.cancel_message(MessageKind::PersonalSign, param(params, 0)?)
                    .await?;
                Ok(Value::Null)
            }
            "signTypedMessage" => Ok(json!(
                self.sign_message(MessageKind::TypedData, param(params, 0)?)
                    .await?
            )),
            "cancelTypedMessage" => {
                self.cancel_message(MessageKind::TypedData, param(params, 0)?)
                    .await?;
                Ok(Value::Null)
            }
            "approveProviderRequestByOrigin" => {
                let origin: String = param(params, 0)?;
                self.approve_provider_request_by_origin(&origin).await?;
                Ok(Value::Null)
            }
            "rejectProviderRequestByOrigin" => {
                let origin: String = param(params, 0)?;
                self.reject_provider_request_by_origin(&origin).await?;
                Ok(Value::Null)
            }
            "getApprovedOrigins" => to_value(self.approved_origins().await),
            "revokeOrigin" => {
                let origin: String = param(params, 0)?;
                Ok(json!(self.revoke_origin(&origin).await))
            }
            "clearApprovedOrigins" => {
                self.clear_approved_origins().await;
                Ok(Value::Null)
            }
            "setSelectedAddress" => {
                let address: String = param(params, 0)?;
                self.set_selected_address(&address).await?;
                Ok(Value::Null)
            }
            "setAccountLabel" => {
                let address: String = param(params, 0)?;
                let label: String = param(params, 1)?;
                self.set_account_label(&address, &label).await?;
                Ok(Value::Null)
            }
            "setRpcTarget" => {
                let target: String = param(params, 0)?;
                let chain_id: Option<String> = param(params, 1).unwrap_or(None);
                let nickname: Option<String> = param(params, 2).unwrap_or(None);
                self.set_rpc_target(&target, chain_id.as_deref(), nickname.as_deref())
                    .await?;
                Ok(Value::Null)
            }
            "addToken" => {
                let token: Token = param(params, 0)?;
                self.add_token(token).await?;
                Ok(Value::Null)
            }
            "removeToken" => {
                let address: String = param(params, 0)?;
                self.remove_token(&address).await;
                Ok(Value::Null)
            }
            "removeSuggestedTokens" => {
                self.remove_suggested_tokens().await;
                Ok(Value::Null)
            }
            other => Err(ControllerError::MethodNotFound(other.into())),
        }
    }

    async fn require_approved(&self, origin: &str) -> Result<(), ControllerError> {
        if self.is_origin_approved(origin).await {
            Ok(())
        } else {
            Err(ControllerError::Unauthorized(origin.into()))
        }
    }
}
