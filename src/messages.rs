//! Message-signing queues.
//!
//! `eth_sign`, `personal_sign` and typed-data requests each get their own
//! `MessageManager`. They share one state machine
//! (`unapproved → approved → signed`, or `unapproved → rejected`) and keep
//! their unapproved count incrementally, since the badge reads it on every
//! state change.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

/// Which signing method a queue serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    EthSign,
    PersonalSign,
    TypedData,
}

impl MessageKind {
    pub fn method(self) -> &'static str {
        match self {
            MessageKind::EthSign => "eth_sign",
            MessageKind::PersonalSign => "personal_sign",
            MessageKind::TypedData => "eth_signTypedData",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Unapproved,
    Approved,
    Signed,
    Rejected,
    /// The signer refused an approved message.
    Errored,
}

impl MessageStatus {
    fn can_transition_to(self, next: MessageStatus) -> bool {
        use MessageStatus::*;
        matches!(
            (self, next),
            (Unapproved, Approved)
                | (Unapproved, Rejected)
                | (Approved, Signed)
                | (Approved, Errored)
        )
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageStatus::Unapproved => "unapproved",
            MessageStatus::Approved => "approved",
            MessageStatus::Signed => "signed",
            MessageStatus::Rejected => "rejected",
            MessageStatus::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Typed-data encoding version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TypedDataVersion {
    V1,
    V3,
    V4,
}

/// What the page asked to sign.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MsgParams {
    pub from: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<TypedDataVersion>,
}

/// One signature request.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: u64,
    pub time: u64,
    pub kind: MessageKind,
    pub status: MessageStatus,
    pub msg_params: MsgParams,
    pub origin: String,
}

/// Errors from the message queues.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum MessageError {
    #[error("message {0} not found")]
    NotFound(u64),
    #[error("message {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: u64,
        from: MessageStatus,
        to: MessageStatus,
    },
    #[error("invalid message params: {0}")]
    InvalidParams(String),
    #[error("user rejected message {0}")]
    Rejected(u64),
    #[error("signing failed: {0}")]
    Signer(String),
}

/// Resolves once the message is signed or rejected.
pub type SignatureWaiter = oneshot::Receiver<Result<String, MessageError>>;

/// One signing queue.
#[derive(Debug)]
pub struct MessageManager {
    kind: MessageKind,
    messages: Vec<Message>,
    unapproved_count: usize,
    waiters: HashMap<u64, oneshot::Sender<Result<String, MessageError>>>,
}

impl MessageManager {
    pub fn new(kind: MessageKind) -> Self {
        MessageManager {
            kind,
            messages: Vec::new(),
            unapproved_count: 0,
            waiters: HashMap::new(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Validate and enqueue a request. `chain_id` is the active hex chain id.
    pub fn add_unapproved(
        &mut self,
        id: u64,
        params: MsgParams,
        origin: &str,
        chain_id: &str,
    ) -> Result<(u64, SignatureWaiter), MessageError> {
        let msg_params = validate(self.kind, params, chain_id)?;
        self.messages.push(Message {
            id,
            time: crate::now_ms(),
            kind: self.kind,
            status: MessageStatus::Unapproved,
            msg_params,
            origin: origin.into(),
        });
        self.unapproved_count += 1;
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        Ok((id, rx))
    }

    pub fn get(&self, id: u64) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn unapproved(&self) -> BTreeMap<u64, Message> {
        self.messages
            .iter()
            .filter(|m| m.status == MessageStatus::Unapproved)
            .map(|m| (m.id, m.clone()))
            .collect()
    }

    pub fn unapproved_count(&self) -> usize {
        self.unapproved_count
    }

    /// Claim an unapproved message for signing.
    pub fn approve(&mut self, id: u64) -> Result<MsgParams, MessageError> {
        let msg = self.transition(id, MessageStatus::Approved)?;
        Ok(msg.msg_params.clone())
    }

    pub fn set_signed(&mut self, id: u64, raw_sig: String) -> Result<(), MessageError> {
        self.transition(id, MessageStatus::Signed)?;
        self.finish(id, Ok(raw_sig));
        Ok(())
    }

    pub fn reject(&mut self, id: u64) -> Result<(), MessageError> {
        self.transition(id, MessageStatus::Rejected)?;
        self.finish(id, Err(MessageError::Rejected(id)));
        Ok(())
    }

    pub fn set_errored(&mut self, id: u64, error: MessageError) -> Result<(), MessageError> {
        self.transition(id, MessageStatus::Errored)?;
        self.finish(id, Err(error));
        Ok(())
    }

    /// Messages still in the queue, unapproved or being signed.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Reject everything still waiting, e.g. when the wallet locks.
    pub fn reject_all_unapproved(&mut self) -> Vec<u64> {
        let ids: Vec<u64> = self.unapproved().into_keys().collect();
        for id in &ids {
            let _ = self.reject(*id);
        }
        ids
    }

    /// Drop a resolved message and hand its outcome to the requester.
    fn finish(&mut self, id: u64, outcome: Result<String, MessageError>) {
        self.messages.retain(|m| m.id != id);
        if let Some(waiter) = self.waiters.remove(&id) {
            let _ = waiter.send(outcome);
        }
    }

    fn transition(&mut self, id: u64, next: MessageStatus) -> Result<&mut Message, MessageError> {
        let msg = self
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(MessageError::NotFound(id))?;
        if !msg.status.can_transition_to(next) {
            return Err(MessageError::InvalidTransition {
                id,
                from: msg.status,
                to: next,
            });
        }
        if msg.status == MessageStatus::Unapproved {
            self.unapproved_count = self.unapproved_count.saturating_sub(1);
        }
        msg.status = next;
        Ok(msg)
    }
}

// ── Validation ──

fn validate(kind: MessageKind, mut params: MsgParams, chain_id: &str) -> Result<MsgParams, MessageError> {
    if params.from.is_empty() {
        return Err(MessageError::InvalidParams("missing from address".into()));
    }
    params.from = params.from.to_lowercase();
    match kind {
        MessageKind::EthSign => {
            let data = params.data.as_str().unwrap_or_default();
            if !is_hex_of_len(data, 32) {
                return Err(MessageError::InvalidParams(
                    "eth_sign requires 32 byte hex data".into(),
                ));
            }
        }
        MessageKind::PersonalSign => {
            let data = params
                .data
                .as_str()
                .ok_or_else(|| MessageError::InvalidParams("data must be a string".into()))?;
            params.data = Value::String(normalize_personal_data(data));
        }
        MessageKind::TypedData => {
            let version = params.version.unwrap_or(TypedDataVersion::V1);
            params.version = Some(version);
            params.data = validate_typed_data(version, params.data, chain_id)?;
        }
    }
    Ok(params)
}

fn is_hex_of_len(s: &str, bytes: usize) -> bool {
    match s.strip_prefix("0x") {
        Some(digits) => digits.len() == bytes * 2 && hex::decode(digits).is_ok(),
        None => false,
    }
}

/// Hex data is kept as-is; anything else is treated as UTF-8 text.
pub fn normalize_personal_data(data: &str) -> String {
    if let Some(digits) = data.strip_prefix("0x") {
        if hex::decode(digits).is_ok() {
            return data.to_lowercase();
        }
    }
    crate::to_prefixed_hex(data.as_bytes())
}

fn validate_typed_data(
    version: TypedDataVersion,
    data: Value,
    chain_id: &str,
) -> Result<Value, MessageError> {
    let data = match data {
        Value::String(s) if version != TypedDataVersion::V1 => serde_json::from_str(&s)
            .map_err(|e| MessageError::InvalidParams(format!("typed data is not JSON: {}", e)))?,
        other => other,
    };
    match version {
        TypedDataVersion::V1 => {
            let entries = data
                .as_array()
                .ok_or_else(|| MessageError::InvalidParams("V1 typed data must be an array".into()))?;
            if entries.is_empty() {
                return Err(MessageError::InvalidParams("typed data is empty".into()));
            }
            for entry in entries {
                if entry.get("type").is_none() || entry.get("name").is_none() {
                    return Err(MessageError::InvalidParams(
                        "typed data entries need type and name".into(),
                    ));
                }
            }
        }
        TypedDataVersion::V3 | TypedDataVersion::V4 => {
            for field in ["types", "primaryType", "domain", "message"] {
                if data.get(field).is_none() {
                    return Err(MessageError::InvalidParams(format!(
                        "typed data is missing `{}`",
                        field
                    )));
                }
            }
            if let Some(requested) = data["domain"].get("chainId").filter(|c| !c.is_null()) {
                let requested = chain_id_number(requested);
                let active = chain_id_number(&Value::String(chain_id.into()));
                if requested.is_none() || requested != active {
                    return Err(MessageError::InvalidParams(format!(
                        "typed data chainId {} does not match active chain {}",
                        data["domain"]["chainId"], chain_id
                    )));
                }
            }
        }
    }
    Ok(data)
}

fn chain_id_number(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => crate::parse_hex_quantity(s).or_else(|| s.parse().ok()),
        _ => None,
    }
}
