//! Persisted wallet state and its versioned envelope.
//!
//! `WalletState` is what the controller owns and what gets written to
//! storage, wrapped in a `VersionedState` carrying the schema version.
//! Migrations run on the untyped form (`VersionedState<Value>`), so legacy
//! blobs never need a Rust type of their own.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::NetworkConfig;
use crate::tokens::Token;
use crate::transaction::TransactionMeta;

/// Schema metadata of a persisted blob.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
    pub version: u32,
}

/// Wallet state wrapped with its schema version.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionedState<T = Value> {
    pub meta: Meta,
    pub data: T,
}

impl VersionedState<Value> {
    /// True when `data` is missing or null.
    pub fn is_empty(&self) -> bool {
        self.data.is_null()
    }
}

/// A named account.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub address: String,
    pub name: String,
}

/// Cached on-chain account info.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub address: String,
    /// Hex wei balance, `None` until first fetched.
    #[serde(default)]
    pub balance: Option<String>,
}

/// The selected network provider.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub rpc_target: String,
    pub chain_id: String,
    pub nickname: String,
}

/// Summary of one keyring and the accounts it controls.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyringDescriptor {
    #[serde(rename = "type")]
    pub kind: String,
    pub accounts: Vec<String>,
}

/// A site the user allowed to see their accounts.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovedOrigin {
    pub approved_at: u64,
}

/// Everything the controller persists.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WalletState {
    pub identities: BTreeMap<String, Identity>,
    pub accounts: BTreeMap<String, Account>,
    pub selected_address: Option<String>,
    /// Stringified network id of the current provider.
    pub network: String,
    pub provider: ProviderConfig,
    pub transactions: Vec<TransactionMeta>,
    pub keyrings: Vec<KeyringDescriptor>,
    pub approved_origins: BTreeMap<String, ApprovedOrigin>,
    pub tokens: Vec<Token>,
    /// Keys this version doesn't model, preserved across load/save.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl WalletState {
    /// Addresses of every account the keyrings control.
    pub fn keyring_accounts(&self) -> Vec<String> {
        self.keyrings
            .iter()
            .flat_map(|k| k.accounts.iter().cloned())
            .collect()
    }

    /// Largest transaction id on record.
    pub fn max_transaction_id(&self) -> Option<u64> {
        self.transactions.iter().map(|tx| tx.id).max()
    }
}

/// Build the state a brand-new wallet starts from.
///
/// `overrides` is merged key-by-key over the top level, the way test
/// fixtures preset a network or selected account.
pub fn first_time_state(network: &NetworkConfig, accounts: &[String], overrides: &Value) -> Value {
    let mut state = WalletState {
        network: network.network_id.clone(),
        provider: ProviderConfig {
            kind: network.kind.clone(),
            rpc_target: network.rpc_target.clone(),
            chain_id: network.chain_id.clone(),
            nickname: network.nickname.clone(),
        },
        selected_address: accounts.first().cloned(),
        ..Default::default()
    };
    for (i, address) in accounts.iter().enumerate() {
        state.identities.insert(
            address.clone(),
            Identity {
                address: address.clone(),
                name: format!("Account {}", i + 1),
            },
        );
        state.accounts.insert(
            address.clone(),
            Account {
                address: address.clone(),
                balance: None,
            },
        );
    }
    if !accounts.is_empty() {
        state.keyrings.push(KeyringDescriptor {
            kind: crate::keyring::KEYRING_TYPE.into(),
            accounts: accounts.to_vec(),
        });
    }

    let mut value = serde_json::to_value(&state).unwrap_or_else(|_| Value::Object(Map::new()));
    if let (Value::Object(base), Value::Object(extra)) = (&mut value, overrides) {
        for (k, v) in extra {
            base.insert(k.clone(), v.clone());
        }
    }
    value
}

/// Describe the shape of a JSON value without any of its contents.
///
/// Every leaf becomes its type name; objects and arrays keep their layout.
/// Safe to hand to error reporting because no string, number or key
/// material survives.
pub fn state_structure(value: &Value) -> Value {
    match value {
        Value::Null => Value::String("null".into()),
        Value::Bool(_) => Value::String("boolean".into()),
        Value::Number(_) => Value::String("number".into()),
        Value::String(_) => Value::String("string".into()),
        Value::Array(items) => Value::Array(items.iter().map(state_structure).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), state_structure(v)))
                .collect(),
        ),
    }
}
