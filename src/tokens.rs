//! Watched tokens and `wallet_watchAsset` suggestions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

/// An ERC-20 token shown in the wallet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub address: String,
    pub symbol: String,
    pub decimals: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum TokenError {
    #[error("asset type `{0}` not supported")]
    UnsupportedType(String),
    #[error("invalid token: {0}")]
    Invalid(String),
}

/// Parse and validate `wallet_watchAsset` params: `{ type, options: {address, symbol, decimals, image} }`.
pub fn parse_watch_asset(params: &Value) -> Result<Token, TokenError> {
    let params = match params {
        Value::Array(items) => items.first().cloned().unwrap_or(Value::Null),
        other => other.clone(),
    };
    let kind = params.get("type").and_then(Value::as_str).unwrap_or_default();
    if kind != "ERC20" {
        return Err(TokenError::UnsupportedType(kind.into()));
    }
    let options = params
        .get("options")
        .ok_or_else(|| TokenError::Invalid("missing options".into()))?;
    let address = options
        .get("address")
        .and_then(Value::as_str)
        .ok_or_else(|| TokenError::Invalid("missing address".into()))?;
    let is_address = address
        .strip_prefix("0x")
        .map(|d| d.len() == 40 && hex::decode(d).is_ok())
        .unwrap_or(false);
    if !is_address {
        return Err(TokenError::Invalid(format!("invalid address {}", address)));
    }
    let symbol = options
        .get("symbol")
        .and_then(Value::as_str)
        .ok_or_else(|| TokenError::Invalid("missing symbol".into()))?;
    if symbol.is_empty() || symbol.len() > 6 {
        return Err(TokenError::Invalid(format!(
            "symbol `{}` must be 1 to 6 characters",
            symbol
        )));
    }
    let decimals = match options.get("decimals") {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.parse().ok(),
        _ => None,
    }
    .filter(|d| *d <= 36)
    .ok_or_else(|| TokenError::Invalid("decimals must be a number between 0 and 36".into()))?;
    Ok(Token {
        address: address.to_lowercase(),
        symbol: symbol.into(),
        decimals: decimals as u8,
        image: options
            .get("image")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

/// Tokens pages have suggested, keyed by address, waiting for the user.
#[derive(Debug, Default)]
pub struct SuggestedTokens {
    suggested: Vec<Token>,
    waiters: HashMap<String, Vec<oneshot::Sender<()>>>,
}

impl SuggestedTokens {
    /// Queue a suggestion; the receiver fires once it is accepted or dismissed.
    pub fn suggest(&mut self, token: Token) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters.entry(token.address.clone()).or_default().push(tx);
        if !self.suggested.iter().any(|t| t.address == token.address) {
            self.suggested.push(token);
        }
        rx
    }

    pub fn all(&self) -> &[Token] {
        &self.suggested
    }

    pub fn len(&self) -> usize {
        self.suggested.len()
    }

    pub fn is_empty(&self) -> bool {
        self.suggested.is_empty()
    }

    /// Drop a single suggestion (it was added or declined).
    pub fn resolve(&mut self, address: &str) {
        let address = address.to_lowercase();
        self.suggested.retain(|t| t.address != address);
        for waiter in self.waiters.remove(&address).unwrap_or_default() {
            let _ = waiter.send(());
        }
    }

    /// Drop every suggestion.
    pub fn clear(&mut self) {
        self.suggested.clear();
        for (_, waiters) in self.waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(());
            }
        }
    }
}
