//! Signing collaborator.
//!
//! The controller hands fully-built transactions and approved messages to a
//! `TxSigner`; key material never leaves it. `DevKeyring` is a deterministic
//! development keyring: addresses and signatures are derived with keyed
//! BLAKE3, which is enough to exercise the approval pipeline end to end but
//! is NOT secp256k1 and produces nothing a real node would accept.

use serde_json::Value;

use crate::messages::MessageKind;
use crate::transaction::TxParams;

/// Keyring type recorded in `WalletState.keyrings`.
pub const KEYRING_TYPE: &str = "iTrust Dev Keyring";

/// Errors from signing.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum SignerError {
    #[error("no key for account {0}")]
    UnknownAccount(String),
    #[error("transaction is missing {0}")]
    Incomplete(&'static str),
    #[error("cannot encode payload: {0}")]
    Encoding(String),
}

/// Holds keys and signs on the controller's behalf.
pub trait TxSigner: Send + Sync {
    /// Addresses this signer controls, lower-case.
    fn accounts(&self) -> Vec<String>;

    /// Sign a transaction whose nonce, gas and gas price are set. Returns raw hex.
    fn sign_transaction(&self, params: &TxParams, chain_id: &str) -> Result<String, SignerError>;

    /// Sign message `data` of the given kind from `from`. Returns hex signature.
    fn sign_message(&self, kind: MessageKind, from: &str, data: &Value)
        -> Result<String, SignerError>;
}

struct DevAccount {
    address: String,
    key: [u8; 32],
}

/// Deterministic keyring for development and tests.
pub struct DevKeyring {
    accounts: Vec<DevAccount>,
}

impl DevKeyring {
    pub fn from_seed(seed: &str, count: usize) -> Self {
        let accounts = (0..count as u32)
            .map(|index| {
                let mut hasher = blake3::Hasher::new_derive_key("itrust dev keyring account");
                hasher.update(seed.as_bytes());
                hasher.update(&index.to_le_bytes());
                let key = *hasher.finalize().as_bytes();
                let digest = blake3::hash(&key);
                DevAccount {
                    address: crate::to_prefixed_hex(&digest.as_bytes()[12..]),
                    key,
                }
            })
            .collect();
        DevKeyring { accounts }
    }

    fn key_for(&self, address: &str) -> Result<&[u8; 32], SignerError> {
        let address = address.to_lowercase();
        self.accounts
            .iter()
            .find(|a| a.address == address)
            .map(|a| &a.key)
            .ok_or(SignerError::UnknownAccount(address))
    }
}

fn signature(key: &[u8; 32], domain: &[u8], payload: &[u8]) -> [u8; 65] {
    let mut hasher = blake3::Hasher::new_keyed(key);
    hasher.update(domain);
    hasher.update(payload);
    let mut out = [0u8; 65];
    hasher.finalize_xof().fill(&mut out);
    out
}

impl TxSigner for DevKeyring {
    fn accounts(&self) -> Vec<String> {
        self.accounts.iter().map(|a| a.address.clone()).collect()
    }

    fn sign_transaction(&self, params: &TxParams, chain_id: &str) -> Result<String, SignerError> {
        let key = self.key_for(&params.from)?;
        if params.nonce.is_none() {
            return Err(SignerError::Incomplete("nonce"));
        }
        if params.gas.is_none() {
            return Err(SignerError::Incomplete("gas"));
        }
        if params.gas_price.is_none() {
            return Err(SignerError::Incomplete("gasPrice"));
        }
        let mut payload =
            serde_json::to_vec(params).map_err(|e| SignerError::Encoding(e.to_string()))?;
        payload.extend_from_slice(chain_id.as_bytes());
        let sig = signature(key, b"tx", &payload);
        payload.extend_from_slice(&sig);
        Ok(crate::to_prefixed_hex(&payload))
    }

    fn sign_message(
        &self,
        kind: MessageKind,
        from: &str,
        data: &Value,
    ) -> Result<String, SignerError> {
        let key = self.key_for(from)?;
        let payload = serde_json::to_vec(data).map_err(|e| SignerError::Encoding(e.to_string()))?;
        let sig = signature(key, kind.method().as_bytes(), &payload);
        Ok(crate::to_prefixed_hex(&sig))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accounts_are_deterministic() {
        let a = DevKeyring::from_seed("seed", 2);
        let b = DevKeyring::from_seed("seed", 2);
        assert_eq!(a.accounts(), b.accounts());
        assert_eq!(a.accounts().len(), 2);
        assert_ne!(a.accounts()[0], a.accounts()[1]);
        assert_eq!(a.accounts()[0].len(), 42);
        assert!(a.accounts()[0].starts_with("0x"));
    }

    #[test]
    fn unknown_account_cannot_sign() {
        let keyring = DevKeyring::from_seed("seed", 1);
        let err = keyring
            .sign_message(MessageKind::PersonalSign, "0xdead", &json!("0x00"))
            .unwrap_err();
        assert!(matches!(err, SignerError::UnknownAccount(_)));
    }

    #[test]
    fn transaction_needs_nonce_and_gas() {
        let keyring = DevKeyring::from_seed("seed", 1);
        let mut params = TxParams {
            from: keyring.accounts()[0].clone(),
            to: Some("0xbbb".into()),
            ..Default::default()
        };
        assert_eq!(
            keyring.sign_transaction(&params, "0x4e8"),
            Err(SignerError::Incomplete("nonce"))
        );
        params.nonce = Some("0x0".into());
        params.gas = Some("0x5208".into());
        params.gas_price = Some("0x1".into());
        let raw = keyring.sign_transaction(&params, "0x4e8").unwrap();
        assert!(raw.starts_with("0x"));
    }

    #[test]
    fn signature_depends_on_kind() {
        let keyring = DevKeyring::from_seed("seed", 1);
        let from = keyring.accounts()[0].clone();
        let data = json!("0x68656c6c6f");
        let a = keyring
            .sign_message(MessageKind::PersonalSign, &from, &data)
            .unwrap();
        let b = keyring.sign_message(MessageKind::EthSign, &from, &data).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.len(), 2 + 130);
    }
}
