//! Configuration file support for the iTrust background process.
//!
//! Loads optional `itrust.toml` from the data directory. CLI flags override
//! config file values. If no config file exists, defaults are used.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::constants;

/// Top-level configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct ItrustConfig {
    pub background: BackgroundConfig,
    pub transport: TransportConfig,
    pub rpc: RpcConfig,
    pub network: NetworkConfig,
    pub platform: PlatformConfig,
    pub keyring: KeyringConfig,
    /// Merged over the generated first-time state (test fixtures, preset networks).
    pub first_time_state: toml::Table,
}

/// Process-wide settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    pub data_dir: PathBuf,
    /// Debug builds log at `debug` and skip the onboarding tab on install.
    pub debug: bool,
    /// Our own extension id; external senders with a different id are tagged.
    pub extension_id: String,
    pub persist_debounce_ms: u64,
    pub polling_interval_ms: u64,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        BackgroundConfig {
            data_dir: "./itrust-data".into(),
            debug: false,
            extension_id: "itrust".into(),
            persist_debounce_ms: constants::PERSIST_DEBOUNCE_MS,
            polling_interval_ms: constants::POLLING_INTERVAL_MS,
        }
    }
}

/// Session transport settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub internal_host: String,
    pub internal_port: u16,
    pub external_host: String,
    pub external_port: u16,
    /// Port names treated as the wallet's own UI.
    pub internal_names: Vec<String>,
    /// Port names refused without establishing a stream.
    pub blacklisted_names: Vec<String>,
    /// Shared secret UI surfaces must present on the internal listener.
    /// Unset means no TCP peer is accepted as a UI surface.
    pub ui_token: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            internal_host: "127.0.0.1".into(),
            internal_port: constants::DEFAULT_INTERNAL_PORT,
            external_host: "127.0.0.1".into(),
            external_port: constants::DEFAULT_EXTERNAL_PORT,
            internal_names: vec![
                constants::ENVIRONMENT_TYPE_POPUP.into(),
                constants::ENVIRONMENT_TYPE_NOTIFICATION.into(),
                constants::ENVIRONMENT_TYPE_FULLSCREEN.into(),
            ],
            blacklisted_names: constants::BLACKLISTED_PORTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            ui_token: None,
        }
    }
}

/// Status API settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub host: String,
    pub port: u16,
}

impl Default for RpcConfig {
    fn default() -> Self {
        RpcConfig {
            host: "127.0.0.1".into(),
            port: constants::DEFAULT_RPC_PORT,
        }
    }
}

/// Default network for a fresh wallet.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub rpc_target: String,
    pub network_id: String,
    pub chain_id: String,
    pub nickname: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            kind: "itrust".into(),
            rpc_target: constants::DEFAULT_RPC_TARGET.into(),
            network_id: constants::ITRUST_NETWORK_ID.into(),
            chain_id: constants::ITRUST_CHAIN_ID.into(),
            nickname: "iTrust".into(),
        }
    }
}

/// Platform shell settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub version: String,
    pub badge_color: String,
    /// Command spawned to open the confirmation window, if any.
    pub popup_command: Option<String>,
    /// Command spawned to open the onboarding tab, if any.
    pub onboarding_command: Option<String>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        PlatformConfig {
            version: env!("CARGO_PKG_VERSION").into(),
            badge_color: constants::BADGE_COLOR.into(),
            popup_command: None,
            onboarding_command: None,
        }
    }
}

/// Development keyring settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct KeyringConfig {
    pub seed: String,
    pub accounts: usize,
}

impl Default for KeyringConfig {
    fn default() -> Self {
        KeyringConfig {
            seed: "itrust development keyring".into(),
            accounts: 1,
        }
    }
}

impl ItrustConfig {
    /// Load configuration from `itrust.toml` in the given directory.
    /// Returns `Default` if the file doesn't exist.
    pub fn load(data_dir: &Path) -> Self {
        let config_path = data_dir.join("itrust.toml");
        let mut config = match std::fs::read_to_string(&config_path) {
            Ok(contents) => match toml::from_str::<ItrustConfig>(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to parse {}: {}, using defaults",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        };
        config.background.data_dir = data_dir.to_path_buf();
        config
    }

    pub fn internal_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!(
            "{}:{}",
            self.transport.internal_host, self.transport.internal_port
        )
        .parse()
    }

    pub fn external_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!(
            "{}:{}",
            self.transport.external_host, self.transport.external_port
        )
        .parse()
    }

    pub fn rpc_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.rpc.host, self.rpc.port).parse()
    }

    /// The first-time-state override table as JSON.
    pub fn first_time_overrides(&self) -> serde_json::Value {
        serde_json::to_value(&self.first_time_state)
            .unwrap_or_else(|_| serde_json::Value::Object(Default::default()))
    }
}
