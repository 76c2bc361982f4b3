//! # iTrust background core
//!
//! The long-lived process behind the iTrust wallet:
//! - **Persistence**: versioned wallet state in sled, migrated forward on boot
//! - **Controller**: sole owner of wallet state, transaction and signing queues
//! - **Session routing**: trusted UI surfaces vs. untrusted pages over framed streams
//! - **Approvals**: user confirmation windows and the pending-request badge

pub mod background;
pub mod badge;
pub mod config;
pub mod controller;
pub mod keyring;
pub mod messages;
pub mod migration;
pub mod network;
pub mod notification;
pub mod persistence;
pub mod platform;
pub mod provider_approval;
pub mod reporting;
pub mod router;
pub mod rpc;
pub mod session;
pub mod state;
pub mod storage;
pub mod tokens;
pub mod transaction;
pub mod transport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Protocol and runtime constants
pub mod constants {
    /// Origin assigned to the wallet's own UI surfaces. Never a real page URL.
    pub const INTERNAL_ORIGIN: &str = "itrust://itrust";

    /// Port name announced by the browser-action popup.
    pub const ENVIRONMENT_TYPE_POPUP: &str = "popup";
    /// Port name announced by the transient confirmation window.
    pub const ENVIRONMENT_TYPE_NOTIFICATION: &str = "notification";
    /// Port name announced by a full-screen wallet tab.
    pub const ENVIRONMENT_TYPE_FULLSCREEN: &str = "fullscreen";
    /// Port names that are refused outright (hardware wallet bridges).
    pub const BLACKLISTED_PORTS: &[&str] = &["trezor-connect"];

    /// Quiet period before a burst of state changes is written to storage.
    pub const PERSIST_DEBOUNCE_MS: u64 = 1_000;
    /// Interval for receipt checks and balance refreshes.
    pub const POLLING_INTERVAL_MS: u64 = 4_000;

    /// Badge background colour.
    pub const BADGE_COLOR: &str = "#506F8B";

    /// Maximum size of one transport frame (1 MiB).
    pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

    /// Default listen port for the wallet's own UI surfaces.
    pub const DEFAULT_INTERNAL_PORT: u16 = 9740;
    /// Default listen port for pages and other extensions.
    pub const DEFAULT_EXTERNAL_PORT: u16 = 9741;
    /// Default listen port for the status API.
    pub const DEFAULT_RPC_PORT: u16 = 9742;

    /// Gas used by a plain value transfer.
    pub const SIMPLE_GAS_COST: &str = "0x5208";
    /// Gas limit used when estimation fails.
    pub const FALLBACK_GAS_LIMIT: &str = "0x5b8d80";

    /// Network id of the iTrust chain.
    pub const ITRUST_NETWORK_ID: &str = "1256";
    /// Chain id of the iTrust chain (hex).
    pub const ITRUST_CHAIN_ID: &str = "0x4e8";
    /// Default node endpoint.
    pub const DEFAULT_RPC_TARGET: &str = "https://testrpc.iTrust.io/";
}

/// Current Unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Monotonic id source shared by transactions and signature requests.
///
/// Seeded above both the largest persisted id and `now_ms() * 1000`, so ids
/// never repeat across restarts and always increase in creation order.
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn seeded_above(existing_max: Option<u64>) -> Self {
        let floor = now_ms().saturating_mul(1000);
        let start = existing_max.map(|m| m + 1).unwrap_or(0).max(floor);
        IdGenerator {
            next: AtomicU64::new(start),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::seeded_above(None)
    }
}

/// Lower-case `0x`-prefixed hex of a byte slice.
pub fn to_prefixed_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Parse a `0x`-prefixed hex quantity (e.g. `"0x1a"`) into a `u64`.
pub fn parse_hex_quantity(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    if digits.is_empty() {
        return Some(0);
    }
    u64::from_str_radix(digits, 16).ok()
}

/// Format a `u64` as a `0x`-prefixed hex quantity.
pub fn format_hex_quantity(n: u64) -> String {
    format!("0x{:x}", n)
}
