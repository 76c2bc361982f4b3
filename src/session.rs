//! Connected sessions and the open/closed state of the wallet's UI surfaces.
//!
//! Every connection the router accepts becomes a `Port`: a duplex of frame
//! channels plus what the other side told us about itself. The
//! `SessionRegistry` tracks which sessions are live and derives the
//! per-surface flags (popup, notification, full-screen tabs) and the
//! aggregate "is any client open" from them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::constants::{ENVIRONMENT_TYPE_NOTIFICATION, ENVIRONMENT_TYPE_POPUP};

/// Buffered frames per direction on one port.
const PORT_BUFFER: usize = 64;

pub type SessionId = u64;

// ── Frames and ports ──

/// One message on a session: `name` selects the substream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub name: String,
    pub data: Value,
}

impl Frame {
    pub fn new(name: &str, data: Value) -> Self {
        Frame {
            name: name.into(),
            data,
        }
    }
}

/// Who is on the other end of a port, as they reported it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSender {
    /// Page URL of the connecting context.
    #[serde(default)]
    pub url: Option<String>,
    /// Extension id of the connecting context.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub tab_id: Option<u64>,
}

/// Our end of a connection.
pub struct Port {
    pub name: String,
    pub sender: PortSender,
    /// Frames from the remote side. Closes when the remote disconnects.
    pub inbound: mpsc::Receiver<Frame>,
    /// Frames to the remote side.
    pub outbound: mpsc::Sender<Frame>,
}

/// The other end of a `Port`, held by the transport or a test.
pub struct RemotePort {
    pub tx: mpsc::Sender<Frame>,
    pub rx: mpsc::Receiver<Frame>,
}

impl Port {
    /// A connected pair of ends.
    pub fn pair(name: &str, sender: PortSender) -> (Port, RemotePort) {
        let (to_port, inbound) = mpsc::channel(PORT_BUFFER);
        let (outbound, from_port) = mpsc::channel(PORT_BUFFER);
        (
            Port {
                name: name.into(),
                sender,
                inbound,
                outbound,
            },
            RemotePort {
                tx: to_port,
                rx: from_port,
            },
        )
    }
}

// ── Sessions ──

/// Which kind of context a session belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurfaceKind {
    Popup,
    Notification,
    /// A full-screen wallet tab (or any other internal surface).
    Fullscreen,
    /// A web page or another extension.
    External,
}

impl SurfaceKind {
    /// Kind of an internal port by its announced name.
    pub fn internal(name: &str) -> Self {
        match name {
            ENVIRONMENT_TYPE_POPUP => SurfaceKind::Popup,
            ENVIRONMENT_TYPE_NOTIFICATION => SurfaceKind::Notification,
            _ => SurfaceKind::Fullscreen,
        }
    }
}

/// A live session as listed by the registry.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: String,
    pub kind: SurfaceKind,
    /// Synthetic internal origin for trusted sessions, page origin otherwise.
    pub origin: String,
    pub trusted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tab_id: Option<u64>,
    pub connected_at: u64,
}

#[derive(Default)]
struct RegistryInner {
    sessions: BTreeMap<SessionId, SessionInfo>,
    /// Set when a confirmation window is requested, before it connects.
    notification_requested: bool,
}

impl RegistryInner {
    fn any(&self, kind: SurfaceKind) -> bool {
        self.sessions.values().any(|s| s.kind == kind)
    }

    fn notification_open(&self) -> bool {
        self.notification_requested || self.any(SurfaceKind::Notification)
    }

    fn client_open(&self) -> bool {
        self.any(SurfaceKind::Popup)
            || self.any(SurfaceKind::Fullscreen)
            || self.notification_open()
    }
}

/// Live sessions plus derived surface flags.
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
    next_id: AtomicU64,
    client_open: watch::Sender<bool>,
    notification_open: watch::Sender<bool>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        SessionRegistry {
            inner: Mutex::new(RegistryInner::default()),
            next_id: AtomicU64::new(1),
            client_open: watch::channel(false).0,
            notification_open: watch::channel(false).0,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn next_session_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a session. Returns the new aggregate when it changed.
    pub fn open(&self, info: SessionInfo) -> Option<bool> {
        let mut inner = self.lock();
        if info.kind == SurfaceKind::Notification {
            inner.notification_requested = true;
        }
        inner.sessions.insert(info.id, info);
        self.publish(&inner)
    }

    /// Drop a session. Returns the new aggregate when it changed.
    pub fn close(&self, id: SessionId) -> Option<bool> {
        let mut inner = self.lock();
        let Some(info) = inner.sessions.remove(&id) else {
            return None;
        };
        if info.kind == SurfaceKind::Notification && !inner.any(SurfaceKind::Notification) {
            inner.notification_requested = false;
        }
        self.publish(&inner)
    }

    /// Mark a confirmation window as requested (or gone, when `false`).
    pub fn set_notification_open(&self, open: bool) -> Option<bool> {
        let mut inner = self.lock();
        inner.notification_requested = open;
        self.publish(&inner)
    }

    /// Claim the confirmation window for one opener.
    ///
    /// Fails when a popup or window is already showing, or when one of
    /// `active_tabs` is a full-screen wallet tab. On success the
    /// notification flag is set before this returns, so a concurrent claim
    /// fails until the window's session ends or the claim is released with
    /// `set_notification_open(false)`.
    pub fn try_claim_notification(&self, active_tabs: &[u64]) -> bool {
        let mut inner = self.lock();
        let on_wallet_tab = inner.sessions.values().any(|s| {
            s.kind == SurfaceKind::Fullscreen
                && s.tab_id.map(|t| active_tabs.contains(&t)).unwrap_or(false)
        });
        if inner.any(SurfaceKind::Popup) || inner.notification_open() || on_wallet_tab {
            return false;
        }
        inner.notification_requested = true;
        self.publish(&inner);
        true
    }

    fn publish(&self, inner: &RegistryInner) -> Option<bool> {
        let notification = inner.notification_open();
        self.notification_open.send_if_modified(|current| {
            let changed = *current != notification;
            *current = notification;
            changed
        });
        let open = inner.client_open();
        let changed = self.client_open.send_if_modified(|current| {
            let changed = *current != open;
            *current = open;
            changed
        });
        changed.then_some(open)
    }

    pub fn is_client_open(&self) -> bool {
        *self.client_open.borrow()
    }

    pub fn popup_open(&self) -> bool {
        self.lock().any(SurfaceKind::Popup)
    }

    pub fn notification_open(&self) -> bool {
        *self.notification_open.borrow()
    }

    pub fn subscribe_notification(&self) -> watch::Receiver<bool> {
        self.notification_open.subscribe()
    }

    pub fn subscribe_client_open(&self) -> watch::Receiver<bool> {
        self.client_open.subscribe()
    }

    /// Browser tab ids of open full-screen wallet tabs.
    pub fn wallet_tab_ids(&self) -> Vec<u64> {
        self.lock()
            .sessions
            .values()
            .filter(|s| s.kind == SurfaceKind::Fullscreen)
            .filter_map(|s| s.tab_id)
            .collect()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.lock().sessions.values().cloned().collect()
    }
}
