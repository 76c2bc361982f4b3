//! Session router: classifies incoming ports and serves them.
//!
//! A port announcing one of the configured internal names is the wallet's
//! own UI and is served as trusted under the synthetic internal origin.
//! Anything else is a page or another extension and keeps its real origin.
//! Deny-listed names, and external ports that carry no page URL, are dropped
//! without a stream ever being set up.

use std::sync::Arc;

use url::Url;

use crate::config::TransportConfig;
use crate::constants::INTERNAL_ORIGIN;
use crate::controller::streams::run_session;
use crate::controller::Controller;
use crate::session::{Port, SessionInfo, SessionRegistry, SurfaceKind};

pub struct SessionRouter {
    controller: Arc<Controller>,
    registry: Arc<SessionRegistry>,
    internal_names: Vec<String>,
    blacklisted_names: Vec<String>,
    /// Our own extension id; senders with another id are recorded as foreign.
    extension_id: Option<String>,
}

impl SessionRouter {
    pub fn new(
        controller: Arc<Controller>,
        registry: Arc<SessionRegistry>,
        transport: &TransportConfig,
        extension_id: Option<String>,
    ) -> Self {
        SessionRouter {
            controller,
            registry,
            internal_names: transport.internal_names.clone(),
            blacklisted_names: transport.blacklisted_names.clone(),
            extension_id,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn is_internal(&self, name: &str) -> bool {
        self.internal_names.iter().any(|n| n == name)
    }

    pub fn is_blacklisted(&self, name: &str) -> bool {
        self.blacklisted_names.iter().any(|n| n == name)
    }

    /// A port opened from inside the wallet's process boundary.
    ///
    /// Returns the serving task, or `None` when the port was refused.
    pub fn on_connect(&self, port: Port) -> Option<tokio::task::JoinHandle<()>> {
        if self.is_blacklisted(&port.name) {
            tracing::debug!("Refused deny-listed port {}", port.name);
            return None;
        }
        if !self.is_internal(&port.name) {
            return self.connect_external(port);
        }
        let info = SessionInfo {
            id: self.registry.next_session_id(),
            name: port.name.clone(),
            kind: SurfaceKind::internal(&port.name),
            origin: INTERNAL_ORIGIN.into(),
            trusted: true,
            extension_id: None,
            tab_id: port.sender.tab_id,
            connected_at: crate::now_ms(),
        };
        Some(self.serve(info, port))
    }

    /// A port opened by a page or another extension. Never trusted.
    pub fn connect_external(&self, port: Port) -> Option<tokio::task::JoinHandle<()>> {
        if self.is_blacklisted(&port.name) {
            tracing::debug!("Refused deny-listed port {}", port.name);
            return None;
        }
        let Some(origin) = port.sender.url.as_deref().and_then(page_origin) else {
            tracing::debug!("Refused external port {} without a page origin", port.name);
            return None;
        };
        let extension_id = port
            .sender
            .id
            .clone()
            .filter(|id| Some(id) != self.extension_id.as_ref());
        let info = SessionInfo {
            id: self.registry.next_session_id(),
            name: port.name.clone(),
            kind: SurfaceKind::External,
            origin,
            trusted: false,
            extension_id,
            tab_id: port.sender.tab_id,
            connected_at: crate::now_ms(),
        };
        Some(self.serve(info, port))
    }

    fn serve(&self, info: SessionInfo, port: Port) -> tokio::task::JoinHandle<()> {
        let id = info.id;
        tracing::info!(
            "Session {} connected: {} ({}, trusted={})",
            id,
            info.name,
            info.origin,
            info.trusted
        );
        self.registry.open(info.clone());
        let controller = self.controller.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            run_session(controller, info, port).await;
            registry.close(id);
        })
    }
}

/// `scheme://host[:port]` of a page URL.
fn page_origin(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    match url.origin() {
        origin @ url::Origin::Tuple(..) => Some(origin.ascii_serialization()),
        url::Origin::Opaque(_) => None,
    }
}
