//! Approval/notification coordinator.
//!
//! Decides when to open the confirmation window and lets callers wait
//! until the user is done with it. Waiting is driven by the session
//! registry's notification flag: it clears when the window's session ends.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::platform::Platform;
use crate::session::SessionRegistry;

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum CoordinatorError {
    #[error("wait for the confirmation window was cancelled")]
    Cancelled,
    #[error("session registry shut down")]
    Closed,
}

/// How the controller asks for the user's attention.
#[async_trait]
pub trait UserConfirmation: Send + Sync {
    /// Show the confirmation UI unless the user already has one in front of them.
    async fn trigger_ui(&self);

    /// Show the confirmation UI and return once it has been closed.
    async fn open_popup(&self);
}

pub struct ApprovalCoordinator {
    platform: Arc<dyn Platform>,
    sessions: Arc<SessionRegistry>,
}

impl ApprovalCoordinator {
    pub fn new(platform: Arc<dyn Platform>, sessions: Arc<SessionRegistry>) -> Self {
        ApprovalCoordinator { platform, sessions }
    }

    /// Open the confirmation window if no wallet surface is showing.
    ///
    /// Returns whether a window was opened.
    pub async fn show_if_needed(&self) -> bool {
        let active_tabs = self.platform.active_tab_ids().await;
        if !self.sessions.try_claim_notification(&active_tabs) {
            return false;
        }
        match self.platform.show_notification_popup().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("Could not open confirmation window: {}", e);
                self.sessions.set_notification_open(false);
                false
            }
        }
    }

    /// Wait until the notification flag clears.
    pub async fn wait_for_close(&self) -> Result<(), CoordinatorError> {
        let mut rx = self.sessions.subscribe_notification();
        rx.wait_for(|open| !*open)
            .await
            .map(|_| ())
            .map_err(|_| CoordinatorError::Closed)
    }

    /// `open_popup`, giving up when `cancel` fires.
    pub async fn open_popup_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), CoordinatorError> {
        self.show_if_needed().await;
        tokio::select! {
            result = self.wait_for_close() => result,
            _ = cancel.cancelled() => Err(CoordinatorError::Cancelled),
        }
    }
}

#[async_trait]
impl UserConfirmation for ApprovalCoordinator {
    async fn trigger_ui(&self) {
        self.show_if_needed().await;
    }

    async fn open_popup(&self) {
        self.show_if_needed().await;
        if let Err(e) = self.wait_for_close().await {
            tracing::warn!("Stopped waiting for confirmation window: {}", e);
        }
    }
}
