//! Platform shell capabilities.
//!
//! Everything the background core needs from its host environment: the
//! version string, opening UI surfaces, the active tab and the badge.
//! `HeadlessPlatform` keeps that state in memory and, when commands are
//! configured, spawns them to open the confirmation window or the
//! onboarding tab.

use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::PlatformConfig;

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum PlatformError {
    #[error("failed to launch `{command}`: {reason}")]
    Launch { command: String, reason: String },
    #[error("platform capability unavailable: {0}")]
    Unavailable(&'static str),
}

#[async_trait]
pub trait Platform: Send + Sync {
    fn version(&self) -> String;

    /// Open the wallet's own full-screen page (onboarding on first install).
    async fn open_extension_in_browser(&self) -> Result<(), PlatformError>;

    /// Open the transient confirmation window.
    async fn show_notification_popup(&self) -> Result<(), PlatformError>;

    async fn close_notification_popup(&self) -> Result<(), PlatformError>;

    /// Tab ids the user is currently looking at.
    async fn active_tab_ids(&self) -> Vec<u64>;

    fn set_badge_text(&self, text: &str);

    fn set_badge_background_color(&self, color: &str);
}

/// In-memory view of what the headless shell has been told.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformSnapshot {
    pub badge_text: String,
    pub badge_color: String,
    pub popup_shown: bool,
    pub popups_opened: u32,
    pub extension_opened: u32,
    pub active_tabs: Vec<u64>,
}

/// Platform for running without a browser.
pub struct HeadlessPlatform {
    config: PlatformConfig,
    state: Mutex<PlatformSnapshot>,
}

impl HeadlessPlatform {
    pub fn new(config: PlatformConfig) -> Self {
        HeadlessPlatform {
            config,
            state: Mutex::new(PlatformSnapshot::default()),
        }
    }

    pub fn snapshot(&self) -> PlatformSnapshot {
        self.lock().clone()
    }

    /// Pretend the user switched to the given tabs.
    pub fn set_active_tabs(&self, tabs: Vec<u64>) {
        self.lock().active_tabs = tabs;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PlatformSnapshot> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn launch(command: &str) -> Result<(), PlatformError> {
        let mut parts = command.split_whitespace();
        let Some(program) = parts.next() else {
            return Err(PlatformError::Launch {
                command: command.into(),
                reason: "empty command".into(),
            });
        };
        tokio::process::Command::new(program)
            .args(parts)
            .spawn()
            .map(|_| ())
            .map_err(|e| PlatformError::Launch {
                command: command.into(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl Platform for HeadlessPlatform {
    fn version(&self) -> String {
        self.config.version.clone()
    }

    async fn open_extension_in_browser(&self) -> Result<(), PlatformError> {
        if let Some(command) = &self.config.onboarding_command {
            Self::launch(command).await?;
        }
        self.lock().extension_opened += 1;
        tracing::info!("Opened wallet page");
        Ok(())
    }

    async fn show_notification_popup(&self) -> Result<(), PlatformError> {
        if let Some(command) = &self.config.popup_command {
            Self::launch(command).await?;
        }
        let mut state = self.lock();
        state.popup_shown = true;
        state.popups_opened += 1;
        Ok(())
    }

    async fn close_notification_popup(&self) -> Result<(), PlatformError> {
        self.lock().popup_shown = false;
        Ok(())
    }

    async fn active_tab_ids(&self) -> Vec<u64> {
        self.lock().active_tabs.clone()
    }

    fn set_badge_text(&self, text: &str) {
        self.lock().badge_text = text.into();
    }

    fn set_badge_background_color(&self, color: &str) {
        self.lock().badge_color = color.into();
    }
}
