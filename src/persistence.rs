//! Persistence gateway: loading state at boot and saving it afterwards.
//!
//! Loading reads the stored blob, regenerates it when missing or empty, runs
//! it through the migrator and writes the result back. Saving is a side
//! pipeline fed by controller events: bursts of changes are coalesced into
//! one write, and a failed write is logged and forgotten.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::controller::{Controller, ControllerEvent};
use crate::migration::Migrator;
use crate::reporting::{report_migration_failure, ErrorReporter};
use crate::state::{Meta, VersionedState, WalletState};
use crate::storage::{Storage, StorageError};

/// Conditions that stop the background from starting.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("migrator returned empty state")]
    EmptyState,
    #[error("stored state does not match the current schema: {0}")]
    Corrupt(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to start {service}: {reason}")]
    Service { service: &'static str, reason: String },
}

/// State handed to the controller at boot.
#[derive(Clone, Debug)]
pub struct LoadedState {
    pub state: WalletState,
    /// Envelope every later save is written with.
    pub meta: Meta,
    /// Nothing was stored before this boot.
    pub first_install: bool,
}

/// Read, repair and migrate the stored blob.
pub fn load_state(
    storage: &dyn Storage,
    migrator: &Migrator,
    reporter: &dyn ErrorReporter,
    first_time_state: Value,
) -> Result<LoadedState, InitError> {
    let raw = storage.get()?;
    let first_install = raw.is_none();
    let stored = match raw {
        None => {
            tracing::info!("No stored state, starting from first-time state");
            migrator.generate_initial_state(first_time_state.clone())
        }
        Some(raw) => match serde_json::from_value::<VersionedState>(raw) {
            Ok(stored) if !stored.is_empty() => stored,
            _ => {
                tracing::error!("Stored state has no data, regenerating");
                reporter.capture_message("iTrust - Empty vault found - unable to recover", json!({}));
                migrator.generate_initial_state(first_time_state.clone())
            }
        },
    };

    let outcome = migrator.migrate_data(stored);
    if let Some(failure) = &outcome.failure {
        report_migration_failure(reporter, failure);
    }
    let migrated = outcome.state;
    if migrated.is_empty() {
        return Err(InitError::EmptyState);
    }

    if storage.is_supported() {
        if let Err(e) = storage.set(&migrated) {
            tracing::warn!("Could not write migrated state: {}", e);
        }
    } else {
        // Logged off the boot path.
        tokio::spawn(async {
            tracing::error!("iTrust - storage backend not supported, state will not persist");
        });
    }

    let meta = migrated.meta;
    let state: WalletState = serde_json::from_value(migrated.data)
        .map_err(|e| InitError::Corrupt(e.to_string()))?;
    Ok(LoadedState {
        state,
        meta,
        first_install,
    })
}

/// Write the controller's state once, logging instead of failing.
pub async fn save_snapshot(controller: &Controller, storage: &dyn Storage, meta: Meta) {
    let data = match serde_json::to_value(controller.persisted_state().await) {
        Ok(data) => data,
        Err(e) => {
            tracing::error!("Could not serialize wallet state: {}", e);
            return;
        }
    };
    match storage.set(&VersionedState { meta, data }) {
        Ok(()) => tracing::trace!("Persisted wallet state"),
        Err(e) => tracing::error!("Persisting wallet state failed: {}", e),
    }
}

/// Save after every quiet period of `debounce` following a state change.
///
/// On cancellation or when the controller goes away, the state is written
/// one last time and storage is flushed before the task ends.
pub fn spawn_persistence(
    controller: Arc<Controller>,
    storage: Arc<dyn Storage>,
    meta: Meta,
    debounce: Duration,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut events = controller.subscribe();
    tokio::spawn(async move {
        let mut dirty = false;
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = tokio::time::sleep(debounce), if dirty => {
                    save_snapshot(&controller, storage.as_ref(), meta).await;
                    dirty = false;
                    continue;
                }
                _ = cancel.cancelled() => break,
            };
            match event {
                Ok(ControllerEvent::StateChanged) | Err(RecvError::Lagged(_)) => dirty = true,
                Ok(_) => {}
                Err(RecvError::Closed) => break,
            }
        }
        save_snapshot(&controller, storage.as_ref(), meta).await;
        if let Err(e) = storage.flush() {
            tracing::warn!("Flushing storage failed: {}", e);
        }
        tracing::debug!("Persistence stopped");
    })
}
