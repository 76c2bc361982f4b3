//! Schema migrations for persisted wallet state.
//!
//! A `Migrator` holds an ordered list of steps, each tagged with the version
//! it upgrades *to*. Only steps newer than the blob's current version run,
//! strictly in ascending order. A failing step stops the chain: the state
//! comes back at the last version that migrated cleanly, together with a
//! `MigrationFailure` the caller is expected to report.

mod m003;

pub use m003::Migration003;

use serde_json::Value;

use crate::state::{state_structure, Meta, VersionedState};

/// Errors a migration step can return.
#[derive(Clone, Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("malformed state at `{path}`: {reason}")]
    Malformed { path: String, reason: String },
    #[error("migration returned empty data")]
    EmptyData,
}

/// A single schema upgrade.
pub trait Migration: Send + Sync {
    /// Version the state is at after this step.
    fn version(&self) -> u32;

    /// Transform the state. Must not depend on anything but its input.
    fn migrate(&self, state: VersionedState) -> Result<VersionedState, MigrationError>;
}

/// A step that failed, with enough context to report it safely.
#[derive(Clone, Debug)]
pub struct MigrationFailure {
    pub version: u32,
    pub error: MigrationError,
    /// Secret-free shape of the state the step was given.
    pub structure: Value,
}

/// Result of running `migrate_data`.
#[derive(Clone, Debug)]
pub struct MigrationOutcome {
    pub state: VersionedState,
    pub failure: Option<MigrationFailure>,
}

/// Applies registered migrations in version order.
pub struct Migrator {
    migrations: Vec<Box<dyn Migration>>,
}

impl Migrator {
    pub fn new(mut migrations: Vec<Box<dyn Migration>>) -> Self {
        migrations.sort_by_key(|m| m.version());
        migrations.dedup_by_key(|m| m.version());
        Migrator { migrations }
    }

    /// Migrator with every step this build ships.
    pub fn with_registered() -> Self {
        Self::new(registered())
    }

    /// Highest registered version, 0 when there are no steps.
    pub fn current_version(&self) -> u32 {
        self.migrations.last().map(|m| m.version()).unwrap_or(0)
    }

    /// Wrap a freshly generated state at the current schema version.
    pub fn generate_initial_state(&self, data: Value) -> VersionedState {
        VersionedState {
            meta: Meta {
                version: self.current_version(),
            },
            data,
        }
    }

    /// Versions of the steps that would run for a blob at `version`.
    pub fn pending(&self, version: u32) -> Vec<u32> {
        self.migrations
            .iter()
            .map(|m| m.version())
            .filter(|v| *v > version)
            .collect()
    }

    pub fn migrate_data(&self, state: VersionedState) -> MigrationOutcome {
        let start = state.meta.version;
        let mut current = state;
        for migration in self.migrations.iter().filter(|m| m.version() > start) {
            let version = migration.version();
            match run_step(migration.as_ref(), current.clone()) {
                Ok(next) => {
                    tracing::debug!("Migrated state to version {}", version);
                    current = next;
                }
                Err(error) => {
                    tracing::warn!(
                        "Migration to version {} failed: {}, staying at version {}",
                        version,
                        error,
                        current.meta.version
                    );
                    let structure =
                        state_structure(&serde_json::to_value(&current).unwrap_or_default());
                    return MigrationOutcome {
                        state: current,
                        failure: Some(MigrationFailure {
                            version,
                            error,
                            structure,
                        }),
                    };
                }
            }
        }
        MigrationOutcome {
            state: current,
            failure: None,
        }
    }
}

fn run_step(
    migration: &dyn Migration,
    state: VersionedState,
) -> Result<VersionedState, MigrationError> {
    let mut next = migration.migrate(state)?;
    if next.is_empty() {
        return Err(MigrationError::EmptyData);
    }
    next.meta.version = migration.version();
    Ok(next)
}

/// Every migration step shipped with this build.
pub fn registered() -> Vec<Box<dyn Migration>> {
    vec![Box::new(Migration003)]
}
