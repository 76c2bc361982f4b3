//! Error-reporting and metrics collaborators.
//!
//! The core never talks to a crash-reporting service directly. It hands
//! errors to an `ErrorReporter` and outbound node calls to a `MetricsSink`;
//! the defaults here route both into `tracing`.

use serde::Serialize;
use serde_json::{json, Value};

use crate::migration::MigrationFailure;
use crate::transaction::TransactionMeta;

/// Receives errors worth reporting. Must never be given secret material.
pub trait ErrorReporter: Send + Sync {
    /// Report an error with structured context under `extra`.
    fn capture_exception(&self, error: &dyn std::error::Error, extra: Value);

    fn capture_message(&self, message: &str, extra: Value);
}

/// Reporter that logs through `tracing`.
#[derive(Clone, Debug, Default)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn capture_exception(&self, error: &dyn std::error::Error, extra: Value) {
        tracing::error!(target: "itrust::report", %extra, "{}", error);
    }

    fn capture_message(&self, message: &str, extra: Value) {
        tracing::error!(target: "itrust::report", %extra, "{}", message);
    }
}

/// One metrics record, serialized as `{ "type": ..., "data": ... }`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct MetricsEntry {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

impl MetricsEntry {
    /// Record of an outbound node RPC call.
    pub fn rpc(data: Value) -> Self {
        MetricsEntry {
            kind: "rpc".into(),
            data,
        }
    }
}

/// External sink for network metrics.
pub trait MetricsSink: Send + Sync {
    fn submit(&self, entry: MetricsEntry);
}

/// Sink that logs entries at `debug`.
#[derive(Clone, Debug, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn submit(&self, entry: MetricsEntry) {
        tracing::debug!(target: "itrust::metrics", kind = %entry.kind, data = %entry.data, "metrics entry");
    }
}

/// Report a migration step failure with only the state's shape attached.
pub fn report_migration_failure(reporter: &dyn ErrorReporter, failure: &MigrationFailure) {
    reporter.capture_exception(
        &failure.error,
        json!({
            "vaultStructure": failure.structure,
            "migrationVersion": failure.version,
        }),
    );
}

/// Report a transaction that ended in `failed`.
pub fn report_failed_tx(reporter: &dyn ErrorReporter, tx: &TransactionMeta) {
    let reason = tx
        .err
        .as_ref()
        .map(|e| e.message.as_str())
        .unwrap_or("unknown error");
    let message = format!("Transaction Failed: {}", reason);
    let extra = json!({ "txMeta": tx });
    reporter.capture_message(&message, extra);
}
