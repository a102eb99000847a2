//! Audit logging for privileged operations
//!
//! Every reconcile or delete issued from the CLI is recorded as one JSON line
//! in `<state_dir>/audit.log`. Write failures never abort the operation.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::core::reconcile::ScopeReport;
use crate::core::rule_id::RuleId;

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Reconcile,
    Delete,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Identifies one CLI invocation
    pub run_id: Uuid,

    pub event_type: EventType,

    pub success: bool,

    /// Scope, counts and other structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        run_id: Uuid,
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            run_id,
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Audit log writer
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Opens the audit log in the state directory
    ///
    /// # Errors
    ///
    /// Returns `Err` if state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: path.into(),
        }
    }

    /// Appends an event to the audit log
    ///
    /// Events are written as JSON-lines format (one JSON object per line)
    pub async fn log(&self, event: &AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(event)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Reads up to `count` events, most recent first
    ///
    /// Lines that fail to parse are skipped.
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .take(count)
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        Ok(events)
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

async fn record(event: AuditEvent) {
    match AuditLog::new() {
        Ok(audit) => {
            if let Err(e) = audit.log(&event).await {
                tracing::warn!("Failed to write audit log {}: {e}", audit.path().display());
            }
        }
        Err(e) => tracing::warn!("Audit log unavailable: {e}"),
    }
}

/// Logs a reconcile run
///
/// # Arguments
///
/// * `reports` - Per-scope counts, empty when the run failed
/// * `error` - Error message if the run failed
pub async fn log_reconcile(run_id: Uuid, reports: &[ScopeReport], error: Option<String>) {
    let event = AuditEvent::new(
        run_id,
        EventType::Reconcile,
        error.is_none(),
        serde_json::json!({ "scopes": reports }),
        error,
    );
    record(event).await;
}

/// Logs a single rule deletion
pub async fn log_delete(
    run_id: Uuid,
    scope: &str,
    id: &RuleId,
    removed: bool,
    error: Option<String>,
) {
    let event = AuditEvent::new(
        run_id,
        EventType::Delete,
        error.is_none(),
        serde_json::json!({
            "scope": scope,
            "id": id,
            "removed": removed,
        }),
        error,
    );
    record(event).await;
}
