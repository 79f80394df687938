use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

pub const BACKUP_CREATED: &str = "BACKUP_CREATED";
pub const BACKUP_CREATE_FAILED: &str = "BACKUP_CREATE_FAILED";
pub const BACKUP_VALIDATED: &str = "BACKUP_VALIDATED";
pub const BACKUP_DELETED: &str = "BACKUP_DELETED";
pub const ROLLBACK_EXECUTED: &str = "ROLLBACK_EXECUTED";
pub const EVIDENCE_STORED: &str = "EVIDENCE_STORED";
pub const EVIDENCE_DELETED: &str = "EVIDENCE_DELETED";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub action: String,
    pub resource: String,
    pub resource_id: String,
    pub details: Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        action: &str,
        resource: &str,
        resource_id: impl Into<String>,
        details: Value,
    ) -> Self {
        Self {
            action: action.to_string(),
            resource: resource.to_string(),
            resource_id: resource_id.into(),
            details,
            timestamp: Utc::now(),
        }
    }
}

pub trait AuditLog: Send + Sync {
    fn log_event(&self, event: AuditEvent);
}

/// Emits each event as a structured `tracing` record on the `audit` target.
#[derive(Debug, Default)]
pub struct TracingAuditLog;

impl AuditLog for TracingAuditLog {
    fn log_event(&self, event: AuditEvent) {
        info!(
            target: "audit",
            action = %event.action,
            resource = %event.resource,
            resource_id = %event.resource_id,
            details = %event.details,
            "audit event"
        );
    }
}

/// Keeps events in memory; handy for tests and for callers that forward the
/// trail elsewhere after an operation.
#[derive(Debug, Default)]
pub struct RecordingAuditLog {
    events: Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn with_action(&self, action: &str) -> Vec<AuditEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.action == action)
            .collect()
    }
}

impl AuditLog for RecordingAuditLog {
    fn log_event(&self, event: AuditEvent) {
        if let Ok(mut g) = self.events.lock() {
            g.push(event);
        }
    }
}
