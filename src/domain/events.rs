//! Audit events recorded in the hash-chained audit log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

/// Types of audit events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A cache miss computed and stored a new run
    RunCreated,

    /// A retention plan was applied
    RetentionApplied,

    /// Retention settings were changed
    RetentionSettingsUpdated,

    RunPinned,

    RunUnpinned,

    /// Demoted artifacts were archived to cold storage
    RunOffloaded,

    /// Artifacts were restored from cold storage
    RunRestored,

    /// Artifacts were brought back from the local evicted directory
    RunRehydrated,
}

/// An event before it is sequenced into the chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_hash: Option<String>,

    /// Event-specific payload (no secrets)
    #[serde(default)]
    pub details: serde_json::Value,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, run_hash: Option<String>, details: serde_json::Value) -> Self {
        Self {
            event_type,
            run_hash,
            details,
        }
    }

    pub fn run_created(run_hash: &str, strategy_name: &str, manifest_hash: &str, artifact_count: usize) -> Self {
        Self::new(
            AuditEventType::RunCreated,
            Some(run_hash.to_string()),
            json!({
                "strategy_name": strategy_name,
                "manifest_hash": manifest_hash,
                "artifact_count": artifact_count,
            }),
        )
    }

    pub fn for_run(event_type: AuditEventType, run_hash: &str) -> Self {
        Self::new(event_type, Some(run_hash.to_string()), serde_json::Value::Null)
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// A sequenced entry; its canonical JSON is what the chain hashes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Position in the chain, starting at 1
    pub seq: u64,

    pub id: Uuid,

    pub timestamp: DateTime<Utc>,

    #[serde(flatten)]
    pub event: AuditEvent,
}

impl AuditEntry {
    pub fn new(seq: u64, event: AuditEvent) -> Self {
        Self {
            seq,
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        }
    }
}

/// One line of the audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLine {
    pub entry: AuditEntry,

    /// Chain value before this entry
    pub prev_hash: String,

    /// `sha256(prev_hash || canonical(entry))`
    pub hash: String,
}
