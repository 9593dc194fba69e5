//! Error taxonomy for the run vault.
//!
//! Callers branch on the variant rather than on message text:
//! - `Validation`: rejected before any mutation
//! - `NotFound`: unknown run or missing archive member, not retryable
//! - `Conflict` / `Integrity`: state or data corruption, never auto-repaired
//! - `Timeout` / `Io` / `ColdStorage`: transient, the caller may retry

use std::time::Duration;

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, VaultError>;

/// Errors surfaced by the vault core
#[derive(Debug, Error)]
pub enum VaultError {
    /// Out-of-range settings or a malformed manifest
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Unknown run hash, missing archive, or missing archive member
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The operation does not apply to the current state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Stored data does not match its recorded digest
    #[error("Integrity check failed for {subject}: {detail}")]
    Integrity { subject: String, detail: String },

    /// A bounded I/O call did not finish in time
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Cancelled between units of work; state is consistent and the operation can be rerun
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// The external pipeline failed
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// Cold-storage provider failure (transport or remote status)
    #[error("Cold storage error: {0}")]
    ColdStorage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VaultError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn integrity(subject: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Integrity {
            subject: subject.into(),
            detail: detail.into(),
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Cancelled(_) | Self::ColdStorage(_) | Self::Io(_)
        )
    }

    /// Whether the error signals corrupted stored data
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity { .. })
    }

    /// HTTP status the API layer should answer with
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound { .. } => 404,
            Self::Conflict(_) | Self::Integrity { .. } => 409,
            Self::Timeout { .. } => 504,
            Self::Cancelled(_) | Self::ColdStorage(_) => 503,
            Self::Pipeline(_) | Self::Io(_) | Self::Serialization(_) => 500,
        }
    }
}
