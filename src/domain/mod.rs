//! Domain types for the run vault.
//!
//! This module contains the core data structures:
//! - Run: configuration, cached record, retention tier
//! - Manifest: hash-stamped artifact set of a run
//! - Events: audit log entries

pub mod events;
pub mod manifest;
pub mod run;

// Re-export commonly used types
pub use events::{AuditEntry, AuditEvent, AuditEventType, AuditLine};
pub use manifest::{
    ArtifactEntry, ArtifactManifest, ManifestLinkage, EVICTED_DIR, MANIFEST_FILE, RECORD_FILE,
};
pub use run::{CreateOutcome, RetentionState, RunConfig, RunRecord};
