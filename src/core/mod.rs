//! Core vault logic.
//!
//! This module contains:
//! - Vault: the service tying everything together
//! - RunRegistry: in-memory, FIFO-bounded run cache
//! - Retention: planner, diff and metrics
//! - AuditLog: hash-chained, rotating journal
//! - ColdStorageTier: archive offload/restore
//! - ArtifactStore: on-disk run directories

pub mod audit;
pub mod canonical;
pub mod cold_storage;
pub mod locks;
pub mod registry;
pub mod retention;
pub mod store;
pub mod vault;

// Re-export commonly used types
pub use audit::{AuditLog, AuditRotationStatus, AuditSettings, AuditVerification, IntegritySnapshot};
pub use cold_storage::{ColdStorage, ColdStorageTier, LocalArchiveStore};
pub use locks::{CancelFlag, RunLocks};
pub use registry::RunRegistry;
pub use retention::{
    plan_retention, plan_retention_diff, ApplyOutcome, RetentionConfig, RetentionMetrics,
    RetentionPlan, RetentionPlanDiff,
};
pub use store::{ArtifactPlacement, ArtifactStore, StaleFlags};
pub use vault::{RunVerification, Vault, VaultOptions};
