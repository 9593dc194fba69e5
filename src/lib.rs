//! runvault - Content-addressed backtest run cache with tiered artifact retention
//!
//! Expensive, deterministic backtest runs are computed once per unique
//! configuration and kept on disk under size and recency constraints.
//!
//! # Architecture
//!
//! - Runs are addressed by the sha256 of their canonical configuration and
//!   dataset hash; concurrent submissions of one config compute it once
//! - Each run directory carries a hash-stamped artifact manifest
//! - A retention planner decides which runs keep full artifacts; the rest
//!   are demoted to manifest-only and may be archived to cold storage
//! - Every mutation is recorded in a hash-chained, rotating audit log
//!
//! # Modules
//!
//! - `adapters`: External systems (backtest pipeline, HTTP object store)
//! - `core`: Vault service, registry, retention, audit log, cold storage
//! - `domain`: Data structures (RunConfig, RunRecord, ArtifactManifest, audit events)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Compute (or fetch) a run
//! runvault run configs/sma_cross.yaml
//!
//! # Preview and apply retention
//! runvault retention plan
//! runvault retention apply
//!
//! # Bring a demoted run back
//! runvault rehydrate <run-hash>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;

// Re-export main types at crate root for convenience
pub use adapters::{ArtifactPayload, Pipeline, PipelineOutput};
pub use core::{CancelFlag, RetentionConfig, Vault, VaultOptions};
pub use domain::{ArtifactEntry, ArtifactManifest, CreateOutcome, RetentionState, RunConfig, RunRecord};
pub use error::{Result, VaultError};
