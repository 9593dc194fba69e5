//! The run vault service.
//!
//! `Vault` owns the registry, the artifact store, the audit log, the
//! retention settings and (optionally) the cold-storage tier. Every mutation
//! of a run happens under that run's lock from [`RunLocks`], so cache-miss
//! builds, retention moves and cold-storage transfers on one run never
//! interleave.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::Pipeline;
use crate::core::audit::{AuditLog, AuditSettings, AuditVerification};
use crate::core::cold_storage::ColdStorageTier;
use crate::core::locks::{CancelFlag, RunLocks};
use crate::core::registry::{RunRegistry, DEFAULT_CAPACITY};
use crate::core::retention::{
    plan_retention, plan_retention_diff, retention_metrics, ApplyOutcome, RetentionConfig,
    RetentionMetrics, RetentionPlan, RetentionPlanDiff,
};
use crate::core::store::{write_json_atomic, ArtifactPlacement, ArtifactStore, StaleFlags};
use crate::domain::{
    AuditEvent, AuditEventType, CreateOutcome, ManifestLinkage, RetentionState, RunConfig,
    RunRecord,
};
use crate::error::{Result, VaultError};

pub const RETENTION_FILE: &str = "retention.json";

/// Everything needed to open a vault
#[derive(Debug, Clone)]
pub struct VaultOptions {
    /// Holds the audit log and persisted retention settings
    pub home: PathBuf,
    pub artifacts: PathBuf,
    pub registry_capacity: usize,
    pub audit: AuditSettings,
    /// Used until settings are saved to `retention.json`
    pub initial_retention: RetentionConfig,
    pub cold_storage: Option<ColdStorageTier>,
    /// Archive evicted files during retention apply and drop the local copy
    pub offload_on_demote: bool,
}

impl VaultOptions {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        Self {
            artifacts: home.join("artifacts"),
            home,
            registry_capacity: DEFAULT_CAPACITY,
            audit: AuditSettings::default(),
            initial_retention: RetentionConfig::default(),
            cold_storage: None,
            offload_on_demote: false,
        }
    }

    pub fn with_artifacts(mut self, artifacts: impl Into<PathBuf>) -> Self {
        self.artifacts = artifacts.into();
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.registry_capacity = capacity;
        self
    }

    pub fn with_audit(mut self, audit: AuditSettings) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_retention(mut self, retention: RetentionConfig) -> Self {
        self.initial_retention = retention;
        self
    }

    pub fn with_cold_storage(mut self, tier: ColdStorageTier, offload_on_demote: bool) -> Self {
        self.cold_storage = Some(tier);
        self.offload_on_demote = offload_on_demote;
        self
    }
}

/// Result of checking a run's stored data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunVerification {
    pub run_hash: String,
    pub manifest_hash: String,
    pub retention_state: RetentionState,
    /// Materialized files whose digest matched the manifest
    pub verified_files: usize,
    pub archived: bool,
}

/// Where rehydrated files came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Local,
    Cold,
}

impl Source {
    fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Cold => "cold",
        }
    }
}

/// Content-addressed run cache with tiered artifact retention
pub struct Vault {
    pipeline: Arc<dyn Pipeline>,
    store: ArtifactStore,
    registry: RunRegistry,
    audit: AuditLog,
    locks: RunLocks,
    cold: Option<ColdStorageTier>,
    offload_on_demote: bool,
    retention: RwLock<RetentionConfig>,
    retention_path: PathBuf,
}

impl Vault {
    /// Open the vault, loading persisted runs into the registry
    pub async fn open(options: VaultOptions, pipeline: Arc<dyn Pipeline>) -> Result<Self> {
        tokio::fs::create_dir_all(&options.home).await?;
        let store = ArtifactStore::open(&options.artifacts).await?;
        let audit = AuditLog::open(&options.home, options.audit).await?;

        let retention_path = options.home.join(RETENTION_FILE);
        let retention = if tokio::fs::try_exists(&retention_path).await? {
            let bytes = tokio::fs::read(&retention_path).await?;
            let config: RetentionConfig = serde_json::from_slice(&bytes)?;
            config.validate()?;
            config
        } else {
            options.initial_retention.validate()?;
            options.initial_retention
        };

        let vault = Self {
            pipeline,
            store,
            registry: RunRegistry::new(options.registry_capacity),
            audit,
            locks: RunLocks::new(),
            cold: options.cold_storage,
            offload_on_demote: options.offload_on_demote,
            retention: RwLock::new(retention),
            retention_path,
        };
        vault.warm_up().await?;
        Ok(vault)
    }

    /// Load records from disk, oldest first, so capacity keeps the newest
    async fn warm_up(&self) -> Result<()> {
        let mut records = Vec::new();
        for hash in self.store.list_run_hashes().await? {
            match self.store.read_record(&hash).await {
                Ok(record) => records.push(record),
                Err(e) if e.is_integrity() => {
                    error!(run_hash = %hash, error = %e, "Corrupt run directory, skipping");
                }
                Err(e) => warn!(run_hash = %hash, error = %e, "Unreadable run directory, skipping"),
            }
        }

        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.run_hash.cmp(&b.run_hash))
        });

        let loaded = records.len();
        for record in records {
            self.registry.insert(record).await;
        }
        if loaded > 0 {
            info!(loaded, cached = self.registry.len().await, "Registry warmed from disk");
        }
        Ok(())
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn cold_storage(&self) -> Option<&ColdStorageTier> {
        self.cold.as_ref()
    }

    // ------------------------------------------------------------------
    // Run cache
    // ------------------------------------------------------------------

    /// Return the cached run for `config`, computing it on a miss.
    ///
    /// `seed` overrides the seed handed to the pipeline but is not part of
    /// the run hash.
    #[instrument(skip(self, config, seed), fields(strategy = %config.strategy_name))]
    pub async fn create_or_get(&self, config: &RunConfig, seed: Option<u64>) -> Result<CreateOutcome> {
        let data_hash = self
            .pipeline
            .dataset_hash(config)
            .await
            .map_err(|e| VaultError::Pipeline(format!("{:#}", e)))?;
        let run_hash = config.run_hash(&data_hash)?;

        if let Some(record) = self.registry.get(&run_hash).await {
            debug!(%run_hash, "Cache hit");
            return Ok(CreateOutcome {
                run_hash,
                record,
                created: false,
            });
        }

        let _guard = self.locks.lock(&run_hash).await;

        // Another caller may have built it while we waited
        if let Some(record) = self.registry.get(&run_hash).await {
            debug!(%run_hash, "Cache hit after waiting for builder");
            return Ok(CreateOutcome {
                run_hash,
                record,
                created: false,
            });
        }

        // Evicted from the registry but still on disk
        let stale = match self.store.read_record(&run_hash).await {
            Ok(record) => {
                debug!(%run_hash, state = %record.retention_state, "Reloaded run from disk");
                self.registry.insert(record.clone()).await;
                return Ok(CreateOutcome {
                    run_hash,
                    record,
                    created: false,
                });
            }
            Err(VaultError::NotFound { .. }) => StaleFlags::default(),
            Err(e) => {
                warn!(%run_hash, error = %e, "Run directory unreadable, recomputing");
                self.store.read_stale_flags(&run_hash).await.unwrap_or_default()
            }
        };

        info!(%run_hash, pipeline = self.pipeline.name(), "Cache miss, running pipeline");
        let output = self
            .pipeline
            .execute(config, seed.unwrap_or(config.seed))
            .await
            .map_err(|e| VaultError::Pipeline(format!("{:#}", e)))?;

        let linkage = ManifestLinkage {
            chain_prev: output.chain_prev.clone(),
            data_hash: Some(data_hash),
            calendar_id: config.calendar_id.clone(),
            symbol: Some(config.symbol.clone()),
            timeframe: Some(config.timeframe.clone()),
        };
        let primary_metric_value = output.primary_metric_value;
        let validation_caution = output.validation_caution;
        let summary = output.summary.clone();

        let manifest = self
            .store
            .write_run(&run_hash, &output.into_payloads(), linkage)
            .await?;

        let record = RunRecord {
            run_hash: run_hash.clone(),
            created_at: Utc::now(),
            strategy_name: config.strategy_name.clone(),
            primary_metric_value,
            validation_caution,
            pinned: stale.pinned,
            retention_state: if stale.pinned {
                RetentionState::Pinned
            } else {
                RetentionState::Full
            },
            summary,
            manifest,
            config: config.clone(),
            archive_ref: stale.archive_ref,
        };
        self.store.write_record(&record).await?;

        self.audit
            .append(AuditEvent::run_created(
                &run_hash,
                &record.strategy_name,
                &record.manifest.manifest_hash,
                record.manifest.len(),
            ))
            .await?;

        let evicted = self.registry.insert(record.clone()).await;
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Registry over capacity, evicted oldest records");
        }

        info!(%run_hash, artifacts = record.manifest.len(), "Run created");
        Ok(CreateOutcome {
            run_hash,
            record,
            created: true,
        })
    }

    pub async fn get_run(&self, run_hash: &str) -> Result<RunRecord> {
        self.registry
            .get(run_hash)
            .await
            .ok_or_else(|| VaultError::not_found("run", run_hash))
    }

    /// Cached runs, newest first
    pub async fn list_runs(&self) -> Vec<RunRecord> {
        let mut runs = self.registry.snapshot().await;
        runs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.run_hash.cmp(&b.run_hash))
        });
        runs
    }

    /// Artifact files currently materialized for a run
    pub async fn list_artifacts(&self, run_hash: &str) -> Result<Vec<String>> {
        self.get_run(run_hash).await?;
        self.store.list_artifacts(run_hash).await
    }

    /// Re-read the manifest from disk and check every materialized file
    #[instrument(skip(self))]
    pub async fn verify_run(&self, run_hash: &str) -> Result<RunVerification> {
        let _guard = self.locks.lock(run_hash).await;
        let record = self.get_run(run_hash).await?;

        let manifest = self.store.read_manifest(run_hash).await?;
        if manifest.manifest_hash != record.manifest.manifest_hash {
            let err = VaultError::integrity(
                format!("run {}", run_hash),
                format!(
                    "manifest.json hash {} differs from registry {}",
                    manifest.manifest_hash, record.manifest.manifest_hash
                ),
            );
            error!(error = %err, "Manifest mismatch");
            return Err(err);
        }

        let verified_files = match self.store.verify_materialized(&manifest).await {
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "Artifact verification failed");
                return Err(e);
            }
        };

        Ok(RunVerification {
            run_hash: run_hash.to_string(),
            manifest_hash: manifest.manifest_hash,
            retention_state: record.retention_state,
            verified_files,
            archived: record.archive_ref.is_some(),
        })
    }

    // ------------------------------------------------------------------
    // Per-run tier changes
    // ------------------------------------------------------------------

    /// Persist a changed record and publish it to the registry
    async fn save(&self, record: &RunRecord) -> Result<()> {
        self.store.write_record(record).await?;
        let updated = record.clone();
        self.registry.update(&record.run_hash, |r| *r = updated).await;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn pin(&self, run_hash: &str) -> Result<RunRecord> {
        let _guard = self.locks.lock(run_hash).await;
        let mut record = self.get_run(run_hash).await?;
        if record.pinned {
            return Ok(record);
        }

        record.pinned = true;
        if record.retention_state.is_materialized() {
            record.retention_state = RetentionState::Pinned;
        }
        self.save(&record).await?;
        self.audit
            .append(AuditEvent::for_run(AuditEventType::RunPinned, run_hash))
            .await?;

        info!(state = %record.retention_state, "Run pinned");
        Ok(record)
    }

    #[instrument(skip(self))]
    pub async fn unpin(&self, run_hash: &str) -> Result<RunRecord> {
        let _guard = self.locks.lock(run_hash).await;
        let mut record = self.get_run(run_hash).await?;
        if !record.pinned {
            return Ok(record);
        }

        record.pinned = false;
        if record.retention_state == RetentionState::Pinned {
            record.retention_state = RetentionState::Full;
        }
        self.save(&record).await?;
        self.audit
            .append(AuditEvent::for_run(AuditEventType::RunUnpinned, run_hash))
            .await?;

        info!(state = %record.retention_state, "Run unpinned");
        Ok(record)
    }

    /// Bring a manifest-only run's files back, from `.evicted/` or cold storage
    #[instrument(skip(self))]
    pub async fn rehydrate(&self, run_hash: &str) -> Result<RunRecord> {
        let _guard = self.locks.lock(run_hash).await;
        let record = self.get_run(run_hash).await?;
        if record.retention_state.is_materialized() {
            return Ok(record);
        }

        let Some((mut record, source)) = self.rehydrate_locked(record).await? else {
            return Err(VaultError::not_found("evicted artifacts", run_hash));
        };
        record.retention_state = record.materialized_state(false);
        self.save(&record).await?;
        self.audit
            .append(
                AuditEvent::for_run(AuditEventType::RunRehydrated, run_hash)
                    .with_details(json!({ "source": source.as_str(), "files": record.manifest.len() })),
            )
            .await?;

        info!(source = source.as_str(), "Run rehydrated");
        Ok(record)
    }

    /// Restore a manifest-only run from cold storage
    #[instrument(skip(self))]
    pub async fn restore(&self, run_hash: &str) -> Result<RunRecord> {
        let cold = self.require_cold()?;
        let _guard = self.locks.lock(run_hash).await;
        let mut record = self.get_run(run_hash).await?;
        if record.retention_state.is_materialized() {
            return Err(VaultError::Conflict(format!(
                "run {} is {}, nothing to restore",
                run_hash, record.retention_state
            )));
        }

        let restored = cold.restore(&record, &self.store.run_dir(run_hash)).await?;
        self.store.remove_evicted(run_hash).await?;

        record.retention_state = record.materialized_state(false);
        self.save(&record).await?;
        self.audit
            .append(
                AuditEvent::for_run(AuditEventType::RunRestored, run_hash).with_details(json!({
                    "archive_ref": record.archive_ref,
                    "files": restored.len(),
                })),
            )
            .await?;

        Ok(record)
    }

    /// Archive a manifest-only run's evicted files to cold storage
    #[instrument(skip(self))]
    pub async fn offload(&self, run_hash: &str) -> Result<RunRecord> {
        self.require_cold()?;
        let _guard = self.locks.lock(run_hash).await;
        let record = self.get_run(run_hash).await?;
        self.offload_locked(record).await
    }

    fn require_cold(&self) -> Result<&ColdStorageTier> {
        self.cold
            .as_ref()
            .ok_or_else(|| VaultError::Conflict("cold storage is not enabled".to_string()))
    }

    /// Caller holds the run lock
    async fn offload_locked(&self, mut record: RunRecord) -> Result<RunRecord> {
        let cold = self.require_cold()?;
        let evicted = self.store.evicted_dir(&record.run_hash);

        if record.archive_ref.is_some() && !tokio::fs::try_exists(&evicted).await? {
            debug!(run_hash = %record.run_hash, "Already offloaded");
            return Ok(record);
        }

        let archive_ref = cold.offload(&record, &evicted).await?;
        self.store.remove_evicted(&record.run_hash).await?;

        record.archive_ref = Some(archive_ref.clone());
        self.save(&record).await?;
        self.audit
            .append(
                AuditEvent::for_run(AuditEventType::RunOffloaded, &record.run_hash)
                    .with_details(json!({ "archive_ref": archive_ref, "provider": cold.provider() })),
            )
            .await?;

        Ok(record)
    }

    /// Caller holds the run lock. `None` when no copy of the files exists.
    async fn rehydrate_locked(&self, record: RunRecord) -> Result<Option<(RunRecord, Source)>> {
        if self.store.rehydrate_local(&record.manifest).await? {
            return Ok(Some((record, Source::Local)));
        }

        let Some(cold) = &self.cold else {
            return Ok(None);
        };
        if record.archive_ref.is_none() && !cold.has_archive(&record.run_hash).await? {
            return Ok(None);
        }

        cold.restore(&record, &self.store.run_dir(&record.run_hash))
            .await?;
        self.store.remove_evicted(&record.run_hash).await?;
        Ok(Some((record, Source::Cold)))
    }

    /// Move-then-mark demotion; returns the record and whether anything changed
    async fn demote_locked(&self, mut record: RunRecord) -> Result<(RunRecord, bool)> {
        let already_archived =
            record.retention_state == RetentionState::ManifestOnly && record.archive_ref.is_some();
        let moved = if already_archived {
            0
        } else {
            self.store.evict(&record.manifest).await?
        };

        let changed = record.retention_state != RetentionState::ManifestOnly;
        if changed {
            record.retention_state = RetentionState::ManifestOnly;
            self.save(&record).await?;
            debug!(run_hash = %record.run_hash, moved, "Run demoted");
        }

        if self.offload_on_demote
            && self.cold.is_some()
            && self.store.placement(&record.manifest).await? == ArtifactPlacement::Evicted
            && tokio::fs::try_exists(self.store.evicted_dir(&record.run_hash)).await?
        {
            record = self.offload_locked(record).await?;
        }

        Ok((record, changed || moved > 0))
    }

    // ------------------------------------------------------------------
    // Retention
    // ------------------------------------------------------------------

    pub async fn retention_config(&self) -> RetentionConfig {
        *self.retention.read().await
    }

    /// Validate and persist new retention settings
    #[instrument(skip(self))]
    pub async fn update_retention_config(&self, config: RetentionConfig) -> Result<RetentionConfig> {
        config.validate()?;

        let mut current = self.retention.write().await;
        write_json_atomic(&self.retention_path, &config).await?;
        let previous = std::mem::replace(&mut *current, config);

        self.audit
            .append(AuditEvent::new(
                AuditEventType::RetentionSettingsUpdated,
                None,
                json!({ "previous": previous, "current": config }),
            ))
            .await?;

        info!(
            keep_last = config.keep_last,
            top_k_per_strategy = config.top_k_per_strategy,
            max_full_bytes = ?config.max_full_bytes,
            "Retention settings updated"
        );
        Ok(config)
    }

    /// Dry-run plan under the current settings
    pub async fn plan_retention(&self) -> RetentionPlan {
        let config = self.retention_config().await;
        plan_retention(&self.registry.snapshot().await, &config)
    }

    /// What would change under `hypothetical` settings
    pub async fn plan_retention_diff(&self, hypothetical: &RetentionConfig) -> Result<RetentionPlanDiff> {
        hypothetical.validate()?;
        let current = self.retention_config().await;
        Ok(plan_retention_diff(
            &self.registry.snapshot().await,
            &current,
            hypothetical,
        ))
    }

    /// Plan under the current settings and apply it
    pub async fn apply_retention(&self, cancel: &CancelFlag) -> Result<ApplyOutcome> {
        let plan = self.plan_retention().await;
        self.apply_retention_plan(&plan, cancel).await
    }

    /// Apply a plan run by run. Cancellation is honoured between runs; every
    /// run already processed is left consistent and a rerun resumes.
    #[instrument(skip(self, plan, cancel), fields(demote = plan.demote.len(), keep_full = plan.keep_full.len()))]
    pub async fn apply_retention_plan(&self, plan: &RetentionPlan, cancel: &CancelFlag) -> Result<ApplyOutcome> {
        let mut outcome = ApplyOutcome::default();

        for run_hash in &plan.demote {
            if cancel.is_cancelled() {
                return self.cancelled(outcome).await;
            }
            let _guard = self.locks.lock(run_hash).await;
            let Some(record) = self.registry.get(run_hash).await else {
                outcome.skipped.push(run_hash.clone());
                continue;
            };

            let had_archive = record.archive_ref.is_some();
            let (record, changed) = self.demote_locked(record).await?;
            outcome.demoted.push(run_hash.clone());
            if changed {
                outcome.newly_demoted.push(run_hash.clone());
            }
            if !had_archive && record.archive_ref.is_some() {
                outcome.offloaded.push(run_hash.clone());
            }
        }

        for run_hash in &plan.keep_full {
            if cancel.is_cancelled() {
                return self.cancelled(outcome).await;
            }
            let _guard = self.locks.lock(run_hash).await;
            let Some(record) = self.registry.get(run_hash).await else {
                outcome.skipped.push(run_hash.clone());
                continue;
            };
            let target = plan.target_state(&record);

            if record.retention_state == RetentionState::ManifestOnly {
                match self.rehydrate_locked(record).await? {
                    Some((mut record, source)) => {
                        record.retention_state = target;
                        self.save(&record).await?;
                        debug!(%run_hash, source = source.as_str(), state = %target, "Run promoted");
                        outcome.promoted.push(run_hash.clone());
                    }
                    None => {
                        warn!(%run_hash, "No copy of evicted artifacts, leaving manifest-only");
                        outcome.skipped.push(run_hash.clone());
                    }
                }
            } else {
                let mut record = record;
                // A demotion interrupted between moving files and marking the state
                if self.store.placement(&record.manifest).await? == ArtifactPlacement::Evicted
                    && self.store.rehydrate_local(&record.manifest).await?
                {
                    warn!(%run_hash, "Moved back files of an interrupted demotion");
                    outcome.promoted.push(run_hash.clone());
                }
                if record.retention_state != target {
                    record.retention_state = target;
                    self.save(&record).await?;
                    outcome.retiered.push(run_hash.clone());
                }
            }
        }

        self.record_apply(&outcome, false).await?;
        info!(
            demoted = outcome.demoted.len(),
            changed = outcome.changed(),
            skipped = outcome.skipped.len(),
            "Retention applied"
        );
        Ok(outcome)
    }

    async fn record_apply(&self, outcome: &ApplyOutcome, cancelled: bool) -> Result<()> {
        self.audit
            .append(AuditEvent::new(
                AuditEventType::RetentionApplied,
                None,
                json!({
                    "demoted": outcome.demoted,
                    "newly_demoted": outcome.newly_demoted.len(),
                    "promoted": outcome.promoted.len(),
                    "retiered": outcome.retiered.len(),
                    "offloaded": outcome.offloaded.len(),
                    "skipped": outcome.skipped.len(),
                    "cancelled": cancelled,
                }),
            ))
            .await?;
        Ok(())
    }

    async fn cancelled(&self, outcome: ApplyOutcome) -> Result<ApplyOutcome> {
        warn!(processed = outcome.demoted.len() + outcome.promoted.len(), "Retention apply cancelled");
        if outcome.changed() > 0 {
            self.record_apply(&outcome, true).await?;
        }
        Err(VaultError::Cancelled(format!(
            "retention apply stopped after {} changes; rerun to resume",
            outcome.changed()
        )))
    }

    pub async fn retention_metrics(&self) -> RetentionMetrics {
        let config = self.retention_config().await;
        let records = self.registry.snapshot().await;
        retention_metrics(&records, &config, self.audit.status().await)
    }

    pub async fn verify_audit(&self) -> Result<AuditVerification> {
        self.audit.verify().await
    }
}
