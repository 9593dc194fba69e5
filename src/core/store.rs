//! File-based artifact store.
//!
//! Layout under the artifact root:
//!
//! ```text
//! <root>/<run_hash>/summary.json      pipeline artifacts (listed in the manifest)
//! <root>/<run_hash>/manifest.json     immutable, hash-stamped
//! <root>/<run_hash>/record.json       mutable run record (pinned, retention_state, ...)
//! <root>/<run_hash>/.evicted/         artifacts of demoted runs
//! ```
//!
//! Every multi-file change is staged and renamed into place, and every JSON
//! document is written to a temp file first, so a crash never leaves a
//! half-written run visible.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::adapters::ArtifactPayload;
use crate::core::canonical::{sha256_file, sha256_hex};
use crate::domain::manifest::validate_artifact_name;
use crate::domain::{
    ArtifactEntry, ArtifactManifest, ManifestLinkage, RetentionState, RunConfig, RunRecord,
    EVICTED_DIR, MANIFEST_FILE, RECORD_FILE,
};
use crate::error::{Result, VaultError};

/// On-disk form of a run record; the manifest lives in its own file
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    run_hash: String,
    created_at: DateTime<Utc>,
    strategy_name: String,
    primary_metric_value: Option<f64>,
    validation_caution: bool,
    pinned: bool,
    retention_state: RetentionState,
    #[serde(default)]
    summary: serde_json::Map<String, serde_json::Value>,
    config: RunConfig,
    #[serde(default)]
    archive_ref: Option<String>,
    manifest_hash: String,
}

impl StoredRecord {
    fn from_record(record: &RunRecord) -> Self {
        Self {
            run_hash: record.run_hash.clone(),
            created_at: record.created_at,
            strategy_name: record.strategy_name.clone(),
            primary_metric_value: record.primary_metric_value,
            validation_caution: record.validation_caution,
            pinned: record.pinned,
            retention_state: record.retention_state,
            summary: record.summary.clone(),
            config: record.config.clone(),
            archive_ref: record.archive_ref.clone(),
            manifest_hash: record.manifest.manifest_hash.clone(),
        }
    }

    fn into_record(self, manifest: ArtifactManifest) -> RunRecord {
        RunRecord {
            run_hash: self.run_hash,
            created_at: self.created_at,
            strategy_name: self.strategy_name,
            primary_metric_value: self.primary_metric_value,
            validation_caution: self.validation_caution,
            pinned: self.pinned,
            retention_state: self.retention_state,
            summary: self.summary,
            manifest,
            config: self.config,
            archive_ref: self.archive_ref,
        }
    }
}

/// Tier flags salvaged from a run directory that can no longer be loaded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaleFlags {
    pub pinned: bool,
    pub archive_ref: Option<String>,
}

/// Where a run's artifact files currently are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactPlacement {
    /// Every entry is in the run directory
    Materialized,
    /// Every entry is in `.evicted/` (or already moved back)
    Evicted,
    /// Some entries are in neither place
    Missing,
}

/// Artifact store rooted at a directory
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (and create) a store at `root`
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_hash: &str) -> PathBuf {
        self.root.join(run_hash)
    }

    pub fn evicted_dir(&self, run_hash: &str) -> PathBuf {
        self.run_dir(run_hash).join(EVICTED_DIR)
    }

    /// Write a new run directory and return its manifest.
    ///
    /// Files are staged in a sibling directory and renamed into place; a stale
    /// directory for the same hash (left behind by an evicted cache entry) is
    /// replaced.
    pub async fn write_run(
        &self,
        run_hash: &str,
        payloads: &[ArtifactPayload],
        linkage: ManifestLinkage,
    ) -> Result<ArtifactManifest> {
        let mut entries = Vec::with_capacity(payloads.len());
        for payload in payloads {
            validate_artifact_name(&payload.name)?;
            entries.push(ArtifactEntry::new(
                payload.name.clone(),
                payload.kind.clone(),
                sha256_hex(&payload.content),
                payload.content.len() as u64,
            ));
        }
        let manifest = ArtifactManifest::new(run_hash, entries, linkage)?;

        let staging = self.root.join(format!(".staging-{}", Uuid::new_v4()));
        fs::create_dir_all(&staging).await?;

        let staged = async {
            for payload in payloads {
                fs::write(staging.join(&payload.name), &payload.content).await?;
            }
            write_json_atomic(&staging.join(MANIFEST_FILE), &manifest).await
        }
        .await;

        if let Err(e) = staged {
            let _ = fs::remove_dir_all(&staging).await;
            return Err(e);
        }

        let target = self.run_dir(run_hash);
        if fs::try_exists(&target).await? {
            warn!(run_hash, "Replacing stale run directory");
            let trash = self.root.join(format!(".trash-{}", Uuid::new_v4()));
            fs::rename(&target, &trash).await?;
            fs::remove_dir_all(&trash).await?;
        }
        fs::rename(&staging, &target).await?;

        debug!(run_hash, files = payloads.len(), "Run directory written");
        Ok(manifest)
    }

    /// Persist the mutable part of a record
    pub async fn write_record(&self, record: &RunRecord) -> Result<()> {
        let path = self.run_dir(&record.run_hash).join(RECORD_FILE);
        write_json_atomic(&path, &StoredRecord::from_record(record)).await
    }

    /// Load and verify a run's manifest
    pub async fn read_manifest(&self, run_hash: &str) -> Result<ArtifactManifest> {
        let path = self.run_dir(run_hash).join(MANIFEST_FILE);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultError::not_found("manifest", run_hash));
            }
            Err(e) => return Err(e.into()),
        };

        let manifest = ArtifactManifest::from_json_slice(&bytes)?;
        if manifest.run_hash != run_hash {
            return Err(VaultError::integrity(
                format!("manifest of run {}", run_hash),
                format!("manifest names run {}", manifest.run_hash),
            ));
        }
        Ok(manifest)
    }

    /// Load a full record (record.json + verified manifest.json)
    pub async fn read_record(&self, run_hash: &str) -> Result<RunRecord> {
        let path = self.run_dir(run_hash).join(RECORD_FILE);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultError::not_found("run", run_hash));
            }
            Err(e) => return Err(e.into()),
        };
        let stored: StoredRecord = serde_json::from_slice(&bytes)?;
        let manifest = self.read_manifest(run_hash).await?;

        if stored.manifest_hash != manifest.manifest_hash {
            return Err(VaultError::integrity(
                format!("record of run {}", run_hash),
                format!(
                    "record references manifest {} but manifest.json is {}",
                    stored.manifest_hash, manifest.manifest_hash
                ),
            ));
        }

        Ok(stored.into_record(manifest))
    }

    /// Read `pinned` and `archive_ref` from record.json without verifying the manifest
    pub async fn read_stale_flags(&self, run_hash: &str) -> Option<StaleFlags> {
        let bytes = fs::read(self.run_dir(run_hash).join(RECORD_FILE)).await.ok()?;
        let stored: StoredRecord = serde_json::from_slice(&bytes).ok()?;
        Some(StaleFlags {
            pinned: stored.pinned,
            archive_ref: stored.archive_ref,
        })
    }

    /// Hashes of every run directory under the root
    pub async fn list_run_hashes(&self) -> Result<Vec<String>> {
        let mut hashes = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if !name.starts_with('.') {
                    hashes.push(name.to_string());
                }
            }
        }

        hashes.sort();
        Ok(hashes)
    }

    /// Artifact files currently materialized in the run directory
    pub async fn list_artifacts(&self, run_hash: &str) -> Result<Vec<String>> {
        let run_dir = self.run_dir(run_hash);
        if !fs::try_exists(&run_dir).await? {
            return Err(VaultError::not_found("run", run_hash));
        }

        let mut names = Vec::new();
        let mut entries = fs::read_dir(&run_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if name != MANIFEST_FILE && name != RECORD_FILE {
                    names.push(name.to_string());
                }
            }
        }

        names.sort();
        Ok(names)
    }

    /// Classify where the manifest's files are
    pub async fn placement(&self, manifest: &ArtifactManifest) -> Result<ArtifactPlacement> {
        let run_dir = self.run_dir(&manifest.run_hash);
        let evicted = self.evicted_dir(&manifest.run_hash);
        let mut all_materialized = true;

        for entry in &manifest.entries {
            if fs::try_exists(run_dir.join(&entry.name)).await? {
                continue;
            }
            all_materialized = false;
            if !fs::try_exists(evicted.join(&entry.name)).await? {
                return Ok(ArtifactPlacement::Missing);
            }
        }

        Ok(if all_materialized {
            ArtifactPlacement::Materialized
        } else {
            ArtifactPlacement::Evicted
        })
    }

    /// Move every manifest entry into `.evicted/`.
    ///
    /// Files already moved are skipped, so an interrupted eviction can be
    /// rerun. Returns the number of files moved by this call.
    pub async fn evict(&self, manifest: &ArtifactManifest) -> Result<usize> {
        let run_dir = self.run_dir(&manifest.run_hash);
        let evicted = self.evicted_dir(&manifest.run_hash);
        fs::create_dir_all(&evicted).await?;

        let mut moved = 0;
        for entry in &manifest.entries {
            let src = run_dir.join(&entry.name);
            if fs::try_exists(&src).await? {
                fs::rename(&src, evicted.join(&entry.name)).await?;
                moved += 1;
            } else if !fs::try_exists(evicted.join(&entry.name)).await? {
                debug!(run_hash = %manifest.run_hash, artifact = %entry.name, "Artifact already gone");
            }
        }

        Ok(moved)
    }

    /// Move `.evicted/` files back, verifying each digest.
    ///
    /// Returns `Ok(false)` without touching anything when the local evicted
    /// copy is incomplete.
    pub async fn rehydrate_local(&self, manifest: &ArtifactManifest) -> Result<bool> {
        if self.placement(manifest).await? == ArtifactPlacement::Missing {
            return Ok(false);
        }

        let run_dir = self.run_dir(&manifest.run_hash);
        let evicted = self.evicted_dir(&manifest.run_hash);

        for entry in &manifest.entries {
            let src = evicted.join(&entry.name);
            if !fs::try_exists(&src).await? {
                continue;
            }
            verify_file(&src, entry).await?;
            fs::rename(&src, run_dir.join(&entry.name)).await?;
        }

        self.remove_evicted(&manifest.run_hash).await?;
        Ok(true)
    }

    /// Drop the local evicted copy (after it was archived)
    pub async fn remove_evicted(&self, run_hash: &str) -> Result<()> {
        let evicted = self.evicted_dir(run_hash);
        if fs::try_exists(&evicted).await? {
            fs::remove_dir_all(&evicted).await?;
        }
        Ok(())
    }

    /// Check every materialized file against the manifest
    pub async fn verify_materialized(&self, manifest: &ArtifactManifest) -> Result<usize> {
        let run_dir = self.run_dir(&manifest.run_hash);
        let mut verified = 0;

        for entry in &manifest.entries {
            let path = run_dir.join(&entry.name);
            if fs::try_exists(&path).await? {
                verify_file(&path, entry).await?;
                verified += 1;
            }
        }

        Ok(verified)
    }
}

/// Compare a file's digest and size with its manifest entry
pub async fn verify_file(path: &Path, entry: &ArtifactEntry) -> Result<()> {
    let owned = path.to_path_buf();
    let (digest, bytes) = tokio::task::spawn_blocking(move || sha256_file(&owned))
        .await
        .map_err(|e| VaultError::Io(std::io::Error::other(e)))??;

    if digest != entry.sha256 || bytes != entry.bytes {
        return Err(VaultError::integrity(
            path.display().to_string(),
            format!(
                "expected sha256 {} ({} bytes), found {} ({} bytes)",
                entry.sha256, entry.bytes, digest, bytes
            ),
        ));
    }
    Ok(())
}

/// Serialize to a temp file in the target directory, then rename over the target
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<()> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        std::io::Write::write_all(&mut tmp, &json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| VaultError::Io(e.error))?;
        Ok(())
    })
    .await
    .map_err(|e| VaultError::Io(std::io::Error::other(e)))?
}
