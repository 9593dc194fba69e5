//! Cold-storage tier for demoted runs.
//!
//! A demoted run's artifact files are packed into a gzip'd tar archive and
//! handed to a [`ColdStorage`] provider. Restoring unpacks into a staging
//! directory, checks every file against the manifest and only then renames
//! the files into the run directory.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::time::timeout;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::core::canonical::sha256_file;
use crate::domain::{ArtifactEntry, RetentionState, RunRecord};
use crate::error::{Result, VaultError};

pub const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// Archive backend
#[async_trait]
pub trait ColdStorage: Send + Sync {
    /// Provider name (`local`, `http`)
    fn provider(&self) -> &'static str;

    /// Store an archive, returning its reference (path or object key)
    async fn put(&self, run_hash: &str, archive: Vec<u8>) -> Result<String>;

    /// Fetch an archive; `NotFound` when absent
    async fn get(&self, run_hash: &str) -> Result<Vec<u8>>;

    async fn exists(&self, run_hash: &str) -> Result<bool>;
}

/// Archives as `<dir>/<run_hash>.tar.gz` on a local (or mounted) filesystem
#[derive(Debug, Clone)]
pub struct LocalArchiveStore {
    dir: PathBuf,
}

impl LocalArchiveStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn archive_path(&self, run_hash: &str) -> PathBuf {
        self.dir.join(format!("{}{}", run_hash, ARCHIVE_SUFFIX))
    }
}

#[async_trait]
impl ColdStorage for LocalArchiveStore {
    fn provider(&self) -> &'static str {
        "local"
    }

    async fn put(&self, run_hash: &str, archive: Vec<u8>) -> Result<String> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let dir = self.dir.clone();
        let path = self.archive_path(run_hash);

        let target = path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            std::io::Write::write_all(&mut tmp, &archive)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&target).map_err(|e| VaultError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| VaultError::Io(std::io::Error::other(e)))??;

        Ok(path.display().to_string())
    }

    async fn get(&self, run_hash: &str) -> Result<Vec<u8>> {
        match tokio::fs::read(self.archive_path(run_hash)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(VaultError::not_found("archive", run_hash))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, run_hash: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.archive_path(run_hash)).await?)
    }
}

/// Offload/restore on top of a provider, with bounded I/O
#[derive(Clone)]
pub struct ColdStorageTier {
    store: Arc<dyn ColdStorage>,
    io_timeout: Duration,
}

impl std::fmt::Debug for ColdStorageTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColdStorageTier")
            .field("provider", &self.store.provider())
            .field("io_timeout", &self.io_timeout)
            .finish()
    }
}

impl ColdStorageTier {
    pub fn new(store: Arc<dyn ColdStorage>, io_timeout: Duration) -> Self {
        Self { store, io_timeout }
    }

    pub fn provider(&self) -> &'static str {
        self.store.provider()
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        timeout(self.io_timeout, fut)
            .await
            .map_err(|_| VaultError::Timeout {
                operation: operation.to_string(),
                after: self.io_timeout,
            })?
    }

    pub async fn has_archive(&self, run_hash: &str) -> Result<bool> {
        self.bounded("cold storage exists", self.store.exists(run_hash))
            .await
    }

    /// Archive the manifest's files from `source_dir`.
    ///
    /// Only manifest-only runs can be offloaded.
    #[instrument(skip(self, record, source_dir), fields(run_hash = %record.run_hash))]
    pub async fn offload(&self, record: &RunRecord, source_dir: &Path) -> Result<String> {
        if record.retention_state != RetentionState::ManifestOnly {
            return Err(VaultError::Conflict(format!(
                "run {} is {}, only manifest-only runs can be offloaded",
                record.run_hash, record.retention_state
            )));
        }

        let entries = record.manifest.entries.clone();
        let source = source_dir.to_path_buf();
        let archive = tokio::task::spawn_blocking(move || pack(&source, &entries))
            .await
            .map_err(|e| VaultError::Io(std::io::Error::other(e)))??;

        let size = archive.len();
        let archive_ref = self
            .bounded("cold storage put", self.store.put(&record.run_hash, archive))
            .await?;

        info!(provider = self.provider(), %archive_ref, bytes = size, "Run offloaded");
        Ok(archive_ref)
    }

    /// Unpack the run's archive into `dest_dir`, verifying every file
    #[instrument(skip(self, record, dest_dir), fields(run_hash = %record.run_hash))]
    pub async fn restore(&self, record: &RunRecord, dest_dir: &Path) -> Result<Vec<ArtifactEntry>> {
        let archive = self
            .bounded("cold storage get", self.store.get(&record.run_hash))
            .await?;

        let entries = record.manifest.entries.clone();
        let dest = dest_dir.to_path_buf();
        let result = tokio::task::spawn_blocking(move || unpack_verified(&archive, &entries, &dest))
            .await
            .map_err(|e| VaultError::Io(std::io::Error::other(e)))?;

        match &result {
            Ok(restored) => info!(files = restored.len(), "Run restored from cold storage"),
            Err(e) if e.is_integrity() => error!(error = %e, "Cold storage archive failed verification"),
            Err(_) => {}
        }
        result
    }
}

fn pack(source: &Path, entries: &[ArtifactEntry]) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for entry in entries {
        let path = source.join(&entry.name);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultError::not_found("artifact", path.display().to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        builder.append_file(&entry.name, &mut file)?;
    }

    Ok(builder.into_inner()?.finish()?)
}

fn unpack_verified(archive: &[u8], entries: &[ArtifactEntry], dest: &Path) -> Result<Vec<ArtifactEntry>> {
    let staging = dest.join(format!(".restore-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&staging)?;

    let outcome = extract_and_verify(archive, entries, &staging).and_then(|()| {
        for entry in entries {
            std::fs::rename(staging.join(&entry.name), dest.join(&entry.name))?;
        }
        Ok(entries.to_vec())
    });

    let _ = std::fs::remove_dir_all(&staging);
    outcome
}

fn corrupt(detail: impl std::fmt::Display) -> VaultError {
    VaultError::integrity("cold storage archive", detail.to_string())
}

fn extract_and_verify(archive: &[u8], entries: &[ArtifactEntry], staging: &Path) -> Result<()> {
    let mut reader = tar::Archive::new(GzDecoder::new(archive));

    for member in reader.entries().map_err(corrupt)? {
        let mut member = member.map_err(corrupt)?;
        let name = member
            .path()
            .map_err(corrupt)?
            .to_string_lossy()
            .into_owned();

        // Members not named by the manifest are ignored
        if !entries.iter().any(|e| e.name == name) {
            continue;
        }

        let mut content = Vec::new();
        member.read_to_end(&mut content).map_err(corrupt)?;
        std::fs::write(staging.join(&name), &content)?;
    }

    for entry in entries {
        let path = staging.join(&entry.name);
        if !path.exists() {
            return Err(VaultError::not_found("archive member", entry.name.clone()));
        }
        let (digest, bytes) = sha256_file(&path)?;
        if digest != entry.sha256 || bytes != entry.bytes {
            return Err(VaultError::integrity(
                entry.name.clone(),
                format!(
                    "restored sha256 {} ({} bytes) does not match manifest {} ({} bytes)",
                    digest, bytes, entry.sha256, entry.bytes
                ),
            ));
        }
    }

    Ok(())
}
