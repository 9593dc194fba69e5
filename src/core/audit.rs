//! Hash-chained, size-rotated audit log.
//!
//! Each line of `audit.log` is an [`AuditLine`]: the sequenced entry, the
//! previous chain value and `sha256(prev_hash || canonical(entry))`. When the
//! active file grows past `threshold_bytes` it is renamed to `audit.log.<N>`,
//! optionally gzip'd, and an empty active file is started. The chain carries
//! straight across the boundary. After every rotation `audit_integrity.json`
//! records where the chain stood.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::core::canonical::{canonical_json, chain_hash, ZERO_HASH};
use crate::core::store::write_json_atomic;
use crate::domain::{AuditEntry, AuditEvent, AuditLine};
use crate::error::{Result, VaultError};

pub const ACTIVE_LOG: &str = "audit.log";
pub const INTEGRITY_FILE: &str = "audit_integrity.json";
pub const DEFAULT_THRESHOLD_BYTES: u64 = 5 * 1024 * 1024;

/// Rotation settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditSettings {
    pub threshold_bytes: u64,
    pub compress: bool,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            threshold_bytes: DEFAULT_THRESHOLD_BYTES,
            compress: true,
        }
    }
}

/// Persisted after each rotation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegritySnapshot {
    /// Chain value of the last entry in `rotated_file`
    pub last_hash: String,
    pub rotated_file: String,
    pub threshold_bytes: u64,
    pub compressed: bool,
    pub rotation_count: u64,
    /// Size of the rotated file before compression
    pub rotated_original_bytes: u64,
    pub rotated_at: DateTime<Utc>,
    #[serde(default)]
    pub last_seq: u64,
}

/// Current rotation state, reported with retention metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRotationStatus {
    pub active_bytes: u64,
    pub threshold_bytes: u64,
    pub rotation_count: u64,
    pub last_rotated_file: Option<String>,
    pub compressed: bool,
    pub last_hash: String,
}

/// Result of replaying the whole chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditVerification {
    pub entries: u64,
    pub files: usize,
    pub last_hash: String,
}

#[derive(Debug)]
struct ChainState {
    last_hash: String,
    seq: u64,
    active_bytes: u64,
    rotation_count: u64,
    last_rotated: Option<String>,
}

/// Append-only audit journal; a single writer per process
#[derive(Debug)]
pub struct AuditLog {
    dir: PathBuf,
    settings: AuditSettings,
    state: Mutex<ChainState>,
}

impl AuditLog {
    /// Open the log in `dir`, recovering the chain head from disk
    pub async fn open(dir: impl Into<PathBuf>, settings: AuditSettings) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let state = {
            let dir = dir.clone();
            tokio::task::spawn_blocking(move || recover_state(&dir, settings))
                .await
                .map_err(|e| VaultError::Io(std::io::Error::other(e)))??
        };

        info!(
            dir = %dir.display(),
            seq = state.seq,
            rotations = state.rotation_count,
            "Audit log opened"
        );

        Ok(Self {
            dir,
            settings,
            state: Mutex::new(state),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn settings(&self) -> AuditSettings {
        self.settings
    }

    pub fn active_path(&self) -> PathBuf {
        self.dir.join(ACTIVE_LOG)
    }

    pub fn integrity_path(&self) -> PathBuf {
        self.dir.join(INTEGRITY_FILE)
    }

    /// Sequence, hash and write one event; rotates when the threshold is crossed
    pub async fn append(&self, event: AuditEvent) -> Result<AuditLine> {
        let mut state = self.state.lock().await;

        let entry = AuditEntry::new(state.seq + 1, event);
        let payload = canonical_json(&entry)?;
        let hash = chain_hash(&state.last_hash, &payload);
        let line = AuditLine {
            entry,
            prev_hash: state.last_hash.clone(),
            hash,
        };

        let mut text = serde_json::to_string(&line)?;
        text.push('\n');
        let written = text.len() as u64;

        let path = self.active_path();
        tokio::task::spawn_blocking(move || append_locked(&path, text.as_bytes()))
            .await
            .map_err(|e| VaultError::Io(std::io::Error::other(e)))??;

        state.seq = line.entry.seq;
        state.last_hash = line.hash.clone();
        state.active_bytes += written;

        debug!(
            seq = line.entry.seq,
            event_type = ?line.entry.event.event_type,
            "Audit entry appended"
        );

        if state.active_bytes > self.settings.threshold_bytes {
            self.rotate(&mut state).await?;
        }

        Ok(line)
    }

    /// Once the rename succeeds the counters advance, so a later failure
    /// (compression, snapshot) never makes the next rotation reuse a number.
    async fn rotate(&self, state: &mut ChainState) -> Result<()> {
        let dir = self.dir.clone();
        let next = state.rotation_count + 1;
        let (number, rotated, original_bytes) =
            tokio::task::spawn_blocking(move || -> Result<(u64, PathBuf, u64)> {
                let active = dir.join(ACTIVE_LOG);
                let mut number = next;
                while rotation_taken(&dir, number) {
                    number += 1;
                }
                let rotated = dir.join(format!("{}.{}", ACTIVE_LOG, number));
                let original_bytes = std::fs::metadata(&active)?.len();
                std::fs::rename(&active, &rotated)?;
                File::create(&active)?.sync_all()?;
                Ok((number, rotated, original_bytes))
            })
            .await
            .map_err(|e| VaultError::Io(std::io::Error::other(e)))??;

        state.rotation_count = number;
        state.last_rotated = Some(file_name(&rotated));
        state.active_bytes = 0;

        let compress = self.settings.compress;
        let rotated_file = if compress {
            let dir = self.dir.clone();
            let compressed = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
                let finished = finish_compression(&dir)?;
                Ok(finished
                    .into_iter()
                    .find(|(n, _)| *n == number)
                    .map_or(rotated, |(_, p)| p))
            })
            .await
            .map_err(|e| VaultError::Io(std::io::Error::other(e)))?;
            match compressed {
                Ok(path) => path,
                Err(e) => {
                    error!(error = %e, rotation = number, "Audit log compression failed");
                    return Err(e);
                }
            }
        } else {
            rotated
        };

        let rotated_name = file_name(&rotated_file);
        state.last_rotated = Some(rotated_name.clone());
        let snapshot = IntegritySnapshot {
            last_hash: state.last_hash.clone(),
            rotated_file: rotated_name.clone(),
            threshold_bytes: self.settings.threshold_bytes,
            compressed: compress,
            rotation_count: number,
            rotated_original_bytes: original_bytes,
            rotated_at: Utc::now(),
            last_seq: state.seq,
        };
        write_json_atomic(&self.integrity_path(), &snapshot).await?;

        info!(
            rotated_file = %rotated_name,
            original_bytes,
            rotation_count = number,
            "Audit log rotated"
        );
        Ok(())
    }

    /// Current head of the chain and rotation counters
    pub async fn status(&self) -> AuditRotationStatus {
        let state = self.state.lock().await;
        AuditRotationStatus {
            active_bytes: state.active_bytes,
            threshold_bytes: self.settings.threshold_bytes,
            rotation_count: state.rotation_count,
            last_rotated_file: state.last_rotated.clone(),
            compressed: self.settings.compress,
            last_hash: state.last_hash.clone(),
        }
    }

    pub async fn last_hash(&self) -> String {
        self.state.lock().await.last_hash.clone()
    }

    /// Read the persisted integrity snapshot, if any rotation has happened
    pub async fn snapshot(&self) -> Result<Option<IntegritySnapshot>> {
        let path = self.integrity_path();
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }
        let bytes = tokio::fs::read(&path).await?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Replay rotated files then the active file, checking every link
    pub async fn verify(&self) -> Result<AuditVerification> {
        let state = self.state.lock().await;
        let snapshot = self.snapshot().await?;
        let dir = self.dir.clone();
        let head = state.last_hash.clone();

        let result = tokio::task::spawn_blocking(move || replay_chain(&dir, snapshot.as_ref(), &head))
            .await
            .map_err(|e| VaultError::Io(std::io::Error::other(e)))?;

        match &result {
            Ok(v) => info!(entries = v.entries, files = v.files, "Audit chain verified"),
            Err(e) => error!(error = %e, "Audit chain verification failed"),
        }
        result
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn append_locked(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.lock_exclusive()?;
    file.write_all(bytes)?;
    file.flush()?;
    file.sync_data()?;
    // Lock is released when file is dropped
    Ok(())
}

/// Compress `path` to `path.gz` and remove the original
fn gzip_file(path: &Path) -> Result<PathBuf> {
    let mut gz_name = path.as_os_str().to_owned();
    gz_name.push(".gz");
    let gz_path = PathBuf::from(gz_name);

    let mut input = File::open(path)?;
    let output = File::create(&gz_path)?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    std::io::copy(&mut input, &mut encoder)?;
    encoder.finish()?.sync_all()?;
    std::fs::remove_file(path)?;

    Ok(gz_path)
}

/// Whether `audit.log.<number>` exists in either form
fn rotation_taken(dir: &Path, number: u64) -> bool {
    let plain = dir.join(format!("{}.{}", ACTIVE_LOG, number));
    let gz = dir.join(format!("{}.{}.gz", ACTIVE_LOG, number));
    plain.exists() || gz.exists()
}

/// Gzip every rotated file still in plain form; returns the rotated files afterwards.
///
/// A rotation whose compression failed or was interrupted leaves the plain file.
fn finish_compression(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut rotated = rotated_files(dir)?;
    for (_, path) in rotated.iter_mut() {
        if path.extension().is_some_and(|e| e == "gz") {
            continue;
        }
        warn!(file = %path.display(), "Completing pending audit log compression");
        *path = gzip_file(path)?;
    }
    rotated.dedup_by(|a, b| a.0 == b.0);
    Ok(rotated)
}

/// Rotated files in chain order as `(number, path)`
fn rotated_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let pattern = format!(
        "{}/{}.*",
        glob::Pattern::escape(&dir.to_string_lossy()),
        ACTIVE_LOG
    );
    let paths = glob::glob(&pattern)
        .map_err(|e| VaultError::Validation(format!("invalid audit directory pattern: {}", e)))?;

    let mut files = Vec::new();
    for path in paths.flatten() {
        if !path.is_file() {
            continue;
        }
        let name = file_name(&path);
        let suffix = &name[ACTIVE_LOG.len() + 1..];
        let number = suffix.strip_suffix(".gz").unwrap_or(suffix);
        if let Ok(n) = number.parse::<u64>() {
            files.push((n, path));
        }
    }
    files.sort();
    Ok(files)
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path)?;
    let reader: Box<dyn BufRead> = if path.extension().is_some_and(|e| e == "gz") {
        Box::new(BufReader::new(GzDecoder::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|e| VaultError::integrity(path.display().to_string(), e.to_string()))?;
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }
    Ok(lines)
}

fn parse_line(path: &Path, line: &str) -> Result<AuditLine> {
    serde_json::from_str(line).map_err(|e| {
        VaultError::integrity(path.display().to_string(), format!("unparseable audit line: {}", e))
    })
}

fn recover_state(dir: &Path, settings: AuditSettings) -> Result<ChainState> {
    let mut rotated = rotated_files(dir)?;

    if settings.compress {
        rotated = finish_compression(dir)?;
    }

    let mut state = ChainState {
        last_hash: ZERO_HASH.to_string(),
        seq: 0,
        active_bytes: 0,
        rotation_count: rotated.last().map(|(n, _)| *n).unwrap_or(0),
        last_rotated: rotated.last().map(|(_, p)| file_name(p)),
    };

    let active = dir.join(ACTIVE_LOG);
    let mut head = None;
    if active.exists() {
        state.active_bytes = std::fs::metadata(&active)?.len();
        if let Some(line) = read_lines(&active)?.last() {
            head = Some(parse_line(&active, line)?);
        }
    }
    if head.is_none() {
        if let Some((_, path)) = rotated.last() {
            if let Some(line) = read_lines(path)?.last() {
                head = Some(parse_line(path, line)?);
            }
        }
    }

    if let Some(line) = head {
        state.last_hash = line.hash;
        state.seq = line.entry.seq;
    }
    Ok(state)
}

fn replay_chain(dir: &Path, snapshot: Option<&IntegritySnapshot>, head: &str) -> Result<AuditVerification> {
    let mut files: Vec<PathBuf> = rotated_files(dir)?.into_iter().map(|(_, p)| p).collect();
    let active = dir.join(ACTIVE_LOG);
    if active.exists() {
        files.push(active);
    }

    let mut expected = ZERO_HASH.to_string();
    let mut seq = 0u64;

    for path in &files {
        for line in read_lines(path)? {
            let line = parse_line(path, &line)?;
            let subject = format!("{} seq {}", file_name(path), line.entry.seq);

            if line.prev_hash != expected {
                return Err(VaultError::integrity(
                    subject,
                    format!("prev_hash {} does not continue chain at {}", line.prev_hash, expected),
                ));
            }
            if line.entry.seq != seq + 1 {
                return Err(VaultError::integrity(
                    subject,
                    format!("expected sequence {}", seq + 1),
                ));
            }
            let recomputed = chain_hash(&line.prev_hash, &canonical_json(&line.entry)?);
            if recomputed != line.hash {
                return Err(VaultError::integrity(
                    subject,
                    format!("entry hash {} recomputes to {}", line.hash, recomputed),
                ));
            }

            expected = line.hash;
            seq = line.entry.seq;
        }

        if let Some(snapshot) = snapshot {
            if file_name(path) == snapshot.rotated_file && snapshot.last_hash != expected {
                return Err(VaultError::integrity(
                    INTEGRITY_FILE,
                    format!(
                        "snapshot last_hash {} does not match chain {} at {}",
                        snapshot.last_hash, expected, snapshot.rotated_file
                    ),
                ));
            }
        }
    }

    if expected != head {
        return Err(VaultError::integrity(
            ACTIVE_LOG,
            format!("chain ends at {} but the log head is {}", expected, head),
        ));
    }

    Ok(AuditVerification {
        entries: seq,
        files: files.len(),
        last_hash: expected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AuditEventType;
    use serde_json::json;
    use tempfile::TempDir;

    fn event(i: usize) -> AuditEvent {
        AuditEvent::run_created(&format!("{:064x}", i), "sma_cross", &"a".repeat(64), 6)
    }

    #[tokio::test]
    async fn test_chain_starts_at_genesis() {
        let temp = TempDir::new().unwrap();
        let log = AuditLog::open(temp.path(), AuditSettings::default()).await.unwrap();

        let first = log.append(event(1)).await.unwrap();
        let second = log.append(event(2)).await.unwrap();

        assert_eq!(first.prev_hash, ZERO_HASH);
        assert_eq!(first.entry.seq, 1);
        assert_eq!(second.prev_hash, first.hash);
        assert_eq!(second.entry.seq, 2);
        assert_eq!(log.last_hash().await, second.hash);

        let verification = log.verify().await.unwrap();
        assert_eq!(verification.entries, 2);
        assert_eq!(verification.files, 1);
    }

    #[tokio::test]
    async fn test_rotation_keeps_chain() {
        let temp = TempDir::new().unwrap();
        let settings = AuditSettings {
            threshold_bytes: 600,
            compress: true,
        };
        let log = AuditLog::open(temp.path(), settings).await.unwrap();

        let mut last = None;
        for i in 0..10 {
            last = Some(log.append(event(i)).await.unwrap());
        }

        let status = log.status().await;
        assert!(status.rotation_count >= 1);
        assert!(status.active_bytes <= 600 + 1024);
        let rotated = status.last_rotated_file.unwrap();
        assert!(rotated.starts_with("audit.log."));
        assert!(rotated.ends_with(".gz"));

        let snapshot = log.snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.threshold_bytes, 600);
        assert!(snapshot.compressed);
        assert!(snapshot.rotated_original_bytes > 600);

        let verification = log.verify().await.unwrap();
        assert_eq!(verification.entries, 10);
        assert_eq!(verification.last_hash, last.unwrap().hash);
    }

    #[tokio::test]
    async fn test_uncompressed_rotation() {
        let temp = TempDir::new().unwrap();
        let settings = AuditSettings {
            threshold_bytes: 100,
            compress: false,
        };
        let log = AuditLog::open(temp.path(), settings).await.unwrap();
        log.append(event(1)).await.unwrap();

        assert!(temp.path().join("audit.log.1").exists());
        assert!(!temp.path().join("audit.log.1.gz").exists());
        assert_eq!(std::fs::metadata(temp.path().join(ACTIVE_LOG)).unwrap().len(), 0);
        assert_eq!(log.verify().await.unwrap().entries, 1);
    }

    #[tokio::test]
    async fn test_failed_snapshot_write_keeps_rotations_apart() {
        let temp = TempDir::new().unwrap();
        let settings = AuditSettings {
            threshold_bytes: 100,
            compress: true,
        };
        let log = AuditLog::open(temp.path(), settings).await.unwrap();

        // A directory in place of the snapshot makes the atomic rename fail
        let blocker = temp.path().join(INTEGRITY_FILE);
        std::fs::create_dir(&blocker).unwrap();
        assert!(log.append(event(1)).await.is_err());

        let status = log.status().await;
        assert_eq!(status.rotation_count, 1);
        assert_eq!(status.active_bytes, 0);
        assert!(temp.path().join("audit.log.1.gz").exists());

        std::fs::remove_dir(&blocker).unwrap();
        log.append(event(2)).await.unwrap();

        assert!(temp.path().join("audit.log.1.gz").exists());
        assert!(temp.path().join("audit.log.2.gz").exists());
        let verification = log.verify().await.unwrap();
        assert_eq!(verification.entries, 2);
        assert_eq!(log.snapshot().await.unwrap().unwrap().rotation_count, 2);
    }

    #[tokio::test]
    async fn test_pending_compression_finished_on_next_rotation() {
        let temp = TempDir::new().unwrap();
        {
            let plain = AuditSettings {
                threshold_bytes: 100,
                compress: false,
            };
            let log = AuditLog::open(temp.path(), plain).await.unwrap();
            log.append(event(1)).await.unwrap();
        }
        assert!(temp.path().join("audit.log.1").exists());

        let settings = AuditSettings {
            threshold_bytes: 100,
            compress: true,
        };
        let log = AuditLog::open(temp.path(), settings).await.unwrap();
        assert!(temp.path().join("audit.log.1.gz").exists());
        assert!(!temp.path().join("audit.log.1").exists());

        // Put back the plain form a failed compression leaves behind
        let gz = temp.path().join("audit.log.1.gz");
        let mut content = Vec::new();
        std::io::Read::read_to_end(&mut GzDecoder::new(File::open(&gz).unwrap()), &mut content).unwrap();
        std::fs::write(temp.path().join("audit.log.1"), &content).unwrap();
        std::fs::remove_file(&gz).unwrap();

        log.append(event(2)).await.unwrap();
        assert!(temp.path().join("audit.log.2.gz").exists());
        assert!(temp.path().join("audit.log.1.gz").exists());
        assert!(!temp.path().join("audit.log.1").exists());
        assert_eq!(log.verify().await.unwrap().entries, 2);
    }

    #[tokio::test]
    async fn test_reopen_continues_chain() {
        let temp = TempDir::new().unwrap();
        let settings = AuditSettings {
            threshold_bytes: 600,
            compress: true,
        };

        let head = {
            let log = AuditLog::open(temp.path(), settings).await.unwrap();
            for i in 0..5 {
                log.append(event(i)).await.unwrap();
            }
            log.status().await
        };

        let log = AuditLog::open(temp.path(), settings).await.unwrap();
        let reopened = log.status().await;
        assert_eq!(reopened.last_hash, head.last_hash);
        assert_eq!(reopened.rotation_count, head.rotation_count);

        let next = log
            .append(AuditEvent::new(AuditEventType::RetentionApplied, None, json!({"demoted": []})))
            .await
            .unwrap();
        assert_eq!(next.prev_hash, head.last_hash);
        assert_eq!(next.entry.seq, 6);
        assert_eq!(log.verify().await.unwrap().entries, 6);
    }

    #[tokio::test]
    async fn test_tampered_entry_detected() {
        let temp = TempDir::new().unwrap();
        let log = AuditLog::open(temp.path(), AuditSettings::default()).await.unwrap();
        for i in 0..3 {
            log.append(event(i)).await.unwrap();
        }

        let path = temp.path().join(ACTIVE_LOG);
        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.replace("sma_cross", "sma_cros5")).unwrap();

        let err = log.verify().await.unwrap_err();
        assert!(err.is_integrity(), "{:?}", err);
    }

    #[tokio::test]
    async fn test_dropped_line_detected() {
        let temp = TempDir::new().unwrap();
        let log = AuditLog::open(temp.path(), AuditSettings::default()).await.unwrap();
        for i in 0..3 {
            log.append(event(i)).await.unwrap();
        }

        let path = temp.path().join(ACTIVE_LOG);
        let content = std::fs::read_to_string(&path).unwrap();
        let kept: Vec<&str> = content.lines().enumerate().filter(|(i, _)| *i != 1).map(|(_, l)| l).collect();
        std::fs::write(&path, kept.join("\n") + "\n").unwrap();

        assert!(log.verify().await.unwrap_err().is_integrity());
    }

    #[tokio::test]
    async fn test_concurrent_appends_serialized() {
        let temp = TempDir::new().unwrap();
        let settings = AuditSettings {
            threshold_bytes: 2_000,
            compress: true,
        };
        let log = std::sync::Arc::new(AuditLog::open(temp.path(), settings).await.unwrap());

        let mut handles = Vec::new();
        for i in 0..16 {
            let log = log.clone();
            handles.push(tokio::spawn(async move { log.append(event(i)).await.unwrap() }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(log.verify().await.unwrap().entries, 16);
    }
}
