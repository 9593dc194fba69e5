//! Artifact manifest for a run.
//!
//! The manifest lists every artifact file a run produced together with its
//! digest and size. `manifest_hash` binds the whole set: it is computed over
//! the entries sorted by name plus the linkage fields, so it does not depend
//! on the order the pipeline emitted files in.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::core::canonical::{canonical_hash, is_sha256_hex};
use crate::error::{Result, VaultError};

/// File name of the manifest inside a run directory
pub const MANIFEST_FILE: &str = "manifest.json";

/// File name of the mutable run record inside a run directory
pub const RECORD_FILE: &str = "record.json";

/// Subdirectory holding artifacts of demoted runs
pub const EVICTED_DIR: &str = ".evicted";

/// Names an artifact may not use
const RESERVED_NAMES: &[&str] = &[MANIFEST_FILE, RECORD_FILE, EVICTED_DIR];

/// A single artifact file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    /// File name, unique within a manifest
    pub name: String,

    /// Artifact kind (summary, metrics, equity, plot, trades, ...)
    pub kind: String,

    /// SHA-256 of the file contents
    pub sha256: String,

    /// Size in bytes
    pub bytes: u64,
}

impl ArtifactEntry {
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        sha256: impl Into<String>,
        bytes: u64,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            sha256: sha256.into(),
            bytes,
        }
    }
}

/// Fields tying a manifest to its inputs and to earlier runs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestLinkage {
    /// Manifest hash of the run this one continues (walk-forward chains)
    #[serde(default)]
    pub chain_prev: Option<String>,

    /// Hash of the dataset the run was computed from
    #[serde(default)]
    pub data_hash: Option<String>,

    #[serde(default)]
    pub calendar_id: Option<String>,

    #[serde(default)]
    pub symbol: Option<String>,

    #[serde(default)]
    pub timeframe: Option<String>,
}

/// Immutable, hash-stamped artifact set of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    /// Run this manifest belongs to
    pub run_hash: String,

    /// Entries in emission order
    pub entries: Vec<ArtifactEntry>,

    #[serde(flatten)]
    pub linkage: ManifestLinkage,

    /// Canonical hash stamped at construction
    pub manifest_hash: String,
}

/// Hashed view: entries sorted by name, linkage inline
#[derive(Serialize)]
struct CanonicalView<'a> {
    run_hash: &'a str,
    entries: Vec<&'a ArtifactEntry>,
    chain_prev: &'a Option<String>,
    data_hash: &'a Option<String>,
    calendar_id: &'a Option<String>,
    symbol: &'a Option<String>,
    timeframe: &'a Option<String>,
}

impl ArtifactManifest {
    /// Build a manifest, rejecting duplicate names and malformed entries
    pub fn new(
        run_hash: impl Into<String>,
        entries: Vec<ArtifactEntry>,
        linkage: ManifestLinkage,
    ) -> Result<Self> {
        validate_entries(&entries)?;

        let mut manifest = Self {
            run_hash: run_hash.into(),
            entries,
            linkage,
            manifest_hash: String::new(),
        };
        manifest.manifest_hash = manifest.canonical_hash()?;
        Ok(manifest)
    }

    /// Canonical hash over name-sorted entries and linkage fields
    pub fn canonical_hash(&self) -> Result<String> {
        let mut entries: Vec<&ArtifactEntry> = self.entries.iter().collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        canonical_hash(&CanonicalView {
            run_hash: &self.run_hash,
            entries,
            chain_prev: &self.linkage.chain_prev,
            data_hash: &self.linkage.data_hash,
            calendar_id: &self.linkage.calendar_id,
            symbol: &self.linkage.symbol,
            timeframe: &self.linkage.timeframe,
        })
    }

    /// Recompute the canonical hash and compare it with the stamped one
    pub fn verify(&self) -> Result<()> {
        let actual = self.canonical_hash()?;
        if actual != self.manifest_hash {
            return Err(VaultError::integrity(
                format!("manifest of run {}", self.run_hash),
                format!(
                    "manifest_hash {} does not match canonical hash {}",
                    self.manifest_hash, actual
                ),
            ));
        }
        Ok(())
    }

    /// Parse a stored manifest; validation and hash verification are mandatory
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        let manifest: Self = serde_json::from_slice(bytes)?;
        validate_entries(&manifest.entries)?;
        manifest.verify()?;
        Ok(manifest)
    }

    /// Look up an entry by name
    pub fn get(&self, name: &str) -> Option<&ArtifactEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Sum of entry sizes
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.bytes).sum()
    }

    /// `name -> sha256` for every entry
    pub fn digest_map(&self) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .map(|e| (e.name.clone(), e.sha256.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Artifact names must be plain file names that cannot collide with bookkeeping files
pub fn validate_artifact_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || RESERVED_NAMES.contains(&name)
    {
        return Err(VaultError::Validation(format!(
            "invalid artifact name: {:?}",
            name
        )));
    }
    Ok(())
}

fn validate_entries(entries: &[ArtifactEntry]) -> Result<()> {
    let mut seen = HashSet::new();

    for entry in entries {
        validate_artifact_name(&entry.name)?;

        if !seen.insert(entry.name.as_str()) {
            return Err(VaultError::Validation(format!(
                "duplicate artifact name in manifest: {}",
                entry.name
            )));
        }
        if !is_sha256_hex(&entry.sha256) {
            return Err(VaultError::Validation(format!(
                "artifact {} has malformed sha256: {:?}",
                entry.name, entry.sha256
            )));
        }
        if entry.bytes == 0 {
            return Err(VaultError::Validation(format!(
                "artifact {} is empty",
                entry.name
            )));
        }
    }

    Ok(())
}
