//! Run configuration and the cached record of a computed run.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::manifest::ArtifactManifest;
use crate::core::canonical::canonical_hash;
use crate::error::Result;

/// Backtest configuration submitted by a caller.
///
/// `features` is a set and `params` a sorted map, so two configurations that
/// differ only in ordering produce the same signature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Registered strategy name
    pub strategy_name: String,

    pub symbol: String,

    pub timeframe: String,

    /// Trading calendar (e.g. XNYS)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<NaiveDate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<NaiveDate>,

    /// Strategy parameters
    #[serde(default)]
    pub params: BTreeMap<String, serde_json::Value>,

    /// Feature columns the strategy consumes
    #[serde(default)]
    pub features: BTreeSet<String>,

    /// RNG seed the run was configured with
    #[serde(default)]
    pub seed: u64,
}

impl RunConfig {
    pub fn new(
        strategy_name: impl Into<String>,
        symbol: impl Into<String>,
        timeframe: impl Into<String>,
    ) -> Self {
        Self {
            strategy_name: strategy_name.into(),
            symbol: symbol.into(),
            timeframe: timeframe.into(),
            calendar_id: None,
            start: None,
            end: None,
            params: BTreeMap::new(),
            features: BTreeSet::new(),
            seed: 0,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.insert(feature.into());
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_calendar(mut self, calendar_id: impl Into<String>) -> Self {
        self.calendar_id = Some(calendar_id.into());
        self
    }

    /// Deterministic signature of every semantic field
    pub fn signature(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Content address of this configuration over the given dataset
    pub fn run_hash(&self, data_hash: &str) -> Result<String> {
        canonical_hash(&json!({
            "config": self.signature()?,
            "data_hash": data_hash,
        }))
    }
}

/// Artifact tier of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RetentionState {
    #[serde(rename = "full")]
    Full,

    #[serde(rename = "pinned")]
    Pinned,

    #[serde(rename = "top_k")]
    TopK,

    /// Only the manifest remains materialized
    #[serde(rename = "manifest-only")]
    ManifestOnly,
}

impl RetentionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Pinned => "pinned",
            Self::TopK => "top_k",
            Self::ManifestOnly => "manifest-only",
        }
    }

    /// Whether artifact files are expected on disk
    pub fn is_materialized(&self) -> bool {
        !matches!(self, Self::ManifestOnly)
    }
}

impl Default for RetentionState {
    fn default() -> Self {
        Self::Full
    }
}

impl fmt::Display for RetentionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A computed run held by the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Content address
    pub run_hash: String,

    pub created_at: DateTime<Utc>,

    pub strategy_name: String,

    /// Ranking metric for top-k retention
    pub primary_metric_value: Option<f64>,

    /// Statistical validation flagged this run; it is never promoted unless pinned
    pub validation_caution: bool,

    pub pinned: bool,

    pub retention_state: RetentionState,

    /// Pipeline summary, opaque to the vault
    #[serde(default)]
    pub summary: serde_json::Map<String, serde_json::Value>,

    pub manifest: ArtifactManifest,

    /// Configuration the run was computed from
    pub config: RunConfig,

    /// Cold-storage reference once the artifacts were offloaded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_ref: Option<String>,
}

impl RunRecord {
    /// Total artifact bytes listed in the manifest
    pub fn artifact_bytes(&self) -> u64 {
        self.manifest.total_bytes()
    }

    /// State a run keeping its artifacts should carry
    pub fn materialized_state(&self, in_top_k: bool) -> RetentionState {
        if self.pinned {
            RetentionState::Pinned
        } else if in_top_k {
            RetentionState::TopK
        } else {
            RetentionState::Full
        }
    }
}

/// Result of `create_or_get`
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub run_hash: String,
    pub record: RunRecord,
    /// False when the record came from the cache
    pub created: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    const DATA: &str = "d1f0c3f1a9c7a4b8e2f5d6c7b8a9e0f1d2c3b4a5968778695a4b3c2d1e0f9a8b";

    fn base() -> RunConfig {
        RunConfig::new("sma_cross", "SPY", "1d")
            .with_param("fast", json!(10))
            .with_param("slow", json!(50))
            .with_feature("close")
            .with_feature("volume")
            .with_seed(7)
    }

    #[test]
    fn test_hash_ignores_insertion_order() {
        let reordered = RunConfig::new("sma_cross", "SPY", "1d")
            .with_feature("volume")
            .with_param("slow", json!(50))
            .with_feature("close")
            .with_param("fast", json!(10))
            .with_seed(7);

        assert_eq!(base().run_hash(DATA).unwrap(), reordered.run_hash(DATA).unwrap());
    }

    #[test]
    fn test_hash_ignores_yaml_feature_order() {
        let a: RunConfig = serde_yaml::from_str(
            "strategy_name: sma_cross\nsymbol: SPY\ntimeframe: 1d\nfeatures: [volume, close]\nparams: {slow: 50, fast: 10}\nseed: 7\n",
        )
        .unwrap();
        let b: RunConfig = serde_yaml::from_str(
            "seed: 7\nparams: {fast: 10, slow: 50}\nfeatures: [close, volume]\ntimeframe: 1d\nsymbol: SPY\nstrategy_name: sma_cross\n",
        )
        .unwrap();

        assert_eq!(a.run_hash(DATA).unwrap(), b.run_hash(DATA).unwrap());
        assert_eq!(a.run_hash(DATA).unwrap(), base().run_hash(DATA).unwrap());
    }

    #[test]
    fn test_hash_sensitive_to_semantic_fields() {
        let h = base().run_hash(DATA).unwrap();

        assert_ne!(h, base().with_seed(8).run_hash(DATA).unwrap());
        assert_ne!(h, base().with_param("fast", json!(11)).run_hash(DATA).unwrap());
        assert_ne!(h, base().with_feature("vwap").run_hash(DATA).unwrap());
        assert_ne!(h, base().with_calendar("XNYS").run_hash(DATA).unwrap());
        assert_ne!(h, base().run_hash(&DATA.replace('d', "e")).unwrap());
    }

    #[test]
    fn test_retention_state_serialization() {
        assert_eq!(
            serde_json::to_string(&RetentionState::ManifestOnly).unwrap(),
            "\"manifest-only\""
        );
        assert_eq!(serde_json::to_string(&RetentionState::TopK).unwrap(), "\"top_k\"");
        let parsed: RetentionState = serde_json::from_str("\"pinned\"").unwrap();
        assert_eq!(parsed, RetentionState::Pinned);
        assert!(!RetentionState::ManifestOnly.is_materialized());
    }
}
