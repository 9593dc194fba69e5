//! Retention planning for run artifacts.
//!
//! The planner is a pure function of a registry snapshot and a
//! [`RetentionConfig`]. It decides which runs keep their full artifact set on
//! disk and which are demoted to manifest-only:
//!
//! 1. pinned runs always stay full
//! 2. runs flagged by validation are never promoted unless pinned
//! 3. the `keep_last` most recent eligible runs stay full
//! 4. the `top_k_per_strategy` best eligible runs of each strategy stay full
//! 5. an optional byte budget drops the lowest-priority non-pinned runs
//!
//! Applying a plan touches the filesystem and lives in [`crate::core::vault`].

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::core::audit::AuditRotationStatus;
use crate::domain::{RetentionState, RunRecord};
use crate::error::{Result, VaultError};

pub const KEEP_LAST_RANGE: (i64, i64) = (1, 500);
pub const TOP_K_RANGE: (i64, i64) = (0, 50);

/// Retention settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Most recent eligible runs kept full (1..=500)
    #[serde(default = "default_keep_last")]
    pub keep_last: u32,

    /// Best runs per strategy kept full (0..=50)
    #[serde(default = "default_top_k")]
    pub top_k_per_strategy: u32,

    /// Byte budget for all full runs; pinned runs are never dropped by it
    #[serde(default)]
    pub max_full_bytes: Option<u64>,
}

fn default_keep_last() -> u32 {
    20
}
fn default_top_k() -> u32 {
    3
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_last: default_keep_last(),
            top_k_per_strategy: default_top_k(),
            max_full_bytes: None,
        }
    }
}

impl RetentionConfig {
    /// Build from untrusted signed values, rejecting anything out of range
    pub fn try_new(keep_last: i64, top_k_per_strategy: i64, max_full_bytes: Option<i64>) -> Result<Self> {
        check_range("keep_last", keep_last, KEEP_LAST_RANGE)?;
        check_range("top_k_per_strategy", top_k_per_strategy, TOP_K_RANGE)?;

        let max_full_bytes = match max_full_bytes {
            Some(v) if v < 0 => {
                return Err(VaultError::Validation(format!(
                    "max_full_bytes must be non-negative, got {}",
                    v
                )));
            }
            Some(v) => Some(v as u64),
            None => None,
        };

        Ok(Self {
            keep_last: keep_last as u32,
            top_k_per_strategy: top_k_per_strategy as u32,
            max_full_bytes,
        })
    }

    /// Check an already-typed config (e.g. deserialized from disk)
    pub fn validate(&self) -> Result<()> {
        check_range("keep_last", self.keep_last as i64, KEEP_LAST_RANGE)?;
        check_range("top_k_per_strategy", self.top_k_per_strategy as i64, TOP_K_RANGE)
    }
}

fn check_range(field: &str, value: i64, (lo, hi): (i64, i64)) -> Result<()> {
    if value < lo || value > hi {
        return Err(VaultError::Validation(format!(
            "{} must be in [{}, {}], got {}",
            field, lo, hi, value
        )));
    }
    Ok(())
}

/// Counters describing a plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSummary {
    pub total: usize,
    pub keep_full: usize,
    pub demote: usize,
    pub pinned: usize,
    pub top_k: usize,
    pub keep_last: usize,
    /// Caution-flagged, unpinned runs
    pub caution_excluded: usize,
    /// Runs removed from keep_full by the byte budget
    pub budget_dropped: usize,
    /// Manifest bytes of the runs kept full
    pub full_bytes: u64,
    pub max_full_bytes: Option<u64>,
}

/// Which runs keep full artifacts and which are demoted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPlan {
    pub keep_full: BTreeSet<String>,
    pub demote: BTreeSet<String>,
    pub pinned: BTreeSet<String>,
    pub top_k: BTreeSet<String>,
    pub keep_last: BTreeSet<String>,
    pub summary: PlanSummary,
}

impl RetentionPlan {
    /// Tier a run in `keep_full` should end up in
    pub fn target_state(&self, record: &RunRecord) -> RetentionState {
        if !self.keep_full.contains(&record.run_hash) {
            RetentionState::ManifestOnly
        } else {
            record.materialized_state(self.top_k.contains(&record.run_hash))
        }
    }
}

/// Newest first, then hash ascending
fn by_recency(a: &RunRecord, b: &RunRecord) -> Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| a.run_hash.cmp(&b.run_hash))
}

/// Best metric first, then newest, then hash ascending
fn by_metric(a: &RunRecord, b: &RunRecord) -> Ordering {
    let ma = a.primary_metric_value.unwrap_or(f64::NEG_INFINITY);
    let mb = b.primary_metric_value.unwrap_or(f64::NEG_INFINITY);
    mb.partial_cmp(&ma)
        .unwrap_or(Ordering::Equal)
        .then_with(|| by_recency(a, b))
}

fn has_rankable_metric(record: &RunRecord) -> bool {
    record.primary_metric_value.is_some_and(|v| !v.is_nan())
}

/// Compute a retention plan. Pure: neither argument is modified.
pub fn plan_retention(records: &[RunRecord], config: &RetentionConfig) -> RetentionPlan {
    let pinned: BTreeSet<String> = records
        .iter()
        .filter(|r| r.pinned)
        .map(|r| r.run_hash.clone())
        .collect();

    let mut eligible: Vec<&RunRecord> = records
        .iter()
        .filter(|r| !r.pinned && !r.validation_caution)
        .collect();
    let caution_excluded = records
        .iter()
        .filter(|r| !r.pinned && r.validation_caution)
        .count();

    eligible.sort_by(|a, b| by_recency(a, b));
    let mut keep_last: BTreeSet<String> = eligible
        .iter()
        .take(config.keep_last as usize)
        .map(|r| r.run_hash.clone())
        .collect();

    let mut by_strategy: BTreeMap<&str, Vec<&RunRecord>> = BTreeMap::new();
    for record in eligible.iter().filter(|r| has_rankable_metric(r)) {
        by_strategy
            .entry(record.strategy_name.as_str())
            .or_default()
            .push(record);
    }
    let mut top_k = BTreeSet::new();
    for runs in by_strategy.values_mut() {
        runs.sort_by(|a, b| by_metric(a, b));
        top_k.extend(
            runs.iter()
                .take(config.top_k_per_strategy as usize)
                .map(|r| r.run_hash.clone()),
        );
    }

    let mut keep_full: BTreeSet<String> = pinned
        .iter()
        .chain(keep_last.iter())
        .chain(top_k.iter())
        .cloned()
        .collect();

    let bytes_of: HashMap<&str, u64> = records
        .iter()
        .map(|r| (r.run_hash.as_str(), r.artifact_bytes()))
        .collect();
    let mut full_bytes: u64 = keep_full
        .iter()
        .map(|h| bytes_of.get(h.as_str()).copied().unwrap_or(0))
        .sum();

    let mut budget_dropped = 0;
    if let Some(budget) = config.max_full_bytes {
        // Lowest priority last: top-k members, then keep-last-only, each newest first
        let mut droppable: Vec<&RunRecord> = eligible
            .iter()
            .copied()
            .filter(|r| top_k.contains(&r.run_hash))
            .collect();
        droppable.extend(
            eligible
                .iter()
                .copied()
                .filter(|r| keep_last.contains(&r.run_hash) && !top_k.contains(&r.run_hash)),
        );

        while full_bytes > budget {
            let Some(victim) = droppable.pop() else {
                break;
            };
            keep_full.remove(&victim.run_hash);
            top_k.remove(&victim.run_hash);
            keep_last.remove(&victim.run_hash);
            full_bytes -= victim.artifact_bytes();
            budget_dropped += 1;
        }
    }

    let demote: BTreeSet<String> = records
        .iter()
        .filter(|r| !keep_full.contains(&r.run_hash))
        .map(|r| r.run_hash.clone())
        .collect();

    let summary = PlanSummary {
        total: records.len(),
        keep_full: keep_full.len(),
        demote: demote.len(),
        pinned: pinned.len(),
        top_k: top_k.len(),
        keep_last: keep_last.len(),
        caution_excluded,
        budget_dropped,
        full_bytes,
        max_full_bytes: config.max_full_bytes,
    };

    RetentionPlan {
        keep_full,
        demote,
        pinned,
        top_k,
        keep_last,
        summary,
    }
}

/// What changes if the hypothetical config replaced the current one
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPlanDiff {
    /// Demoted under the hypothetical config but not the current one
    pub new_demotions: BTreeSet<String>,
    /// Full under the hypothetical config but not the current one
    pub new_full: BTreeSet<String>,
    /// Full now, not full under the hypothetical config
    pub lost_full: BTreeSet<String>,
}

/// Dry-run comparison of two configs over the same snapshot
pub fn plan_retention_diff(
    records: &[RunRecord],
    current: &RetentionConfig,
    hypothetical: &RetentionConfig,
) -> RetentionPlanDiff {
    let now = plan_retention(records, current);
    let next = plan_retention(records, hypothetical);

    RetentionPlanDiff {
        new_demotions: next.demote.difference(&now.demote).cloned().collect(),
        new_full: next.keep_full.difference(&now.keep_full).cloned().collect(),
        lost_full: now.keep_full.difference(&next.keep_full).cloned().collect(),
    }
}

/// Result of applying a plan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    /// Every planned demotion still present in the registry
    pub demoted: Vec<String>,
    /// Demotions that changed state in this call
    pub newly_demoted: Vec<String>,
    /// Manifest-only runs brought back to a full tier
    pub promoted: Vec<String>,
    /// Runs whose tier changed between full tiers (e.g. full -> top_k)
    pub retiered: Vec<String>,
    pub offloaded: Vec<String>,
    /// Runs that could not be processed (left the registry, artifacts unavailable)
    pub skipped: Vec<String>,
}

impl ApplyOutcome {
    pub fn changed(&self) -> usize {
        self.newly_demoted.len() + self.promoted.len() + self.retiered.len()
    }
}

/// Per-tier counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCounts {
    pub full: usize,
    pub pinned: usize,
    pub top_k: usize,
    #[serde(rename = "manifest-only")]
    pub manifest_only: usize,
    pub total: usize,
}

/// Per-tier manifest bytes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBytes {
    pub full: u64,
    pub pinned: u64,
    pub top_k: u64,
    #[serde(rename = "manifest-only")]
    pub manifest_only: u64,
    pub total_bytes: u64,
}

/// Retention dashboard numbers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionMetrics {
    pub counts: TierCounts,
    pub bytes: TierBytes,
    /// Budget minus bytes of materialized tiers; negative when over budget
    pub budget_remaining: Option<i64>,
    pub audit_rotation: AuditRotationStatus,
}

/// Aggregate tier counts and bytes over a snapshot
pub fn retention_metrics(
    records: &[RunRecord],
    config: &RetentionConfig,
    audit_rotation: AuditRotationStatus,
) -> RetentionMetrics {
    let mut counts = TierCounts::default();
    let mut bytes = TierBytes::default();

    for record in records {
        let size = record.artifact_bytes();
        match record.retention_state {
            RetentionState::Full => {
                counts.full += 1;
                bytes.full += size;
            }
            RetentionState::Pinned => {
                counts.pinned += 1;
                bytes.pinned += size;
            }
            RetentionState::TopK => {
                counts.top_k += 1;
                bytes.top_k += size;
            }
            RetentionState::ManifestOnly => {
                counts.manifest_only += 1;
                bytes.manifest_only += size;
            }
        }
    }

    counts.total = counts.full + counts.pinned + counts.top_k + counts.manifest_only;
    bytes.total_bytes = bytes.full + bytes.pinned + bytes.top_k + bytes.manifest_only;

    let materialized = bytes.full + bytes.pinned + bytes.top_k;
    let budget_remaining = config
        .max_full_bytes
        .map(|budget| budget as i64 - materialized as i64);

    RetentionMetrics {
        counts,
        bytes,
        budget_remaining,
        audit_rotation,
    }
}
