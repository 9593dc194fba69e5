//! Adapter interfaces for external systems.
//!
//! The backtest pipeline (data loading, simulation, validation) is an
//! external collaborator; the vault only consumes its output. Cold-storage
//! providers that talk to remote services live here as well.

pub mod command;
pub mod object_store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::RunConfig;

pub use command::CommandPipeline;
pub use object_store::HttpObjectStore;

/// One file produced by a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPayload {
    /// File name inside the run directory
    pub name: String,

    /// Free-form kind (`summary`, `equity`, `plot`, ...)
    pub kind: String,

    pub content: Vec<u8>,
}

impl ArtifactPayload {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            content,
        }
    }

    /// Pretty-printed JSON document artifact
    pub fn json(name: impl Into<String>, kind: impl Into<String>, value: &serde_json::Value) -> Self {
        let content = serde_json::to_vec_pretty(value).unwrap_or_default();
        Self::new(name, kind, content)
    }
}

/// Everything a pipeline run hands back to the vault
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineOutput {
    #[serde(default)]
    pub summary: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    pub metrics: serde_json::Value,

    #[serde(default)]
    pub validation: serde_json::Value,

    /// Metric used for per-strategy top-k ranking
    #[serde(default)]
    pub primary_metric_value: Option<f64>,

    /// Set when statistical validation flagged the run
    #[serde(default)]
    pub validation_caution: bool,

    /// Hash of the run this one continues from, if any
    #[serde(default)]
    pub chain_prev: Option<String>,

    /// Binary artifacts (equity curve, trades, plots)
    #[serde(skip)]
    pub artifacts: Vec<ArtifactPayload>,
}

impl PipelineOutput {
    /// The full artifact set: the three JSON documents plus binary artifacts
    pub fn into_payloads(self) -> Vec<ArtifactPayload> {
        let mut payloads = vec![
            ArtifactPayload::json("summary.json", "summary", &serde_json::Value::Object(self.summary)),
            ArtifactPayload::json("metrics.json", "metrics", &self.metrics),
            ArtifactPayload::json("validation.json", "validation", &self.validation),
        ];
        payloads.extend(
            self.artifacts
                .into_iter()
                .filter(|a| !matches!(a.name.as_str(), "summary.json" | "metrics.json" | "validation.json")),
        );
        payloads
    }
}

/// The external backtest pipeline
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Human-readable pipeline name
    fn name(&self) -> &str;

    /// Hash of the dataset the config would run against
    async fn dataset_hash(&self, config: &RunConfig) -> anyhow::Result<String>;

    /// Run the backtest. Called at most once per run hash.
    async fn execute(&self, config: &RunConfig, seed: u64) -> anyhow::Result<PipelineOutput>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payloads_include_documents() {
        let mut output = PipelineOutput {
            metrics: json!({"sharpe": 1.2}),
            validation: json!({"p_value": 0.01}),
            ..Default::default()
        };
        output.summary.insert("trades".to_string(), json!(42));
        output.artifacts.push(ArtifactPayload::new("equity.parquet", "equity", b"PAR1".to_vec()));
        output.artifacts.push(ArtifactPayload::new("metrics.json", "metrics", b"{}".to_vec()));

        let names: Vec<_> = output.into_payloads().into_iter().map(|p| p.name).collect();
        assert_eq!(
            names,
            vec!["summary.json", "metrics.json", "validation.json", "equity.parquet"]
        );
    }
}
