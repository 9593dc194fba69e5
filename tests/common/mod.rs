//! Shared fixtures: a deterministic in-process pipeline and vault helpers.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use runvault::core::audit::AuditSettings;
use runvault::{ArtifactPayload, Pipeline, PipelineOutput, RunConfig, Vault, VaultOptions};
use serde_json::json;
use tempfile::TempDir;

/// Pipeline whose output is derived from the config.
///
/// Params read: `metric` (f64, primary metric), `caution` (bool).
#[derive(Default)]
pub struct FakePipeline {
    pub executions: AtomicUsize,
    pub delay: Option<Duration>,
}

impl FakePipeline {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            executions: AtomicUsize::new(0),
            delay: Some(delay),
        }
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Pipeline for FakePipeline {
    fn name(&self) -> &str {
        "fake"
    }

    async fn dataset_hash(&self, config: &RunConfig) -> anyhow::Result<String> {
        Ok(format!("{}-{}-v1", config.symbol, config.timeframe))
    }

    async fn execute(&self, config: &RunConfig, seed: u64) -> anyhow::Result<PipelineOutput> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let metric = config.params.get("metric").and_then(|v| v.as_f64());
        let caution = config
            .params
            .get("caution")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let mut output = PipelineOutput {
            metrics: json!({ "sharpe": metric, "seed": seed }),
            validation: json!({ "caution": caution }),
            primary_metric_value: metric,
            validation_caution: caution,
            ..Default::default()
        };
        output
            .summary
            .insert("strategy".to_string(), json!(config.strategy_name));

        let tag = format!("{}:{}:{}", config.strategy_name, config.symbol, seed);
        output.artifacts = vec![
            ArtifactPayload::new("equity.parquet", "equity", format!("PAR1 equity {}", tag).into_bytes()),
            ArtifactPayload::new("plots.png", "plot", format!("PNG plot {}", tag).into_bytes()),
        ];
        Ok(output)
    }
}

pub fn config(strategy: &str, symbol: &str) -> RunConfig {
    RunConfig::new(strategy, symbol, "1d")
}

pub fn scored(strategy: &str, symbol: &str, metric: f64) -> RunConfig {
    config(strategy, symbol).with_param("metric", json!(metric))
}

pub async fn open_vault(temp: &TempDir, pipeline: Arc<FakePipeline>) -> Vault {
    open_with(VaultOptions::new(temp.path()), pipeline).await
}

pub async fn open_with(options: VaultOptions, pipeline: Arc<FakePipeline>) -> Vault {
    Vault::open(options, pipeline).await.unwrap()
}

pub fn small_audit() -> AuditSettings {
    AuditSettings {
        threshold_bytes: 600,
        compress: true,
    }
}
