//! Pipeline adapter that shells out to an external backtest program.
//!
//! Protocol (request JSON on stdin for both modes):
//! - `<program> [args] dataset-hash` prints the dataset hash on stdout
//! - `<program> [args] run --out <dir>` prints a [`PipelineOutput`] JSON
//!   document on stdout and writes binary artifacts into `<dir>`

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use super::{ArtifactPayload, Pipeline, PipelineOutput};
use crate::domain::RunConfig;

/// Default wall-clock limit for one pipeline invocation
pub const DEFAULT_PIPELINE_TIMEOUT: Duration = Duration::from_secs(3600);

/// Pipeline backed by a subprocess
#[derive(Debug, Clone)]
pub struct CommandPipeline {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandPipeline {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_PIPELINE_TIMEOUT,
        }
    }

    /// Arguments placed before the mode (`dataset-hash` / `run`)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Spawn the program, feed `input` on stdin, collect stdout
    async fn invoke(&self, mode: &[&str], input: &[u8], what: &str) -> Result<Vec<u8>> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .args(mode)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn pipeline '{}' for {}", self.program, what))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input)
                .await
                .context("Failed to write pipeline request to stdin")?;
            // Drop stdin to signal EOF
        }

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .with_context(|| format!("Pipeline {} timed out after {:?}", what, self.timeout))?
            .with_context(|| format!("Failed to wait for pipeline {}", what))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            anyhow::bail!(
                "Pipeline {} failed with exit code {}: {}",
                what,
                exit_code,
                stderr.trim()
            );
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl Pipeline for CommandPipeline {
    fn name(&self) -> &str {
        &self.program
    }

    async fn dataset_hash(&self, config: &RunConfig) -> Result<String> {
        let request = serde_json::to_vec(&json!({ "config": config }))?;
        let stdout = self.invoke(&["dataset-hash"], &request, "dataset-hash").await?;

        let hash = String::from_utf8(stdout)
            .context("Pipeline dataset hash is not valid UTF-8")?
            .trim()
            .to_string();
        if hash.is_empty() {
            anyhow::bail!("Pipeline returned an empty dataset hash");
        }
        Ok(hash)
    }

    async fn execute(&self, config: &RunConfig, seed: u64) -> Result<PipelineOutput> {
        let out_dir = tempfile::TempDir::new().context("Failed to create pipeline output directory")?;
        let out_path = out_dir.path().to_string_lossy().into_owned();

        let request = serde_json::to_vec(&json!({ "config": config, "seed": seed }))?;
        info!(program = %self.program, strategy = %config.strategy_name, seed, "Running pipeline");
        let stdout = self
            .invoke(&["run", "--out", &out_path], &request, "run")
            .await?;

        let mut output: PipelineOutput =
            serde_json::from_slice(&stdout).context("Pipeline output is not a valid result document")?;

        let mut entries = tokio::fs::read_dir(out_dir.path()).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let kind = name.split('.').next().unwrap_or("artifact").to_string();
            let content = tokio::fs::read(entry.path())
                .await
                .with_context(|| format!("Failed to read pipeline artifact {}", name))?;
            debug!(artifact = %name, bytes = content.len(), "Collected pipeline artifact");
            output.artifacts.push(ArtifactPayload::new(name, kind, content));
        }
        output.artifacts.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let pipeline = CommandPipeline::new("backtest")
            .with_args(vec!["--profile".to_string(), "ci".to_string()])
            .with_timeout(Duration::from_secs(5));
        assert_eq!(pipeline.name(), "backtest");
        assert_eq!(pipeline.args.len(), 2);
        assert_eq!(pipeline.timeout, Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dataset_hash_from_stdout() {
        let pipeline = CommandPipeline::new("sh").with_args(vec![
            "-c".to_string(),
            "cat > /dev/null; echo '  abc123  '".to_string(),
            "pipeline".to_string(),
        ]);
        let hash = pipeline
            .dataset_hash(&RunConfig::new("sma", "SPY", "1d"))
            .await
            .unwrap();
        assert_eq!(hash, "abc123");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_collects_artifacts() {
        let script = r#"cat > /dev/null; printf 'PAR1' > "$3/equity.parquet"; echo '{"primary_metric_value": 1.5, "metrics": {"sharpe": 1.5}}'"#;
        let pipeline = CommandPipeline::new("sh").with_args(vec![
            "-c".to_string(),
            script.to_string(),
            "pipeline".to_string(),
        ]);

        let output = pipeline
            .execute(&RunConfig::new("sma", "SPY", "1d"), 7)
            .await
            .unwrap();
        assert_eq!(output.primary_metric_value, Some(1.5));
        assert_eq!(output.artifacts.len(), 1);
        assert_eq!(output.artifacts[0].name, "equity.parquet");
        assert_eq!(output.artifacts[0].kind, "equity");
        assert_eq!(output.artifacts[0].content, b"PAR1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failure_reports_exit_code() {
        let pipeline = CommandPipeline::new("sh").with_args(vec![
            "-c".to_string(),
            "cat > /dev/null; echo boom >&2; exit 3".to_string(),
        ]);
        let err = pipeline
            .dataset_hash(&RunConfig::new("sma", "SPY", "1d"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exit code 3"));
    }
}
