//! Command-line interface for runvault.
//!
//! Provides commands for computing runs through the cache, inspecting runs
//! and artifacts, moving runs between retention tiers, and checking the
//! audit chain.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::adapters::{Pipeline, PipelineOutput};
use crate::config;
use crate::core::{CancelFlag, RetentionConfig, Vault};
use crate::domain::RunConfig;

/// runvault - Content-addressed backtest run cache with tiered artifact retention
#[derive(Parser, Debug)]
#[command(name = "runvault")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Compute a run (or return the cached one) from a YAML run config
    Run {
        /// Run config file (YAML)
        config: PathBuf,

        /// Seed handed to the pipeline; does not change the run hash
        #[arg(long)]
        seed: Option<u64>,
    },

    /// List cached runs, newest first
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show a run record as JSON
    Show { run_hash: String },

    /// List a run's materialized artifact files
    Artifacts { run_hash: String },

    /// Pin a run so retention never demotes it
    Pin { run_hash: String },

    Unpin { run_hash: String },

    /// Restore a manifest-only run from cold storage
    Restore { run_hash: String },

    /// Bring a manifest-only run's artifacts back (local copy first, then cold storage)
    Rehydrate { run_hash: String },

    /// Archive a manifest-only run to cold storage
    Offload { run_hash: String },

    /// Check a run's manifest and files against their recorded digests
    Verify { run_hash: String },

    /// Retention planning and application
    Retention {
        #[command(subcommand)]
        command: RetentionCommands,
    },

    /// Audit log inspection
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum RetentionCommands {
    /// Show the plan under the current settings (dry run)
    Plan,

    /// Plan and apply; Ctrl-C stops between runs
    Apply,

    /// Compare the current plan with one under different settings
    Diff(RetentionArgs),

    /// Tier counts, bytes and budget
    Metrics,

    /// Update and persist retention settings
    Set(RetentionArgs),
}

/// Retention settings; omitted values keep the current setting
#[derive(clap::Args, Debug)]
pub struct RetentionArgs {
    #[arg(long, allow_negative_numbers = true)]
    pub keep_last: Option<i64>,

    #[arg(long, allow_negative_numbers = true)]
    pub top_k_per_strategy: Option<i64>,

    #[arg(long, allow_negative_numbers = true)]
    pub max_full_bytes: Option<i64>,

    /// Remove the byte budget
    #[arg(long, conflicts_with = "max_full_bytes")]
    pub no_budget: bool,
}

impl RetentionArgs {
    fn merge(&self, current: &RetentionConfig) -> Result<RetentionConfig> {
        let max_full_bytes = if self.no_budget {
            None
        } else {
            self.max_full_bytes.or(current.max_full_bytes.map(|b| b as i64))
        };
        let config = RetentionConfig::try_new(
            self.keep_last.unwrap_or(current.keep_last as i64),
            self.top_k_per_strategy
                .unwrap_or(current.top_k_per_strategy as i64),
            max_full_bytes,
        )?;
        Ok(config)
    }
}

#[derive(Subcommand, Debug)]
pub enum AuditCommands {
    /// Replay the whole chain, including rotated files
    Verify,

    /// Rotation status and chain head
    Status,
}

/// Stand-in used when no pipeline command is configured
struct UnconfiguredPipeline;

#[async_trait]
impl Pipeline for UnconfiguredPipeline {
    fn name(&self) -> &str {
        "unconfigured"
    }

    async fn dataset_hash(&self, _config: &RunConfig) -> Result<String> {
        anyhow::bail!("No pipeline configured. Set RUNVAULT_PIPELINE_CMD or pipeline.command in .runvault/config.yaml")
    }

    async fn execute(&self, _config: &RunConfig, _seed: u64) -> Result<PipelineOutput> {
        anyhow::bail!("No pipeline configured")
    }
}

async fn open_vault() -> Result<Vault> {
    let cfg = config::config()?;
    let pipeline: Arc<dyn Pipeline> = match cfg.command_pipeline() {
        Some(pipeline) => Arc::new(pipeline),
        None => Arc::new(UnconfiguredPipeline),
    };

    Vault::open(cfg.vault_options()?, pipeline)
        .await
        .with_context(|| format!("Failed to open vault at {}", cfg.home.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Config => show_config(),
            Commands::Run { config, seed } => run(&config, seed).await,
            command => {
                let vault = open_vault().await?;
                execute_with_vault(&vault, command).await
            }
        }
    }
}

async fn execute_with_vault(vault: &Vault, command: Commands) -> Result<()> {
    match command {
        Commands::Runs { limit } => list_runs(vault, limit).await,
        Commands::Show { run_hash } => print_json(&vault.get_run(&run_hash).await?),
        Commands::Artifacts { run_hash } => {
            for name in vault.list_artifacts(&run_hash).await? {
                println!("{}", name);
            }
            Ok(())
        }
        Commands::Pin { run_hash } => report_state(vault.pin(&run_hash).await?),
        Commands::Unpin { run_hash } => report_state(vault.unpin(&run_hash).await?),
        Commands::Restore { run_hash } => report_state(vault.restore(&run_hash).await?),
        Commands::Rehydrate { run_hash } => report_state(vault.rehydrate(&run_hash).await?),
        Commands::Offload { run_hash } => {
            let record = vault.offload(&run_hash).await?;
            println!(
                "{} offloaded to {}",
                record.run_hash,
                record.archive_ref.as_deref().unwrap_or("-")
            );
            Ok(())
        }
        Commands::Verify { run_hash } => print_json(&vault.verify_run(&run_hash).await?),
        Commands::Retention { command } => retention(vault, command).await,
        Commands::Audit { command } => match command {
            AuditCommands::Verify => print_json(&vault.verify_audit().await?),
            AuditCommands::Status => print_json(&vault.audit().status().await),
        },
        Commands::Config | Commands::Run { .. } => Ok(()),
    }
}

fn report_state(record: crate::domain::RunRecord) -> Result<()> {
    println!(
        "{}  {}{}",
        record.run_hash,
        record.retention_state,
        if record.pinned { " (pinned)" } else { "" }
    );
    Ok(())
}

async fn run(path: &Path, seed: Option<u64>) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read run config: {}", path.display()))?;
    let run_config: RunConfig = serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse run config: {}", path.display()))?;

    let vault = open_vault().await?;
    let outcome = vault.create_or_get(&run_config, seed).await?;

    if outcome.created {
        eprintln!("[Run {} computed]", outcome.run_hash);
    } else {
        eprintln!("[Run {} served from cache]", outcome.run_hash);
    }
    print_json(&outcome.record)
}

async fn list_runs(vault: &Vault, limit: usize) -> Result<()> {
    let runs = vault.list_runs().await;
    if runs.is_empty() {
        println!("No runs found");
        return Ok(());
    }

    println!(
        "{:<18} {:<20} {:<14} {:>10} {:<20}",
        "RUN", "STRATEGY", "TIER", "METRIC", "CREATED"
    );
    println!("{}", "-".repeat(86));

    for run in runs.iter().take(limit) {
        let metric = run
            .primary_metric_value
            .map(|v| format!("{:.4}", v))
            .unwrap_or_else(|| "-".to_string());
        let caution = if run.validation_caution { " !" } else { "" };
        println!(
            "{:<18} {:<20} {:<14} {:>10} {:<20}{}",
            &run.run_hash[..run.run_hash.len().min(16)],
            run.strategy_name,
            run.retention_state.as_str(),
            metric,
            run.created_at.format("%Y-%m-%d %H:%M:%S"),
            caution
        );
    }

    println!("\nShowing {} of {} cached runs", runs.len().min(limit), runs.len());
    Ok(())
}

async fn retention(vault: &Vault, command: RetentionCommands) -> Result<()> {
    match command {
        RetentionCommands::Plan => print_json(&vault.plan_retention().await),
        RetentionCommands::Metrics => print_json(&vault.retention_metrics().await),
        RetentionCommands::Diff(args) => {
            let hypothetical = args.merge(&vault.retention_config().await)?;
            print_json(&vault.plan_retention_diff(&hypothetical).await?)
        }
        RetentionCommands::Set(args) => {
            let config = args.merge(&vault.retention_config().await)?;
            print_json(&vault.update_retention_config(config).await?)
        }
        RetentionCommands::Apply => {
            let cancel = CancelFlag::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("\n[Stopping after the current run...]");
                    on_signal.cancel();
                }
            });

            let outcome = vault.apply_retention(&cancel).await?;
            print_json(&outcome)
        }
    }
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("runvault configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home (audit, settings): {}", cfg.home.display());
    println!("  Artifacts:              {}", cfg.artifacts.display());
    println!();
    println!("Registry capacity: {}", cfg.registry_capacity);
    println!();
    println!("Audit log:");
    println!("  Rotate at:  {} bytes", cfg.audit.threshold_bytes);
    println!("  Compress:   {}", cfg.audit.compress);
    println!();
    println!("Cold storage:");
    println!("  Enabled:    {}", cfg.cold_storage.enabled);
    println!("  Provider:   {:?}", cfg.cold_storage.provider);
    println!("  Directory:  {}", cfg.cold_storage.dir.display());
    if let Some(endpoint) = &cfg.cold_storage.endpoint {
        println!("  Endpoint:   {}/{}", endpoint, cfg.cold_storage.prefix);
    }
    println!("  Offload on demote: {}", cfg.cold_storage.offload_on_demote);
    println!("  I/O timeout: {}s", cfg.io_timeout.as_secs());
    println!();
    println!("Pipeline:");
    println!(
        "  Command:    {}",
        cfg.pipeline.command.as_deref().unwrap_or("(not configured)")
    );
    println!("  Timeout:    {}s", cfg.pipeline.timeout.as_secs());

    Ok(())
}
