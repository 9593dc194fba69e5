//! Configuration for runvault.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (RUNVAULT_HOME, RUNVAULT_ARTIFACTS_DIR, ...)
//! 2. Config file (.runvault/config.yaml)
//! 3. Defaults (~/.runvault)
//!
//! Config file discovery:
//! - Searches current directory and parents for .runvault/config.yaml
//! - Paths in config file are relative to the .runvault/ directory

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::adapters::{CommandPipeline, HttpObjectStore};
use crate::core::audit::{AuditSettings, DEFAULT_THRESHOLD_BYTES};
use crate::core::cold_storage::{ColdStorage, ColdStorageTier, LocalArchiveStore};
use crate::core::registry::DEFAULT_CAPACITY;
use crate::core::retention::RetentionConfig;
use crate::core::vault::VaultOptions;

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const DEFAULT_IO_TIMEOUT_SECS: u64 = 120;
const DEFAULT_PIPELINE_TIMEOUT_SECS: u64 = 3600;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub registry: Option<RegistryConfig>,
    #[serde(default)]
    pub audit: Option<AuditConfig>,
    #[serde(default)]
    pub cold_storage: Option<ColdStorageConfig>,
    #[serde(default)]
    pub retention: Option<RetentionConfig>,
    #[serde(default)]
    pub pipeline: Option<PipelineConfig>,
    #[serde(default)]
    pub io_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Vault state directory (relative to .runvault/)
    pub home: Option<String>,
    /// Artifact root (relative to .runvault/)
    pub artifacts: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    pub capacity: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditConfig {
    pub threshold_bytes: Option<u64>,
    pub compress: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ColdStorageConfig {
    pub enabled: Option<bool>,
    pub provider: Option<String>,
    pub dir: Option<String>,
    pub endpoint: Option<String>,
    pub prefix: Option<String>,
    pub offload_on_demote: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub timeout_seconds: Option<u64>,
}

/// Cold-storage backend selector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColdProvider {
    Local,
    Http,
}

impl ColdProvider {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "local" | "fs" => Ok(Self::Local),
            "http" | "https" | "object" => Ok(Self::Http),
            other => anyhow::bail!("Unknown cold storage provider '{}' (expected local or http)", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColdStorageSettings {
    pub enabled: bool,
    pub provider: ColdProvider,
    /// Archive directory for the local provider
    pub dir: PathBuf,
    pub endpoint: Option<String>,
    pub prefix: String,
    pub token: Option<String>,
    pub offload_on_demote: bool,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub timeout: Duration,
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Vault state: audit log, retention.json
    pub home: PathBuf,
    pub artifacts: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub registry_capacity: usize,
    pub audit: AuditSettings,
    pub cold_storage: ColdStorageSettings,
    pub retention: RetentionConfig,
    pub pipeline: PipelineSettings,
    pub io_timeout: Duration,
}

impl ResolvedConfig {
    /// Cold-storage tier, when enabled
    pub fn cold_storage_tier(&self) -> Result<Option<ColdStorageTier>> {
        let cold = &self.cold_storage;
        if !cold.enabled {
            return Ok(None);
        }

        let store: Arc<dyn ColdStorage> = match cold.provider {
            ColdProvider::Local => Arc::new(LocalArchiveStore::new(&cold.dir)),
            ColdProvider::Http => {
                let endpoint = cold
                    .endpoint
                    .clone()
                    .context("Cold storage provider 'http' requires RUNVAULT_COLD_ENDPOINT or cold_storage.endpoint")?;
                let mut store = HttpObjectStore::new(endpoint, cold.prefix.clone());
                if let Some(token) = &cold.token {
                    store = store.with_token(token.clone());
                }
                Arc::new(store)
            }
        };

        Ok(Some(ColdStorageTier::new(store, self.io_timeout)))
    }

    pub fn vault_options(&self) -> Result<VaultOptions> {
        let mut options = VaultOptions::new(&self.home)
            .with_artifacts(&self.artifacts)
            .with_capacity(self.registry_capacity)
            .with_audit(self.audit)
            .with_retention(self.retention);
        if let Some(tier) = self.cold_storage_tier()? {
            options = options.with_cold_storage(tier, self.cold_storage.offload_on_demote);
        }
        Ok(options)
    }

    /// External pipeline, when a command is configured
    pub fn command_pipeline(&self) -> Option<CommandPipeline> {
        self.pipeline.command.as_ref().map(|command| {
            CommandPipeline::new(command.clone())
                .with_args(self.pipeline.args.clone())
                .with_timeout(self.pipeline.timeout)
        })
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".runvault").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => anyhow::bail!("{} must be a boolean, got '{}'", name, other),
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("{} must be a non-negative integer, got '{}'", name, value))
}

/// Merge the config file and environment over defaults
fn resolve(
    config_file: Option<(PathBuf, ConfigFile)>,
    env: &dyn Fn(&str) -> Option<String>,
    default_home: PathBuf,
) -> Result<ResolvedConfig> {
    let (config_path, file) = match config_file {
        Some((path, file)) => (Some(path), file),
        None => (None, ConfigFile::default()),
    };
    let base = config_path
        .as_ref()
        .and_then(|p| p.parent())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let home = if let Some(env_home) = env("RUNVAULT_HOME") {
        PathBuf::from(env_home)
    } else if let Some(ref home_path) = file.paths.home {
        resolve_path(&base, home_path)
    } else {
        default_home
    };

    let artifacts = if let Some(dir) = env("RUNVAULT_ARTIFACTS_DIR") {
        PathBuf::from(dir)
    } else if let Some(ref dir) = file.paths.artifacts {
        resolve_path(&base, dir)
    } else {
        home.join("artifacts")
    };

    let registry_capacity = match env("RUNVAULT_REGISTRY_CAPACITY") {
        Some(v) => parse_number("RUNVAULT_REGISTRY_CAPACITY", &v)?,
        None => file
            .registry
            .as_ref()
            .and_then(|r| r.capacity)
            .unwrap_or(DEFAULT_CAPACITY),
    };

    let audit = AuditSettings {
        threshold_bytes: match env("RUNVAULT_AUDIT_ROTATE_BYTES") {
            Some(v) => parse_number("RUNVAULT_AUDIT_ROTATE_BYTES", &v)?,
            None => file
                .audit
                .as_ref()
                .and_then(|a| a.threshold_bytes)
                .unwrap_or(DEFAULT_THRESHOLD_BYTES),
        },
        compress: match env("RUNVAULT_AUDIT_COMPRESS") {
            Some(v) => parse_bool("RUNVAULT_AUDIT_COMPRESS", &v)?,
            None => file.audit.as_ref().and_then(|a| a.compress).unwrap_or(true),
        },
    };

    let cold = file.cold_storage.as_ref();
    let cold_storage = ColdStorageSettings {
        enabled: match env("RUNVAULT_COLD_STORAGE") {
            Some(v) => parse_bool("RUNVAULT_COLD_STORAGE", &v)?,
            None => cold.and_then(|c| c.enabled).unwrap_or(false),
        },
        provider: match env("RUNVAULT_COLD_PROVIDER").or_else(|| cold.and_then(|c| c.provider.clone())) {
            Some(v) => ColdProvider::parse(&v)?,
            None => ColdProvider::Local,
        },
        dir: cold
            .and_then(|c| c.dir.as_ref())
            .map(|d| resolve_path(&base, d))
            .unwrap_or_else(|| home.join("cold")),
        endpoint: env("RUNVAULT_COLD_ENDPOINT").or_else(|| cold.and_then(|c| c.endpoint.clone())),
        prefix: cold
            .and_then(|c| c.prefix.clone())
            .unwrap_or_else(|| "runvault".to_string()),
        token: env("RUNVAULT_COLD_TOKEN"),
        offload_on_demote: cold.and_then(|c| c.offload_on_demote).unwrap_or(false),
    };

    let retention = file.retention.unwrap_or_default();
    retention
        .validate()
        .context("Invalid retention section in config file")?;

    let pipeline = PipelineSettings {
        command: env("RUNVAULT_PIPELINE_CMD").or_else(|| file.pipeline.as_ref().and_then(|p| p.command.clone())),
        args: file.pipeline.as_ref().map(|p| p.args.clone()).unwrap_or_default(),
        timeout: Duration::from_secs(
            file.pipeline
                .as_ref()
                .and_then(|p| p.timeout_seconds)
                .unwrap_or(DEFAULT_PIPELINE_TIMEOUT_SECS),
        ),
    };

    let io_timeout_secs: u64 = match env("RUNVAULT_IO_TIMEOUT_SECS") {
        Some(v) => parse_number("RUNVAULT_IO_TIMEOUT_SECS", &v)?,
        None => file.io_timeout_seconds.unwrap_or(DEFAULT_IO_TIMEOUT_SECS),
    };
    if io_timeout_secs == 0 {
        anyhow::bail!("io timeout must be at least 1 second");
    }
    if pipeline.timeout.is_zero() {
        anyhow::bail!("pipeline.timeout_seconds must be at least 1 second");
    }
    let io_timeout = Duration::from_secs(io_timeout_secs);

    Ok(ResolvedConfig {
        home,
        artifacts,
        config_file: config_path,
        registry_capacity,
        audit,
        cold_storage,
        retention,
        pipeline,
        io_timeout,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".runvault");

    let config_file = match find_config_file() {
        Some(path) => {
            let file = load_config_file(&path)?;
            Some((path, file))
        }
        None => None,
    };

    resolve(config_file, &|name| std::env::var(name).ok(), default_home)
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| format!("{:#}", e)));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the runvault home directory
pub fn runvault_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}

/// Get the artifact root
pub fn artifacts_dir() -> Result<PathBuf> {
    Ok(config()?.artifacts.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::TempDir;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_without_file() {
        let config = resolve(None, &env_from(&[]), PathBuf::from("/home/u/.runvault")).unwrap();

        assert_eq!(config.home, PathBuf::from("/home/u/.runvault"));
        assert_eq!(config.artifacts, PathBuf::from("/home/u/.runvault/artifacts"));
        assert_eq!(config.registry_capacity, 100);
        assert_eq!(config.audit.threshold_bytes, 5 * 1024 * 1024);
        assert!(config.audit.compress);
        assert!(!config.cold_storage.enabled);
        assert_eq!(config.cold_storage.provider, ColdProvider::Local);
        assert_eq!(config.io_timeout, Duration::from_secs(120));
        assert_eq!(config.retention, RetentionConfig::default());
        assert!(config.command_pipeline().is_none());
        assert!(config.cold_storage_tier().unwrap().is_none());
    }

    #[test]
    fn test_env_overrides() {
        let env = env_from(&[
            ("RUNVAULT_HOME", "/srv/vault"),
            ("RUNVAULT_ARTIFACTS_DIR", "/data/artifacts"),
            ("RUNVAULT_AUDIT_ROTATE_BYTES", "600"),
            ("RUNVAULT_AUDIT_COMPRESS", "false"),
            ("RUNVAULT_COLD_STORAGE", "1"),
            ("RUNVAULT_COLD_PROVIDER", "http"),
            ("RUNVAULT_COLD_ENDPOINT", "http://localhost:9000"),
            ("RUNVAULT_REGISTRY_CAPACITY", "7"),
        ]);
        let config = resolve(None, &env, PathBuf::from("/unused")).unwrap();

        assert_eq!(config.home, PathBuf::from("/srv/vault"));
        assert_eq!(config.artifacts, PathBuf::from("/data/artifacts"));
        assert_eq!(config.audit.threshold_bytes, 600);
        assert!(!config.audit.compress);
        assert!(config.cold_storage.enabled);
        assert_eq!(config.cold_storage.provider, ColdProvider::Http);
        assert_eq!(config.registry_capacity, 7);

        let tier = config.cold_storage_tier().unwrap().unwrap();
        assert_eq!(tier.provider(), "http");
    }

    #[test]
    fn test_invalid_env_values() {
        let bad_bool = env_from(&[("RUNVAULT_COLD_STORAGE", "maybe")]);
        assert!(resolve(None, &bad_bool, PathBuf::from("/h")).is_err());

        let bad_provider = env_from(&[("RUNVAULT_COLD_PROVIDER", "tape")]);
        assert!(resolve(None, &bad_provider, PathBuf::from("/h")).is_err());

        let bad_number = env_from(&[("RUNVAULT_AUDIT_ROTATE_BYTES", "-5")]);
        assert!(resolve(None, &bad_number, PathBuf::from("/h")).is_err());
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let zero = env_from(&[("RUNVAULT_IO_TIMEOUT_SECS", "0")]);
        let err = resolve(None, &zero, PathBuf::from("/h")).unwrap_err();
        assert!(err.to_string().contains("io timeout"));

        let file: ConfigFile = serde_yaml::from_str("io_timeout_seconds: 0\n").unwrap();
        let none = env_from(&[]);
        assert!(resolve(Some((PathBuf::from("/cfg/config.yaml"), file)), &none, PathBuf::from("/h")).is_err());

        let file: ConfigFile = serde_yaml::from_str("pipeline:\n  timeout_seconds: 0\n").unwrap();
        assert!(resolve(Some((PathBuf::from("/cfg/config.yaml"), file)), &none, PathBuf::from("/h")).is_err());

        let one = env_from(&[("RUNVAULT_IO_TIMEOUT_SECS", "1")]);
        assert_eq!(
            resolve(None, &one, PathBuf::from("/h")).unwrap().io_timeout,
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_http_provider_requires_endpoint() {
        let env = env_from(&[("RUNVAULT_COLD_STORAGE", "true"), ("RUNVAULT_COLD_PROVIDER", "http")]);
        let config = resolve(None, &env, PathBuf::from("/h")).unwrap();
        assert!(config.cold_storage_tier().is_err());
    }

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join(".runvault");
        std::fs::create_dir_all(&dir).unwrap();

        let config_path = dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
paths:
  home: /var/lib/runvault
  artifacts: /var/lib/runvault/runs
registry:
  capacity: 250
audit:
  threshold_bytes: 1024
cold_storage:
  enabled: true
  dir: /mnt/archive
  offload_on_demote: true
retention:
  keep_last: 10
  top_k_per_strategy: 2
  max_full_bytes: 1000000
pipeline:
  command: backtest
  args: ["--profile", "ci"]
  timeout_seconds: 60
"#
        )
        .unwrap();

        let parsed = load_config_file(&config_path).unwrap();
        let config = resolve(Some((config_path.clone(), parsed)), &env_from(&[]), PathBuf::from("/h")).unwrap();

        assert_eq!(config.home, PathBuf::from("/var/lib/runvault"));
        assert_eq!(config.artifacts, PathBuf::from("/var/lib/runvault/runs"));
        assert_eq!(config.registry_capacity, 250);
        assert_eq!(config.audit.threshold_bytes, 1024);
        assert!(config.audit.compress);
        assert!(config.cold_storage.enabled);
        assert!(config.cold_storage.offload_on_demote);
        assert_eq!(config.cold_storage.dir, PathBuf::from("/mnt/archive"));
        assert_eq!(config.retention.keep_last, 10);
        assert_eq!(config.retention.max_full_bytes, Some(1_000_000));
        assert_eq!(config.pipeline.timeout, Duration::from_secs(60));
        assert_eq!(config.config_file, Some(config_path));

        let options = config.vault_options().unwrap();
        assert!(options.cold_storage.is_some());
        assert!(config.command_pipeline().is_some());
    }

    #[test]
    fn test_invalid_retention_section() {
        let file = ConfigFile {
            retention: Some(RetentionConfig {
                keep_last: 0,
                top_k_per_strategy: 3,
                max_full_bytes: None,
            }),
            ..Default::default()
        };
        let result = resolve(Some((PathBuf::from("/p/.runvault/config.yaml"), file)), &env_from(&[]), PathBuf::from("/h"));
        assert!(result.is_err());
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
