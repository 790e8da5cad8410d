//! ---
//! luo_section: "01-core-functionality"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Shared primitives and utilities for the live update runtime."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use tracing::debug;

use crate::logging::LogFormat;
use crate::module::{ModuleFormat, ModuleKind};

fn default_node_id() -> String {
    "node-local".to_owned()
}

fn default_code_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_data_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_cache_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_backup_path() -> PathBuf {
    PathBuf::from("target/backups")
}

fn default_retain_last() -> usize {
    10
}

fn default_sync_enabled() -> bool {
    true
}

fn default_signal_path() -> PathBuf {
    PathBuf::from("target/sync/signal.json")
}

fn default_worker_dir() -> PathBuf {
    PathBuf::from("target/sync/workers")
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_topic() -> String {
    "r-luo.reload".to_owned()
}

fn default_lock_name() -> String {
    "r-luo.driver".to_owned()
}

fn default_lock_ttl() -> Duration {
    Duration::from_secs(30)
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_ack_timeout() -> Duration {
    Duration::from_secs(3)
}

fn default_resubscribe_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_audit_directory() -> PathBuf {
    PathBuf::from("target/audit")
}

fn default_audit_max_bytes() -> u64 {
    1024 * 1024
}

fn default_audit_max_files() -> usize {
    5
}

fn default_recent_limit() -> usize {
    50
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_log_max_files() -> usize {
    7
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9899))
}

fn default_api_enabled() -> bool {
    true
}

fn default_api_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8089))
}

/// Primary configuration object for the R-LUO runtime.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub modules: IndexMap<String, ModuleConfig>,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "R_LUO_CONFIG";

    /// Load configuration from disk, respecting the `R_LUO_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<AppConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Identifier this process reports as `origin_process_id`.
    pub fn process_id(&self) -> String {
        self.node
            .process_id
            .clone()
            .unwrap_or_else(|| format!("pid-{}", std::process::id()))
    }

    /// Validate structural invariants.
    ///
    /// Dependency cycles are rejected later, at registration time.
    pub fn validate(&self) -> Result<()> {
        if self.node.node_id.trim().is_empty() {
            return Err(anyhow!("node.node_id must not be empty"));
        }
        self.detector.validate()?;
        if self.backup.retain_last == 0 {
            return Err(anyhow!("backup.retain_last must be at least 1"));
        }
        if self.sync.poll_interval.is_zero() {
            return Err(anyhow!("sync.poll_interval must be greater than zero"));
        }
        if self.cluster.enabled && self.cluster.lock_ttl <= self.cluster.lock_timeout {
            return Err(anyhow!(
                "cluster.lock_ttl must exceed cluster.lock_timeout"
            ));
        }
        if self.audit.max_files == 0 {
            return Err(anyhow!("audit.max_files must be at least 1"));
        }
        for (name, module) in &self.modules {
            for dependency in &module.depends_on {
                if dependency == name {
                    return Err(anyhow!("module '{}' cannot depend on itself", name));
                }
                if !self.modules.contains_key(dependency) {
                    return Err(anyhow!(
                        "module '{}' depends on unknown module '{}'",
                        name,
                        dependency
                    ));
                }
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub process_id: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            process_id: None,
        }
    }
}

/// Scan cadence per module class. Code modules get a fast mtime-style check,
/// externally versioned config and rules are polled more slowly.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    #[serde(default = "default_code_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub code_interval: Duration,
    #[serde(default = "default_data_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub config_interval: Duration,
    #[serde(default = "default_data_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub rule_interval: Duration,
    #[serde(default = "default_cache_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub cache_interval: Duration,
}

impl DetectorConfig {
    pub fn interval_for(&self, kind: ModuleKind) -> Duration {
        match kind {
            ModuleKind::Code => self.code_interval,
            ModuleKind::Config => self.config_interval,
            ModuleKind::Rule => self.rule_interval,
            ModuleKind::Cache => self.cache_interval,
        }
    }

    fn validate(&self) -> Result<()> {
        for kind in ModuleKind::ALL {
            if self.interval_for(kind).is_zero() {
                return Err(anyhow!(
                    "detector interval for {} modules must be greater than zero",
                    kind
                ));
            }
        }
        Ok(())
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            code_interval: default_code_interval(),
            config_interval: default_data_interval(),
            rule_interval: default_data_interval(),
            cache_interval: default_cache_interval(),
        }
    }
}

/// Serializer used for backup envelopes.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackupFormat {
    #[default]
    Json,
    Cbor,
}

impl BackupFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            BackupFormat::Json => "json",
            BackupFormat::Cbor => "cbor",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default = "default_backup_path")]
    pub directory: PathBuf,
    #[serde(default = "default_retain_last")]
    pub retain_last: usize,
    #[serde(default)]
    pub format: BackupFormat,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            directory: default_backup_path(),
            retain_last: default_retain_last(),
            format: BackupFormat::default(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_sync_enabled")]
    pub enabled: bool,
    #[serde(default = "default_signal_path")]
    pub signal_path: PathBuf,
    #[serde(default = "default_worker_dir")]
    pub worker_dir: PathBuf,
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub poll_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: default_sync_enabled(),
            signal_path: default_signal_path(),
            worker_dir: default_worker_dir(),
            poll_interval: default_poll_interval(),
        }
    }
}

/// Coordination backend used for the cluster lock and pub/sub topic.
#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClusterBackend {
    /// In-process backend; every node sharing the process sees the same topic.
    #[default]
    Loopback,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub backend: ClusterBackend,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_lock_name")]
    pub lock_name: String,
    #[serde(default = "default_lock_ttl")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub lock_ttl: Duration,
    #[serde(default = "default_lock_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub lock_timeout: Duration,
    #[serde(default = "default_ack_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub ack_timeout: Duration,
    #[serde(default)]
    pub expected_peers: usize,
    #[serde(default = "default_resubscribe_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub resubscribe_interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: ClusterBackend::default(),
            topic: default_topic(),
            lock_name: default_lock_name(),
            lock_ttl: default_lock_ttl(),
            lock_timeout: default_lock_timeout(),
            ack_timeout: default_ack_timeout(),
            expected_peers: 0,
            resubscribe_interval: default_resubscribe_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_audit_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_audit_max_files")]
    pub max_files: usize,
    #[serde(default = "default_recent_limit")]
    pub recent_limit: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            directory: default_audit_directory(),
            max_bytes: default_audit_max_bytes(),
            max_files: default_audit_max_files(),
            recent_limit: default_recent_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    #[serde(default = "default_log_max_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            max_files: default_log_max_files(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_listen")]
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            listen: default_metrics_listen(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_listen")]
    pub listen: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_api_enabled(),
            listen: default_api_listen(),
        }
    }
}

/// A file-backed data module declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    #[serde(default)]
    pub kind: ModuleKind,
    pub source: PathBuf,
    #[serde(default)]
    pub format: ModuleFormat,
    #[serde(default)]
    pub depends_on: Vec<String>,
}
