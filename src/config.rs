//! Configuration management for hostward
//!
//! The configuration directory holds one general file plus one task config per
//! file, grouped by kind:
//!
//! ```text
//! <config_dir>/
//!   general.yml
//!   collectors/cpu-load.yml
//!   shippers/aggregator-host.toml
//!   executors/restart-nginx.json
//!   loggers/syslog.yml
//!   access-tokens/tokens
//! ```
//!
//! # Examples
//!
//! **YAML Format:**
//! ```yaml
//! path: /load-avg
//! implementation: LoadAvg
//! interval: 30s
//! ```
//!
//! **TOML Format:**
//! ```toml
//! path = "/hosts"
//! implementation = "AggregatorHost"
//! interval = "1m"
//! dependency_paths = ["/load-avg", "/memory"]
//! ```

use crate::error::{AgentError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Host tags attached to every envelope
pub type Tags = BTreeMap<String, String>;

/// The four schedulable task kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    #[default]
    Collector,
    Shipper,
    Executor,
    Logger,
}

impl TaskKind {
    /// One-letter tag used for canonical cache paths
    pub fn tag(&self) -> &'static str {
        match self {
            TaskKind::Collector => "r",
            TaskKind::Shipper | TaskKind::Logger => "w",
            TaskKind::Executor => "x",
        }
    }

    /// Directory name inside the config dir
    pub fn dir_name(&self) -> &'static str {
        match self {
            TaskKind::Collector => "collectors",
            TaskKind::Shipper => "shippers",
            TaskKind::Executor => "executors",
            TaskKind::Logger => "loggers",
        }
    }

    pub fn all() -> [TaskKind; 4] {
        [
            TaskKind::Collector,
            TaskKind::Shipper,
            TaskKind::Executor,
            TaskKind::Logger,
        ]
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskKind::Collector => "collector",
            TaskKind::Shipper => "shipper",
            TaskKind::Executor => "executor",
            TaskKind::Logger => "logger",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for TaskKind {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "collector" | "reader" | "r" => Ok(TaskKind::Collector),
            "shipper" | "writer" | "w" => Ok(TaskKind::Shipper),
            "executor" | "x" => Ok(TaskKind::Executor),
            "logger" => Ok(TaskKind::Logger),
            other => Err(AgentError::config(format!("unknown task kind: {}", other))),
        }
    }
}

/// Normalize `path` under the `/<tag>` prefix.
///
/// Paths already starting with `/<tag>` are returned unchanged. Only `r` and
/// `w` are prepended as-is; any other tag falls back to the `/w` prefix.
pub fn canonical_path(tag: &str, path: &str) -> String {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };

    if path.starts_with(&format!("/{}", tag)) {
        return path;
    }

    match tag {
        "r" => format!("/r{}", path),
        _ => format!("/w{}", path),
    }
}

/// One schedulable unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Path under which results are cached; empty means "never cache"
    #[serde(default)]
    pub path: String,
    /// Kind, implied by the config subdirectory
    #[serde(default)]
    pub kind: TaskKind,
    /// Implementation name looked up in the plugin registry
    pub implementation: String,
    /// Implementation-specific parameters
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
    /// Pause between two runs
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Paths of other tasks whose cached output this task consumes
    #[serde(default)]
    pub dependency_paths: Vec<String>,
    /// Endpoint override for shippers and executors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,
    /// Credential override for shippers and executors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl TaskConfig {
    pub fn new(kind: TaskKind, path: &str, implementation: &str) -> Self {
        Self {
            path: path.to_string(),
            kind,
            implementation: implementation.to_string(),
            fields: serde_json::Map::new(),
            interval: default_interval(),
            dependency_paths: Vec::new(),
            endpoint_url: None,
            credential: None,
        }
    }

    pub fn with_field(mut self, key: &str, value: serde_json::Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_dependencies<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependency_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Canonical cache path for this task.
    ///
    /// Executors are always stored under `/x`, even though the generic
    /// canonicalization rule would file an unrecognized tag under `/w`.
    pub fn path_with_prefix(&self) -> String {
        match self.kind {
            TaskKind::Executor => {
                let path = if self.path.starts_with('/') {
                    self.path.clone()
                } else {
                    format!("/{}", self.path)
                };
                if path.starts_with("/x") {
                    path
                } else {
                    format!("/x{}", path)
                }
            }
            kind => canonical_path(kind.tag(), &self.path),
        }
    }

    /// Interval formatted the way it appears in envelopes
    pub fn interval_string(&self) -> String {
        humantime::format_duration(self.interval).to_string()
    }

    pub fn validate(&self) -> Result<()> {
        if self.implementation.trim().is_empty() {
            return Err(AgentError::config(format!(
                "{} '{}' has no implementation",
                self.kind, self.path
            )));
        }
        if self.interval.is_zero() {
            return Err(AgentError::config(format!(
                "{} '{}' has a zero interval",
                self.kind, self.path
            )));
        }
        Ok(())
    }
}

/// Aggregator (master) endpoint and default credential
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AggregatorConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

/// Shared log-intake shipping settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogReceiverConfig {
    /// Interval between two shipments of the shared buffer
    #[serde(default = "default_ship_interval", with = "humantime_serde")]
    pub ship_interval: Duration,
    /// Buffers longer than this are cleared after a shipment attempt
    #[serde(default = "default_auto_prune_length")]
    pub auto_prune_length: usize,
    /// Optional TCP address accepting raw log lines
    #[serde(default)]
    pub intake_addr: Option<String>,
}

impl Default for LogReceiverConfig {
    fn default() -> Self {
        Self {
            ship_interval: default_ship_interval(),
            auto_prune_length: default_auto_prune_length(),
            intake_addr: None,
        }
    }
}

/// Graphite plaintext intake feeding the nested metrics store
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GraphiteConfig {
    #[serde(default)]
    pub listen_addr: Option<String>,
}

/// Process-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Lifetime of every cached result
    #[serde(default = "default_ttl", with = "humantime_serde")]
    pub ttl: Duration,
    /// Address of the read-only HTTP facade
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub log_receiver: LogReceiverConfig,
    #[serde(default)]
    pub graphite: GraphiteConfig,
    /// Host tags
    #[serde(default)]
    pub tags: Tags,
    /// CIDR networks allowed to read the HTTP facade; empty allows all
    #[serde(default)]
    pub allowed_networks: Vec<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            listen_addr: default_listen_addr(),
            log_level: default_log_level(),
            aggregator: AggregatorConfig::default(),
            tls: TlsConfig::default(),
            log_receiver: LogReceiverConfig::default(),
            graphite: GraphiteConfig::default(),
            tags: Tags::new(),
            allowed_networks: Vec::new(),
        }
    }
}

/// Everything loaded from the config directory
#[derive(Debug, Clone, Default)]
pub struct Configs {
    pub general: GeneralConfig,
    pub collectors: Vec<TaskConfig>,
    pub shippers: Vec<TaskConfig>,
    pub executors: Vec<TaskConfig>,
    pub loggers: Vec<TaskConfig>,
    pub access_tokens: Vec<String>,
}

impl Configs {
    /// Load and validate the whole config directory
    pub fn load(config_dir: &Path) -> Result<Self> {
        if !config_dir.is_dir() {
            return Err(AgentError::config(format!(
                "config directory {} does not exist",
                config_dir.display()
            )));
        }

        let general = match find_config_file(config_dir, "general") {
            Some(path) => load_config_file::<GeneralConfig>(&path)?,
            None => GeneralConfig::default(),
        };

        let mut configs = Configs {
            general,
            access_tokens: load_access_tokens(config_dir)?,
            ..Default::default()
        };

        for kind in TaskKind::all() {
            let tasks = load_task_dir(&config_dir.join(kind.dir_name()), kind)?;
            match kind {
                TaskKind::Collector => configs.collectors = tasks,
                TaskKind::Shipper => configs.shippers = tasks,
                TaskKind::Executor => configs.executors = tasks,
                TaskKind::Logger => configs.loggers = tasks,
            }
        }

        Ok(configs)
    }

    /// Collectors, shippers, and executors in scheduling order
    pub fn scheduled(&self) -> impl Iterator<Item = &TaskConfig> {
        self.collectors
            .iter()
            .chain(self.shippers.iter())
            .chain(self.executors.iter())
    }

    pub fn task_count(&self) -> usize {
        self.collectors.len() + self.shippers.len() + self.executors.len() + self.loggers.len()
    }
}

/// Deserialize a config file, picking the format from its extension
pub fn load_config_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)?;
    let parsed = match path.extension().and_then(|s| s.to_str()) {
        Some("json") => serde_json::from_str(&content)
            .map_err(|e| AgentError::config(format!("{}: {}", path.display(), e)))?,
        Some("toml") => toml::from_str(&content)
            .map_err(|e| AgentError::config(format!("{}: {}", path.display(), e)))?,
        Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
            .map_err(|e| AgentError::config(format!("{}: {}", path.display(), e)))?,
        _ => {
            return Err(AgentError::config(format!(
                "unsupported config file format: {}",
                path.display()
            )))
        }
    };
    Ok(parsed)
}

fn is_config_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("json") | Some("toml") | Some("yaml") | Some("yml")
    )
}

fn find_config_file(dir: &Path, stem: &str) -> Option<PathBuf> {
    ["yml", "yaml", "json", "toml"]
        .iter()
        .map(|ext| dir.join(format!("{}.{}", stem, ext)))
        .find(|p| p.is_file())
}

/// Load every task config in `dir`, sorted by file name
pub fn load_task_dir(dir: &Path, kind: TaskKind) -> Result<Vec<TaskConfig>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_config_file(p))
        .collect();
    files.sort();

    let mut tasks = Vec::with_capacity(files.len());
    for file in files {
        debug!(file = %file.display(), %kind, "loading task config");
        let mut task: TaskConfig = load_config_file(&file)?;
        task.kind = kind;
        task.validate()
            .map_err(|e| AgentError::config(format!("{}: {}", file.display(), e)))?;
        tasks.push(task);
    }
    Ok(tasks)
}

/// Read every file in `<config_dir>/access-tokens`; tokens are comma-separated per line
pub fn load_access_tokens(config_dir: &Path) -> Result<Vec<String>> {
    let dir = config_dir.join("access-tokens");
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    files.sort();

    let mut tokens = Vec::new();
    for file in files {
        let Ok(content) = std::fs::read_to_string(&file) else {
            continue;
        };
        for line in content.lines() {
            tokens.extend(
                line.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string),
            );
        }
    }
    Ok(tokens)
}

/// Config directory precedence: env var, then /etc/hostward, then the user config dir
pub fn default_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("HOSTWARD_CONFIG_DIR") {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    let system_config = PathBuf::from("/etc/hostward");
    if system_config.exists() {
        system_config
    } else {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("hostward")
    }
}

// Default value functions
fn default_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_ttl() -> Duration {
    Duration::from_secs(60)
}
fn default_ship_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_auto_prune_length() -> usize {
    10_000
}
fn default_listen_addr() -> String {
    "127.0.0.1:55555".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
