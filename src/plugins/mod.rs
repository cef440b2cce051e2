//! Pluggable task implementations
//!
//! Every collector, shipper, and executor is a [`Task`] built by a constructor
//! registered under `(TaskKind, implementation name)`. A fresh instance is
//! constructed for every run and dropped afterwards. Loggers are long-lived
//! producers and live in [`loggers`].
//!
//! Out-of-tree plugins register themselves at startup:
//!
//! ```ignore
//! PluginRegistry::register(TaskKind::Collector, "Uptime", plugin(|config| {
//!     let fields: UptimeFields = decode_fields(config)?;
//!     Ok(Box::new(Uptime::new(fields)))
//! }));
//! ```

pub mod collectors;
pub mod command;
pub mod executors;
pub mod loggers;
pub mod shippers;

use crate::config::{TaskConfig, TaskKind, Tags};
use crate::error::{AgentError, Result};
use crate::host::Host;
use crate::statsd::StatsdRegistry;
use crate::store::CounterStore;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

/// Capability interface shared by every task implementation
#[async_trait]
pub trait Task: Send {
    /// Perform one unit of work
    async fn run(&mut self) -> anyhow::Result<()>;

    /// JSON output of the last run; an empty vector means "no output"
    fn to_json(&self) -> Result<Vec<u8>>;

    /// Hand over the assembled dependency data before `run`.
    ///
    /// Collectors ignore it.
    fn set_context(&mut self, _context: TaskContext) {}
}

/// Dependency data keyed by canonical path, each value a parsed envelope
pub type DependencyData = BTreeMap<String, serde_json::Value>;

/// Everything a shipper or executor may read while running
#[derive(Clone)]
pub struct TaskContext {
    pub data: DependencyData,
    pub tags: Tags,
    pub counters: Arc<CounterStore>,
    pub host: Host,
    /// Endpoint URL after default resolution
    pub endpoint_url: String,
    /// Credential after default resolution
    pub credential: String,
    pub statsd: Arc<StatsdRegistry>,
    /// Canonical path of the task receiving this context
    pub path: String,
}

/// Constructor producing a task instance from its config
pub type PluginConstructor = Arc<dyn Fn(&TaskConfig) -> Result<Box<dyn Task>> + Send + Sync>;

type RegistryKey = (TaskKind, String);

/// Wrap a closure as a [`PluginConstructor`]
pub fn plugin<F>(constructor: F) -> PluginConstructor
where
    F: Fn(&TaskConfig) -> Result<Box<dyn Task>> + Send + Sync + 'static,
{
    Arc::new(constructor)
}

static PLUGIN_REGISTRY: Lazy<RwLock<HashMap<RegistryKey, PluginConstructor>>> = Lazy::new(|| {
    let mut registry = HashMap::new();
    PluginRegistry::initialize_builtin_plugins(&mut registry);
    RwLock::new(registry)
});

/// Name-keyed plugin construction
pub struct PluginRegistry;

impl PluginRegistry {
    /// Register (or replace) a constructor for `kind` + `name`
    pub fn register(kind: TaskKind, name: &str, constructor: PluginConstructor) {
        let mut registry = PLUGIN_REGISTRY
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.insert((kind, name.to_string()), constructor);
    }

    fn register_builtin(
        registry: &mut HashMap<RegistryKey, PluginConstructor>,
        kind: TaskKind,
        name: &str,
        constructor: PluginConstructor,
    ) {
        registry.insert((kind, name.to_string()), constructor);
    }

    fn initialize_builtin_plugins(registry: &mut HashMap<RegistryKey, PluginConstructor>) {
        // Collectors
        Self::register_builtin(
            registry,
            TaskKind::Collector,
            "Shell",
            plugin(|config| Ok(Box::new(collectors::Shell::new(decode_fields(config)?)))),
        );
        Self::register_builtin(
            registry,
            TaskKind::Collector,
            "LoadAvg",
            plugin(|_| Ok(Box::new(collectors::LoadAvg::default()))),
        );
        Self::register_builtin(
            registry,
            TaskKind::Collector,
            "Memory",
            plugin(|_| Ok(Box::new(collectors::Memory::default()))),
        );

        // Shippers
        Self::register_builtin(
            registry,
            TaskKind::Shipper,
            "Http",
            plugin(|config| Ok(Box::new(shippers::Http::new(decode_fields(config)?)?))),
        );
        Self::register_builtin(
            registry,
            TaskKind::Shipper,
            "AggregatorHost",
            plugin(|config| {
                Ok(Box::new(shippers::AggregatorHost::new(decode_fields(
                    config,
                )?)?))
            }),
        );
        Self::register_builtin(
            registry,
            TaskKind::Shipper,
            "StatsdAbsolute",
            plugin(|config| {
                Ok(Box::new(shippers::StatsdAbsolute::new(decode_fields(
                    config,
                )?)))
            }),
        );

        // Executors
        Self::register_builtin(
            registry,
            TaskKind::Executor,
            "Shell",
            plugin(|config| Ok(Box::new(executors::Shell::new(decode_fields(config)?)))),
        );
    }

    /// Construct a fresh task instance for `config`
    pub fn construct(config: &TaskConfig) -> Result<Box<dyn Task>> {
        let constructor = {
            let registry = PLUGIN_REGISTRY
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            registry
                .get(&(config.kind, config.implementation.clone()))
                .cloned()
        };

        match constructor {
            Some(constructor) => constructor(config),
            None => Err(AgentError::config(format!(
                "no {} implementation named '{}'",
                config.kind, config.implementation
            ))),
        }
    }

    pub fn is_registered(kind: TaskKind, name: &str) -> bool {
        let registry = PLUGIN_REGISTRY
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.contains_key(&(kind, name.to_string()))
    }

    /// Registered implementation names for `kind`, sorted
    pub fn registered(kind: TaskKind) -> Vec<String> {
        let registry = PLUGIN_REGISTRY
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut names: Vec<String> = registry
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names
    }
}

/// Decode a task's `fields` into the plugin's own typed settings
pub fn decode_fields<T: DeserializeOwned>(config: &TaskConfig) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(config.fields.clone())).map_err(|e| {
        AgentError::config(format!(
            "invalid fields for {} '{}' ({}): {}",
            config.kind, config.path, config.implementation, e
        ))
    })
}
