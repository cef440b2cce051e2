//! Agent core
//!
//! The [`Agent`] owns every shared store and drives task execution: it
//! constructs a fresh task per run, hands shippers and executors their
//! assembled dependency data, and persists a result envelope for every run
//! into the result cache, whether the run succeeded or not.

pub mod access;
mod assembly;
mod schedule;

pub use access::{AccessControl, AccessTokens, AllowedNetworks};
pub use assembly::{resolve_endpoint, Envelope, GRAPHITE_PATH};
pub use schedule::{ScheduledTask, Supervisor};

use crate::config::{Configs, TaskConfig, TaskKind};
use crate::error::{AgentError, Result};
use crate::host::{Host, HostInfo, SystemHost};
use crate::plugins::PluginRegistry;
use crate::statsd::StatsdRegistry;
use crate::store::{CounterStore, LogBuffers, NestedMetricsStore, ResultCache};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

/// Shared handle to the running agent. Cloning is cheap.
#[derive(Clone)]
pub struct Agent {
    id: Uuid,
    configs: Arc<Configs>,
    cache: Arc<ResultCache>,
    counters: Arc<CounterStore>,
    metrics: Arc<NestedMetricsStore>,
    log_buffers: Arc<LogBuffers>,
    statsd: Arc<StatsdRegistry>,
    host_info: Arc<dyn HostInfo>,
    access: Arc<AccessControl>,
    shutdown: CancellationToken,
}

impl Agent {
    pub fn new(configs: Configs) -> Result<Self> {
        let networks = AllowedNetworks::parse(configs.general.allowed_networks.as_slice())?;
        let tokens = AccessTokens::new(configs.access_tokens.iter().cloned());
        let host_info: Arc<dyn HostInfo> = Arc::new(SystemHost::new(configs.general.tags.clone()));
        let shutdown = CancellationToken::new();

        Ok(Self {
            id: Uuid::new_v4(),
            cache: Arc::new(ResultCache::new(configs.general.ttl)),
            counters: Arc::new(CounterStore::new()),
            metrics: Arc::new(NestedMetricsStore::new()),
            log_buffers: Arc::new(LogBuffers::new()),
            statsd: Arc::new(StatsdRegistry::new(shutdown.child_token())),
            host_info,
            access: Arc::new(AccessControl::new(tokens, networks)),
            configs: Arc::new(configs),
            shutdown,
        })
    }

    /// Replace the host metadata source
    pub fn with_host_info(mut self, host_info: Arc<dyn HostInfo>) -> Self {
        self.host_info = host_info;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn configs(&self) -> &Configs {
        &self.configs
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn counters(&self) -> &Arc<CounterStore> {
        &self.counters
    }

    pub fn metrics(&self) -> &Arc<NestedMetricsStore> {
        &self.metrics
    }

    pub fn log_buffers(&self) -> &Arc<LogBuffers> {
        &self.log_buffers
    }

    pub fn statsd(&self) -> &Arc<StatsdRegistry> {
        &self.statsd
    }

    pub fn access(&self) -> &AccessControl {
        &self.access
    }

    pub fn host(&self) -> Host {
        self.host_info.host()
    }

    /// Root token cancelled on shutdown
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Run `config` once and cache its envelope.
    ///
    /// Returns the run's output bytes. A failed run is cached as
    /// `{"Error": message}` and then reported as [`AgentError::Execution`].
    /// Construction and serialization failures return early without caching.
    #[instrument(skip(self, config), fields(path = %config.path, kind = %config.kind, implementation = %config.implementation))]
    pub async fn execute(&self, config: &TaskConfig) -> Result<Vec<u8>> {
        let mut task = PluginRegistry::construct(config).inspect_err(|e| {
            error!(error = %e, "Failed to construct task");
        })?;

        if matches!(config.kind, TaskKind::Shipper | TaskKind::Executor) {
            task.set_context(self.task_context(config));
        }

        let (output, failure) = match task.run().await {
            Ok(()) => match task.to_json() {
                Ok(output) => (output, None),
                Err(e) => {
                    error!(
                        error = %e,
                        interval = %config.interval_string(),
                        dependencies = ?config.dependency_paths,
                        "Failed to serialize task output"
                    );
                    return Err(e);
                }
            },
            Err(e) => {
                let message = format!("{:#}", e);
                let payload = serde_json::to_vec(&serde_json::json!({ "Error": message }))?;
                (payload, Some(message))
            }
        };

        if !config.path.is_empty() && !output.is_empty() {
            self.save_run(config, &output)?;
        }

        match failure {
            Some(message) => {
                warn!(
                    error = %message,
                    interval = %config.interval_string(),
                    dependencies = ?config.dependency_paths,
                    "Task run failed"
                );
                Err(AgentError::Execution(message))
            }
            None => {
                debug!(bytes = output.len(), "Task run completed");
                Ok(output)
            }
        }
    }

    /// Wrap `output` in an envelope and store it under the task's canonical path
    pub fn save_run(&self, config: &TaskConfig, output: &[u8]) -> Result<()> {
        let data: serde_json::Value = serde_json::from_slice(output).inspect_err(|e| {
            error!(path = %config.path, error = %e, "Task output is not valid JSON");
        })?;

        let envelope = Envelope::new(config, &self.configs.general.tags, self.host(), data);
        let bytes = serde_json::to_vec(&envelope)?;
        self.cache.set(&config.path_with_prefix(), bytes);
        Ok(())
    }

    /// Latest non-expired envelope at a canonical path
    pub fn get_run_by_path(&self, path: &str) -> Option<Vec<u8>> {
        self.cache.get(path)
    }
}
