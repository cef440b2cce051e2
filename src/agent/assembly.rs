//! Result envelopes and dependency data for shippers and executors

use super::Agent;
use crate::config::{canonical_path, AggregatorConfig, TaskConfig, TaskKind, Tags};
use crate::host::Host;
use crate::plugins::shippers::aggregator_suffix;
use crate::plugins::{DependencyData, TaskContext};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Path of the synthetic dependency carrying the nested metrics snapshot
pub const GRAPHITE_PATH: &str = "/graphite";

/// Cached record of one task run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    pub path: String,
    pub interval: String,
    pub implementation: String,
    pub kind: TaskKind,
    pub tags: Tags,
    pub unix_nano: i64,
    pub host: Host,
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(config: &TaskConfig, tags: &Tags, host: Host, data: serde_json::Value) -> Self {
        Self {
            path: config.path.clone(),
            interval: config.interval_string(),
            implementation: config.implementation.clone(),
            kind: config.kind,
            tags: tags.clone(),
            unix_nano: unix_nano(),
            host,
            data,
        }
    }
}

fn unix_nano() -> i64 {
    chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

/// Endpoint URL and credential a task should use, after applying agent-wide defaults.
///
/// Aggregator-family shippers fall back to the aggregator URL plus their API
/// suffix whenever the configured URL is missing or lacks that suffix.
/// Executors fall back to the aggregator URL as-is. Both fall back to the
/// aggregator access token when no credential is configured.
pub fn resolve_endpoint(config: &TaskConfig, aggregator: &AggregatorConfig) -> (String, String) {
    let configured_url = config.endpoint_url.clone().filter(|u| !u.is_empty());
    let configured_credential = config.credential.clone().filter(|c| !c.is_empty());
    let default_credential = || aggregator.access_token.clone();

    match (config.kind, aggregator_suffix(&config.implementation)) {
        (TaskKind::Shipper, Some(suffix)) => {
            let url = match configured_url {
                Some(url) if url.ends_with(suffix) => url,
                _ => format!("{}{}", aggregator.url.trim_end_matches('/'), suffix),
            };
            (url, configured_credential.unwrap_or_else(default_credential))
        }
        (TaskKind::Executor, _) | (TaskKind::Logger, _) => (
            configured_url.unwrap_or_else(|| aggregator.url.clone()),
            configured_credential.unwrap_or_else(default_credential),
        ),
        _ => (
            configured_url.unwrap_or_default(),
            configured_credential.unwrap_or_default(),
        ),
    }
}

impl Agent {
    /// Synthetic record exposing the nested metrics store as a dependency
    pub fn graphite_record(&self) -> serde_json::Value {
        serde_json::json!({
            "UnixNano": unix_nano(),
            "Path": GRAPHITE_PATH,
            "Host": self.host(),
            "Data": self.metrics.snapshot(),
        })
    }

    /// Resolve `config.dependency_paths`, skipping anything not cached.
    ///
    /// Executors additionally see every non-expired cache entry.
    pub fn dependency_data(&self, config: &TaskConfig) -> DependencyData {
        let mut data = DependencyData::new();

        if config.kind == TaskKind::Executor {
            for (path, bytes) in self.cache.all_non_expired() {
                if let Ok(value) = serde_json::from_slice(&bytes) {
                    data.insert(path, value);
                }
            }
        }

        for path in &config.dependency_paths {
            if path.ends_with(GRAPHITE_PATH) {
                data.insert(path.clone(), self.graphite_record());
                continue;
            }

            let path = canonical_path("r", path);
            let Some(bytes) = self.cache.get(&path) else {
                continue;
            };
            if let Ok(value) = serde_json::from_slice(&bytes) {
                data.insert(path, value);
            }
        }

        data
    }

    /// Everything a shipper or executor receives before running
    pub fn task_context(&self, config: &TaskConfig) -> TaskContext {
        let (endpoint_url, credential) = resolve_endpoint(config, &self.configs.general.aggregator);
        TaskContext {
            data: self.dependency_data(config),
            tags: self.configs.general.tags.clone(),
            counters: Arc::clone(&self.counters),
            host: self.host(),
            endpoint_url,
            credential,
            statsd: Arc::clone(&self.statsd),
            path: config.path_with_prefix(),
        }
    }
}
