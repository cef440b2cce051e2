//! Built-in shippers
//!
//! Shippers forward the data of the tasks they depend on. The dependency data
//! arrives as a JSON object keyed by canonical path, each value the cached
//! envelope of that task.
//!
//! **YAML Format:**
//! ```yaml
//! path: /hosts
//! implementation: AggregatorHost
//! interval: 1m
//! dependency_paths:
//!   - /load-avg
//!   - /memory
//! ```
//!
//! ```yaml
//! path: /statsd
//! implementation: StatsdAbsolute
//! interval: 10s
//! dependency_paths: [/load-avg]
//! fields:
//!   address: localhost:8125
//!   buffer_interval: 1s
//!   prefix: "web1."
//! ```

use super::{Task, TaskContext};
use crate::error::{AgentError, Result};
use crate::transport;
use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// API suffix required by an aggregator-family shipper, if `implementation` is one
pub fn aggregator_suffix(implementation: &str) -> Option<&'static str> {
    match implementation {
        "AggregatorHost" => Some("/api/hosts"),
        _ => None,
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct Shipment {
    url: String,
    method: String,
    status_code: u16,
}

/// Settings for the generic HTTP shipper
#[derive(Debug, Clone, Deserialize)]
pub struct HttpFields {
    /// Target URL; falls back to the task's endpoint override
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for HttpFields {
    fn default() -> Self {
        Self {
            url: None,
            method: default_method(),
            headers: HashMap::new(),
            username: None,
            password: None,
        }
    }
}

/// Sends the dependency data to an arbitrary HTTP endpoint
pub struct Http {
    fields: HttpFields,
    method: Method,
    client: Client,
    context: Option<TaskContext>,
    result: Option<Shipment>,
}

impl Http {
    pub fn new(fields: HttpFields) -> Result<Self> {
        Ok(Self {
            method: transport::parse_method(&fields.method)?,
            fields,
            client: transport::http_client()?,
            context: None,
            result: None,
        })
    }
}

#[async_trait]
impl Task for Http {
    async fn run(&mut self) -> anyhow::Result<()> {
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("HTTP shipper ran without dependency data"))?;

        let url = self
            .fields
            .url
            .clone()
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| context.endpoint_url.clone());
        if url.is_empty() {
            anyhow::bail!("HTTP shipper has no url");
        }

        let mut request = self.client.request(self.method.clone(), &url);
        for (key, value) in &self.fields.headers {
            request = request.header(key, value);
        }
        if let Some(username) = &self.fields.username {
            let password = self.fields.password.as_deref().unwrap_or_default();
            request = request.header(
                "Authorization",
                transport::basic_auth_header(username, password),
            );
        }

        let body = serde_json::to_vec(&context.data)?;
        let status_code = transport::send_json(request, body).await?;
        self.result = Some(Shipment {
            url,
            method: self.method.to_string(),
            status_code,
        });
        Ok(())
    }

    fn to_json(&self) -> Result<Vec<u8>> {
        match &self.result {
            Some(result) => Ok(serde_json::to_vec(result)?),
            None => Ok(Vec::new()),
        }
    }

    fn set_context(&mut self, context: TaskContext) {
        self.context = Some(context);
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorHostFields {
    #[serde(default = "default_method")]
    pub method: String,
}

impl Default for AggregatorHostFields {
    fn default() -> Self {
        Self {
            method: default_method(),
        }
    }
}

/// Reports this host's collected data to the aggregator's `/api/hosts` endpoint.
///
/// The endpoint URL and credential are resolved before the run: the agent-wide
/// aggregator URL is used when none is configured, and the aggregator access
/// token becomes the basic-auth username when no credential is set.
pub struct AggregatorHost {
    method: Method,
    client: Client,
    context: Option<TaskContext>,
    result: Option<Shipment>,
}

impl AggregatorHost {
    pub fn new(fields: AggregatorHostFields) -> Result<Self> {
        let method = transport::parse_method(&fields.method)?;
        if method != Method::POST && method != Method::PUT {
            return Err(AgentError::config(format!(
                "AggregatorHost supports POST or PUT, not {}",
                method
            )));
        }
        Ok(Self {
            method,
            client: transport::http_client()?,
            context: None,
            result: None,
        })
    }
}

#[async_trait]
impl Task for AggregatorHost {
    async fn run(&mut self) -> anyhow::Result<()> {
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("AggregatorHost ran without dependency data"))?;
        if context.endpoint_url.is_empty() {
            anyhow::bail!("no aggregator URL configured");
        }

        let request = self
            .client
            .request(self.method.clone(), &context.endpoint_url)
            .header(
                "Authorization",
                transport::basic_auth_header(&context.credential, ""),
            );
        let body = serde_json::to_vec(&context.data)?;
        let status_code = transport::send_json(request, body).await?;

        self.result = Some(Shipment {
            url: context.endpoint_url.clone(),
            method: self.method.to_string(),
            status_code,
        });
        Ok(())
    }

    fn to_json(&self) -> Result<Vec<u8>> {
        match &self.result {
            Some(result) => Ok(serde_json::to_vec(result)?),
            None => Ok(Vec::new()),
        }
    }

    fn set_context(&mut self, context: TaskContext) {
        self.context = Some(context);
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatsdFields {
    #[serde(default = "default_statsd_address")]
    pub address: String,
    #[serde(default = "default_buffer_interval", with = "humantime_serde")]
    pub buffer_interval: Duration,
    #[serde(default)]
    pub prefix: String,
}

impl Default for StatsdFields {
    fn default() -> Self {
        Self {
            address: default_statsd_address(),
            buffer_interval: default_buffer_interval(),
            prefix: String::new(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct StatsdReport {
    address: String,
    gauges: usize,
}

/// Forwards every numeric leaf of the dependency data as a statsd gauge.
///
/// `/r/load-avg` with `Data.LoadAvg1m = 0.5` becomes `<prefix>r.load-avg.LoadAvg1m:0.5|g`.
pub struct StatsdAbsolute {
    fields: StatsdFields,
    context: Option<TaskContext>,
    result: Option<StatsdReport>,
}

impl StatsdAbsolute {
    pub fn new(fields: StatsdFields) -> Self {
        Self {
            fields,
            context: None,
            result: None,
        }
    }
}

#[async_trait]
impl Task for StatsdAbsolute {
    async fn run(&mut self) -> anyhow::Result<()> {
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("StatsdAbsolute ran without dependency data"))?;
        let client = context
            .statsd
            .client(self.fields.buffer_interval, &self.fields.address)?;

        let mut gauges = Vec::new();
        for (path, envelope) in &context.data {
            let Some(data) = envelope.get("Data") else {
                continue;
            };
            let key = path.trim_matches('/').replace('/', ".");
            flatten(&key, data, &mut gauges);
        }

        for (key, value) in &gauges {
            client.gauge(&format!("{}{}", self.fields.prefix, key), *value);
        }
        self.result = Some(StatsdReport {
            address: client.address().to_string(),
            gauges: gauges.len(),
        });
        Ok(())
    }

    fn to_json(&self) -> Result<Vec<u8>> {
        match &self.result {
            Some(result) => Ok(serde_json::to_vec(result)?),
            None => Ok(Vec::new()),
        }
    }

    fn set_context(&mut self, context: TaskContext) {
        self.context = Some(context);
    }
}

/// Collect numeric leaves of `value` under `.`-joined keys
pub fn flatten(prefix: &str, value: &Value, out: &mut Vec<(String, f64)>) {
    let join = |key: &str| {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}.{}", prefix, key)
        }
    };

    match value {
        Value::Number(n) => {
            if let Some(v) = n.as_f64() {
                out.push((prefix.to_string(), v));
            }
        }
        Value::Object(map) => {
            for (key, child) in map {
                flatten(&join(key), child, out);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                flatten(&join(&i.to_string()), child, out);
            }
        }
        _ => {}
    }
}

fn default_method() -> String {
    "POST".to_string()
}

fn default_statsd_address() -> String {
    "localhost:8125".to_string()
}

fn default_buffer_interval() -> Duration {
    Duration::from_secs(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Host;
    use crate::statsd::StatsdRegistry;
    use crate::store::CounterStore;
    use serde_json::json;
    use std::sync::Arc;

    fn context(data: Value) -> TaskContext {
        let data = match data {
            Value::Object(map) => map.into_iter().collect(),
            _ => Default::default(),
        };
        TaskContext {
            data,
            tags: Default::default(),
            counters: Arc::new(CounterStore::new()),
            host: Host {
                name: "web1".to_string(),
                tags: Default::default(),
            },
            endpoint_url: String::new(),
            credential: String::new(),
            statsd: Arc::new(StatsdRegistry::default()),
            path: "/w/test".to_string(),
        }
    }

    #[test]
    fn test_flatten_numeric_leaves() {
        let mut out = Vec::new();
        flatten(
            "r.load",
            &json!({"One": 0.5, "Name": "x", "Cores": [1, 2], "Nested": {"Ok": true, "N": 3}}),
            &mut out,
        );
        out.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            out,
            vec![
                ("r.load.Cores.0".to_string(), 1.0),
                ("r.load.Cores.1".to_string(), 2.0),
                ("r.load.Nested.N".to_string(), 3.0),
                ("r.load.One".to_string(), 0.5),
            ]
        );
    }

    #[test]
    fn test_aggregator_suffix() {
        assert_eq!(aggregator_suffix("AggregatorHost"), Some("/api/hosts"));
        assert_eq!(aggregator_suffix("Http"), None);
    }

    #[test]
    fn test_aggregator_rejects_get() {
        let fields = AggregatorHostFields {
            method: "GET".to_string(),
        };
        assert!(matches!(
            AggregatorHost::new(fields),
            Err(AgentError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_statsd_absolute_queues_gauges() {
        let receiver = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let fields = StatsdFields {
            address: receiver.local_addr().unwrap().to_string(),
            buffer_interval: Duration::from_secs(3600),
            prefix: "web1.".to_string(),
        };
        let ctx = context(json!({"/r/load": {"Path": "/r/load", "Data": {"One": 0.5}}}));
        let statsd = Arc::clone(&ctx.statsd);

        let mut task = StatsdAbsolute::new(fields);
        task.set_context(ctx);
        task.run().await.unwrap();

        let client = statsd.client(Duration::from_secs(3600), "unused").unwrap();
        assert_eq!(client.pending(), 1);
        client.flush().await.unwrap();

        let mut buf = [0u8; 512];
        let n = receiver.recv(&mut buf).await.unwrap();
        assert_eq!(std::str::from_utf8(&buf[..n]).unwrap(), "web1.r.load.One:0.5|g");

        let report: Value = serde_json::from_slice(&task.to_json().unwrap()).unwrap();
        assert_eq!(report["Gauges"], 1);
    }

    #[tokio::test]
    async fn test_http_without_url_fails() {
        let mut task = Http::new(HttpFields::default()).unwrap();
        task.set_context(context(json!({})));
        assert!(task.run().await.is_err());
        assert!(task.to_json().unwrap().is_empty());
    }
}
