//! Log shipping
//!
//! Buffered log lines are POSTed to `{receiver}/api/logs` as
//!
//! ```json
//! {"Loglines": ["..."], "Filename": "/var/log/syslog", "Host": {"Name": "web1", "Tags": {}}}
//! ```
//!
//! with basic auth (`access token`, empty password). A successful shipment
//! removes the shipped lines from the buffer; a failed one leaves the buffer
//! untouched for the next attempt. After every attempt the buffer is pruned
//! if it has grown past its threshold, so a receiver outage costs lines
//! instead of unbounded memory.

use crate::error::{AgentError, Result};
use crate::host::{Host, HostInfo};
use crate::store::LogBuffers;
use crate::transport;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Buffer fed by the shared TCP log intake
pub const SHARED_LOG_BUFFER: &str = "tcp";

const LOGS_API_PATH: &str = "/api/logs";

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct LogShipment<'a> {
    loglines: &'a [String],
    filename: &'a str,
    host: Host,
}

/// A shipment the receiver accepted
#[derive(Debug, Clone)]
pub struct Shipped {
    pub lines: usize,
    /// JSON body that was POSTed
    pub payload: Vec<u8>,
}

pub struct LogShipper {
    client: Client,
    url: String,
    access_token: String,
    buffers: Arc<LogBuffers>,
    host_info: Arc<dyn HostInfo>,
}

impl LogShipper {
    /// `receiver_url` is the base URL; `/api/logs` is appended
    pub fn new(
        receiver_url: &str,
        access_token: &str,
        buffers: Arc<LogBuffers>,
        host_info: Arc<dyn HostInfo>,
    ) -> Result<Self> {
        let url = if receiver_url.is_empty() {
            String::new()
        } else {
            format!("{}{}", receiver_url.trim_end_matches('/'), LOGS_API_PATH)
        };
        Ok(Self {
            client: transport::http_client()?,
            url,
            access_token: access_token.to_string(),
            buffers,
            host_info,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Ship everything currently in `buffer`, returning how many lines were sent.
    ///
    /// An empty buffer is a no-op. Lines appended while the request is in
    /// flight stay buffered for the next shipment.
    pub async fn send_log(&self, buffer: &str, filename: &str) -> Result<usize> {
        Ok(self
            .ship(buffer, filename)
            .await?
            .map_or(0, |shipped| shipped.lines))
    }

    /// Like [`LogShipper::send_log`], but hands back the accepted payload
    pub async fn ship(&self, buffer: &str, filename: &str) -> Result<Option<Shipped>> {
        let lines = self.buffers.lines(buffer);
        if lines.is_empty() {
            return Ok(None);
        }
        if self.url.is_empty() {
            return Err(AgentError::transport("no log receiver URL configured"));
        }

        let payload = serde_json::to_vec(&LogShipment {
            loglines: &lines,
            filename,
            host: self.host_info.host(),
        })?;
        let request = self.client.post(&self.url).header(
            "Authorization",
            transport::basic_auth_header(&self.access_token, ""),
        );
        transport::send_json(request, payload.clone()).await?;

        self.buffers.drain_front(buffer, lines.len());
        Ok(Some(Shipped {
            lines: lines.len(),
            payload,
        }))
    }

    /// Clear `buffer` if it holds more than `threshold` lines. A threshold of 0 disables pruning.
    pub fn prune(&self, buffer: &str, threshold: usize) -> bool {
        let len = self.buffers.len(buffer);
        if threshold == 0 || len <= threshold {
            return false;
        }
        self.buffers.clear(buffer);
        warn!(buffer, dropped = len, threshold, "Pruned log buffer");
        true
    }

    /// One shipment attempt followed by a prune pass
    pub async fn ship_and_prune(
        &self,
        buffer: &str,
        filename: &str,
        threshold: usize,
    ) -> Result<Option<Shipped>> {
        let result = self.ship(buffer, filename).await;
        self.prune(buffer, threshold);
        result
    }

    /// Ship and prune `buffer` until `shutdown` fires, pausing `interval`
    /// after each attempt. `on_shipped` sees every accepted payload.
    #[instrument(skip(self, shutdown, on_shipped), fields(url = %self.url))]
    pub async fn ship_forever<F>(
        &self,
        buffer: &str,
        filename: &str,
        interval: Duration,
        threshold: usize,
        shutdown: CancellationToken,
        on_shipped: F,
    ) where
        F: Fn(&Shipped) + Send + Sync,
    {
        info!("Starting log shipper");
        loop {
            match self.ship_and_prune(buffer, filename, threshold).await {
                Ok(None) => {}
                Ok(Some(shipped)) => {
                    debug!(sent = shipped.lines, "Shipped log lines");
                    on_shipped(&shipped);
                }
                Err(e) => warn!(error = %e, "Failed to ship log lines, will retry"),
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }
        debug!("Log shipper stopped");
    }
}
