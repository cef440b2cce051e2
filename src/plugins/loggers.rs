//! Log producers
//!
//! A logger owns one log buffer and keeps appending to it until shutdown. The
//! log shipper drains that buffer on the logger's interval.
//!
//! **YAML Format:**
//! ```yaml
//! path: /syslog
//! implementation: File
//! interval: 1m
//! fields:
//!   file: /var/log/syslog
//!   from_beginning: false
//!   auto_prune_length: 5000
//! ```

use crate::config::TaskConfig;
use crate::error::{AgentError, Result};
use crate::plugins::decode_fields;
use crate::store::LogBuffers;
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A long-lived producer of log lines
#[async_trait]
pub trait LogSource: Send {
    /// Name reported as `Filename` in shipments
    fn filename(&self) -> String;

    /// Per-logger prune threshold, if configured
    fn auto_prune_length(&self) -> Option<usize>;

    /// Append lines to `buffer` in `buffers` until `shutdown` fires
    async fn run_forever(
        &mut self,
        buffers: Arc<LogBuffers>,
        buffer: String,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Construct the log source named by `config.implementation`
pub fn build(config: &TaskConfig) -> Result<Box<dyn LogSource>> {
    match config.implementation.as_str() {
        "File" => Ok(Box::new(FileLogger::new(decode_fields(config)?))),
        other => Err(AgentError::config(format!(
            "no logger implementation named '{}'",
            other
        ))),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileFields {
    pub file: PathBuf,
    #[serde(default)]
    pub from_beginning: bool,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default)]
    pub auto_prune_length: Option<usize>,
}

/// Incremental reader over a growing file
#[derive(Debug)]
pub struct FileTail {
    path: PathBuf,
    position: u64,
    partial: String,
}

impl FileTail {
    /// Start at the current end of `path`, or at 0 if it does not exist yet
    pub async fn at_end(path: PathBuf) -> Self {
        let position = tokio::fs::metadata(&path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);
        Self {
            path,
            position,
            partial: String::new(),
        }
    }

    pub fn at_start(path: PathBuf) -> Self {
        Self {
            path,
            position: 0,
            partial: String::new(),
        }
    }

    /// Complete lines written since the last poll.
    ///
    /// A truncated file is read again from the start. A missing file yields nothing.
    pub async fn poll(&mut self) -> anyhow::Result<Vec<String>> {
        let len = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to stat {}", self.path.display()))
            }
        };

        if len < self.position {
            debug!(file = %self.path.display(), "File truncated, reading from start");
            self.position = 0;
            self.partial.clear();
        }
        if len == self.position {
            return Ok(Vec::new());
        }

        let mut file = tokio::fs::File::open(&self.path)
            .await
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.seek(std::io::SeekFrom::Start(self.position)).await?;
        let mut bytes = Vec::new();
        let read = file.read_to_end(&mut bytes).await?;
        self.position += read as u64;

        self.partial.push_str(&String::from_utf8_lossy(&bytes));
        let mut lines: Vec<String> = self.partial.split('\n').map(str::to_string).collect();
        self.partial = lines.pop().unwrap_or_default();
        Ok(lines
            .into_iter()
            .map(|l| l.trim_end_matches('\r').to_string())
            .filter(|l| !l.is_empty())
            .collect())
    }
}

/// Tails a file by polling
pub struct FileLogger {
    fields: FileFields,
}

impl FileLogger {
    pub fn new(fields: FileFields) -> Self {
        Self { fields }
    }
}

#[async_trait]
impl LogSource for FileLogger {
    fn filename(&self) -> String {
        self.fields.file.display().to_string()
    }

    fn auto_prune_length(&self) -> Option<usize> {
        self.fields.auto_prune_length
    }

    async fn run_forever(
        &mut self,
        buffers: Arc<LogBuffers>,
        buffer: String,
        shutdown: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut tail = if self.fields.from_beginning {
            FileTail::at_start(self.fields.file.clone())
        } else {
            FileTail::at_end(self.fields.file.clone()).await
        };

        loop {
            match tail.poll().await {
                Ok(lines) if !lines.is_empty() => buffers.extend(&buffer, lines),
                Ok(_) => {}
                Err(e) => warn!(file = %self.fields.file.display(), error = %e, "Failed to read log file"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.fields.poll_interval) => {}
                _ = shutdown.cancelled() => return Ok(()),
            }
        }
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}
