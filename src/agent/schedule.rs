//! Perpetual task loops and their supervision

use super::Agent;
use crate::config::TaskConfig;
use crate::error::AgentError;
use crate::logs::{LogShipper, Shipped, SHARED_LOG_BUFFER};
use crate::plugins::loggers;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Handle to a single scheduled task loop
pub struct ScheduledTask {
    path: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Stop the loop after its current run
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the loop to exit
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            warn!(path = %self.path, error = %e, "Scheduled task panicked");
        }
    }
}

/// Owns every loop started by [`Agent::run_all_forever`]
pub struct Supervisor {
    token: CancellationToken,
    tasks: JoinSet<()>,
}

impl Supervisor {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            tasks: JoinSet::new(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Supervise an extra future, such as the HTTP facade
    pub fn spawn<F>(&mut self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(future);
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Cancel every loop and wait for all of them to exit
    pub async fn shutdown(mut self) {
        info!(loops = self.tasks.len(), "Shutting down");
        self.token.cancel();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Supervised loop panicked");
            }
        }
        info!("All loops stopped");
    }
}

impl Agent {
    /// Run `config` forever on its interval until cancelled
    pub fn schedule(&self, config: TaskConfig) -> ScheduledTask {
        let token = self.shutdown.child_token();
        let path = config.path_with_prefix();
        let handle = tokio::spawn(self.clone().run_forever(config, token.clone()));
        ScheduledTask {
            path,
            token,
            handle,
        }
    }

    #[instrument(skip(self, config, token), fields(path = %config.path, kind = %config.kind))]
    async fn run_forever(self, config: TaskConfig, token: CancellationToken) {
        debug!(interval = %config.interval_string(), "Starting task loop");
        loop {
            // execute logs failures with full task context
            if let Err(AgentError::Configuration(e)) = self.execute(&config).await {
                debug!(error = %e, "Task cannot be constructed, retrying next tick");
            }

            tokio::select! {
                _ = tokio::time::sleep(config.interval) => {}
                _ = token.cancelled() => break,
            }
        }
        debug!("Task loop stopped");
    }

    /// Start every configured loop and return their supervisor.
    ///
    /// One loop per collector, shipper, and executor; a producer and a shipper
    /// per logger; the shared log buffer shipper; the cache janitor; and the
    /// optional intake listeners.
    pub async fn run_all_forever(&self) -> crate::error::Result<Supervisor> {
        let mut supervisor = Supervisor::new(self.shutdown.clone());
        let general = &self.configs.general;

        for config in self.configs.scheduled() {
            supervisor.spawn(
                self.clone()
                    .run_forever(config.clone(), self.shutdown.child_token()),
            );
        }

        for config in &self.configs.loggers {
            if let Err(e) = self.spawn_logger(&mut supervisor, config) {
                error!(
                    path = %config.path,
                    implementation = %config.implementation,
                    error = %e,
                    "Skipping logger"
                );
            }
        }

        let shipper = Arc::new(LogShipper::new(
            &general.aggregator.url,
            &general.aggregator.access_token,
            Arc::clone(&self.log_buffers),
            self.host_info.clone(),
        )?);
        let filename = general
            .log_receiver
            .intake_addr
            .as_deref()
            .map(|addr| format!("tcp://{}", addr))
            .unwrap_or_else(|| SHARED_LOG_BUFFER.to_string());
        let interval = general.log_receiver.ship_interval;
        let threshold = general.log_receiver.auto_prune_length;
        let token = self.shutdown.child_token();
        supervisor.spawn(async move {
            shipper
                .ship_forever(SHARED_LOG_BUFFER, &filename, interval, threshold, token, |_| {})
                .await
        });

        supervisor.spawn(self.clone().purge_cache_forever(self.shutdown.child_token()));

        if let Some(addr) = &general.log_receiver.intake_addr {
            let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
            info!(addr = %addr, "Accepting log lines");
            supervisor.spawn(crate::intake::serve_log_intake(
                listener,
                Arc::clone(&self.log_buffers),
                SHARED_LOG_BUFFER.to_string(),
                self.shutdown.child_token(),
            ));
        }

        if let Some(addr) = &general.graphite.listen_addr {
            let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
            info!(addr = %addr, "Accepting graphite metrics");
            supervisor.spawn(crate::intake::serve_graphite_intake(
                listener,
                Arc::clone(&self.metrics),
                self.shutdown.child_token(),
            ));
        }

        info!(loops = supervisor.len(), "Agent running");
        Ok(supervisor)
    }

    fn spawn_logger(
        &self,
        supervisor: &mut Supervisor,
        config: &TaskConfig,
    ) -> crate::error::Result<()> {
        let mut source = loggers::build(config)?;
        let buffer = config.path_with_prefix();
        let filename = source.filename();
        let threshold = source
            .auto_prune_length()
            .unwrap_or(self.configs.general.log_receiver.auto_prune_length);
        let interval = config.interval;

        let (url, credential) = super::resolve_endpoint(config, &self.configs.general.aggregator);
        let shipper = LogShipper::new(
            &url,
            &credential,
            Arc::clone(&self.log_buffers),
            self.host_info.clone(),
        )?;

        let buffers = Arc::clone(&self.log_buffers);
        let producer_buffer = buffer.clone();
        let producer_token = self.shutdown.child_token();
        supervisor.spawn(async move {
            if let Err(e) = source
                .run_forever(buffers, producer_buffer.clone(), producer_token)
                .await
            {
                error!(buffer = %producer_buffer, error = %e, "Log producer stopped");
            }
        });

        let agent = self.clone();
        let run_config = config.clone();
        let record = move |shipped: &Shipped| {
            if let Err(e) = agent.save_run(&run_config, &shipped.payload) {
                warn!(path = %run_config.path, error = %e, "Failed to cache log shipment");
            }
        };
        let token = self.shutdown.child_token();
        supervisor.spawn(async move {
            shipper
                .ship_forever(&buffer, &filename, interval, threshold, token, record)
                .await
        });
        Ok(())
    }

    /// Drop expired cache entries once per TTL
    async fn purge_cache_forever(self, token: CancellationToken) {
        let period = self.cache.default_ttl().max(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {
                    let purged = self.cache.purge_expired();
                    if purged > 0 {
                        debug!(purged, "Purged expired results");
                    }
                }
                _ = token.cancelled() => break,
            }
        }
    }
}
