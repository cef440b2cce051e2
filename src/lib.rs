//! hostward - extensible host telemetry agent
//!
//! Runs scheduled collectors, shippers, and executors on their own intervals,
//! caches every run as a JSON envelope, forwards tailed log lines to a remote
//! receiver, and answers condition queries over the cached results.

pub mod agent;
pub mod config;
pub mod error;
pub mod host;
pub mod http;
pub mod intake;
pub mod logs;
pub mod plugins;
pub mod query;
pub mod statsd;
pub mod store;
pub mod transport;

pub use agent::Agent;
pub use config::{Configs, TaskConfig, TaskKind};
pub use error::{AgentError, Result};
