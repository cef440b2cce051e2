//! Error taxonomy for the agent core
//!
//! Each variant maps to one failure class with its own handling policy:
//! configuration failures abort a single run, execution failures are cached
//! as error payloads, serialization failures are surfaced to the caller,
//! transport failures are retried on the next tick, and authorization
//! failures never get past the HTTP boundary.

use thiserror::Error;

/// Result alias used across the agent core
pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Unknown implementation name, malformed field, or invalid config file
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A task's run failed
    #[error("{0}")]
    Execution(String),

    /// Marshal/unmarshal failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Send failure towards a remote receiver, aggregator, or metrics endpoint
    #[error("transport error: {0}")]
    Transport(String),

    /// Bad token or disallowed network
    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_error_displays_bare_message() {
        let err = AgentError::Execution("exit status 1".to_string());
        assert_eq!(err.to_string(), "exit status 1");
    }

    #[test]
    fn test_serialization_error_from_serde() {
        let err: AgentError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, AgentError::Serialization(_)));
    }
}
