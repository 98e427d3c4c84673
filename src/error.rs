//! Error taxonomy for fetch attempts and runs

use std::time::Duration;
use thiserror::Error;

/// Failure of a single request routed through a proxy.
///
/// Every variant counts against the endpoint that carried the request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("could not build client for proxy: {0}")]
    Client(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("bot challenge served (HTTP {0})")]
    Challenge(u16),
}

impl TransportError {
    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(timeout)
        } else if let Some(status) = err.status() {
            TransportError::Status(status.as_u16())
        } else {
            TransportError::Connect(err.to_string())
        }
    }
}

/// Why a task ended without a payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("no proxy available in the pool")]
    NoProxyAvailable,
    #[error("transport failure via {proxy}: {source}")]
    Transport {
        proxy: String,
        #[source]
        source: TransportError,
    },
    #[error("stopped before attempt {attempt}")]
    Cancelled { attempt: u32 },
    #[error("fetch worker panicked")]
    WorkerPanicked,
}

impl FetchError {
    /// Whether another attempt with a different proxy may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transport { .. })
    }
}

/// Errors that abort a whole run before any task is attempted
#[derive(Debug, Error)]
pub enum RunError {
    #[error("proxy pool still empty after waiting {0:?}; no tasks were attempted")]
    NoInitialProxies(Duration),
}

/// Errors loading the location task list
#[derive(Debug, Error)]
pub enum TaskLoadError {
    #[error("failed to read task file: {0}")]
    Io(#[from] std::io::Error),
    #[error("task file is not a JSON array of objects: {0}")]
    Json(#[from] serde_json::Error),
    #[error("task #{index} has no usable `{field}` value")]
    MissingKey { index: usize, field: String },
    #[error("duplicate task key `{0}`")]
    DuplicateKey(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transport_errors_are_retryable() {
        let transport = FetchError::Transport {
            proxy: "http://10.0.0.1:80".into(),
            source: TransportError::Status(503),
        };
        assert!(transport.is_retryable());
        assert!(!FetchError::NoProxyAvailable.is_retryable());
        assert!(!FetchError::Cancelled { attempt: 1 }.is_retryable());
    }

    #[test]
    fn test_error_messages_name_the_proxy() {
        let err = FetchError::Transport {
            proxy: "http://10.0.0.1:80".into(),
            source: TransportError::Challenge(403),
        };
        assert_eq!(
            err.to_string(),
            "transport failure via http://10.0.0.1:80: bot challenge served (HTTP 403)"
        );
    }
}
