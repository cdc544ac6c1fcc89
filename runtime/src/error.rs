use std::time::Duration;

use thiserror::Error;

const TRANSIENT_MARKERS: &[&str] = &[
    "network",
    "timeout",
    "timed out",
    "connection",
    "connect",
    "reset by peer",
    "broken pipe",
    "temporarily unavailable",
    "fetch failed",
];

/// Failure of a single attempt of a remote operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OperationError {
    #[error("network error: {0}")]
    Network(String),
    #[error("operation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
    #[error("remote returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("{0}")]
    Other(String),
}

impl OperationError {
    pub fn status(status: u16, message: impl Into<String>) -> Self {
        OperationError::Status {
            status,
            message: message.into(),
        }
    }

    /// Default retry classification: network, timeout and 5xx failures are
    /// transient, 4xx are permanent. Untyped errors are classified by message.
    pub fn is_retryable(&self) -> bool {
        match self {
            OperationError::Network(_) | OperationError::Timeout(_) => true,
            OperationError::Status { status, .. } => *status >= 500,
            OperationError::Other(message) => {
                let lower = message.to_ascii_lowercase();
                TRANSIENT_MARKERS.iter().any(|marker| lower.contains(marker))
            }
        }
    }
}

/// Error surfaced by the executor and deduplicator to callers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResilienceError {
    #[error("circuit breaker open for operation {key}; retry in {}ms", .retry_after.as_millis())]
    CircuitOpen { key: String, retry_after: Duration },
    #[error("operation {key} failed after {attempts} attempt(s): {source}")]
    Failed {
        key: String,
        attempts: u32,
        #[source]
        source: OperationError,
    },
    #[error("operation {key} aborted: {message}")]
    Aborted { key: String, message: String },
}

impl ResilienceError {
    pub fn key(&self) -> &str {
        match self {
            ResilienceError::CircuitOpen { key, .. }
            | ResilienceError::Failed { key, .. }
            | ResilienceError::Aborted { key, .. } => key,
        }
    }

    pub fn operation_error(&self) -> Option<&OperationError> {
        match self {
            ResilienceError::Failed { source, .. } => Some(source),
            _ => None,
        }
    }
}
