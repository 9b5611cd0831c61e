//! Error types for the cache

use std::time::Duration;

use thiserror::Error;

/// Main error type for the cache
#[derive(Error, Debug)]
pub enum Error {
    /// Cache store error
    #[error("Cache store error: {0}")]
    Store(#[from] StoreError),

    /// Backend query failure
    #[error("{0}")]
    Backend(#[from] BackendQueryFailure),

    /// Distributed lock error
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// The inbound query could not be interpreted
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Cache store errors
///
/// Always contained by the caller: reads degrade to a miss, writes are logged
/// and dropped.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Could not reach the store
    #[error("Connection error: {0}")]
    Connection(String),

    /// The store did not answer within the configured timeout
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// The store rejected a command
    #[error("Command failed: {0}")]
    Command(String),

    /// A cached payload could not be decoded
    #[error("Corrupted entry {key}: {reason}")]
    Corrupted { key: String, reason: String },
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() {
            StoreError::Connection(e.to_string())
        } else if e.is_timeout() {
            StoreError::Command(format!("timeout: {}", e))
        } else {
            StoreError::Command(e.to_string())
        }
    }
}

/// Backend TSDB failures
///
/// Non-success responses and transport failures are both folded into this
/// type so callers only ever handle one failure shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendQueryFailure {
    /// The backend answered with a non-success status
    #[error("KairosDB responded {status}: {message}")]
    Status { status: u16, message: String },

    /// The backend could not be reached
    #[error("Could not connect to KairosDB: {0}")]
    Connection(String),

    /// The backend answered with something we could not decode
    #[error("Malformed KairosDB response: {0}")]
    Malformed(String),
}

impl BackendQueryFailure {
    /// HTTP status to report for this failure (0 when the backend never answered)
    pub fn status_code(&self) -> u16 {
        match self {
            BackendQueryFailure::Status { status, .. } => *status,
            BackendQueryFailure::Connection(_) => 0,
            BackendQueryFailure::Malformed(_) => 502,
        }
    }
}

/// Distributed lock errors
#[derive(Error, Debug, Clone)]
pub enum LockError {
    /// The store backing the lock failed
    #[error("Lock backend error: {0}")]
    Backend(#[from] StoreError),

    /// The lease was no longer held by us at release time
    #[error("Lease {0} is not held by this instance")]
    NotHeld(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
