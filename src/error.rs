// Error types module

use std::fmt;

/// Centralized error type for the engine
///
/// Only startup and offline paths surface these. The per-query path
/// logs and swallows every failure instead.
#[derive(Debug, Clone)]
pub enum QueryLensError {
    /// Configuration errors (invalid YAML, bad regex, out-of-range values)
    Config(String),

    /// Log store failures (permission denied, disk full, lock timeout)
    Storage(String),

    /// Alert channel setup or delivery failures
    Alert(String),

    /// Unexpected internal errors
    Internal(String),
}

impl fmt::Display for QueryLensError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryLensError::Config(msg) => write!(f, "Configuration error: {}", msg),
            QueryLensError::Storage(msg) => write!(f, "Storage error: {}", msg),
            QueryLensError::Alert(msg) => write!(f, "Alert error: {}", msg),
            QueryLensError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for QueryLensError {}

impl From<crate::store::StoreError> for QueryLensError {
    fn from(err: crate::store::StoreError) -> Self {
        QueryLensError::Storage(err.to_string())
    }
}

impl From<crate::alert::AlertError> for QueryLensError {
    fn from(err: crate::alert::AlertError) -> Self {
        QueryLensError::Alert(err.to_string())
    }
}
