//! Error types for the synthesis engine.
//!
//! Each concern gets its own enum; `EngineError` collects them for callers
//! that drive whole episodes or batches.

use std::time::Duration;

/// Failures of a single oracle call.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    /// The Claude client reported an error
    #[error("Claude API error: {0}")]
    Client(#[from] claude::Error),

    /// The call did not finish within its hard timeout
    #[error("Oracle call timed out after {0:?}")]
    Timeout(Duration),

    /// The backend could not serve the request (transient)
    #[error("Oracle unavailable: {0}")]
    Unavailable(String),

    /// The request itself was rejected (not worth retrying)
    #[error("Oracle rejected request: {0}")]
    Rejected(String),

    /// Every attempt allowed by the retry policy failed
    #[error("Oracle gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<OracleError>,
    },
}

impl OracleError {
    /// Whether another attempt of the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            OracleError::Client(e) => e.is_retryable(),
            OracleError::Timeout(_) | OracleError::Unavailable(_) => true,
            OracleError::Rejected(_) | OracleError::Exhausted { .. } => false,
        }
    }
}

/// Failures of the persisted fact-graph cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

/// Failures of the dataset sink.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Dataset file is not a JSON array: {0}")]
    InvalidFormat(String),
}

/// Invalid configuration values.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Umbrella error for engine entry points.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Result alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability_follows_client_classification() {
        let transient: OracleError = claude::Error::Api {
            status: 503,
            message: "overloaded".into(),
        }
        .into();
        assert!(transient.is_retryable());

        let fatal: OracleError = claude::Error::NoApiKey.into();
        assert!(!fatal.is_retryable());
    }

    #[test]
    fn test_exhausted_is_terminal() {
        let err = OracleError::Exhausted {
            attempts: 5,
            last: Box::new(OracleError::Timeout(Duration::from_secs(1))),
        };
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("5 attempts"));
    }
}
