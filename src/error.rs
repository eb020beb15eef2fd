//! Error types for Tollgate.

use thiserror::Error;

/// Service-level errors raised while loading configuration or starting up.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors surfaced by the quota machinery during startup
    #[error("Quota error: {0}")]
    Quota(#[from] QuotaError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for TollgateError {
    fn from(err: ::config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Outcome of an admission check that did not admit the request.
///
/// This is a closed set: callers are expected to match on it exhaustively.
/// Only [`QuotaError::LimitExceeded`] should reach a client as a
/// "too many requests" response; everything else is an internal failure
/// that the limiter has already turned into a denial.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuotaError {
    /// No prior state exists for the key.
    ///
    /// Part of the public taxonomy for [`QuotaStore`](crate::store::QuotaStore)
    /// implementations that treat a missing key as an error. The bundled
    /// stores report absence as `Ok(None)`, and the controllers treat it as
    /// a first request.
    #[error("no quota state for key {key}")]
    NotFound { key: String },

    /// The store was unreachable, timed out, or failed.
    #[error("quota store error: {0}")]
    Store(String),

    /// A stored value could not be parsed into the expected state.
    #[error("corrupt quota state: {0}")]
    Decode(String),

    /// The subject has exhausted its quota for the current period.
    #[error("rate limit exceeded for subject {subject} in tier {tier}")]
    LimitExceeded { subject: String, tier: String },

    /// Concurrent writers kept winning the compare-and-swap race.
    #[error("gave up after {attempts} conflicting writes for subject {subject}")]
    Contention { subject: String, attempts: u32 },
}

impl QuotaError {
    /// Whether this error is the user-visible "quota exhausted" outcome.
    pub fn is_limit_exceeded(&self) -> bool {
        matches!(self, QuotaError::LimitExceeded { .. })
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for QuotaError {
    fn from(err: redis::RedisError) -> Self {
        QuotaError::Store(err.to_string())
    }
}

/// Result type alias for Tollgate service operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
