//! Error types for the Turnstile service.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum GateError {
    /// The shared counter store could not be reached or rejected the command
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// A persisted record could not be decoded
    #[error("Corrupt record at {key}: {reason}")]
    CorruptRecord { key: String, reason: String },

    /// A policy write was rejected; the stored policy is unchanged
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// No policy exists for the given identity or policy id
    #[error("Policy not found: {0}")]
    PolicyNotFound(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GateError {
    /// Whether this error comes from the backing store rather than the caller's input.
    ///
    /// The request gate applies its fail-open/fail-closed stance to these.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            GateError::StoreUnavailable(_) | GateError::CorruptRecord { .. }
        )
    }
}

#[cfg(feature = "redis-store")]
impl From<redis::RedisError> for GateError {
    fn from(err: redis::RedisError) -> Self {
        GateError::StoreUnavailable(err.to_string())
    }
}

impl From<config::ConfigError> for GateError {
    fn from(err: config::ConfigError) -> Self {
        GateError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, GateError>;
