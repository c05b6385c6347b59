//! Error types for the Floodgate admission layer.

use thiserror::Error;

pub use crate::backpressure::BackpressureError;
pub use crate::ratelimit::RateLimitError;

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate limiting errors
    #[error("Rate limit error: {0}")]
    RateLimit(#[from] RateLimitError),

    /// Backpressure errors
    #[error("Backpressure error: {0}")]
    Backpressure(#[from] BackpressureError),
}

impl From<::config::ConfigError> for FloodgateError {
    fn from(err: ::config::ConfigError) -> Self {
        FloodgateError::Config(err.to_string())
    }
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
