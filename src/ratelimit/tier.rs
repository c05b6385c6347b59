//! Rate limit configuration and named tier presets.
//!
//! A tier is nothing more than a pre-filled [`RateLimitConfig`]. Callers pick
//! a tier and then layer explicit [`RateLimitOverrides`] on top of it; any
//! field set in the overrides wins over the tier's value.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by rate limiter configuration and key validation.
///
/// An over-budget request is never an error; see
/// [`RateLimitResult`](super::RateLimitResult).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("max_requests must be greater than zero")]
    InvalidMaxRequests,

    #[error("window_ms must be greater than zero")]
    InvalidWindow,

    #[error("rate limit key must not be empty")]
    EmptyKey,
}

/// Configuration for a sliding-window rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum admitted requests per key within the window
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    /// Length of the trailing window in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Namespace prepended to every key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Human-readable reason reported when a request is rejected
    #[serde(default = "default_message")]
    pub message: String,
}

fn default_max_requests() -> u32 {
    100
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_key_prefix() -> String {
    "rl".to_string()
}

fn default_message() -> String {
    "Too many requests, please try again later.".to_string()
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitTier::Standard.config()
    }
}

impl RateLimitConfig {
    /// Create a configuration from explicit limits, keeping the default prefix and message.
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window_ms: window.as_millis() as u64,
            key_prefix: default_key_prefix(),
            message: default_message(),
        }
    }

    /// The preset configuration for a tier.
    pub fn from_tier(tier: RateLimitTier) -> Self {
        tier.config()
    }

    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the rejection message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Apply overrides; every field present in `overrides` replaces ours.
    pub fn with_overrides(mut self, overrides: &RateLimitOverrides) -> Self {
        if let Some(max_requests) = overrides.max_requests {
            self.max_requests = max_requests;
        }
        if let Some(window_ms) = overrides.window_ms {
            self.window_ms = window_ms;
        }
        if let Some(ref prefix) = overrides.key_prefix {
            self.key_prefix = prefix.clone();
        }
        if let Some(ref message) = overrides.message {
            self.message = message.clone();
        }
        self
    }

    /// The window as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Reject non-positive limits.
    pub fn validate(&self) -> Result<(), RateLimitError> {
        if self.max_requests == 0 {
            return Err(RateLimitError::InvalidMaxRequests);
        }
        if self.window_ms == 0 {
            return Err(RateLimitError::InvalidWindow);
        }
        Ok(())
    }

    /// Build the namespaced storage key for a caller-supplied key.
    pub(crate) fn namespaced(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.key_prefix, key)
        }
    }
}

/// Partial configuration layered on top of a tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitOverrides {
    #[serde(default)]
    pub max_requests: Option<u32>,
    #[serde(default)]
    pub window_ms: Option<u64>,
    #[serde(default)]
    pub key_prefix: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Named rate limit presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitTier {
    /// 100 requests per minute
    Standard,
    /// 30 requests per minute, for sensitive operations
    Strict,
    /// 1000 requests per minute, for cheap reads
    Relaxed,
    /// 10 requests per second
    Burst,
}

impl RateLimitTier {
    /// The preset configuration for this tier.
    pub fn config(&self) -> RateLimitConfig {
        let (max_requests, window_ms, suffix, message) = match self {
            RateLimitTier::Standard => (100, 60_000, "standard", default_message()),
            RateLimitTier::Strict => (
                30,
                60_000,
                "strict",
                "Too many requests to a sensitive endpoint, please try again later.".to_string(),
            ),
            RateLimitTier::Relaxed => (1000, 60_000, "relaxed", default_message()),
            RateLimitTier::Burst => (
                10,
                1_000,
                "burst",
                "Request burst limit exceeded, please slow down.".to_string(),
            ),
        };

        RateLimitConfig {
            max_requests,
            window_ms,
            key_prefix: format!("{}:{}", default_key_prefix(), suffix),
            message,
        }
    }
}

impl std::fmt::Display for RateLimitTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RateLimitTier::Standard => "standard",
            RateLimitTier::Strict => "strict",
            RateLimitTier::Relaxed => "relaxed",
            RateLimitTier::Burst => "burst",
        };
        write!(f, "{}", name)
    }
}
