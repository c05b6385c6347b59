//! Composition of concurrency limiting and per-key rate limiting.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::headers::{rate_limit_headers, Header, RETRY_AFTER};
use crate::backpressure::{
    BackpressureError, BackpressureManager, BackpressureStats, BackpressureStatus, Permit,
};
use crate::config::FloodgateConfig;
use crate::error::Result;
use crate::ratelimit::{
    whole_seconds, RateLimitError, RateLimitResult, RateLimiterStatus, SlidingWindowRateLimiter,
};

/// Machine code reported when a rate limit check rejects a request.
pub const RATE_LIMITED_CODE: &str = "RATE_LIMIT_EXCEEDED";

/// Why a request was not admitted.
#[derive(Error, Debug)]
pub enum Rejection {
    /// A key exhausted its budget in one of the key spaces
    #[error("{message}")]
    RateLimited {
        space: String,
        message: String,
        result: RateLimitResult,
    },

    /// No concurrency slot could be obtained
    #[error("{error}")]
    Overloaded {
        error: BackpressureError,
        retry_after: u64,
    },

    /// The caller supplied an unusable key
    #[error("invalid key for key space '{space}': {source}")]
    InvalidKey {
        space: String,
        #[source]
        source: RateLimitError,
    },
}

impl Rejection {
    /// HTTP status for this rejection.
    pub fn status_code(&self) -> u16 {
        match self {
            Rejection::RateLimited { .. } => 429,
            Rejection::Overloaded { error, .. } => error.status_code(),
            Rejection::InvalidKey { .. } => 400,
        }
    }

    /// Machine-readable code for this rejection.
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::RateLimited { .. } => RATE_LIMITED_CODE,
            Rejection::Overloaded { error, .. } => error.code(),
            Rejection::InvalidKey { .. } => "INVALID_KEY",
        }
    }

    /// Headers the transport should attach to the error response.
    pub fn headers(&self) -> Vec<Header> {
        match self {
            Rejection::RateLimited { result, .. } => rate_limit_headers(result),
            Rejection::Overloaded { retry_after, .. } => {
                vec![(RETRY_AFTER, retry_after.to_string())]
            }
            Rejection::InvalidKey { .. } => Vec::new(),
        }
    }
}

/// A request that passed admission. Holds its concurrency slot until released or dropped.
#[derive(Debug)]
pub struct Admission {
    permit: Permit,
    checks: Vec<(String, RateLimitResult)>,
}

impl Admission {
    /// Give the concurrency slot back. Safe to call more than once.
    pub fn release(&self) {
        self.permit.release();
    }

    pub fn permit(&self) -> &Permit {
        &self.permit
    }

    /// Rate limit results per key space, in check order.
    pub fn checks(&self) -> &[(String, RateLimitResult)] {
        &self.checks
    }

    /// Informational headers from the check with the least remaining budget.
    pub fn headers(&self) -> Vec<Header> {
        self.checks
            .iter()
            .min_by_key(|(_, result)| result.remaining)
            .map(|(_, result)| rate_limit_headers(result))
            .unwrap_or_default()
    }
}

/// Snapshot of every component behind the controller.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionStatus {
    pub backpressure: BackpressureStatus,
    pub backpressure_stats: BackpressureStats,
    pub rate_limiters: BTreeMap<String, RateLimiterStatus>,
}

/// Admits operations by first taking a concurrency slot and then checking
/// each requested key space's rate limiter in turn.
pub struct AdmissionController {
    backpressure: BackpressureManager,
    limiters: BTreeMap<String, Arc<SlidingWindowRateLimiter>>,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("limiters", &self.limiters.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl AdmissionController {
    /// Create a controller with no rate limit key spaces.
    pub fn new(backpressure: BackpressureManager) -> Self {
        Self {
            backpressure,
            limiters: BTreeMap::new(),
        }
    }

    /// Register a rate limiter under a key space name.
    pub fn with_limiter(
        mut self,
        space: impl Into<String>,
        limiter: Arc<SlidingWindowRateLimiter>,
    ) -> Self {
        self.limiters.insert(space.into(), limiter);
        self
    }

    /// Build the backpressure manager and one limiter per configured key space.
    pub fn from_config(config: &FloodgateConfig) -> Result<Self> {
        let mut controller = Self::new(BackpressureManager::new(config.backpressure.clone())?);
        let interval = config.rate_limiting.cleanup_interval();

        for (name, space) in &config.rate_limiting.key_spaces {
            let limiter = SlidingWindowRateLimiter::with_cleanup_interval(space.resolve(), interval)?;
            controller = controller.with_limiter(name.clone(), Arc::new(limiter));
        }

        info!(
            key_spaces = ?controller.limiters.keys().collect::<Vec<_>>(),
            max_concurrent = config.backpressure.max_concurrent,
            "Admission controller initialized"
        );

        Ok(controller)
    }

    pub fn backpressure(&self) -> &BackpressureManager {
        &self.backpressure
    }

    pub fn limiter(&self, space: &str) -> Option<&Arc<SlidingWindowRateLimiter>> {
        self.limiters.get(space)
    }

    /// Admit an operation identified by `(key space, key)` pairs.
    ///
    /// The slot is taken before any rate limit is consulted and is given back
    /// as soon as any check rejects. Unknown key spaces are skipped.
    pub async fn admit(&self, keys: &[(&str, &str)]) -> std::result::Result<Admission, Rejection> {
        let permit = self.backpressure.acquire().await.map_err(|error| {
            let retry_after = whole_seconds(self.backpressure.config().queue_timeout()).max(1);
            Rejection::Overloaded { error, retry_after }
        })?;

        let mut checks = Vec::with_capacity(keys.len());

        for &(space, key) in keys {
            let Some(limiter) = self.limiters.get(space) else {
                warn!(space = %space, "Unknown rate limit key space, skipping check");
                continue;
            };

            let result = match limiter.check_limit(key) {
                Ok(result) => result,
                Err(source) => {
                    permit.release();
                    return Err(Rejection::InvalidKey {
                        space: space.to_string(),
                        source,
                    });
                }
            };

            if !result.allowed {
                permit.release();
                debug!(
                    space = %space,
                    key = %key,
                    retry_after = ?result.retry_after,
                    "Request rejected by rate limit"
                );
                return Err(Rejection::RateLimited {
                    space: space.to_string(),
                    message: limiter.config().message,
                    result,
                });
            }

            checks.push((space.to_string(), result));
        }

        Ok(Admission { permit, checks })
    }

    /// Run `operation` under admission. The slot is released however the
    /// operation ends, including when this future is dropped.
    pub async fn run<F, T>(
        &self,
        keys: &[(&str, &str)],
        operation: F,
    ) -> std::result::Result<T, Rejection>
    where
        F: Future<Output = T>,
    {
        let admission = self.admit(keys).await?;
        let output = operation.await;
        admission.release();
        Ok(output)
    }

    pub fn status(&self) -> AdmissionStatus {
        AdmissionStatus {
            backpressure: self.backpressure.status(),
            backpressure_stats: self.backpressure.stats(),
            rate_limiters: self
                .limiters
                .iter()
                .map(|(name, limiter)| (name.clone(), limiter.status()))
                .collect(),
        }
    }

    /// Reject queued waiters and stop every limiter's background sweep.
    pub fn shutdown(&self) {
        let cleared = self.backpressure.clear_queue();
        for limiter in self.limiters.values() {
            limiter.destroy();
        }
        info!(cleared = cleared, "Admission controller shut down");
    }
}
