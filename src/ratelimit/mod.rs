//! Per-key rate limiting over a trailing time window.

mod limiter;
mod tier;
mod window;

pub use limiter::{
    whole_seconds, RateLimitResult, RateLimiterStatus, SlidingWindowRateLimiter,
    DEFAULT_CLEANUP_INTERVAL,
};
pub use tier::{RateLimitConfig, RateLimitError, RateLimitOverrides, RateLimitTier};
pub use window::WindowLog;
