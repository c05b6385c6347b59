//! Response header values for admission decisions.

use crate::ratelimit::{whole_seconds, RateLimitResult};

pub const RATELIMIT_LIMIT: &str = "RateLimit-Limit";
pub const RATELIMIT_REMAINING: &str = "RateLimit-Remaining";
pub const RATELIMIT_RESET: &str = "RateLimit-Reset";
pub const RETRY_AFTER: &str = "Retry-After";

/// A header name and its rendered value.
pub type Header = (&'static str, String);

/// `RateLimit-*` headers describing a check, plus `Retry-After` when it was rejected.
pub fn rate_limit_headers(result: &RateLimitResult) -> Vec<Header> {
    let mut headers = vec![
        (RATELIMIT_LIMIT, result.limit.to_string()),
        (RATELIMIT_REMAINING, result.remaining.to_string()),
        (RATELIMIT_RESET, whole_seconds(result.reset_after).to_string()),
    ];

    if let Some(retry_after) = result.retry_after {
        headers.push((RETRY_AFTER, retry_after.to_string()));
    }

    headers
}
