//! Sliding-window log rate limiter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace};

use super::tier::{RateLimitConfig, RateLimitError, RateLimitOverrides, RateLimitTier};
use super::window::WindowLog;

/// How often idle keys are swept when no interval is given.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// Outcome of a single rate limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    /// Whether the request may proceed
    pub allowed: bool,
    /// The configured budget for the window
    pub limit: u32,
    /// Further requests permitted in the current window
    pub remaining: u32,
    /// When the oldest counted request leaves the window
    pub reset_time: DateTime<Utc>,
    /// Time from now until `reset_time`
    pub reset_after: Duration,
    /// Whole seconds until a slot frees up; only set when rejected
    pub retry_after: Option<u64>,
}

/// Counters reported by [`SlidingWindowRateLimiter::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimiterStatus {
    pub active_keys: usize,
    pub total_requests: u64,
    pub blocked_requests: u64,
}

struct LimiterState {
    config: RwLock<RateLimitConfig>,
    logs: DashMap<String, WindowLog>,
    total_requests: AtomicU64,
    blocked_requests: AtomicU64,
}

impl LimiterState {
    /// Remove every key whose log has fully expired. Returns the number removed.
    fn sweep(&self) -> usize {
        let window = self.config.read().window();
        let now = Instant::now();
        let before = self.logs.len();

        self.logs.retain(|_, log| {
            log.prune(now, window);
            !log.is_empty()
        });

        before.saturating_sub(self.logs.len())
    }
}

/// Per-key rate limiter using an exact sliding-window log.
///
/// Each key keeps the timestamps of its admitted requests. A check drops the
/// timestamps that have left the window and admits the request only if fewer
/// than `max_requests` remain. Rejected checks are not recorded.
///
/// Checks on the same key are serialized by the key map's shard lock, so
/// concurrent callers can never both observe spare budget for the last slot.
pub struct SlidingWindowRateLimiter {
    state: Arc<LimiterState>,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

impl SlidingWindowRateLimiter {
    /// Create a rate limiter with the default cleanup interval.
    ///
    /// The background sweep is only started when called from within a tokio
    /// runtime; otherwise [`cleanup_expired`](Self::cleanup_expired) can be
    /// driven by the caller.
    pub fn new(config: RateLimitConfig) -> Result<Self, RateLimitError> {
        Self::with_cleanup_interval(config, DEFAULT_CLEANUP_INTERVAL)
    }

    /// Create a rate limiter that sweeps idle keys every `interval`.
    pub fn with_cleanup_interval(
        config: RateLimitConfig,
        interval: Duration,
    ) -> Result<Self, RateLimitError> {
        config.validate()?;

        debug!(
            max_requests = config.max_requests,
            window_ms = config.window_ms,
            key_prefix = %config.key_prefix,
            "Creating sliding window rate limiter"
        );

        let state = Arc::new(LimiterState {
            config: RwLock::new(config),
            logs: DashMap::new(),
            total_requests: AtomicU64::new(0),
            blocked_requests: AtomicU64::new(0),
        });

        let cleanup = spawn_cleanup(Arc::downgrade(&state), interval);

        Ok(Self {
            state,
            cleanup: Mutex::new(cleanup),
        })
    }

    /// Create a rate limiter from a tier preset with explicit overrides applied.
    pub fn from_tier(
        tier: RateLimitTier,
        overrides: &RateLimitOverrides,
    ) -> Result<Self, RateLimitError> {
        Self::new(RateLimitConfig::from_tier(tier).with_overrides(overrides))
    }

    /// Check whether a request for `key` may proceed, recording it if so.
    pub fn check_limit(&self, key: &str) -> Result<RateLimitResult, RateLimitError> {
        if key.is_empty() {
            return Err(RateLimitError::EmptyKey);
        }

        let (storage_key, limit, window) = {
            let config = self.state.config.read();
            (config.namespaced(key), config.max_requests, config.window())
        };

        self.state.total_requests.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();

        // The entry guard holds the shard lock for the whole read-modify-write
        let mut log = self.state.logs.entry(storage_key).or_default();
        log.prune(now, window);

        if log.len() >= limit as usize {
            let oldest = log.oldest().unwrap_or(now);
            drop(log);

            self.state.blocked_requests.fetch_add(1, Ordering::Relaxed);

            let reset_after = (oldest + window).saturating_duration_since(now);
            let retry_after = whole_seconds(reset_after).max(1);

            debug!(
                key = %key,
                limit = limit,
                retry_after = retry_after,
                "Rate limit exceeded"
            );

            return Ok(RateLimitResult {
                allowed: false,
                limit,
                remaining: 0,
                reset_time: wall_clock_after(reset_after),
                reset_after,
                retry_after: Some(retry_after),
            });
        }

        log.record(now);
        let count = log.len();
        drop(log);

        let remaining = limit.saturating_sub(count as u32);
        trace!(key = %key, remaining = remaining, "Rate limit check passed");

        Ok(RateLimitResult {
            allowed: true,
            limit,
            remaining,
            reset_time: wall_clock_after(window),
            reset_after: window,
            retry_after: None,
        })
    }

    /// Remaining budget for `key` without recording a request.
    pub fn peek_limit(&self, key: &str) -> Result<u32, RateLimitError> {
        if key.is_empty() {
            return Err(RateLimitError::EmptyKey);
        }

        let (storage_key, limit, window) = {
            let config = self.state.config.read();
            (config.namespaced(key), config.max_requests, config.window())
        };

        let used = self
            .state
            .logs
            .get(&storage_key)
            .map(|log| log.live_count(Instant::now(), window))
            .unwrap_or(0);

        Ok(limit.saturating_sub(used as u32))
    }

    /// Forget everything recorded for `key`.
    pub fn reset_limit(&self, key: &str) {
        let storage_key = self.state.config.read().namespaced(key);
        if self.state.logs.remove(&storage_key).is_some() {
            debug!(key = %key, "Rate limit reset");
        }
    }

    /// Current key count and request counters.
    pub fn status(&self) -> RateLimiterStatus {
        RateLimiterStatus {
            active_keys: self.state.logs.len(),
            total_requests: self.state.total_requests.load(Ordering::Relaxed),
            blocked_requests: self.state.blocked_requests.load(Ordering::Relaxed),
        }
    }

    /// Run one sweep pass, removing keys with no live entries.
    pub fn cleanup_expired(&self) -> usize {
        self.state.sweep()
    }

    /// A copy of the active configuration.
    pub fn config(&self) -> RateLimitConfig {
        self.state.config.read().clone()
    }

    /// Replace the configuration. Recorded logs are kept and judged against the new limits.
    pub fn update_config(&self, config: RateLimitConfig) -> Result<(), RateLimitError> {
        config.validate()?;
        info!(
            max_requests = config.max_requests,
            window_ms = config.window_ms,
            "Rate limiter configuration updated"
        );
        *self.state.config.write() = config;
        Ok(())
    }

    /// Whether the background sweep task is running.
    pub fn cleanup_active(&self) -> bool {
        self.cleanup
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Stop the background sweep and drop all recorded state.
    pub fn destroy(&self) {
        if let Some(handle) = self.cleanup.lock().take() {
            handle.abort();
        }
        self.state.logs.clear();
        debug!("Rate limiter destroyed");
    }
}

impl Drop for SlidingWindowRateLimiter {
    fn drop(&mut self) {
        if let Some(handle) = self.cleanup.get_mut().take() {
            handle.abort();
        }
    }
}

/// Spawn the periodic sweep. The task only holds a weak reference, so it never
/// keeps the limiter alive.
fn spawn_cleanup(weak: Weak<LimiterState>, interval: Duration) -> Option<JoinHandle<()>> {
    let runtime = match tokio::runtime::Handle::try_current() {
        Ok(runtime) => runtime,
        Err(_) => {
            debug!("No tokio runtime available, background cleanup disabled");
            return None;
        }
    };

    Some(runtime.spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let Some(state) = weak.upgrade() else {
                break;
            };

            let removed = state.sweep();
            if removed > 0 {
                debug!(removed = removed, "Swept expired rate limit keys");
            }
        }
    }))
}

/// Round a duration up to whole seconds, at millisecond resolution.
pub fn whole_seconds(duration: Duration) -> u64 {
    let millis = duration.as_millis() as u64;
    millis.div_ceil(1000)
}

fn wall_clock_after(duration: Duration) -> DateTime<Utc> {
    let delta = chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero());
    Utc::now() + delta
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, window_ms: u64) -> SlidingWindowRateLimiter {
        let config = RateLimitConfig::new(max_requests, Duration::from_millis(window_ms));
        SlidingWindowRateLimiter::new(config).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = RateLimitConfig::new(0, Duration::from_secs(1));
        assert!(matches!(
            SlidingWindowRateLimiter::new(config),
            Err(RateLimitError::InvalidMaxRequests)
        ));
    }

    #[test]
    fn test_empty_key_rejected() {
        let limiter = limiter(5, 1000);
        assert_eq!(limiter.check_limit(""), Err(RateLimitError::EmptyKey));
        assert_eq!(limiter.peek_limit(""), Err(RateLimitError::EmptyKey));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slide() {
        let limiter = limiter(2, 100);

        assert!(limiter.check_limit("client").unwrap().allowed);
        assert!(limiter.check_limit("client").unwrap().allowed);

        let rejected = limiter.check_limit("client").unwrap();
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        assert_eq!(rejected.retry_after, Some(1));

        tokio::time::advance(Duration::from_millis(101)).await;

        assert!(limiter.check_limit("client").unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_exactly_window_old_is_expired() {
        let limiter = limiter(1, 100);

        assert!(limiter.check_limit("client").unwrap().allowed);
        tokio::time::advance(Duration::from_millis(99)).await;
        assert!(!limiter.check_limit("client").unwrap().allowed);

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(limiter.check_limit("client").unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_is_not_recorded() {
        let limiter = limiter(2, 100);

        limiter.check_limit("client").unwrap();
        tokio::time::advance(Duration::from_millis(50)).await;
        limiter.check_limit("client").unwrap();

        // Hammer the key while over budget
        for _ in 0..10 {
            assert!(!limiter.check_limit("client").unwrap().allowed);
        }

        // Only the first admission has expired, so exactly one slot frees up
        tokio::time::advance(Duration::from_millis(51)).await;
        let result = limiter.check_limit("client").unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 0);
        assert!(!limiter.check_limit("client").unwrap().allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_rounds_up() {
        let limiter = limiter(1, 2_500);

        limiter.check_limit("client").unwrap();
        tokio::time::advance(Duration::from_millis(400)).await;

        let result = limiter.check_limit("client").unwrap();
        assert!(!result.allowed);
        assert_eq!(result.reset_after, Duration::from_millis(2_100));
        assert_eq!(result.retry_after, Some(3));
    }

    #[test]
    fn test_whole_seconds() {
        assert_eq!(whole_seconds(Duration::ZERO), 0);
        assert_eq!(whole_seconds(Duration::from_millis(1)), 1);
        assert_eq!(whole_seconds(Duration::from_millis(1_000)), 1);
        assert_eq!(whole_seconds(Duration::from_millis(2_001)), 3);
        assert_eq!(whole_seconds(Duration::from_secs(3)), 3);
    }

    #[test]
    fn test_remaining_counts_down() {
        let limiter = limiter(3, 60_000);

        let first = limiter.check_limit("client").unwrap();
        assert!(first.allowed);
        assert_eq!(first.limit, 3);
        assert_eq!(first.remaining, 2);
        assert_eq!(first.retry_after, None);
        assert_eq!(first.reset_after, Duration::from_secs(60));

        assert_eq!(limiter.check_limit("client").unwrap().remaining, 1);
        assert_eq!(limiter.check_limit("client").unwrap().remaining, 0);
    }

    #[test]
    fn test_independent_keys() {
        let limiter = limiter(1, 60_000);

        assert!(limiter.check_limit("key1").unwrap().allowed);
        assert!(!limiter.check_limit("key1").unwrap().allowed);
        assert!(limiter.check_limit("key2").unwrap().allowed);
    }

    #[test]
    fn test_peek_does_not_record() {
        let limiter = limiter(3, 60_000);

        assert_eq!(limiter.peek_limit("client").unwrap(), 3);
        limiter.check_limit("client").unwrap();
        assert_eq!(limiter.peek_limit("client").unwrap(), 2);
        assert_eq!(limiter.peek_limit("client").unwrap(), 2);
        assert_eq!(limiter.status().total_requests, 1);
    }

    #[test]
    fn test_reset_limit() {
        let limiter = limiter(1, 60_000);

        limiter.check_limit("client").unwrap();
        assert!(!limiter.check_limit("client").unwrap().allowed);

        limiter.reset_limit("client");
        assert_eq!(limiter.status().active_keys, 0);
        assert!(limiter.check_limit("client").unwrap().allowed);
    }

    #[test]
    fn test_status_counts_every_check() {
        let limiter = limiter(2, 60_000);

        for _ in 0..5 {
            limiter.check_limit("a").unwrap();
        }
        limiter.check_limit("b").unwrap();

        let status = limiter.status();
        assert_eq!(status.active_keys, 2);
        assert_eq!(status.total_requests, 6);
        assert_eq!(status.blocked_requests, 3);
    }

    #[test]
    fn test_budget_holds_under_concurrency() {
        let limiter = Arc::new(limiter(10, 60_000));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..25)
                        .filter(|_| limiter.check_limit("shared").unwrap().allowed)
                        .count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 10);
        assert_eq!(limiter.status().blocked_requests, 190);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_cleanup_removes_idle_keys() {
        let limiter = limiter(5, 100);

        limiter.check_limit("idle").unwrap();
        tokio::time::advance(Duration::from_millis(60)).await;
        limiter.check_limit("active").unwrap();
        tokio::time::advance(Duration::from_millis(50)).await;

        assert_eq!(limiter.cleanup_expired(), 1);
        assert_eq!(limiter.status().active_keys, 1);
        assert_eq!(limiter.peek_limit("active").unwrap(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_cleanup_sweeps_idle_keys() {
        let config = RateLimitConfig::new(5, Duration::from_millis(50));
        let limiter =
            SlidingWindowRateLimiter::with_cleanup_interval(config, Duration::from_millis(100))
                .unwrap();
        assert!(limiter.cleanup_active());

        limiter.check_limit("idle").unwrap();
        assert_eq!(limiter.status().active_keys, 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(limiter.status().active_keys, 0);
    }

    #[tokio::test]
    async fn test_destroy_stops_cleanup() {
        let limiter = limiter(5, 1000);
        assert!(limiter.cleanup_active());

        limiter.check_limit("client").unwrap();
        limiter.destroy();

        assert!(!limiter.cleanup_active());
        assert_eq!(limiter.status().active_keys, 0);
    }

    #[test]
    fn test_no_cleanup_outside_runtime() {
        let limiter = limiter(5, 1000);
        assert!(!limiter.cleanup_active());
    }

    #[test]
    fn test_update_config() {
        let limiter = limiter(1, 60_000);

        limiter.check_limit("client").unwrap();
        assert!(!limiter.check_limit("client").unwrap().allowed);

        let mut config = limiter.config();
        config.max_requests = 2;
        limiter.update_config(config).unwrap();
        assert!(limiter.check_limit("client").unwrap().allowed);

        let mut invalid = limiter.config();
        invalid.window_ms = 0;
        assert_eq!(limiter.update_config(invalid), Err(RateLimitError::InvalidWindow));
        assert_eq!(limiter.config().max_requests, 2);
    }

    #[test]
    fn test_from_tier_with_overrides() {
        let overrides = RateLimitOverrides {
            max_requests: Some(2),
            ..Default::default()
        };
        let limiter = SlidingWindowRateLimiter::from_tier(RateLimitTier::Burst, &overrides).unwrap();

        let config = limiter.config();
        assert_eq!(config.max_requests, 2);
        assert_eq!(config.window_ms, 1_000);
    }
}
