//! Per-key sliding window log.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Timestamps of admitted requests for one key, oldest first.
///
/// An entry is expired once it is at least `window` old, so the window is
/// open at its lower bound: `(now - window, now]`.
#[derive(Debug, Default, Clone)]
pub struct WindowLog {
    entries: VecDeque<Instant>,
}

impl WindowLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every entry that has fallen out of the window.
    pub fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.entries.front() {
            if is_expired(oldest, now, window) {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Count entries still inside the window without mutating the log.
    pub fn live_count(&self, now: Instant, window: Duration) -> usize {
        self.entries
            .iter()
            .filter(|&&ts| !is_expired(ts, now, window))
            .count()
    }

    /// Record an admitted request.
    pub fn record(&mut self, now: Instant) {
        self.entries.push_back(now);
    }

    /// The oldest retained entry.
    pub fn oldest(&self) -> Option<Instant> {
        self.entries.front().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_expired(ts: Instant, now: Instant, window: Duration) -> bool {
    now.saturating_duration_since(ts) >= window
}
