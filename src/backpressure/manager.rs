//! Bounded concurrency with a FIFO wait queue.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::error::BackpressureError;
use super::permit::Permit;

/// Fraction of `max_concurrent` at which [`BackpressureManager::is_overloaded`] trips.
pub const OVERLOAD_THRESHOLD: f64 = 0.9;

/// Configuration for the backpressure manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackpressureConfig {
    /// Maximum operations executing at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Maximum operations waiting for a slot
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// How long a queued operation may wait, in milliseconds
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,

    /// When false every acquire succeeds immediately and nothing is tracked
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_max_concurrent() -> usize {
    100
}

fn default_max_queue_size() -> usize {
    500
}

fn default_queue_timeout_ms() -> u64 {
    30_000
}

fn default_enabled() -> bool {
    true
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_queue_size: default_max_queue_size(),
            queue_timeout_ms: default_queue_timeout_ms(),
            enabled: default_enabled(),
        }
    }
}

impl BackpressureConfig {
    pub fn new(max_concurrent: usize, max_queue_size: usize, queue_timeout: Duration) -> Self {
        Self {
            max_concurrent,
            max_queue_size,
            queue_timeout_ms: queue_timeout.as_millis() as u64,
            enabled: true,
        }
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), BackpressureError> {
        if self.max_concurrent == 0 {
            return Err(BackpressureError::InvalidMaxConcurrent);
        }
        Ok(())
    }
}

/// Point-in-time view of the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackpressureStatus {
    pub current_concurrent: usize,
    pub queue_size: usize,
    /// Hard saturation: every slot is taken
    pub is_overloaded: bool,
    pub max_concurrent: usize,
    pub max_queue_size: usize,
}

/// Running totals since the manager was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackpressureStats {
    pub total_processed: u64,
    pub total_queued: u64,
    pub total_rejected: u64,
    pub total_timeouts: u64,
}

enum Wakeup {
    Admitted,
    Shutdown,
}

struct Waiter {
    ticket: u64,
    notify: oneshot::Sender<Wakeup>,
    enqueued_at: Instant,
}

struct State {
    config: BackpressureConfig,
    current: usize,
    queue: VecDeque<Waiter>,
    next_ticket: u64,
    stats: BackpressureStats,
}

impl State {
    fn issue_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn has_capacity(&self) -> bool {
        !self.config.enabled || self.current < self.config.max_concurrent
    }

    /// Hand free slots to the oldest waiters.
    fn admit_waiters(&mut self) {
        while self.has_capacity() {
            let Some(waiter) = self.queue.pop_front() else {
                break;
            };

            // A closed receiver means the waiter is gone
            if waiter.notify.send(Wakeup::Admitted).is_err() {
                continue;
            }

            self.current += 1;
            self.stats.total_processed += 1;
            trace!(
                ticket = waiter.ticket,
                waited_ms = waiter.enqueued_at.elapsed().as_millis() as u64,
                "Admitted queued request"
            );
        }
    }

    fn remove_waiter(&mut self, ticket: u64) -> bool {
        match self.queue.iter().position(|w| w.ticket == ticket) {
            Some(pos) => {
                self.queue.remove(pos);
                true
            }
            None => false,
        }
    }
}

pub(super) struct Shared {
    state: Mutex<State>,
}

impl Shared {
    pub(super) fn release_slot(&self) {
        let mut state = self.state.lock();
        state.current = state.current.saturating_sub(1);
        state.admit_waiters();
    }
}

/// Admission control bounded by a maximum concurrency.
///
/// Operations beyond `max_concurrent` wait in a FIFO queue of at most
/// `max_queue_size` entries for up to `queue_timeout`; anything beyond that is
/// shed immediately. All state lives behind one mutex, so every transition of
/// a ticket (admit, hand-off, timeout, shutdown) is decided exactly once.
///
/// Cloning is cheap and yields a handle to the same manager.
#[derive(Clone)]
pub struct BackpressureManager {
    shared: Arc<Shared>,
}

impl BackpressureManager {
    /// Create a new manager with the given configuration.
    pub fn new(config: BackpressureConfig) -> Result<Self, BackpressureError> {
        config.validate()?;

        debug!(
            max_concurrent = config.max_concurrent,
            max_queue_size = config.max_queue_size,
            queue_timeout_ms = config.queue_timeout_ms,
            enabled = config.enabled,
            "Creating backpressure manager"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    config,
                    current: 0,
                    queue: VecDeque::new(),
                    next_ticket: 0,
                    stats: BackpressureStats::default(),
                }),
            }),
        })
    }

    /// Acquire a concurrency slot, waiting in the queue if none is free.
    ///
    /// Fails immediately when the queue is full, or after `queue_timeout` if
    /// no slot was handed over in time. Dropping the returned future while it
    /// waits gives up the queue position.
    ///
    /// An elapsed deadline only takes effect once the timeout is processed
    /// under the manager lock; a release that reaches the waiter first still
    /// hands it the slot.
    pub async fn acquire(&self) -> Result<Permit, BackpressureError> {
        let (pending, timeout) = {
            let mut state = self.shared.state.lock();

            if !state.config.enabled {
                return Ok(Permit::noop());
            }

            if state.current < state.config.max_concurrent {
                state.current += 1;
                state.stats.total_processed += 1;
                let ticket = state.issue_ticket();
                trace!(ticket = ticket, current = state.current, "Admitted request");
                return Ok(Permit::new(self.shared.clone(), ticket));
            }

            if state.queue.len() >= state.config.max_queue_size {
                state.stats.total_rejected += 1;
                let err = BackpressureError::QueueFull {
                    current: state.current,
                    queued: state.queue.len(),
                    max_queue: state.config.max_queue_size,
                };
                drop(state);
                warn!(error = %err, "Shedding request, queue full");
                return Err(err);
            }

            let ticket = state.issue_ticket();
            let (tx, rx) = oneshot::channel();
            state.queue.push_back(Waiter {
                ticket,
                notify: tx,
                enqueued_at: Instant::now(),
            });
            state.stats.total_queued += 1;

            debug!(
                ticket = ticket,
                queue_size = state.queue.len(),
                "Request queued for a concurrency slot"
            );

            let pending = PendingTicket {
                shared: self.shared.clone(),
                ticket,
                rx,
                settled: false,
            };
            (pending, state.config.queue_timeout())
        };

        pending.wait(timeout).await
    }

    /// Acquire a slot only if one is free right now. Never queues.
    pub fn try_acquire(&self) -> Option<Permit> {
        let mut state = self.shared.state.lock();

        if !state.config.enabled {
            return Some(Permit::noop());
        }

        if state.current < state.config.max_concurrent {
            state.current += 1;
            state.stats.total_processed += 1;
            let ticket = state.issue_ticket();
            return Some(Permit::new(self.shared.clone(), ticket));
        }

        None
    }

    /// Current concurrency and queue depth. Reports zero while disabled.
    pub fn status(&self) -> BackpressureStatus {
        let state = self.shared.state.lock();
        let (current, queued) = if state.config.enabled {
            (state.current, state.queue.len())
        } else {
            (0, 0)
        };

        BackpressureStatus {
            current_concurrent: current,
            queue_size: queued,
            is_overloaded: state.config.enabled && current >= state.config.max_concurrent,
            max_concurrent: state.config.max_concurrent,
            max_queue_size: state.config.max_queue_size,
        }
    }

    pub fn stats(&self) -> BackpressureStats {
        self.shared.state.lock().stats
    }

    /// Soft overload signal: true from 90% of `max_concurrent` upwards.
    pub fn is_overloaded(&self) -> bool {
        self.load_factor() >= OVERLOAD_THRESHOLD
    }

    /// `current_concurrent / max_concurrent`.
    pub fn load_factor(&self) -> f64 {
        let state = self.shared.state.lock();
        if !state.config.enabled {
            return 0.0;
        }
        state.current as f64 / state.config.max_concurrent as f64
    }

    /// Reject every queued waiter with [`BackpressureError::Shutdown`].
    ///
    /// Admitted operations keep their slots. Returns the number of waiters rejected.
    pub fn clear_queue(&self) -> usize {
        let mut state = self.shared.state.lock();
        let waiters: Vec<Waiter> = state.queue.drain(..).collect();
        state.stats.total_rejected += waiters.len() as u64;
        drop(state);

        let cleared = waiters.len();
        for waiter in waiters {
            let _ = waiter.notify.send(Wakeup::Shutdown);
        }

        if cleared > 0 {
            info!(cleared = cleared, "Cleared backpressure queue");
        }
        cleared
    }

    pub fn config(&self) -> BackpressureConfig {
        self.shared.state.lock().config.clone()
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.state.lock().config.enabled
    }

    /// Replace the configuration without disturbing admitted operations.
    ///
    /// Lowering `max_concurrent` only throttles future admissions. Raising it,
    /// or disabling the manager, admits queued waiters right away.
    pub fn update_config(&self, config: BackpressureConfig) -> Result<(), BackpressureError> {
        config.validate()?;

        let mut state = self.shared.state.lock();
        info!(
            max_concurrent = config.max_concurrent,
            max_queue_size = config.max_queue_size,
            queue_timeout_ms = config.queue_timeout_ms,
            enabled = config.enabled,
            "Backpressure configuration updated"
        );
        state.config = config;
        state.admit_waiters();
        Ok(())
    }

    pub fn set_enabled(&self, enabled: bool) {
        let mut state = self.shared.state.lock();
        if state.config.enabled != enabled {
            info!(enabled = enabled, "Backpressure toggled");
        }
        state.config.enabled = enabled;
        state.admit_waiters();
    }
}

impl std::fmt::Debug for BackpressureManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackpressureManager")
            .field("status", &self.status())
            .finish()
    }
}

/// A queued acquire. Removes its own ticket if dropped before it settles.
struct PendingTicket {
    shared: Arc<Shared>,
    ticket: u64,
    rx: oneshot::Receiver<Wakeup>,
    settled: bool,
}

impl PendingTicket {
    async fn wait(mut self, timeout: Duration) -> Result<Permit, BackpressureError> {
        let outcome = tokio::time::timeout(timeout, &mut self.rx).await;
        self.settled = true;

        match outcome {
            Ok(Ok(wakeup)) => self.resolve(wakeup),
            Ok(Err(_)) => Err(BackpressureError::Shutdown),
            Err(_) => self.expire(timeout),
        }
    }

    fn resolve(&self, wakeup: Wakeup) -> Result<Permit, BackpressureError> {
        match wakeup {
            Wakeup::Admitted => Ok(Permit::new(self.shared.clone(), self.ticket)),
            Wakeup::Shutdown => Err(BackpressureError::Shutdown),
        }
    }

    fn expire(&mut self, timeout: Duration) -> Result<Permit, BackpressureError> {
        let mut state = self.shared.state.lock();
        if state.remove_waiter(self.ticket) {
            state.stats.total_timeouts += 1;
            drop(state);
            warn!(
                ticket = self.ticket,
                timeout_ms = timeout.as_millis() as u64,
                "Timed out waiting for a concurrency slot"
            );
            return Err(BackpressureError::QueueTimeout { timeout });
        }
        drop(state);

        // A release or clear_queue dequeued us first and its outcome stands
        match self.rx.try_recv() {
            Ok(wakeup) => self.resolve(wakeup),
            Err(_) => Err(BackpressureError::Shutdown),
        }
    }
}

impl Drop for PendingTicket {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        let removed = self.shared.state.lock().remove_waiter(self.ticket);
        if removed {
            trace!(ticket = self.ticket, "Queued request abandoned");
            return;
        }

        // Handed a slot that nobody will use
        if let Ok(Wakeup::Admitted) = self.rx.try_recv() {
            self.shared.release_slot();
        }
    }
}
