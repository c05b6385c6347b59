//! Release handle for an admitted operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::trace;

use super::manager::Shared;

/// Handle to a concurrency slot held by an admitted operation.
///
/// The slot is returned on the first call to [`release`](Permit::release) or
/// when the permit is dropped, whichever comes first. Later calls are no-ops,
/// so a permit may be released from both a success path and a cleanup path.
pub struct Permit {
    /// `None` for pass-through permits handed out while the manager is disabled
    shared: Option<Arc<Shared>>,
    ticket: u64,
    released: AtomicBool,
}

impl Permit {
    pub(super) fn new(shared: Arc<Shared>, ticket: u64) -> Self {
        Self {
            shared: Some(shared),
            ticket,
            released: AtomicBool::new(false),
        }
    }

    pub(super) fn noop() -> Self {
        Self {
            shared: None,
            ticket: 0,
            released: AtomicBool::new(false),
        }
    }

    /// Return the slot to the manager. Only the first call has any effect.
    pub fn release(&self) {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        if let Some(ref shared) = self.shared {
            trace!(ticket = self.ticket, "Releasing concurrency slot");
            shared.release_slot();
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Whether this permit holds a counted slot (false when backpressure is disabled).
    pub fn is_tracked(&self) -> bool {
        self.shared.is_some()
    }

    /// Admission ticket id, unique per manager. Zero for untracked permits.
    pub fn ticket(&self) -> u64 {
        self.ticket
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("ticket", &self.ticket)
            .field("tracked", &self.is_tracked())
            .field("released", &self.is_released())
            .finish()
    }
}
