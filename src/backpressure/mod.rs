//! Global concurrency limiting with a bounded FIFO wait queue.

mod error;
mod manager;
mod permit;

pub use error::BackpressureError;
pub use manager::{
    BackpressureConfig, BackpressureManager, BackpressureStats, BackpressureStatus,
    OVERLOAD_THRESHOLD,
};
pub use permit::Permit;
