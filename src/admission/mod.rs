//! Admission layer composing backpressure with per-key rate limits.
//!
//! A request first takes a concurrency slot from the
//! [`BackpressureManager`](crate::backpressure::BackpressureManager), then is
//! checked against each requested key space. The slot is released exactly
//! once, whether the request is rejected, completes, or is abandoned.

mod controller;
pub mod headers;

pub use controller::{Admission, AdmissionController, AdmissionStatus, Rejection, RATE_LIMITED_CODE};
