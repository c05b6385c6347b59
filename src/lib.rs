//! Floodgate - In-process Admission Control
//!
//! This crate decides whether operations may proceed. It combines a per-key
//! sliding-window rate limiter with a global concurrency limiter that queues
//! overflow up to a bound and sheds load beyond it. All state is process-local
//! and in memory.

pub mod admission;
pub mod backpressure;
pub mod config;
pub mod error;
pub mod ratelimit;
