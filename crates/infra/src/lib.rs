//! # Chime Infra
//!
//! Runtime infrastructure for the chime timer engine: the due-time tracker,
//! the bounded timeout worker pool, and the [`TimerService`] that couples
//! timer state transitions to transaction outcomes.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod scheduling;

// Re-export commonly used items
pub use scheduling::{SchedulerError, SchedulerResult, TimerService, TimerServiceConfig};
