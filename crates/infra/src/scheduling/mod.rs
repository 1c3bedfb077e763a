//! Scheduling infrastructure for timer execution.
//!
//! Two decoupled concerns, wired together by [`TimerService`]:
//! - a due-time tracker: one tokio task popping the earliest pending fire
//!   instant, fed through a command channel
//! - a bounded blocking worker pool executing timeout callbacks, so a slow
//!   handler never delays other timers' delivery
//!
//! Timer state transitions that depend on a transaction outcome are driven
//! by transaction synchronizations; see the service module.

pub mod error;
pub mod service;

mod tracker;

pub use error::{SchedulerError, SchedulerResult};
pub use service::{TimerService, TimerServiceConfig};
