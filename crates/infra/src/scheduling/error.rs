//! Scheduler error types.

use thiserror::Error;

use chime_domain::ChimeError;

/// Scheduler-specific errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Scheduler is already running
    #[error("Timer service already running")]
    AlreadyRunning,

    /// Scheduler is not running
    #[error("Timer service not running")]
    NotRunning,

    /// Loading persisted timers failed
    #[error("Timer store error: {0}")]
    Store(String),

    /// Operation timed out
    #[error("Operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// Tracker task join failed
    #[error("Task join failed: {0}")]
    TaskJoinFailed(String),
}

impl From<SchedulerError> for ChimeError {
    fn from(err: SchedulerError) -> Self {
        ChimeError::Scheduler(err.to_string())
    }
}

/// Convenience type alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;
