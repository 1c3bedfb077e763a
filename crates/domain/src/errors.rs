//! Error types used throughout the timer engine.

use thiserror::Error;

use crate::schedule::ScheduleParseError;

/// Main error type for chime.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChimeError {
    /// One or more schedule fields failed to parse; carries the full
    /// per-field diagnostics.
    #[error(transparent)]
    Parse(#[from] ScheduleParseError),

    #[error("Timer store error: {0}")]
    Store(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for chime operations.
pub type Result<T> = std::result::Result<T, ChimeError>;
