//! Port interfaces for timer persistence and timeout dispatch.
//!
//! These traits define the boundaries between the timer core and whatever
//! hosts it: a store implementation decides durability, and the timeout
//! callback is the application code a fired timer invokes.

use chime_domain::{ChimeError, TimerId, TimerRecord};
use thiserror::Error;

/// Timer store errors.
#[derive(Debug, Error)]
pub enum TimerStoreError {
    /// The persistence backend could not be reached.
    #[error("Persistence backend unavailable: {0}")]
    Unavailable(String),

    /// Registering the transaction completion callback failed while the
    /// staging view was being created.
    #[error("Failed to register transaction synchronization: {0}")]
    SynchronizationFailed(String),

    #[error("Timer {0} not found")]
    NotFound(TimerId),
}

impl From<TimerStoreError> for ChimeError {
    fn from(err: TimerStoreError) -> Self {
        match err {
            TimerStoreError::NotFound(id) => ChimeError::NotFound(format!("timer {id}")),
            other => ChimeError::Store(other.to_string()),
        }
    }
}

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, TimerStoreError>;

/// Trait for persisting timer records.
///
/// Implementations must be transaction-aware: mutations made inside an
/// active ambient transaction are visible to that transaction's own reads,
/// invisible elsewhere until commit, and discarded on rollback.
pub trait TimerStore: Send + Sync {
    /// Reserve a store-unique timer identity.
    fn allocate_id(&self) -> TimerId;

    /// Insert a new record.
    fn add_timer(&self, record: TimerRecord) -> StoreResult<()>;

    /// Overwrite an existing record (expiration advance of a recurring
    /// timer). Inserts when the record is missing.
    fn update_timer(&self, record: TimerRecord) -> StoreResult<()>;

    /// Delete a record. Removing an unknown id is not an error.
    fn remove_timer(&self, id: TimerId) -> StoreResult<()>;

    /// Fetch one record of a deployment.
    fn get_timer(&self, deployment_id: &str, id: TimerId) -> StoreResult<Option<TimerRecord>>;

    /// Fetch all records of a deployment.
    fn get_timers(&self, deployment_id: &str) -> StoreResult<Vec<TimerRecord>>;

    /// Fetch all records of a deployment at service start, before any of
    /// them are scheduled.
    fn load_timers(&self, deployment_id: &str) -> StoreResult<Vec<TimerRecord>>;
}

/// The application timeout callback.
///
/// Invoked from a worker thread with the fired timer's record; it may block
/// for arbitrarily long and may interact with the ambient transaction the
/// scheduler wrapped around it. Errors are classified by the scheduler's
/// retry policy and never propagate further.
pub trait TimeoutCallback: Send + Sync {
    fn invoke(&self, timer: &TimerRecord) -> anyhow::Result<()>;
}
