//! Ambient transaction port.
//!
//! The store and scheduler never own a transaction implementation; they
//! consume this port. "Ambient" means the transaction, if any, is the one
//! associated with the calling thread; store operations pick it up without
//! it being passed explicitly, matching container-managed transaction
//! semantics.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use chime_domain::ChimeError;

mod memory;

pub use memory::InMemoryTransactionManager;

/// Identity of one transaction, unique per manager.
pub type TxId = u64;

/// Observable state of the ambient transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// No transaction is associated with the calling thread.
    NoTransaction,
    Active,
    /// Still active, but the only possible outcome is rollback.
    MarkedRollback,
    Committed,
    RolledBack,
}

/// How a transaction completed. Deliberately an enum rather than a boolean
/// so heuristic outcomes can be added without touching every synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Committed,
    RolledBack,
}

impl fmt::Display for TxOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxOutcome::Committed => f.write_str("committed"),
            TxOutcome::RolledBack => f.write_str("rolled-back"),
        }
    }
}

/// Callback delivered exactly once when the transaction it was registered
/// with completes. Runs on the completing thread, after the transaction has
/// been disassociated from it.
pub trait TransactionSynchronization: Send + Sync {
    fn after_completion(&self, outcome: TxOutcome);
}

/// Transaction port errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error("No active transaction on this thread")]
    NoActiveTransaction,

    #[error("A transaction is already active on this thread")]
    AlreadyActive,

    #[error("Transaction {0} is no longer accepting work")]
    Completing(TxId),

    #[error("Transaction was marked rollback-only and has been rolled back")]
    RolledBack,
}

impl From<TxError> for ChimeError {
    fn from(err: TxError) -> Self {
        ChimeError::Transaction(err.to_string())
    }
}

/// The ambient transaction collaborator.
///
/// `begin`/`commit`/`rollback` associate and disassociate a transaction with
/// the calling thread; `current` and `status` observe it; synchronizations
/// hook its completion.
pub trait TransactionManager: Send + Sync {
    /// Start a transaction on the calling thread.
    fn begin(&self) -> Result<TxId, TxError>;

    /// Commit the calling thread's transaction. A transaction marked
    /// rollback-only is rolled back instead and the call fails with
    /// [`TxError::RolledBack`].
    fn commit(&self) -> Result<(), TxError>;

    /// Roll back the calling thread's transaction.
    fn rollback(&self) -> Result<(), TxError>;

    /// Mark the calling thread's transaction so it can only roll back.
    fn set_rollback_only(&self) -> Result<(), TxError>;

    /// Status of the calling thread's transaction.
    fn status(&self) -> TxStatus;

    /// Identity of the calling thread's transaction, if one is active.
    fn current(&self) -> Option<TxId>;

    /// Register a completion callback on the calling thread's transaction.
    /// Fails when there is none or it is already completing.
    fn register_synchronization(
        &self,
        sync: Arc<dyn TransactionSynchronization>,
    ) -> Result<(), TxError>;
}
