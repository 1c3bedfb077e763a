//! In-memory ambient transaction manager.
//!
//! Each manager instance tracks at most one flat transaction per thread.
//! Completion callbacks run on the completing thread, after the transaction
//! has been popped off it, so a synchronization that touches the store again
//! goes down the no-transaction path.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{TransactionManager, TransactionSynchronization, TxError, TxId, TxOutcome, TxStatus};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// (manager id, transaction id) pairs active on this thread, at most one
    /// per manager.
    static AMBIENT: RefCell<Vec<(u64, TxId)>> = const { RefCell::new(Vec::new()) };
}

struct TxState {
    status: TxStatus,
    synchronizations: Vec<Arc<dyn TransactionSynchronization>>,
}

/// Thread-ambient, flat (non-nested) transaction manager.
pub struct InMemoryTransactionManager {
    manager_id: u64,
    next_tx: AtomicU64,
    states: Mutex<HashMap<TxId, TxState>>,
}

impl InMemoryTransactionManager {
    pub fn new() -> Self {
        Self {
            manager_id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            next_tx: AtomicU64::new(1),
            states: Mutex::new(HashMap::new()),
        }
    }

    fn ambient_tx(&self) -> Option<TxId> {
        AMBIENT.with(|cell| {
            cell.borrow()
                .iter()
                .find(|(manager, _)| *manager == self.manager_id)
                .map(|(_, tx)| *tx)
        })
    }

    fn disassociate(&self, tx_id: TxId) {
        AMBIENT.with(|cell| {
            cell.borrow_mut().retain(|(manager, tx)| *manager != self.manager_id || *tx != tx_id);
        });
    }

    /// Complete the calling thread's transaction with the given outcome and
    /// drive the registered synchronizations. The transaction is popped off
    /// the thread before any synchronization runs.
    fn complete(&self, outcome: TxOutcome) -> Result<(), TxError> {
        let tx_id = self.ambient_tx().ok_or(TxError::NoActiveTransaction)?;
        let state = {
            let mut states = self.states.lock();
            match states.get(&tx_id) {
                Some(state)
                    if matches!(state.status, TxStatus::Active | TxStatus::MarkedRollback) => {}
                _ => return Err(TxError::Completing(tx_id)),
            }
            states.remove(&tx_id)
        };
        self.disassociate(tx_id);

        debug!(tx = tx_id, outcome = %outcome, "transaction completed");
        if let Some(state) = state {
            for sync in &state.synchronizations {
                sync.after_completion(outcome);
            }
        }
        Ok(())
    }
}

impl Default for InMemoryTransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager for InMemoryTransactionManager {
    fn begin(&self) -> Result<TxId, TxError> {
        if self.ambient_tx().is_some() {
            return Err(TxError::AlreadyActive);
        }
        let tx_id = self.next_tx.fetch_add(1, Ordering::Relaxed);
        self.states
            .lock()
            .insert(tx_id, TxState { status: TxStatus::Active, synchronizations: Vec::new() });
        AMBIENT.with(|cell| cell.borrow_mut().push((self.manager_id, tx_id)));
        debug!(tx = tx_id, "transaction begun");
        Ok(tx_id)
    }

    fn commit(&self) -> Result<(), TxError> {
        // A rollback-only transaction cannot commit: complete it as a
        // rollback and report that to the caller.
        match self.status() {
            TxStatus::Active => self.complete(TxOutcome::Committed),
            TxStatus::MarkedRollback => {
                self.complete(TxOutcome::RolledBack)?;
                Err(TxError::RolledBack)
            }
            _ => Err(TxError::NoActiveTransaction),
        }
    }

    fn rollback(&self) -> Result<(), TxError> {
        self.complete(TxOutcome::RolledBack)
    }

    fn set_rollback_only(&self) -> Result<(), TxError> {
        let tx_id = self.ambient_tx().ok_or(TxError::NoActiveTransaction)?;
        let mut states = self.states.lock();
        match states.get_mut(&tx_id) {
            Some(state) if matches!(state.status, TxStatus::Active | TxStatus::MarkedRollback) => {
                state.status = TxStatus::MarkedRollback;
                Ok(())
            }
            _ => Err(TxError::Completing(tx_id)),
        }
    }

    fn status(&self) -> TxStatus {
        let Some(tx_id) = self.ambient_tx() else {
            return TxStatus::NoTransaction;
        };
        self.states.lock().get(&tx_id).map_or(TxStatus::NoTransaction, |state| state.status)
    }

    fn current(&self) -> Option<TxId> {
        self.ambient_tx()
    }

    fn register_synchronization(
        &self,
        sync: Arc<dyn TransactionSynchronization>,
    ) -> Result<(), TxError> {
        let tx_id = self.ambient_tx().ok_or(TxError::NoActiveTransaction)?;
        let mut states = self.states.lock();
        match states.get_mut(&tx_id) {
            Some(state) if matches!(state.status, TxStatus::Active | TxStatus::MarkedRollback) => {
                state.synchronizations.push(sync);
                Ok(())
            }
            _ => Err(TxError::Completing(tx_id)),
        }
    }
}
