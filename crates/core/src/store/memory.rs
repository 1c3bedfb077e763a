//! Transactional in-memory timer store.
//!
//! The durable map is the committed source of truth and is safe for
//! concurrent insert/delete. Every operation performed inside an active
//! ambient transaction goes through a per-transaction staging view: a
//! snapshot of the durable map overlaid with pending adds and removes. The
//! view is merged into the durable map when its transaction commits and
//! discarded on any other outcome, so concurrent transactions never observe
//! each other's uncommitted work.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use chime_domain::{TimerId, TimerRecord};

use crate::ports::{StoreResult, TimerStore};
use crate::tx::{TransactionManager, TransactionSynchronization, TxId, TxOutcome, TxStatus};

/// One transaction's private overlay of the durable map.
///
/// `tasks` is what the transaction reads; `pending_add` and `pending_remove`
/// are what commit will replay against the durable map. Adds and removes
/// cross-cancel: removing a pending add drops the add instead of staging a
/// delete, and re-adding a pending-removed id drops the remove.
struct StoreView {
    tasks: HashMap<TimerId, TimerRecord>,
    pending_add: HashMap<TimerId, TimerRecord>,
    pending_remove: HashSet<TimerId>,
}

impl StoreView {
    fn add(&mut self, record: TimerRecord) {
        self.pending_remove.remove(&record.id);
        self.tasks.insert(record.id, record.clone());
        self.pending_add.insert(record.id, record);
    }

    fn remove(&mut self, id: TimerId) {
        self.tasks.remove(&id);
        if self.pending_add.remove(&id).is_none() {
            self.pending_remove.insert(id);
        }
    }
}

struct StoreInner {
    tx: Arc<dyn TransactionManager>,
    timers: DashMap<TimerId, TimerRecord>,
    views: Mutex<HashMap<TxId, Arc<Mutex<StoreView>>>>,
    next_id: AtomicU64,
}

/// Merges or discards one staging view when its transaction completes.
struct ViewCompletion {
    inner: Arc<StoreInner>,
    tx_id: TxId,
}

impl TransactionSynchronization for ViewCompletion {
    fn after_completion(&self, outcome: TxOutcome) {
        let view = self.inner.views.lock().remove(&self.tx_id);
        let Some(view) = view else { return };
        if outcome != TxOutcome::Committed {
            debug!(tx = self.tx_id, "discarded staged timer changes");
            return;
        }
        let view = view.lock();
        for (id, record) in &view.pending_add {
            self.inner.timers.insert(*id, record.clone());
        }
        for id in &view.pending_remove {
            self.inner.timers.remove(id);
        }
        debug!(
            tx = self.tx_id,
            added = view.pending_add.len(),
            removed = view.pending_remove.len(),
            "merged staged timer changes"
        );
    }
}

/// In-memory [`TimerStore`] with per-transaction staging.
pub struct MemoryTimerStore {
    inner: Arc<StoreInner>,
}

impl MemoryTimerStore {
    pub fn new(tx: Arc<dyn TransactionManager>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                tx,
                timers: DashMap::new(),
                views: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// The staging view of the calling thread's transaction, created lazily.
    ///
    /// Returns `None` outside a usable transaction, including when the
    /// completion callback cannot be registered any more, in which case the
    /// operation degrades to the direct path as if no transaction were
    /// present.
    fn view(&self) -> Option<Arc<Mutex<StoreView>>> {
        let tx_id = self.inner.tx.current()?;
        if !matches!(self.inner.tx.status(), TxStatus::Active | TxStatus::MarkedRollback) {
            return None;
        }

        let mut views = self.inner.views.lock();
        if let Some(view) = views.get(&tx_id) {
            return Some(view.clone());
        }

        let snapshot: HashMap<TimerId, TimerRecord> =
            self.inner.timers.iter().map(|entry| (*entry.key(), entry.value().clone())).collect();
        let view = Arc::new(Mutex::new(StoreView {
            tasks: snapshot,
            pending_add: HashMap::new(),
            pending_remove: HashSet::new(),
        }));

        let completion = Arc::new(ViewCompletion { inner: self.inner.clone(), tx_id });
        match self.inner.tx.register_synchronization(completion) {
            Ok(()) => {
                views.insert(tx_id, view.clone());
                Some(view)
            }
            Err(err) => {
                warn!(tx = tx_id, error = %err, "synchronization registration failed; applying changes directly");
                None
            }
        }
    }
}

impl TimerStore for MemoryTimerStore {
    fn allocate_id(&self) -> TimerId {
        TimerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn add_timer(&self, record: TimerRecord) -> StoreResult<()> {
        match self.view() {
            Some(view) => view.lock().add(record),
            None => {
                self.inner.timers.insert(record.id, record);
            }
        }
        Ok(())
    }

    fn update_timer(&self, record: TimerRecord) -> StoreResult<()> {
        self.add_timer(record)
    }

    fn remove_timer(&self, id: TimerId) -> StoreResult<()> {
        match self.view() {
            Some(view) => view.lock().remove(id),
            None => {
                self.inner.timers.remove(&id);
            }
        }
        Ok(())
    }

    fn get_timer(&self, deployment_id: &str, id: TimerId) -> StoreResult<Option<TimerRecord>> {
        let record = match self.view() {
            Some(view) => view.lock().tasks.get(&id).cloned(),
            None => self.inner.timers.get(&id).map(|entry| entry.value().clone()),
        };
        Ok(record.filter(|record| record.deployment_id == deployment_id))
    }

    fn get_timers(&self, deployment_id: &str) -> StoreResult<Vec<TimerRecord>> {
        let records = match self.view() {
            Some(view) => view
                .lock()
                .tasks
                .values()
                .filter(|record| record.deployment_id == deployment_id)
                .cloned()
                .collect(),
            None => self
                .inner
                .timers
                .iter()
                .filter(|entry| entry.value().deployment_id == deployment_id)
                .map(|entry| entry.value().clone())
                .collect(),
        };
        Ok(records)
    }

    fn load_timers(&self, deployment_id: &str) -> StoreResult<Vec<TimerRecord>> {
        self.get_timers(deployment_id)
    }
}
