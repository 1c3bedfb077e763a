//! Timer service: creation, cancellation, and timeout dispatch.
//!
//! The service bridges persisted timer records to the due-time tracker and
//! the worker pool. Every state transition that depends on a transaction
//! outcome (scheduling a freshly created timer, finalizing or undoing a
//! cancellation) goes through a transaction synchronization registered at
//! most once per (timer, transaction).
//!
//! Timeout execution runs on blocking worker threads, never on the tracker
//! task. Each fire begins its own transaction when the service is
//! configured transactional, invokes the application callback, and decides
//! from the transaction status whether the attempt completed or must retry.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use chime_core::{
    TimeoutCallback, TimerStore, TransactionManager, TransactionSynchronization, TxId, TxOutcome,
    TxStatus,
};
use chime_domain::{ChimeError, Result, ScheduleExpression, TimerId, TimerRecord};

use super::error::{SchedulerError, SchedulerResult};
use super::tracker::DueTimeTracker;

/// Configuration for the timer service.
#[derive(Debug, Clone)]
pub struct TimerServiceConfig {
    /// Additional timeout attempts after a rolled-back first attempt.
    pub retry_attempts: u32,
    /// Maximum timeout callbacks executing concurrently.
    pub worker_pool_size: usize,
    /// Whether timeout callbacks run inside a container-managed transaction.
    pub transacted: bool,
    /// Timeout for stopping the due-time tracker.
    pub stop_timeout: Duration,
}

impl Default for TimerServiceConfig {
    fn default() -> Self {
        Self {
            retry_attempts: 1,
            worker_pool_size: 8,
            transacted: true,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Transient state of a live timer, owned by the service and never
/// persisted.
struct LiveTimer {
    record: TimerRecord,
    /// Wall-clock arming generation; stale tracker entries are ignored.
    generation: u64,
    /// Created inside a transaction that has not committed yet.
    pending_commit: bool,
    /// Cancelled inside a transaction that has not committed yet.
    pending_cancel: bool,
    /// Transaction a completion callback is already registered with.
    sync_registered_for: Option<TxId>,
}

struct ServiceInner {
    deployment_id: String,
    store: Arc<dyn TimerStore>,
    tx: Arc<dyn TransactionManager>,
    callback: Arc<dyn TimeoutCallback>,
    config: TimerServiceConfig,
    live: DashMap<TimerId, LiveTimer>,
    workers: Arc<Semaphore>,
    tracker: RwLock<Option<DueTimeTracker>>,
    next_generation: AtomicU64,
}

/// Applies a timer's commit/rollback-conditional transition when its
/// transaction completes.
struct TimerCompletion {
    inner: Arc<ServiceInner>,
    timer_id: TimerId,
}

impl TransactionSynchronization for TimerCompletion {
    fn after_completion(&self, outcome: TxOutcome) {
        self.inner.complete_transition(self.timer_id, outcome);
    }
}

/// Calendar-aware timer service.
///
/// Construct with explicit collaborators (store, transaction manager,
/// timeout callback); the service itself never reaches into ambient global
/// state.
pub struct TimerService {
    inner: Arc<ServiceInner>,
    cancellation: Mutex<CancellationToken>,
}

impl TimerService {
    pub fn new(
        deployment_id: impl Into<String>,
        store: Arc<dyn TimerStore>,
        tx: Arc<dyn TransactionManager>,
        callback: Arc<dyn TimeoutCallback>,
        config: TimerServiceConfig,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.worker_pool_size));
        Self {
            inner: Arc::new(ServiceInner {
                deployment_id: deployment_id.into(),
                store,
                tx,
                callback,
                config,
                live: DashMap::new(),
                workers,
                tracker: RwLock::new(None),
                next_generation: AtomicU64::new(1),
            }),
            cancellation: Mutex::new(CancellationToken::new()),
        }
    }

    /// Start the service: spawn the due-time tracker and schedule every
    /// persisted timer of this deployment.
    #[instrument(skip(self), fields(deployment = %self.inner.deployment_id))]
    pub async fn start(&self) -> SchedulerResult<()> {
        if self.is_running() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        *self.cancellation.lock() = cancel.clone();

        let dispatcher = self.inner.clone();
        let tracker = DueTimeTracker::spawn(move |timer_id| dispatcher.dispatch(timer_id), cancel);
        *self.inner.tracker.write() = Some(tracker);

        let records = self
            .inner
            .store
            .load_timers(&self.inner.deployment_id)
            .map_err(|err| SchedulerError::Store(err.to_string()))?;
        let mut scheduled = 0usize;
        for record in records {
            let Some(due) = record.next_expiration else { continue };
            let timer_id = record.id;
            let generation = self.inner.next_generation();
            self.inner.live.insert(
                timer_id,
                LiveTimer {
                    record,
                    generation,
                    pending_commit: false,
                    pending_cancel: false,
                    sync_registered_for: None,
                },
            );
            self.inner.arm(timer_id, generation, due);
            scheduled += 1;
        }

        info!(scheduled, "timer service started");
        Ok(())
    }

    /// Stop the service: cancel the tracker and drop all live timer state.
    /// Persisted records are left in the store; in-flight timeout
    /// executions run to completion.
    #[instrument(skip(self), fields(deployment = %self.inner.deployment_id))]
    pub async fn stop(&self) -> SchedulerResult<()> {
        let Some(tracker) = self.inner.tracker.write().take() else {
            return Err(SchedulerError::NotRunning);
        };
        self.cancellation.lock().cancel();
        tracker
            .join(self.inner.config.stop_timeout)
            .await
            .map_err(SchedulerError::TaskJoinFailed)?;
        self.inner.live.clear();
        info!("timer service stopped");
        Ok(())
    }

    /// True while the due-time tracker is installed.
    pub fn is_running(&self) -> bool {
        self.inner.tracker.read().is_some()
    }

    pub fn deployment_id(&self) -> &str {
        &self.inner.deployment_id
    }

    /// Create a timer that fires once at `expiration`.
    pub fn create_single_action_timer(
        &self,
        primary_key: Option<String>,
        timeout_method: impl Into<String>,
        expiration: DateTime<Utc>,
        info: Option<serde_json::Value>,
    ) -> Result<TimerId> {
        let record = TimerRecord::single_action(
            self.inner.store.allocate_id(),
            &self.inner.deployment_id,
            primary_key,
            timeout_method,
            expiration,
            info,
        );
        self.register_new_timer(record)
    }

    /// Create a timer that fires once, `delay` from now.
    pub fn create_single_action_timer_in(
        &self,
        primary_key: Option<String>,
        timeout_method: impl Into<String>,
        delay: Duration,
        info: Option<serde_json::Value>,
    ) -> Result<TimerId> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|_| ChimeError::InvalidInput("delay out of range".into()))?;
        self.create_single_action_timer(primary_key, timeout_method, Utc::now() + delay, info)
    }

    /// Create a timer that fires at `initial_expiration` and then at a fixed
    /// period.
    pub fn create_interval_timer(
        &self,
        primary_key: Option<String>,
        timeout_method: impl Into<String>,
        initial_expiration: DateTime<Utc>,
        period: Duration,
        info: Option<serde_json::Value>,
    ) -> Result<TimerId> {
        let record = TimerRecord::interval(
            self.inner.store.allocate_id(),
            &self.inner.deployment_id,
            primary_key,
            timeout_method,
            initial_expiration,
            period,
            info,
        )?;
        self.register_new_timer(record)
    }

    /// Create a calendar timer. A malformed expression is rejected
    /// immediately with the full per-field diagnostics; an expression whose
    /// window already passed is stored but never scheduled.
    pub fn create_calendar_timer(
        &self,
        primary_key: Option<String>,
        timeout_method: impl Into<String>,
        expression: &ScheduleExpression,
        auto_created: bool,
        info: Option<serde_json::Value>,
    ) -> Result<TimerId> {
        let schedule = expression.parse()?;
        let record = TimerRecord::calendar(
            self.inner.store.allocate_id(),
            &self.inner.deployment_id,
            primary_key,
            timeout_method,
            schedule,
            auto_created,
            info,
            Utc::now(),
        );
        if record.next_expiration.is_none() {
            warn!(timer = %record.id, "calendar timer has no upcoming fire time");
        }
        self.register_new_timer(record)
    }

    /// Cancel a timer. Inside a transaction the removal is staged and the
    /// wall-clock task is cancelled eagerly; a rollback restores both.
    pub fn cancel_timer(&self, timer_id: TimerId) -> Result<()> {
        let inner = &self.inner;
        inner.cancel_task(timer_id);

        let Some(mut live) = inner.live.get_mut(&timer_id) else {
            // Not live (service stopped or timer never armed); still honor
            // the store removal.
            return match inner.store.get_timer(&inner.deployment_id, timer_id)? {
                Some(_) => {
                    inner.store.remove_timer(timer_id)?;
                    Ok(())
                }
                None => Err(ChimeError::NotFound(format!("timer {timer_id}"))),
            };
        };

        live.pending_cancel = true;
        inner.store.remove_timer(timer_id)?;
        let coupled = inner.couple_to_transaction(timer_id, &mut live);
        drop(live);
        if !coupled {
            inner.live.remove(&timer_id);
        }
        info!(timer = %timer_id, "timer cancelled");
        Ok(())
    }

    /// One active timer of this deployment.
    pub fn get_timer(&self, timer_id: TimerId) -> Result<Option<TimerRecord>> {
        let record = self.inner.store.get_timer(&self.inner.deployment_id, timer_id)?;
        Ok(record.filter(|record| record.next_expiration.is_some()))
    }

    /// All active timers of this deployment, as seen by the ambient
    /// transaction. Exhausted timers are filtered out.
    pub fn get_timers(&self) -> Result<Vec<TimerRecord>> {
        let records = self.inner.store.get_timers(&self.inner.deployment_id)?;
        Ok(records.into_iter().filter(|record| record.next_expiration.is_some()).collect())
    }

    /// Stage a new timer: persist it, and either couple its scheduling to
    /// the ambient transaction or arm it right away.
    fn register_new_timer(&self, record: TimerRecord) -> Result<TimerId> {
        let inner = &self.inner;
        let timer_id = record.id;
        let kind = record.kind.to_string();
        inner.store.add_timer(record.clone())?;

        let generation = inner.next_generation();
        let due = record.next_expiration;
        let mut live = LiveTimer {
            record,
            generation,
            pending_commit: true,
            pending_cancel: false,
            sync_registered_for: None,
        };
        let coupled = inner.couple_to_transaction(timer_id, &mut live);
        if !coupled {
            live.pending_commit = false;
        }
        inner.live.insert(timer_id, live);

        if !coupled {
            match due {
                Some(due) => inner.arm(timer_id, generation, due),
                None => {
                    inner.live.remove(&timer_id);
                }
            }
        }
        info!(timer = %timer_id, kind = %kind, coupled, "timer created");
        Ok(timer_id)
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("TimerService dropped while running; cancelling tracker");
            self.cancellation.lock().cancel();
        }
    }
}

impl ServiceInner {
    fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    fn arm(&self, timer_id: TimerId, generation: u64, due: DateTime<Utc>) {
        match &*self.tracker.read() {
            Some(tracker) => tracker.arm(timer_id, generation, due),
            None => debug!(timer = %timer_id, "service not started; timer will be armed at start"),
        }
    }

    fn cancel_task(&self, timer_id: TimerId) {
        if let Some(tracker) = &*self.tracker.read() {
            tracker.cancel(timer_id);
        }
    }

    /// Register the completion callback for this timer on the ambient
    /// transaction, once per (timer, transaction). Returns false when there
    /// is no usable transaction; the caller then applies the transition
    /// immediately, as on the no-transaction path.
    fn couple_to_transaction(self: &Arc<Self>, timer_id: TimerId, live: &mut LiveTimer) -> bool {
        if !matches!(self.tx.status(), TxStatus::Active | TxStatus::MarkedRollback) {
            return false;
        }
        let Some(tx_id) = self.tx.current() else {
            return false;
        };
        if live.sync_registered_for == Some(tx_id) {
            return true;
        }
        let sync = Arc::new(TimerCompletion { inner: self.clone(), timer_id });
        match self.tx.register_synchronization(sync) {
            Ok(()) => {
                live.sync_registered_for = Some(tx_id);
                true
            }
            Err(err) => {
                warn!(
                    timer = %timer_id,
                    error = %err,
                    "synchronization registration failed; applying transition immediately"
                );
                false
            }
        }
    }

    /// Commit/rollback-conditional transitions: a committed creation arms
    /// the timer, a rolled-back creation erases it, a committed
    /// cancellation stays removed, and a rolled-back cancellation restores
    /// the pre-cancel state.
    fn complete_transition(&self, timer_id: TimerId, outcome: TxOutcome) {
        let Some(mut live) = self.live.get_mut(&timer_id) else {
            return;
        };
        live.sync_registered_for = None;

        match outcome {
            TxOutcome::Committed => {
                if live.pending_cancel {
                    drop(live);
                    self.live.remove(&timer_id);
                    debug!(timer = %timer_id, "cancellation committed");
                } else if live.pending_commit {
                    live.pending_commit = false;
                    let generation = self.next_generation();
                    live.generation = generation;
                    let due = live.record.next_expiration;
                    drop(live);
                    match due {
                        Some(due) => {
                            debug!(timer = %timer_id, "creation committed; scheduling");
                            self.arm(timer_id, generation, due);
                        }
                        None => {
                            self.live.remove(&timer_id);
                        }
                    }
                }
            }
            TxOutcome::RolledBack => {
                if live.pending_commit {
                    // The staged insert is already gone; the timer never
                    // existed.
                    drop(live);
                    self.live.remove(&timer_id);
                    debug!(timer = %timer_id, "creation rolled back");
                } else if live.pending_cancel {
                    live.pending_cancel = false;
                    let generation = self.next_generation();
                    live.generation = generation;
                    let record = live.record.clone();
                    drop(live);
                    debug!(timer = %timer_id, "cancellation rolled back; restoring");
                    if let Err(err) = self.store.add_timer(record.clone()) {
                        warn!(timer = %timer_id, error = %err, "could not restore cancelled timer");
                    }
                    if let Some(due) = record.next_expiration {
                        self.arm(timer_id, generation, due);
                    }
                }
            }
        }
    }

    /// Runs on the tracker task when a timer comes due: hand the timeout to
    /// the worker pool. Never executes the callback inline.
    fn dispatch(self: &Arc<Self>, timer_id: TimerId) {
        let record = {
            let Some(live) = self.live.get(&timer_id) else { return };
            if live.pending_cancel || live.pending_commit {
                return;
            }
            live.record.clone()
        };

        match self.workers.clone().try_acquire_owned() {
            Ok(permit) => {
                let inner = self.clone();
                tokio::task::spawn_blocking(move || {
                    inner.execute_timeout(record);
                    drop(permit);
                });
            }
            Err(_) => {
                // Scheduling rejection: the timer stays in the store and is
                // only picked up again by a reload.
                warn!(timer = %timer_id, "worker pool exhausted; timeout dispatch rejected");
            }
        }
    }

    /// The timeout attempt loop. Runs on a blocking worker thread.
    fn execute_timeout(self: &Arc<Self>, record: TimerRecord) {
        let timer_id = record.id;
        let transacted = self.config.transacted;
        let attempts = self.config.retry_attempts + 1;
        let mut completed = false;

        for attempt in 1..=attempts {
            if transacted {
                if let Err(err) = self.tx.begin() {
                    error!(timer = %timer_id, error = %err, "could not begin timeout transaction");
                    break;
                }
            }

            let invocation = catch_unwind(AssertUnwindSafe(|| self.callback.invoke(&record)));
            let callback_err = match invocation {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err.to_string()),
                Err(_) => Some("timeout callback panicked".to_string()),
            };
            if let Some(err) = &callback_err {
                // An error from a timeout does not necessarily mean failure;
                // for transacted timers the transaction status decides
                // whether this attempt retries.
                warn!(timer = %timer_id, attempt, error = %err, "timeout callback failed");
            }

            if !transacted {
                if callback_err.is_none() {
                    completed = true;
                    break;
                }
                continue;
            }

            match self.tx.status() {
                TxStatus::Active => match self.tx.commit() {
                    Ok(()) => completed = true,
                    Err(err) => {
                        warn!(timer = %timer_id, error = %err, "timeout transaction failed to commit");
                    }
                },
                _ => {
                    if let Err(err) = self.tx.rollback() {
                        warn!(timer = %timer_id, error = %err, "timeout transaction failed to roll back");
                    }
                }
            }
            if completed {
                break;
            }
        }

        if !completed {
            warn!(timer = %timer_id, attempts, "abandoning timer after exhausting timeout attempts");
        }
        self.finalize_fire(record, completed);
    }

    /// Post-attempt bookkeeping. A single-action timer is finalized win or
    /// lose; it never fires twice. Recurring timers advance and re-arm
    /// only after the advanced record is persisted; on failure they keep
    /// their pre-fire expiration.
    fn finalize_fire(self: &Arc<Self>, mut record: TimerRecord, success: bool) {
        let timer_id = record.id;

        if record.is_one_shot() {
            if let Err(err) = self.store.remove_timer(timer_id) {
                warn!(timer = %timer_id, error = %err, "failed to remove fired single-action timer");
            }
            self.live.remove(&timer_id);
            return;
        }

        if !success {
            return;
        }

        record.advance(Utc::now());
        match record.next_expiration {
            Some(due) => {
                let generation = self.next_generation();
                {
                    let Some(mut live) = self.live.get_mut(&timer_id) else {
                        return;
                    };
                    if live.pending_cancel {
                        return;
                    }
                    live.record = record.clone();
                    live.generation = generation;
                }
                if let Err(err) = self.store.update_timer(record) {
                    error!(timer = %timer_id, error = %err, "failed to persist advanced timer");
                    return;
                }
                self.arm(timer_id, generation, due);
            }
            None => {
                // Calendar schedule exhausted.
                if let Err(err) = self.store.remove_timer(timer_id) {
                    warn!(timer = %timer_id, error = %err, "failed to remove exhausted timer");
                }
                self.live.remove(&timer_id);
            }
        }
    }
}
