//! Integration tests for the timer service.
//!
//! These tests run the full stack (service, due-time tracker, worker pool,
//! transactional store, and ambient transaction manager) against real
//! wall-clock time, with deliberately generous margins.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use chime_core::{
    InMemoryTransactionManager, MemoryTimerStore, TimeoutCallback, TimerStore, TransactionManager,
};
use chime_domain::{ScheduleExpression, TimerRecord};
use chime_infra::{SchedulerError, TimerService, TimerServiceConfig};

#[derive(Clone, Copy)]
enum CallbackMode {
    Succeed,
    /// Fail but leave the transaction alone.
    Fail,
    /// Fail and mark the ambient transaction rollback-only.
    FailAndMarkRollback,
}

struct TestCallback {
    count: AtomicUsize,
    mode: CallbackMode,
    tm: Arc<InMemoryTransactionManager>,
}

impl TestCallback {
    fn new(mode: CallbackMode, tm: Arc<InMemoryTransactionManager>) -> Arc<Self> {
        Arc::new(Self { count: AtomicUsize::new(0), mode, tm })
    }

    fn invocations(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl TimeoutCallback for TestCallback {
    fn invoke(&self, _timer: &TimerRecord) -> anyhow::Result<()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        match self.mode {
            CallbackMode::Succeed => Ok(()),
            CallbackMode::Fail => Err(anyhow!("timeout handler failed")),
            CallbackMode::FailAndMarkRollback => {
                let _ = self.tm.set_rollback_only();
                Err(anyhow!("timeout handler failed and poisoned the transaction"))
            }
        }
    }
}

struct Fixture {
    tm: Arc<InMemoryTransactionManager>,
    store: Arc<MemoryTimerStore>,
    callback: Arc<TestCallback>,
    service: Arc<TimerService>,
}

fn fixture(mode: CallbackMode, config: TimerServiceConfig) -> Fixture {
    let _ = tracing_subscriber::fmt().with_env_filter("info").with_test_writer().try_init();
    let tm = Arc::new(InMemoryTransactionManager::new());
    let store = Arc::new(MemoryTimerStore::new(tm.clone()));
    let callback = TestCallback::new(mode, tm.clone());
    let service = Arc::new(TimerService::new(
        "app",
        store.clone(),
        tm.clone(),
        callback.clone(),
        config,
    ));
    Fixture { tm, store, callback, service }
}

fn in_ms(ms: i64) -> chrono::DateTime<Utc> {
    Utc::now() + chrono::Duration::milliseconds(ms)
}

#[tokio::test(flavor = "multi_thread")]
async fn single_action_timer_fires_once_and_is_removed() {
    let f = fixture(CallbackMode::Succeed, TimerServiceConfig::default());
    f.service.start().await.expect("start");

    f.service
        .create_single_action_timer(None, "on_timeout", in_ms(100), None)
        .expect("create");
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(f.callback.invocations(), 1);
    assert!(f.service.get_timers().expect("get").is_empty());
    assert!(f.store.get_timers("app").expect("store read").is_empty());

    f.service.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn interval_timer_advances_and_repeats() {
    let f = fixture(CallbackMode::Succeed, TimerServiceConfig::default());
    f.service.start().await.expect("start");

    let initial = in_ms(100);
    let id = f
        .service
        .create_interval_timer(None, "on_timeout", initial, Duration::from_millis(150), None)
        .expect("create");
    tokio::time::sleep(Duration::from_millis(700)).await;

    let fired = f.callback.invocations();
    assert!((2..=6).contains(&fired), "unexpected fire count {fired}");

    // The persisted record has advanced past its initial expiration.
    let record = f.service.get_timer(id).expect("get").expect("still present");
    assert!(record.next_expiration.expect("recurring") > initial);

    f.service.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn calendar_timer_fires_on_schedule() {
    let f = fixture(CallbackMode::Succeed, TimerServiceConfig::default());
    f.service.start().await.expect("start");

    // Every second.
    let expr = ScheduleExpression::new().hour("*").minute("*").second("*");
    f.service
        .create_calendar_timer(None, "on_timeout", &expr, false, None)
        .expect("create");
    tokio::time::sleep(Duration::from_millis(2_500)).await;

    let fired = f.callback.invocations();
    assert!((1..=4).contains(&fired), "unexpected fire count {fired}");

    f.service.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_calendar_expression_is_rejected_with_field_map() {
    let f = fixture(CallbackMode::Succeed, TimerServiceConfig::default());
    let expr = ScheduleExpression::new().hour("25").minute("61");
    let err = f
        .service
        .create_calendar_timer(None, "on_timeout", &expr, false, None)
        .expect_err("must fail");
    let chime_domain::ChimeError::Parse(parse) = err else {
        panic!("expected parse error, got {err}");
    };
    assert_eq!(parse.errors.len(), 2);
    assert!(f.store.get_timers("app").expect("store read").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn creation_commits_with_its_transaction() {
    let f = fixture(CallbackMode::Succeed, TimerServiceConfig::default());
    f.service.start().await.expect("start");

    let (tm, service) = (f.tm.clone(), f.service.clone());
    tokio::task::spawn_blocking(move || {
        tm.begin().expect("begin");
        service
            .create_single_action_timer(None, "on_timeout", in_ms(200), None)
            .expect("create");
        // Own reads see the staged record.
        assert_eq!(service.get_timers().expect("get").len(), 1);
        tm.commit().expect("commit");
    })
    .await
    .expect("tx task");

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(f.callback.invocations(), 1);

    f.service.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn rolled_back_creation_never_schedules() {
    let f = fixture(CallbackMode::Succeed, TimerServiceConfig::default());
    f.service.start().await.expect("start");

    let (tm, service) = (f.tm.clone(), f.service.clone());
    tokio::task::spawn_blocking(move || {
        tm.begin().expect("begin");
        service
            .create_single_action_timer(None, "on_timeout", in_ms(100), None)
            .expect("create");
        tm.rollback().expect("rollback");
    })
    .await
    .expect("tx task");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(f.callback.invocations(), 0);

    // Verified from a non-participating thread: no durable trace.
    let store = f.store.clone();
    let seen = thread::spawn(move || store.get_timers("app").expect("store read").len())
        .join()
        .expect("observer");
    assert_eq!(seen, 0);

    f.service.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn rolled_back_cancellation_restores_the_timer() {
    let f = fixture(CallbackMode::Succeed, TimerServiceConfig::default());
    f.service.start().await.expect("start");

    let id = f
        .service
        .create_single_action_timer(None, "on_timeout", in_ms(400), None)
        .expect("create");

    let (tm, service) = (f.tm.clone(), f.service.clone());
    tokio::task::spawn_blocking(move || {
        tm.begin().expect("begin");
        service.cancel_timer(id).expect("cancel");
        assert!(service.get_timers().expect("get").is_empty());
        tm.rollback().expect("rollback");
        // The pre-cancel record is back, original expiration included.
        let restored = service.get_timer(id).expect("get").expect("restored");
        assert_eq!(restored.id, id);
    })
    .await
    .expect("tx task");

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_eq!(f.callback.invocations(), 1, "restored timer must still fire");

    f.service.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn committed_cancellation_stays_removed() {
    let f = fixture(CallbackMode::Succeed, TimerServiceConfig::default());
    f.service.start().await.expect("start");

    let id = f
        .service
        .create_single_action_timer(None, "on_timeout", in_ms(200), None)
        .expect("create");

    let (tm, service) = (f.tm.clone(), f.service.clone());
    tokio::task::spawn_blocking(move || {
        tm.begin().expect("begin");
        service.cancel_timer(id).expect("cancel");
        tm.commit().expect("commit");
    })
    .await
    .expect("tx task");

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(f.callback.invocations(), 0);
    assert!(f.store.get_timers("app").expect("store read").is_empty());

    f.service.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn rollback_marking_callback_exhausts_the_retry_budget() {
    let config = TimerServiceConfig { retry_attempts: 2, ..Default::default() };
    let f = fixture(CallbackMode::FailAndMarkRollback, config);
    f.service.start().await.expect("start");

    f.service
        .create_single_action_timer(None, "on_timeout", in_ms(50), None)
        .expect("create");
    tokio::time::sleep(Duration::from_millis(800)).await;

    // retry_attempts + 1 total attempts, then the one-shot timer is
    // finalized as removed even though every attempt failed.
    assert_eq!(f.callback.invocations(), 3);
    assert!(f.store.get_timers("app").expect("store read").is_empty());

    f.service.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn abandoned_recurring_timer_keeps_its_pre_fire_expiration() {
    let config = TimerServiceConfig { retry_attempts: 1, ..Default::default() };
    let f = fixture(CallbackMode::FailAndMarkRollback, config);
    f.service.start().await.expect("start");

    let initial = in_ms(50);
    let id = f
        .service
        .create_interval_timer(None, "on_timeout", initial, Duration::from_secs(3600), None)
        .expect("create");
    tokio::time::sleep(Duration::from_millis(800)).await;

    assert_eq!(f.callback.invocations(), 2);
    // Not advanced: no successful completion path was reached.
    let record = f.store.get_timer("app", id).expect("store read").expect("still present");
    assert_eq!(record.next_expiration, Some(initial));

    f.service.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn error_with_still_active_transaction_does_not_retry() {
    let config = TimerServiceConfig { retry_attempts: 5, ..Default::default() };
    let f = fixture(CallbackMode::Fail, config);
    f.service.start().await.expect("start");

    f.service
        .create_single_action_timer(None, "on_timeout", in_ms(50), None)
        .expect("create");
    tokio::time::sleep(Duration::from_millis(600)).await;

    // The callback threw but left the transaction active: the attempt is
    // treated as completed and the loop exits after a single pass.
    assert_eq!(f.callback.invocations(), 1);
    assert!(f.store.get_timers("app").expect("store read").is_empty());

    f.service.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn non_transacted_error_retries_until_exhaustion() {
    let config =
        TimerServiceConfig { retry_attempts: 2, transacted: false, ..Default::default() };
    let f = fixture(CallbackMode::Fail, config);
    f.service.start().await.expect("start");

    f.service
        .create_single_action_timer(None, "on_timeout", in_ms(50), None)
        .expect("create");
    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(f.callback.invocations(), 3);

    f.service.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn persisted_timers_are_scheduled_at_start() {
    let f = fixture(CallbackMode::Succeed, TimerServiceConfig::default());

    // Created while the service is stopped: persisted but not armed.
    f.service
        .create_single_action_timer(None, "on_timeout", in_ms(150), None)
        .expect("create");
    assert_eq!(f.callback.invocations(), 0);

    f.service.start().await.expect("start");
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(f.callback.invocations(), 1);

    f.service.stop().await.expect("stop");
}

#[tokio::test(flavor = "multi_thread")]
async fn lifecycle_rejects_double_start_and_stop() {
    let f = fixture(CallbackMode::Succeed, TimerServiceConfig::default());

    assert!(matches!(f.service.stop().await, Err(SchedulerError::NotRunning)));
    f.service.start().await.expect("start");
    assert!(matches!(f.service.start().await, Err(SchedulerError::AlreadyRunning)));
    f.service.stop().await.expect("stop");

    // Restart after stop succeeds.
    f.service.start().await.expect("start again");
    f.service.stop().await.expect("stop again");
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_unknown_timer_is_an_error() {
    let f = fixture(CallbackMode::Succeed, TimerServiceConfig::default());
    f.service.start().await.expect("start");
    let err = f.service.cancel_timer(chime_domain::TimerId(999)).expect_err("unknown timer");
    assert!(matches!(err, chime_domain::ChimeError::NotFound(_)));
    f.service.stop().await.expect("stop");
}
