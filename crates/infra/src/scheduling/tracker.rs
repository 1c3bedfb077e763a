//! Due-time tracking.
//!
//! One tokio task owns all due-time bookkeeping: a binary heap of pending
//! fire instants, fed through an unbounded command channel so that
//! synchronous transaction callbacks can arm and cancel without blocking.
//! The tracker itself never runs application code: when an entry comes due
//! it hands the timer id to the dispatch callback and moves on, so a slow
//! timeout handler cannot delay other timers' delivery.
//!
//! Cancellation is lazy: arming bumps a per-timer generation, and a popped
//! heap entry fires only if it still carries the timer's current generation.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use chime_domain::TimerId;

enum TrackerCommand {
    Arm { timer_id: TimerId, generation: u64, due: DateTime<Utc> },
    Cancel { timer_id: TimerId },
}

/// Handle to the due-time tracker task.
pub(crate) struct DueTimeTracker {
    commands: mpsc::UnboundedSender<TrackerCommand>,
    handle: JoinHandle<()>,
}

impl DueTimeTracker {
    /// Spawn the tracker task. `on_due` runs on the tracker task and must
    /// only dispatch, never execute, the timeout work.
    pub(crate) fn spawn<F>(on_due: F, cancel: CancellationToken) -> Self
    where
        F: Fn(TimerId) + Send + 'static,
    {
        let (commands, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(receiver, on_due, cancel));
        Self { commands, handle }
    }

    /// Arm (or re-arm) a timer. A later generation supersedes any entry
    /// still queued for the same timer.
    pub(crate) fn arm(&self, timer_id: TimerId, generation: u64, due: DateTime<Utc>) {
        let _ = self.commands.send(TrackerCommand::Arm { timer_id, generation, due });
    }

    /// Best-effort eager cancel of a timer's pending fire.
    pub(crate) fn cancel(&self, timer_id: TimerId) {
        let _ = self.commands.send(TrackerCommand::Cancel { timer_id });
    }

    /// Await tracker shutdown after its cancellation token fired.
    pub(crate) async fn join(self, timeout: Duration) -> Result<(), String> {
        drop(self.commands);
        match tokio::time::timeout(timeout, self.handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!("tracker did not stop within {timeout:?}")),
        }
    }
}

async fn run<F>(
    mut receiver: mpsc::UnboundedReceiver<TrackerCommand>,
    on_due: F,
    cancel: CancellationToken,
) where
    F: Fn(TimerId) + Send + 'static,
{
    // Heap of (due, generation, timer). Stale generations are skipped when
    // popped rather than removed in place.
    let mut heap: BinaryHeap<Reverse<(DateTime<Utc>, u64, TimerId)>> = BinaryHeap::new();
    let mut armed: HashMap<TimerId, u64> = HashMap::new();

    loop {
        let next_due = heap.peek().map(|Reverse((due, _, _))| *due);
        let sleep = match next_due {
            Some(due) => {
                let delay = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(delay)
            }
            None => tokio::time::sleep(Duration::MAX),
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("due-time tracker cancelled");
                break;
            }
            command = receiver.recv() => match command {
                Some(TrackerCommand::Arm { timer_id, generation, due }) => {
                    trace!(timer = %timer_id, generation, %due, "armed");
                    armed.insert(timer_id, generation);
                    heap.push(Reverse((due, generation, timer_id)));
                }
                Some(TrackerCommand::Cancel { timer_id }) => {
                    trace!(timer = %timer_id, "cancelled");
                    armed.remove(&timer_id);
                }
                None => break,
            },
            _ = sleep, if next_due.is_some() => {
                let now = Utc::now();
                loop {
                    let due = match heap.peek() {
                        Some(Reverse((due, _, _))) if *due <= now => true,
                        _ => false,
                    };
                    if !due {
                        break;
                    }
                    let Some(Reverse((_, generation, timer_id))) = heap.pop() else {
                        break;
                    };
                    if armed.get(&timer_id) == Some(&generation) {
                        armed.remove(&timer_id);
                        on_due(timer_id);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn due_entries_fire_in_order() {
        let fired = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();
        let sink = fired.clone();
        let tracker = DueTimeTracker::spawn(move |id| sink.lock().push(id), cancel.clone());

        let now = Utc::now();
        tracker.arm(TimerId(2), 1, now + chrono::Duration::milliseconds(80));
        tracker.arm(TimerId(1), 2, now + chrono::Duration::milliseconds(20));

        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
        tracker.join(Duration::from_secs(1)).await.expect("join");

        assert_eq!(*fired.lock(), vec![TimerId(1), TimerId(2)]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancelled_timer_does_not_fire() {
        let count = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let sink = count.clone();
        let tracker =
            DueTimeTracker::spawn(move |_| { sink.fetch_add(1, Ordering::SeqCst); }, cancel.clone());

        tracker.arm(TimerId(1), 1, Utc::now() + chrono::Duration::milliseconds(50));
        tracker.cancel(TimerId(1));

        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        tracker.join(Duration::from_secs(1)).await.expect("join");

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rearm_supersedes_stale_entry() {
        let count = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();
        let sink = count.clone();
        let tracker =
            DueTimeTracker::spawn(move |_| { sink.fetch_add(1, Ordering::SeqCst); }, cancel.clone());

        let now = Utc::now();
        tracker.arm(TimerId(1), 1, now + chrono::Duration::milliseconds(30));
        // Supersede before the first entry comes due.
        tracker.arm(TimerId(1), 2, now + chrono::Duration::milliseconds(60));

        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
        tracker.join(Duration::from_secs(1)).await.expect("join");

        // The stale generation is skipped; only the re-armed entry fires.
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
