//! Timer data model.
//!
//! A [`TimerRecord`] is the persistent description of a scheduled timer,
//! independent of any storage engine or runtime state. Runtime-only flags
//! (pending commit, pending cancel, task handles) live with the scheduler,
//! never here.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{ChimeError, Result};
use crate::schedule::CalendarSchedule;

/// Numeric timer identity, unique within a store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TimerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// The three timer shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerKind {
    /// Fires once at a fixed instant.
    SingleAction { expiration: DateTime<Utc> },
    /// Fires at an initial instant, then repeats at a fixed period.
    Interval { initial_expiration: DateTime<Utc>, period: Duration },
    /// Fires whenever the calendar schedule matches. Auto-created timers are
    /// the ones declared at deployment rather than by application code.
    Calendar { schedule: CalendarSchedule, auto_created: bool },
}

impl fmt::Display for TimerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimerKind::SingleAction { .. } => "single-action",
            TimerKind::Interval { .. } => "interval",
            TimerKind::Calendar { .. } => "calendar",
        };
        f.write_str(name)
    }
}

/// Persistent description of one timer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerRecord {
    /// Store-unique identity.
    pub id: TimerId,
    /// The deployment the timer belongs to.
    pub deployment_id: String,
    /// Primary key of the owning component instance, when there is one.
    pub primary_key: Option<String>,
    /// Name of the timeout method the callback dispatches on.
    pub timeout_method: String,
    /// Opaque payload handed back to the application at timeout.
    pub info: Option<serde_json::Value>,
    /// What kind of timer this is and when it fires.
    pub kind: TimerKind,
    /// The next instant the timer is due, `None` once exhausted.
    pub next_expiration: Option<DateTime<Utc>>,
}

impl TimerRecord {
    pub fn single_action(
        id: TimerId,
        deployment_id: impl Into<String>,
        primary_key: Option<String>,
        timeout_method: impl Into<String>,
        expiration: DateTime<Utc>,
        info: Option<serde_json::Value>,
    ) -> Self {
        Self {
            id,
            deployment_id: deployment_id.into(),
            primary_key,
            timeout_method: timeout_method.into(),
            info,
            kind: TimerKind::SingleAction { expiration },
            next_expiration: Some(expiration),
        }
    }

    pub fn interval(
        id: TimerId,
        deployment_id: impl Into<String>,
        primary_key: Option<String>,
        timeout_method: impl Into<String>,
        initial_expiration: DateTime<Utc>,
        period: Duration,
        info: Option<serde_json::Value>,
    ) -> Result<Self> {
        if period.is_zero() {
            return Err(ChimeError::InvalidInput("interval period must be positive".into()));
        }
        Ok(Self {
            id,
            deployment_id: deployment_id.into(),
            primary_key,
            timeout_method: timeout_method.into(),
            info,
            kind: TimerKind::Interval { initial_expiration, period },
            next_expiration: Some(initial_expiration),
        })
    }

    /// Build a calendar timer; the first expiration is computed from
    /// `created_at`. An expired schedule yields a record with no expiration,
    /// which the scheduler will never arm.
    pub fn calendar(
        id: TimerId,
        deployment_id: impl Into<String>,
        primary_key: Option<String>,
        timeout_method: impl Into<String>,
        schedule: CalendarSchedule,
        auto_created: bool,
        info: Option<serde_json::Value>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let next_expiration = schedule.next_fire_after(created_at);
        Self {
            id,
            deployment_id: deployment_id.into(),
            primary_key,
            timeout_method: timeout_method.into(),
            info,
            kind: TimerKind::Calendar { schedule, auto_created },
            next_expiration,
        }
    }

    /// Advance to the expiration after a successful fire. Single-action
    /// timers are exhausted; interval timers step by their fixed period;
    /// calendar timers recompute from `now`.
    pub fn advance(&mut self, now: DateTime<Utc>) {
        self.next_expiration = match &self.kind {
            TimerKind::SingleAction { .. } => None,
            TimerKind::Interval { period, .. } => {
                let step = chrono::Duration::from_std(*period).unwrap_or(chrono::Duration::MAX);
                self.next_expiration.map(|at| at + step)
            }
            TimerKind::Calendar { schedule, .. } => schedule.next_fire_after(now),
        };
    }

    /// True when the timer can fire at most once more.
    pub fn is_one_shot(&self) -> bool {
        matches!(self.kind, TimerKind::SingleAction { .. })
    }

    /// The calendar schedule, for calendar timers.
    pub fn schedule(&self) -> Option<&CalendarSchedule> {
        match &self.kind {
            TimerKind::Calendar { schedule, .. } => Some(schedule),
            _ => None,
        }
    }
}
