//! Schedule fields and per-field expression variants.
//!
//! Each calendar field of a schedule carries one [`FieldExpr`], and the
//! fire-time walk asks it for the next or previous allowed value relative to
//! a [`DateCursor`] position. Month-shape-dependent variants (`NthWeekday`,
//! `DaysFromEnd`) recompute against the cursor's month on every call.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::cursor::DateCursor;

/// A calendar field of a schedule expression, in significance order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ScheduleField {
    Year,
    Month,
    DayOfMonth,
    DayOfWeek,
    Hour,
    Minute,
    Second,
}

impl ScheduleField {
    /// All fields in fire-time walk order (most to least significant).
    pub const ALL: [ScheduleField; 7] = [
        ScheduleField::Year,
        ScheduleField::Month,
        ScheduleField::DayOfMonth,
        ScheduleField::DayOfWeek,
        ScheduleField::Hour,
        ScheduleField::Minute,
        ScheduleField::Second,
    ];

    /// Smallest value a token may produce after symbolic conversion.
    pub(crate) fn static_min(self) -> u32 {
        match self {
            ScheduleField::Year => 0,
            ScheduleField::Month => 0,
            ScheduleField::DayOfMonth => 1,
            ScheduleField::DayOfWeek => 1,
            ScheduleField::Hour | ScheduleField::Minute | ScheduleField::Second => 0,
        }
    }

    /// Largest value a token may produce after symbolic conversion.
    ///
    /// Day-of-week admits 8 here: numeric input is stored shifted by one, so
    /// both `0` and `7` arrive as Sunday and the `8` is folded back to `1` at
    /// the use site.
    pub(crate) fn static_max(self) -> u32 {
        match self {
            ScheduleField::Year => 9999,
            ScheduleField::Month => 11,
            ScheduleField::DayOfMonth => 31,
            ScheduleField::DayOfWeek => 8,
            ScheduleField::Hour => 23,
            ScheduleField::Minute | ScheduleField::Second => 59,
        }
    }
}

impl fmt::Display for ScheduleField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScheduleField::Year => "year",
            ScheduleField::Month => "month",
            ScheduleField::DayOfMonth => "day-of-month",
            ScheduleField::DayOfWeek => "day-of-week",
            ScheduleField::Hour => "hour",
            ScheduleField::Minute => "minute",
            ScheduleField::Second => "second",
        };
        f.write_str(name)
    }
}

/// A parsed constraint on a single schedule field.
///
/// Values are stored in internal numbering: months `0..=11`, day-of-week
/// Sunday-based `1..=7`, everything else as written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldExpr {
    /// `*`: no constraint.
    Wildcard,
    /// `A-B`. `wrap_start` carries the upper segment of a day-of-week range
    /// that wrapped through Sunday during 7/0 normalization: the allowed set
    /// is `start..=end` plus `wrap_start..=7`.
    Range { start: u32, end: u32, wrap_start: Option<u32> },
    /// Explicit values, ascending and deduplicated. Single values and
    /// flattened static ranges both land here.
    List(Vec<u32>),
    /// `N/M` or `*/M` on hour, minute or second.
    Increment { start: u32, interval: u32 },
    /// `1ST`..`5TH` or `LAST` weekday of the month (day-of-month only).
    /// `ordinal` of `None` means the last such weekday.
    NthWeekday { ordinal: Option<u8>, weekday: u32 },
    /// `LAST` or `-N`: N days before the end of the month (day-of-month only).
    DaysFromEnd(u32),
}

impl FieldExpr {
    /// Smallest allowed value `>=` the cursor's current value for `field`,
    /// valid within the cursor's actual field range, or `None`.
    pub(crate) fn next_value(&self, field: ScheduleField, cursor: &DateCursor) -> Option<u32> {
        let current = cursor.get(field);
        let valid = |v: u32| (cursor.actual_min(field)..=cursor.actual_max(field)).contains(&v);
        match self {
            FieldExpr::Wildcard => Some(current),
            FieldExpr::Range { start, end, wrap_start } => {
                if let Some(ws) = wrap_start {
                    if current >= *ws {
                        return Some(current).filter(|v| valid(*v));
                    }
                    if current > *end {
                        return Some(*ws).filter(|v| valid(*v));
                    }
                }
                if current <= *start {
                    Some(*start).filter(|v| valid(*v))
                } else if current <= *end {
                    Some(current).filter(|v| valid(*v))
                } else {
                    None
                }
            }
            FieldExpr::List(values) => {
                values.iter().copied().find(|v| *v >= current).filter(|v| valid(*v))
            }
            FieldExpr::Increment { start, interval } => {
                if current <= *start {
                    return Some(*start).filter(|v| valid(*v));
                }
                let steps = (current - start).div_ceil(*interval);
                Some(start + steps * interval).filter(|v| valid(*v))
            }
            FieldExpr::NthWeekday { .. } => {
                let day = self.weekday_in_month(cursor)?;
                Some(day).filter(|v| *v >= current && valid(*v))
            }
            FieldExpr::DaysFromEnd(offset) => {
                let max = cursor.actual_max(field);
                let day = max.checked_sub(*offset)?;
                Some(day).filter(|v| *v >= current && valid(*v))
            }
        }
    }

    /// Largest allowed value `<=` the cursor's current value for `field`,
    /// valid within the cursor's actual field range, or `None`.
    pub(crate) fn previous_value(&self, field: ScheduleField, cursor: &DateCursor) -> Option<u32> {
        let current = cursor.get(field);
        let valid = |v: u32| (cursor.actual_min(field)..=cursor.actual_max(field)).contains(&v);
        match self {
            FieldExpr::Wildcard => Some(current),
            FieldExpr::Range { start, end, wrap_start } => {
                if let Some(ws) = wrap_start {
                    if current >= *ws {
                        return Some(current).filter(|v| valid(*v));
                    }
                }
                if current < *start {
                    None
                } else if current <= *end {
                    Some(current).filter(|v| valid(*v))
                } else {
                    Some(*end).filter(|v| valid(*v))
                }
            }
            FieldExpr::List(values) => {
                values.iter().rev().copied().find(|v| *v <= current).filter(|v| valid(*v))
            }
            FieldExpr::Increment { start, interval } => {
                if current < *start {
                    return None;
                }
                let steps = (current - start) / interval;
                Some(start + steps * interval).filter(|v| valid(*v))
            }
            FieldExpr::NthWeekday { .. } => {
                let day = self.weekday_in_month(cursor)?;
                Some(day).filter(|v| *v <= current && valid(*v))
            }
            FieldExpr::DaysFromEnd(offset) => {
                let max = cursor.actual_max(field);
                let day = max.checked_sub(*offset)?;
                Some(day).filter(|v| *v <= current && valid(*v))
            }
        }
    }

    /// Day of month matched by an `NthWeekday` expression in the cursor's
    /// month, or `None` when the ordinal does not exist (e.g. a fifth Friday
    /// in a 28-day month).
    fn weekday_in_month(&self, cursor: &DateCursor) -> Option<u32> {
        let FieldExpr::NthWeekday { ordinal, weekday } = self else {
            return None;
        };
        let max_day = cursor.actual_max(ScheduleField::DayOfMonth);
        let first_dow = cursor.weekday_of_day(1);
        let first_match = 1 + (weekday + 7 - first_dow) % 7;
        let day = match ordinal {
            Some(n) => first_match + (u32::from(*n) - 1) * 7,
            None => first_match + (max_day - first_match) / 7 * 7,
        };
        (day <= max_day).then_some(day)
    }

    /// Largest literal value the expression can ever produce, independent of
    /// any calendar context. Used to seed the backward walk for bounded year
    /// expressions.
    pub(crate) fn max_literal(&self) -> Option<u32> {
        match self {
            FieldExpr::Wildcard
            | FieldExpr::NthWeekday { .. }
            | FieldExpr::DaysFromEnd(_) => None,
            FieldExpr::Range { end, wrap_start, .. } => Some(wrap_start.map_or(*end, |_| 7)),
            FieldExpr::List(values) => values.last().copied(),
            FieldExpr::Increment { .. } => None,
        }
    }

    /// True for the unconstrained `*` expression.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, FieldExpr::Wildcard)
    }
}
