//! Calendar schedule expressions and fire-time computation.
//!
//! A [`ScheduleExpression`] carries the seven raw field strings (year, month,
//! day-of-month, day-of-week, hour, minute, second) plus optional start/end
//! bounds. Parsing produces an immutable [`CalendarSchedule`] which can
//! compute the next and previous fire times around any instant.
//!
//! # Examples
//!
//! ```
//! use chrono::{TimeZone, Utc};
//! use chime_domain::schedule::ScheduleExpression;
//!
//! // Weekdays at 09:00.
//! let schedule = ScheduleExpression::new()
//!     .day_of_week("Mon-Fri")
//!     .hour("9")
//!     .parse()
//!     .unwrap();
//!
//! let saturday = Utc.with_ymd_and_hms(2024, 1, 6, 12, 0, 0).unwrap();
//! let next = schedule.next_fire_after(saturday).unwrap();
//! assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 8, 9, 0, 0).unwrap());
//! ```

mod cursor;
mod field;
mod parser;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use cursor::DateCursor;

pub use field::{FieldExpr, ScheduleField};
pub use parser::{FieldParseError, ScheduleParseError};

const DOM: usize = 2;
const DOW: usize = 3;
const HOUR: usize = 4;

/// Raw calendar schedule input.
///
/// Defaults follow the calendar-timer convention: date fields default to `*`
/// and time fields to `0`, so an untouched expression means "daily at
/// midnight".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleExpression {
    year: String,
    month: String,
    day_of_month: String,
    day_of_week: String,
    hour: String,
    minute: String,
    second: String,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl Default for ScheduleExpression {
    fn default() -> Self {
        Self {
            year: "*".into(),
            month: "*".into(),
            day_of_month: "*".into(),
            day_of_week: "*".into(),
            hour: "0".into(),
            minute: "0".into(),
            second: "0".into(),
            start: None,
            end: None,
        }
    }
}

impl ScheduleExpression {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn year(mut self, value: impl Into<String>) -> Self {
        self.year = value.into();
        self
    }

    pub fn month(mut self, value: impl Into<String>) -> Self {
        self.month = value.into();
        self
    }

    pub fn day_of_month(mut self, value: impl Into<String>) -> Self {
        self.day_of_month = value.into();
        self
    }

    pub fn day_of_week(mut self, value: impl Into<String>) -> Self {
        self.day_of_week = value.into();
        self
    }

    pub fn hour(mut self, value: impl Into<String>) -> Self {
        self.hour = value.into();
        self
    }

    pub fn minute(mut self, value: impl Into<String>) -> Self {
        self.minute = value.into();
        self
    }

    pub fn second(mut self, value: impl Into<String>) -> Self {
        self.second = value.into();
        self
    }

    /// Earliest instant the schedule may fire at (inclusive).
    pub fn start_at(mut self, start: DateTime<Utc>) -> Self {
        self.start = Some(start);
        self
    }

    /// Latest instant the schedule may fire at (inclusive).
    pub fn end_at(mut self, end: DateTime<Utc>) -> Self {
        self.end = Some(end);
        self
    }

    /// Parse into an immutable [`CalendarSchedule`], reporting every failed
    /// field rather than the first.
    pub fn parse(&self) -> Result<CalendarSchedule, ScheduleParseError> {
        CalendarSchedule::parse(self)
    }
}

impl fmt::Display for ScheduleExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{};{};{};{};{};{};{}",
            self.year,
            self.month,
            self.day_of_month,
            self.day_of_week,
            self.hour,
            self.minute,
            self.second
        )
    }
}

/// Resolution of the day-of-month/day-of-week joint constraint.
enum DayResolution {
    /// A candidate day inside the cursor's month.
    Day(u32),
    /// No candidate this month; resume the walk in this month instead.
    CarryMonth { year: i32, month0: u32 },
}

/// An immutable, parsed calendar schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarSchedule {
    exprs: [FieldExpr; 7],
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    expired: bool,
    raw: String,
}

impl CalendarSchedule {
    /// Parse all seven fields, aggregating per-field failures.
    pub fn parse(expr: &ScheduleExpression) -> Result<Self, ScheduleParseError> {
        let mut errors = BTreeMap::new();
        let mut field = |field: ScheduleField, raw: &str| match parser::parse_field(field, raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                errors.insert(field, err);
                FieldExpr::Wildcard
            }
        };
        let exprs = [
            field(ScheduleField::Year, &expr.year),
            field(ScheduleField::Month, &expr.month),
            field(ScheduleField::DayOfMonth, &expr.day_of_month),
            field(ScheduleField::DayOfWeek, &expr.day_of_week),
            field(ScheduleField::Hour, &expr.hour),
            field(ScheduleField::Minute, &expr.minute),
            field(ScheduleField::Second, &expr.second),
        ];
        if !errors.is_empty() {
            return Err(ScheduleParseError { errors });
        }

        // An end bound before the start bound cannot be satisfied. The
        // schedule still constructs (a restart may legitimately reload such a
        // timer) but is flagged so every fire-time query returns nothing.
        let expired = matches!((expr.start, expr.end), (Some(s), Some(e)) if e < s);

        Ok(Self { exprs, start: expr.start, end: expr.end, expired, raw: expr.to_string() })
    }

    /// Earliest instant strictly after `after` matching the schedule and its
    /// bounds, or `None` within a 100-year lookahead.
    pub fn next_fire_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.expired {
            return None;
        }
        let mut cursor = match self.start {
            Some(start) if start > after => DateCursor::from_datetime(start),
            _ => DateCursor::from_datetime(after + Duration::seconds(1)),
        };
        let stop = match self.end {
            Some(end) => DateCursor::from_datetime(end + Duration::seconds(1)),
            None => {
                let mut bound = cursor;
                bound.add(ScheduleField::Year, 100);
                bound
            }
        };

        let mut idx = 0;
        while idx <= 6 && cursor < stop {
            let field = ScheduleField::ALL[idx];
            let mut value = self.exprs[idx].next_value(field, &cursor);

            // Day-of-month and day-of-week are alternative constraints on
            // the same date: either may match the day when both are
            // constrained.
            if idx == DOM && !self.exprs[DOW].is_wildcard() {
                match self.reconcile_day(&cursor, value, true) {
                    DayResolution::Day(day) => value = Some(day),
                    DayResolution::CarryMonth { year, month0 } => {
                        let year_changed = year != cursor.year();
                        cursor.set_year_month(year, month0);
                        cursor.reset_below(ScheduleField::Month, false);
                        idx = if year_changed { 0 } else { 1 };
                        continue;
                    }
                }
            }

            match value {
                Some(next) => {
                    let current = cursor.get(field);
                    if next == current {
                        idx += 1;
                    } else if idx == DOW && !self.exprs[DOM].is_wildcard() {
                        // The day is already resolved by day-of-month.
                        idx += 1;
                    } else {
                        let (year_before, month_before) = (cursor.year(), cursor.month0());
                        cursor.set(field, next);
                        cursor.reset_below(field, false);
                        idx = resume_index(&cursor, field, idx, year_before, month_before);
                    }
                }
                None if idx > 0 => {
                    if idx == DOW && !self.exprs[DOM].is_wildcard() {
                        idx += 1;
                    } else if !self.carry(&mut cursor, &mut idx, 1) {
                        return None;
                    }
                }
                None => return None,
            }
        }

        (cursor < stop).then(|| cursor.to_datetime())?
    }

    /// Latest instant strictly before `before` matching the schedule and its
    /// bounds, or `None` within a 100-year lookback. The backward mirror of
    /// [`next_fire_after`](Self::next_fire_after).
    pub fn previous_fire_before(&self, before: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.expired {
            return None;
        }
        let mut seed = before - Duration::seconds(1);
        if let Some(end) = self.end {
            seed = seed.min(end);
        }
        let mut cursor = DateCursor::from_datetime(seed);
        let stop = match self.start {
            Some(start) => DateCursor::from_datetime(start - Duration::seconds(1)),
            None => {
                let mut bound = cursor;
                bound.add(ScheduleField::Year, -100);
                bound
            }
        };

        let mut idx = 0;
        while idx <= 6 && cursor > stop {
            let field = ScheduleField::ALL[idx];
            let mut value = self.exprs[idx].previous_value(field, &cursor);

            if idx == DOM && !self.exprs[DOW].is_wildcard() {
                match self.reconcile_day(&cursor, value, false) {
                    DayResolution::Day(day) => value = Some(day),
                    DayResolution::CarryMonth { year, month0 } => {
                        let year_changed = year != cursor.year();
                        cursor.set_year_month(year, month0);
                        cursor.reset_below(ScheduleField::Month, true);
                        idx = if year_changed { 0 } else { 1 };
                        continue;
                    }
                }
            }

            match value {
                Some(previous) => {
                    let current = cursor.get(field);
                    if previous == current {
                        idx += 1;
                    } else if idx == DOW && !self.exprs[DOM].is_wildcard() {
                        idx += 1;
                    } else {
                        let (year_before, month_before) = (cursor.year(), cursor.month0());
                        cursor.set(field, previous);
                        cursor.reset_below(field, true);
                        idx = resume_index(&cursor, field, idx, year_before, month_before);
                    }
                }
                None if idx > 0 => {
                    if idx == DOW && !self.exprs[DOM].is_wildcard() {
                        idx += 1;
                    } else if !self.carry(&mut cursor, &mut idx, -1) {
                        return None;
                    }
                }
                None => return None,
            }
        }

        (cursor > stop).then(|| cursor.to_datetime())?
    }

    /// The very last instant the schedule can fire, or `None` when it is
    /// unbounded (wildcard year without an end bound) or expired.
    pub fn final_fire_time(&self) -> Option<DateTime<Utc>> {
        if self.expired {
            return None;
        }
        if let Some(end) = self.end {
            return self.previous_fire_before(end + Duration::seconds(1));
        }
        let max_year = self.exprs[0].max_literal()?;
        let seed = Utc.with_ymd_and_hms(max_year as i32, 12, 31, 23, 59, 59).single()?;
        self.previous_fire_before(seed + Duration::seconds(1))
    }

    /// True when the end bound precedes the start bound: the schedule parsed
    /// but can never fire.
    pub fn is_expired(&self) -> bool {
        self.expired
    }

    /// The raw seven-field input, `;`-joined in significance order.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.start
    }

    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.end
    }

    /// Find the day matched by the day-of-week expression nearest to the
    /// cursor (scanning forward or backward), and fold it with the
    /// day-of-month candidate: inside the cursor's month the nearer of the
    /// two wins; a day-of-month candidate beats a match in an adjacent
    /// month; with neither, the walk carries into the month of the weekday
    /// match.
    fn reconcile_day(
        &self,
        cursor: &DateCursor,
        dom_candidate: Option<u32>,
        forward: bool,
    ) -> DayResolution {
        let direction = if forward { 1 } else { -1 };
        let mut clone = *cursor;
        let mut matched = None;
        // Any weekday constraint matches within seven consecutive days.
        for _ in 0..=7 {
            let value = if forward {
                self.exprs[DOW].next_value(ScheduleField::DayOfWeek, &clone)
            } else {
                self.exprs[DOW].previous_value(ScheduleField::DayOfWeek, &clone)
            };
            if let Some(weekday) = value {
                matched = Some(weekday);
                break;
            }
            clone.add(ScheduleField::DayOfMonth, direction);
        }
        let Some(weekday) = matched else {
            return DayResolution::Day(cursor.get(ScheduleField::DayOfMonth));
        };
        clone.set(ScheduleField::DayOfWeek, weekday);

        if clone.year() == cursor.year() && clone.month0() == cursor.month0() {
            let dow_day = clone.get(ScheduleField::DayOfMonth);
            let day = match dom_candidate {
                Some(dom) if forward => dom.min(dow_day),
                Some(dom) => dom.max(dow_day),
                None => dow_day,
            };
            DayResolution::Day(day)
        } else {
            match dom_candidate {
                Some(dom) => DayResolution::Day(dom),
                None => DayResolution::CarryMonth { year: clone.year(), month0: clone.month0() },
            }
        }
    }

    /// No value fits the current field: step the parent field by one unit,
    /// reset everything below the most significant component the carry
    /// touched, and reposition the walk there. Returns false when the carry
    /// cannot be expressed (which ends the search).
    fn carry(&self, cursor: &mut DateCursor, idx: &mut usize, direction: i64) -> bool {
        let parent_idx = if *idx == HOUR { DOM } else { *idx - 1 };
        let parent = ScheduleField::ALL[parent_idx];
        let before = *cursor;
        cursor.add(parent, direction);
        let Some(touched) = DateCursor::most_significant_change(&before, cursor) else {
            return false;
        };
        cursor.reset_below(touched, direction < 0);
        *idx = walk_index(touched);
        true
    }
}

impl fmt::Display for CalendarSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Where the walk resumes after setting a field: a weekday move can carry
/// the date into another month (or year), which must then be re-validated.
fn resume_index(
    cursor: &DateCursor,
    field: ScheduleField,
    idx: usize,
    year_before: i32,
    month_before: u32,
) -> usize {
    if field == ScheduleField::DayOfWeek {
        if cursor.year() != year_before {
            return 0;
        }
        if cursor.month0() != month_before {
            return 1;
        }
    }
    idx + 1
}

fn walk_index(field: ScheduleField) -> usize {
    match field {
        ScheduleField::Year => 0,
        ScheduleField::Month => 1,
        ScheduleField::DayOfMonth => 2,
        ScheduleField::DayOfWeek => DOW,
        ScheduleField::Hour => HOUR,
        ScheduleField::Minute => 5,
        ScheduleField::Second => 6,
    }
}
