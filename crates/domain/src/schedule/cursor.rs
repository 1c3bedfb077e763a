//! Mutable calendar position for the fire-time walk.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};

use super::field::ScheduleField;

/// A calendar position split into its six stored components, ordered so the
/// derived `Ord` is chronological.
///
/// Day-of-week is derived from the date rather than stored. Setting it moves
/// the date by whole days inside a Sunday-first week, which may carry across
/// a month boundary. The day component may be transiently out of range for
/// the month while the walk is mid-mutation; every mutation that can leave it
/// so is immediately followed by a `reset_below` that restores validity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct DateCursor {
    year: i32,
    month0: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
}

impl DateCursor {
    pub(crate) fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self {
            year: dt.year(),
            month0: dt.month0(),
            day: dt.day(),
            hour: dt.hour(),
            minute: dt.minute(),
            second: dt.second(),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_parts(
        year: i32,
        month0: u32,
        day: u32,
        hour: u32,
        minute: u32,
        second: u32,
    ) -> Self {
        Self { year, month0, day, hour, minute, second }
    }

    pub(crate) fn to_datetime(self) -> Option<DateTime<Utc>> {
        Utc.with_ymd_and_hms(self.year, self.month0 + 1, self.day, self.hour, self.minute, self.second)
            .single()
    }

    pub(crate) fn get(&self, field: ScheduleField) -> u32 {
        match field {
            ScheduleField::Year => self.year.max(0) as u32,
            ScheduleField::Month => self.month0,
            ScheduleField::DayOfMonth => self.day,
            ScheduleField::DayOfWeek => self.weekday_of_day(self.day),
            ScheduleField::Hour => self.hour,
            ScheduleField::Minute => self.minute,
            ScheduleField::Second => self.second,
        }
    }

    /// Set a field to an in-range value. Setting `DayOfWeek` shifts the date
    /// by the signed weekday delta instead of overwriting a component.
    pub(crate) fn set(&mut self, field: ScheduleField, value: u32) {
        match field {
            ScheduleField::Year => self.year = value as i32,
            ScheduleField::Month => self.month0 = value,
            ScheduleField::DayOfMonth => self.day = value,
            ScheduleField::DayOfWeek => {
                let delta = i64::from(value) - i64::from(self.weekday_of_day(self.day));
                self.shift_days(delta);
            }
            ScheduleField::Hour => self.hour = value,
            ScheduleField::Minute => self.minute = value,
            ScheduleField::Second => self.second = value,
        }
    }

    /// Add a signed amount to a field with full carry into more significant
    /// components, mirroring a lenient calendar.
    pub(crate) fn add(&mut self, field: ScheduleField, amount: i64) {
        match field {
            ScheduleField::Year => {
                self.year += amount as i32;
                self.clamp_day();
            }
            ScheduleField::Month => {
                let total = i64::from(self.year) * 12 + i64::from(self.month0) + amount;
                self.year = total.div_euclid(12) as i32;
                self.month0 = total.rem_euclid(12) as u32;
                self.clamp_day();
            }
            ScheduleField::DayOfMonth | ScheduleField::DayOfWeek => self.shift_days(amount),
            ScheduleField::Hour => self.shift_seconds(amount * 3600),
            ScheduleField::Minute => self.shift_seconds(amount * 60),
            ScheduleField::Second => self.shift_seconds(amount),
        }
    }

    /// Reset every stored field less significant than `field` to its minimum
    /// or maximum. The day maximum is the current month's length.
    pub(crate) fn reset_below(&mut self, field: ScheduleField, to_max: bool) {
        if field < ScheduleField::DayOfMonth {
            self.day = if to_max { self.days_in_month() } else { 1 };
        }
        if field < ScheduleField::Hour {
            self.hour = if to_max { 23 } else { 0 };
        }
        if field < ScheduleField::Minute {
            self.minute = if to_max { 59 } else { 0 };
        }
        if field < ScheduleField::Second {
            self.second = if to_max { 59 } else { 0 };
        }
    }

    pub(crate) fn actual_min(&self, field: ScheduleField) -> u32 {
        field.static_min()
    }

    pub(crate) fn actual_max(&self, field: ScheduleField) -> u32 {
        match field {
            ScheduleField::DayOfMonth => self.days_in_month(),
            ScheduleField::DayOfWeek => 7,
            _ => field.static_max(),
        }
    }

    /// Most significant stored field that differs between two positions.
    /// Used after a carry to find where the walk must resume.
    pub(crate) fn most_significant_change(before: &Self, after: &Self) -> Option<ScheduleField> {
        if before.year != after.year {
            Some(ScheduleField::Year)
        } else if before.month0 != after.month0 {
            Some(ScheduleField::Month)
        } else if before.day != after.day {
            Some(ScheduleField::DayOfMonth)
        } else if before.hour != after.hour {
            Some(ScheduleField::Hour)
        } else if before.minute != after.minute {
            Some(ScheduleField::Minute)
        } else if before.second != after.second {
            Some(ScheduleField::Second)
        } else {
            None
        }
    }

    pub(crate) fn year(&self) -> i32 {
        self.year
    }

    /// Jump directly to a month, leaving less significant fields untouched.
    /// Callers reset them immediately after.
    pub(crate) fn set_year_month(&mut self, year: i32, month0: u32) {
        self.year = year;
        self.month0 = month0;
    }

    pub(crate) fn month0(&self) -> u32 {
        self.month0
    }

    pub(crate) fn days_in_month(&self) -> u32 {
        days_in_month(self.year, self.month0)
    }

    /// Sunday-based weekday (1..=7) of the given day in the cursor's month.
    /// The day is clamped to the month length first, so a transiently
    /// overflowing cursor still yields a defined weekday.
    pub(crate) fn weekday_of_day(&self, day: u32) -> u32 {
        let day = day.clamp(1, self.days_in_month());
        match NaiveDate::from_ymd_opt(self.year, self.month0 + 1, day) {
            Some(date) => date.weekday().num_days_from_sunday() + 1,
            None => 1,
        }
    }

    fn clamp_day(&mut self) {
        self.day = self.day.min(self.days_in_month());
    }

    fn shift_days(&mut self, days: i64) {
        self.clamp_day();
        if let Some(date) = NaiveDate::from_ymd_opt(self.year, self.month0 + 1, self.day) {
            let shifted = date + chrono::Duration::days(days);
            self.year = shifted.year();
            self.month0 = shifted.month0();
            self.day = shifted.day();
        }
    }

    fn shift_seconds(&mut self, seconds: i64) {
        let total =
            i64::from(self.hour) * 3600 + i64::from(self.minute) * 60 + i64::from(self.second) + seconds;
        let day_shift = total.div_euclid(86_400);
        let rem = total.rem_euclid(86_400);
        self.hour = (rem / 3600) as u32;
        self.minute = (rem % 3600 / 60) as u32;
        self.second = (rem % 60) as u32;
        if day_shift != 0 {
            self.shift_days(day_shift);
        }
    }
}

pub(crate) fn days_in_month(year: i32, month0: u32) -> u32 {
    match month0 {
        0 | 2 | 4 | 6 | 7 | 9 | 11 => 31,
        3 | 5 | 8 | 10 => 30,
        _ => {
            if NaiveDate::from_ymd_opt(year, 2, 29).is_some() {
                29
            } else {
                28
            }
        }
    }
}
