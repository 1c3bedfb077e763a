//! Per-field parsing of schedule expressions.
//!
//! Parsing never stops at the first bad field: each field either yields a
//! [`FieldExpr`] or a [`FieldParseError`], and the caller aggregates the
//! failures into one [`ScheduleParseError`] exposing the complete map.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use super::field::{FieldExpr, ScheduleField};

const MONTHS: [&str; 12] =
    ["JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC"];
const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];
const ORDINALS: [(&str, u8); 5] = [("1ST", 1), ("2ND", 2), ("3RD", 3), ("4TH", 4), ("5TH", 5)];

/// A single field that failed to parse.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("invalid {field} value {value:?}: {message}")]
pub struct FieldParseError {
    /// The field the value belonged to.
    pub field: ScheduleField,
    /// The raw value as supplied by the caller.
    pub value: String,
    /// What was wrong with it.
    pub message: String,
}

impl FieldParseError {
    fn new(field: ScheduleField, value: &str, message: impl Into<String>) -> Self {
        Self { field, value: value.to_string(), message: message.into() }
    }
}

/// Aggregate failure over all seven fields of a schedule expression.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("schedule expression has {} invalid field(s): {}", .errors.len(), format_errors(.errors))]
pub struct ScheduleParseError {
    /// Per-field failures, in field significance order.
    pub errors: BTreeMap<ScheduleField, FieldParseError>,
}

fn format_errors(errors: &BTreeMap<ScheduleField, FieldParseError>) -> String {
    let mut out = String::new();
    for (i, err) in errors.values().enumerate() {
        if i > 0 {
            out.push_str("; ");
        }
        let _ = fmt::Write::write_fmt(&mut out, format_args!("{err}"));
    }
    out
}

/// Parse one raw field value into its expression.
///
/// Whitespace anywhere in the value is discarded and matching is
/// case-insensitive, so `"2nd tue"` and `"2NDTUE"` are the same token.
pub(crate) fn parse_field(
    field: ScheduleField,
    raw: &str,
) -> Result<FieldExpr, FieldParseError> {
    let expr: String = raw.split_whitespace().collect::<String>().to_uppercase();
    if expr.is_empty() {
        return Err(FieldParseError::new(field, raw, "value cannot be empty"));
    }
    if expr == "*" {
        return Ok(FieldExpr::Wildcard);
    }

    if !expr.contains(',') {
        if let Some((lhs, rhs)) = split_range(&expr) {
            return parse_range(field, raw, lhs, rhs);
        }
    }

    match field {
        ScheduleField::Hour | ScheduleField::Minute | ScheduleField::Second => {
            if let Some((lhs, rhs)) = expr.split_once('/') {
                return parse_increment(field, raw, lhs, rhs);
            }
        }
        ScheduleField::DayOfMonth => {
            if expr == "LAST" {
                return Ok(FieldExpr::DaysFromEnd(0));
            }
            if let Some(rest) = expr.strip_prefix('-') {
                return parse_days_from_end(field, raw, rest);
            }
            if let Some(result) = parse_nth_weekday(field, raw, &expr) {
                return result;
            }
        }
        _ => {}
    }

    parse_list(field, raw, &expr)
}

/// Split `A-B` with the dash strictly inside the token, so `-3` (days before
/// month end) is left alone.
fn split_range(expr: &str) -> Option<(&str, &str)> {
    let idx = expr.char_indices().skip(1).find(|(_, c)| *c == '-').map(|(i, _)| i)?;
    let (lhs, rhs) = (&expr[..idx], &expr[idx + 1..]);
    (!rhs.is_empty()).then_some((lhs, rhs))
}

fn parse_range(
    field: ScheduleField,
    raw: &str,
    lhs: &str,
    rhs: &str,
) -> Result<FieldExpr, FieldParseError> {
    let begin = convert_value(field, raw, lhs)?;
    let end = convert_value(field, raw, rhs)?;

    if field == ScheduleField::DayOfWeek {
        // 0 and 7 both mean Sunday; after the +1 shift they arrive as 1 and
        // 8. A full 0-7 range collapses to the whole week, and an 8 endpoint
        // folds back to Sunday, which may leave the range wrapped.
        let (begin, end) = match (begin, end) {
            (8, 1) | (1, 8) => (1, 7),
            (b, e) => (if b == 8 { 1 } else { b }, if e == 8 { 1 } else { e }),
        };
        if begin > end {
            return Ok(FieldExpr::Range { start: 1, end, wrap_start: Some(begin) });
        }
        return Ok(FieldExpr::Range { start: begin, end, wrap_start: None });
    }

    if begin > end {
        return Err(FieldParseError::new(field, raw, "range end is before range start"));
    }
    Ok(FieldExpr::Range { start: begin, end, wrap_start: None })
}

fn parse_increment(
    field: ScheduleField,
    raw: &str,
    lhs: &str,
    rhs: &str,
) -> Result<FieldExpr, FieldParseError> {
    let start =
        if lhs == "*" { field.static_min() } else { convert_value(field, raw, lhs)? };
    let interval: u32 = rhs
        .parse()
        .map_err(|_| FieldParseError::new(field, raw, "unparseable increment interval"))?;
    if interval == 0 || interval > field.static_max() {
        return Err(FieldParseError::new(
            field,
            raw,
            format!("increment interval must be 1-{}", field.static_max()),
        ));
    }
    Ok(FieldExpr::Increment { start, interval })
}

fn parse_days_from_end(
    field: ScheduleField,
    raw: &str,
    rest: &str,
) -> Result<FieldExpr, FieldParseError> {
    match rest.parse::<u32>() {
        Ok(offset) if rest.len() == 1 && offset <= 7 => Ok(FieldExpr::DaysFromEnd(offset)),
        _ => Err(FieldParseError::new(field, raw, "days before month end must be 0-7")),
    }
}

fn parse_nth_weekday(
    field: ScheduleField,
    raw: &str,
    expr: &str,
) -> Option<Result<FieldExpr, FieldParseError>> {
    let (ordinal, rest) = if let Some(rest) = expr.strip_prefix("LAST") {
        (None, rest)
    } else {
        let (prefix, n) = ORDINALS.iter().find(|(p, _)| expr.starts_with(p))?;
        (Some(*n), &expr[prefix.len()..])
    };
    if rest.is_empty() {
        return None;
    }
    let result = match weekday_value(rest) {
        Some(weekday) => Ok(FieldExpr::NthWeekday { ordinal, weekday }),
        None => Err(FieldParseError::new(
            field,
            raw,
            "ordinal day must combine 1ST-5TH or LAST with SUN-SAT",
        )),
    };
    Some(result)
}

fn parse_list(
    field: ScheduleField,
    raw: &str,
    expr: &str,
) -> Result<FieldExpr, FieldParseError> {
    let mut values = std::collections::BTreeSet::new();
    for item in expr.split(',') {
        if item.is_empty() {
            return Err(FieldParseError::new(field, raw, "empty list item"));
        }
        if let Some((lhs, rhs)) = split_range(item) {
            if let FieldExpr::Range { start, end, wrap_start } = parse_range(field, raw, lhs, rhs)? {
                values.extend(start..=end);
                if let Some(ws) = wrap_start {
                    values.extend(ws..=7);
                }
            }
        } else {
            let mut value = convert_value(field, raw, item)?;
            if field == ScheduleField::DayOfWeek && value == 8 {
                value = 1;
            }
            values.insert(value);
        }
    }
    Ok(FieldExpr::List(values.into_iter().collect()))
}

fn weekday_value(token: &str) -> Option<u32> {
    WEEKDAYS.iter().position(|w| *w == token).map(|i| i as u32 + 1)
}

/// Convert a single token to the field's internal numbering and validate it.
///
/// Numeric months shift to 0-based storage; numeric weekdays shift by +1 so
/// both `0` and `7` end up meaning Sunday (the `8` is folded at the use
/// site, where range wrapping needs to see it).
fn convert_value(
    field: ScheduleField,
    raw: &str,
    token: &str,
) -> Result<u32, FieldParseError> {
    let first = token
        .chars()
        .next()
        .ok_or_else(|| FieldParseError::new(field, raw, "value cannot be empty"))?;

    let value = if first.is_ascii_digit() {
        let n: u32 = token
            .parse()
            .map_err(|_| FieldParseError::new(field, raw, "unparseable value"))?;
        if field == ScheduleField::Year && token.len() != 4 {
            return Err(FieldParseError::new(field, raw, legal_values(field)));
        }
        match field {
            ScheduleField::DayOfWeek => n + 1,
            ScheduleField::Month => n
                .checked_sub(1)
                .ok_or_else(|| FieldParseError::new(field, raw, legal_values(field)))?,
            _ => n,
        }
    } else {
        match field {
            ScheduleField::Month => MONTHS
                .iter()
                .position(|m| *m == token)
                .map(|i| i as u32)
                .ok_or_else(|| FieldParseError::new(field, raw, legal_values(field)))?,
            ScheduleField::DayOfWeek => weekday_value(token)
                .ok_or_else(|| FieldParseError::new(field, raw, legal_values(field)))?,
            _ => return Err(FieldParseError::new(field, raw, "unparseable value")),
        }
    };

    if value < field.static_min() || value > field.static_max() {
        return Err(FieldParseError::new(field, raw, legal_values(field)));
    }
    Ok(value)
}

fn legal_values(field: ScheduleField) -> String {
    match field {
        ScheduleField::Year => "valid years are four-digit values".to_string(),
        ScheduleField::Month => "valid month values are 1-12 or JAN-DEC".to_string(),
        ScheduleField::DayOfMonth => "valid day-of-month values are 1-31".to_string(),
        ScheduleField::DayOfWeek => "valid day-of-week values are 0-7 or SUN-SAT".to_string(),
        ScheduleField::Hour => "valid hour values are 0-23".to_string(),
        ScheduleField::Minute => "valid minute values are 0-59".to_string(),
        ScheduleField::Second => "valid second values are 0-59".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_and_single_values() {
        assert_eq!(parse_field(ScheduleField::Hour, " * ").unwrap(), FieldExpr::Wildcard);
        assert_eq!(
            parse_field(ScheduleField::Hour, "14").unwrap(),
            FieldExpr::List(vec![14])
        );
        assert_eq!(
            parse_field(ScheduleField::Month, "jan").unwrap(),
            FieldExpr::List(vec![0])
        );
        assert_eq!(
            parse_field(ScheduleField::Month, "12").unwrap(),
            FieldExpr::List(vec![11])
        );
    }

    #[test]
    fn test_day_of_week_numbering() {
        // 0 and 7 both mean Sunday.
        assert_eq!(
            parse_field(ScheduleField::DayOfWeek, "0").unwrap(),
            FieldExpr::List(vec![1])
        );
        assert_eq!(
            parse_field(ScheduleField::DayOfWeek, "7").unwrap(),
            FieldExpr::List(vec![1])
        );
        assert_eq!(
            parse_field(ScheduleField::DayOfWeek, "Mon-Fri").unwrap(),
            FieldExpr::Range { start: 2, end: 6, wrap_start: None }
        );
        assert_eq!(
            parse_field(ScheduleField::DayOfWeek, "0-7").unwrap(),
            FieldExpr::Range { start: 1, end: 7, wrap_start: None }
        );
        // Fri-Sun wraps through the Sunday fold.
        assert_eq!(
            parse_field(ScheduleField::DayOfWeek, "FRI-SUN").unwrap(),
            FieldExpr::Range { start: 1, end: 1, wrap_start: Some(6) }
        );
    }

    #[test]
    fn test_day_of_month_specials() {
        assert_eq!(
            parse_field(ScheduleField::DayOfMonth, "Last").unwrap(),
            FieldExpr::DaysFromEnd(0)
        );
        assert_eq!(
            parse_field(ScheduleField::DayOfMonth, "-0").unwrap(),
            FieldExpr::DaysFromEnd(0)
        );
        assert_eq!(
            parse_field(ScheduleField::DayOfMonth, "-3").unwrap(),
            FieldExpr::DaysFromEnd(3)
        );
        assert!(parse_field(ScheduleField::DayOfMonth, "-8").is_err());
        assert_eq!(
            parse_field(ScheduleField::DayOfMonth, "2nd Tue").unwrap(),
            FieldExpr::NthWeekday { ordinal: Some(2), weekday: 3 }
        );
        assert_eq!(
            parse_field(ScheduleField::DayOfMonth, "LAST FRI").unwrap(),
            FieldExpr::NthWeekday { ordinal: None, weekday: 6 }
        );
    }

    #[test]
    fn test_increments_only_on_time_fields() {
        assert_eq!(
            parse_field(ScheduleField::Minute, "*/15").unwrap(),
            FieldExpr::Increment { start: 0, interval: 15 }
        );
        assert_eq!(
            parse_field(ScheduleField::Second, "30/10").unwrap(),
            FieldExpr::Increment { start: 30, interval: 10 }
        );
        assert!(parse_field(ScheduleField::Minute, "*/0").is_err());
        assert!(parse_field(ScheduleField::Minute, "*/60").is_err());
        assert!(parse_field(ScheduleField::DayOfMonth, "*/2").is_err());
    }

    #[test]
    fn test_lists_flatten_ranges_and_sort() {
        assert_eq!(
            parse_field(ScheduleField::Hour, "22,9-11,8").unwrap(),
            FieldExpr::List(vec![8, 9, 10, 11, 22])
        );
        // Numeric weekdays shift by one: input 3 is Wednesday (internal 4),
        // input 7 folds to Sunday (internal 1).
        assert_eq!(
            parse_field(ScheduleField::DayOfWeek, "7,3").unwrap(),
            FieldExpr::List(vec![1, 4])
        );
    }

    #[test]
    fn test_rejected_values() {
        assert!(parse_field(ScheduleField::Hour, "24").is_err());
        assert!(parse_field(ScheduleField::Minute, "60").is_err());
        assert!(parse_field(ScheduleField::Month, "0").is_err());
        assert!(parse_field(ScheduleField::Month, "13").is_err());
        assert!(parse_field(ScheduleField::Month, "BOB").is_err());
        assert!(parse_field(ScheduleField::Hour, "17-9").is_err());
        assert!(parse_field(ScheduleField::Hour, "").is_err());
        assert!(parse_field(ScheduleField::DayOfMonth, "32").is_err());
    }
}
