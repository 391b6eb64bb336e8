//! Condition matching over a subject's attribute bag.
//!
//! [`matches`] is a pure predicate: conditions are AND-ed, and every
//! condition that cannot be evaluated (unknown operator, missing field,
//! value of the wrong shape) evaluates to `false` and is logged. Nothing in
//! here returns an error or panics, so a malformed subject can never enroll
//! by accident and can never abort a batch.

use chrono::{DateTime, Datelike, NaiveDate};
use serde_json::Value;

use crate::workflow::Condition;

/// Condition value that switches `is_today` to month/day comparison.
pub const ANNIVERSARY: &str = "anniversary";

// ---------------------------------------------------------------------------
// Operator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
    GreaterThan,
    LessThan,
    GreaterThanOrEqual,
    LessThanOrEqual,
    Contains,
    IsToday,
    LessThanDaysAgo,
    GreaterThanDaysAgo,
    Exists,
}

impl Operator {
    /// Parse an operator name (case-insensitive). Returns `None` for
    /// anything unrecognised.
    pub fn parse(s: &str) -> Option<Self> {
        let op = match s.trim().to_ascii_lowercase().as_str() {
            "equals" => Self::Equals,
            "not_equals" => Self::NotEquals,
            "in" => Self::In,
            "not_in" => Self::NotIn,
            "greater_than" => Self::GreaterThan,
            "less_than" => Self::LessThan,
            "greater_than_or_equal" => Self::GreaterThanOrEqual,
            "less_than_or_equal" => Self::LessThanOrEqual,
            "contains" => Self::Contains,
            "is_today" => Self::IsToday,
            "less_than_days_ago" => Self::LessThanDaysAgo,
            "greater_than_days_ago" => Self::GreaterThanDaysAgo,
            "exists" => Self::Exists,
            _ => return None,
        };
        Some(op)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::In => "in",
            Self::NotIn => "not_in",
            Self::GreaterThan => "greater_than",
            Self::LessThan => "less_than",
            Self::GreaterThanOrEqual => "greater_than_or_equal",
            Self::LessThanOrEqual => "less_than_or_equal",
            Self::Contains => "contains",
            Self::IsToday => "is_today",
            Self::LessThanDaysAgo => "less_than_days_ago",
            Self::GreaterThanDaysAgo => "greater_than_days_ago",
            Self::Exists => "exists",
        }
    }
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

/// `true` when every condition holds for `attrs`. An empty list matches.
pub fn matches(attrs: &Value, conditions: &[Condition], today: NaiveDate) -> bool {
    conditions.iter().all(|c| evaluate(attrs, c, today))
}

/// Evaluate one condition. Fails closed.
pub fn evaluate(attrs: &Value, condition: &Condition, today: NaiveDate) -> bool {
    let Some(op) = Operator::parse(&condition.operator) else {
        tracing::warn!(
            field = %condition.field,
            operator = %condition.operator,
            "Unknown condition operator, treating condition as false"
        );
        return false;
    };

    let field_value = lookup(attrs, &condition.field).filter(|v| !v.is_null());

    if op == Operator::Exists {
        let expected = condition.value.as_bool().unwrap_or(true);
        return field_value.is_some() == expected;
    }

    let Some(actual) = field_value else {
        tracing::warn!(
            field = %condition.field,
            operator = op.as_str(),
            "Subject attribute missing, treating condition as false"
        );
        return false;
    };

    let expected = &condition.value;
    let result = match op {
        Operator::Equals => Some(loose_eq(actual, expected)),
        Operator::NotEquals => Some(!loose_eq(actual, expected)),
        Operator::In => expected
            .as_array()
            .map(|items| items.iter().any(|item| loose_eq(actual, item))),
        Operator::NotIn => expected
            .as_array()
            .map(|items| !items.iter().any(|item| loose_eq(actual, item))),
        Operator::GreaterThan => compare(actual, expected).map(|o| o.is_gt()),
        Operator::LessThan => compare(actual, expected).map(|o| o.is_lt()),
        Operator::GreaterThanOrEqual => compare(actual, expected).map(|o| o.is_ge()),
        Operator::LessThanOrEqual => compare(actual, expected).map(|o| o.is_le()),
        Operator::Contains => contains(actual, expected),
        Operator::IsToday => is_today(actual, expected, today),
        Operator::LessThanDaysAgo => {
            days_ago(actual, today).zip(as_number(expected)).map(|(d, n)| (d as f64) < n)
        }
        Operator::GreaterThanDaysAgo => {
            days_ago(actual, today).zip(as_number(expected)).map(|(d, n)| (d as f64) > n)
        }
        // Presence was settled before the value comparison.
        Operator::Exists => Some(true),
    };

    result.unwrap_or_else(|| {
        tracing::warn!(
            field = %condition.field,
            operator = op.as_str(),
            "Condition values could not be compared, treating condition as false"
        );
        false
    })
}

// ---------------------------------------------------------------------------
// Value helpers
// ---------------------------------------------------------------------------

/// Look up `path` in `attrs`: an exact key first, then a dotted path.
pub fn lookup<'a>(attrs: &'a Value, path: &str) -> Option<&'a Value> {
    let object = attrs.as_object()?;
    if let Some(v) = object.get(path) {
        return Some(v);
    }
    if !path.contains('.') {
        return None;
    }
    path.split('.')
        .try_fold(attrs, |current, part| current.as_object()?.get(part))
}

/// Equality with number/string/bool coercion. Strings compare
/// case-sensitively.
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Number(_), Value::String(_)) | (Value::String(_), Value::Number(_)) => {
            as_number(a).zip(as_number(b)).is_some_and(|(x, y)| x == y)
        }
        (Value::Bool(x), Value::String(s)) | (Value::String(s), Value::Bool(x)) => {
            s.trim().eq_ignore_ascii_case(if *x { "true" } else { "false" })
        }
        _ => a == b,
    }
}

/// Numeric view of a JSON number or numeric string.
pub fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Calendar date of an RFC 3339 timestamp or `YYYY-MM-DD` string.
pub fn as_date(v: &Value) -> Option<NaiveDate> {
    let s = v.as_str()?.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.date_naive());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    as_number(a)?.partial_cmp(&as_number(b)?)
}

fn contains(actual: &Value, expected: &Value) -> Option<bool> {
    match actual {
        Value::String(haystack) => {
            let needle = match expected {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => return None,
            };
            Some(haystack.to_lowercase().contains(&needle.to_lowercase()))
        }
        Value::Array(items) => Some(items.iter().any(|item| loose_eq(item, expected))),
        _ => None,
    }
}

fn is_today(actual: &Value, expected: &Value, today: NaiveDate) -> Option<bool> {
    let date = as_date(actual)?;
    let hit = if expected.as_str() == Some(ANNIVERSARY) {
        same_anniversary(date, today)
    } else {
        date == today
    };
    Some(match expected {
        Value::Bool(false) => !hit,
        _ => hit,
    })
}

/// Month/day match. Feb 29 dates are celebrated on Feb 28 in common years.
pub fn same_anniversary(date: NaiveDate, day: NaiveDate) -> bool {
    if date.month() == day.month() && date.day() == day.day() {
        return true;
    }
    let is_leap_day = date.month() == 2 && date.day() == 29;
    is_leap_day
        && day.month() == 2
        && day.day() == 28
        && NaiveDate::from_ymd_opt(day.year(), 2, 29).is_none()
}

fn days_ago(actual: &Value, today: NaiveDate) -> Option<i64> {
    as_date(actual).map(|d| (today - d).num_days())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
