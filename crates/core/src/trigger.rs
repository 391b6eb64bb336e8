//! Trigger matching and occurrence keys.
//!
//! Every firing is keyed by `(workflow_id, subject_id, occurrence_key)`.
//! The helpers here compute those keys and decide, without I/O, whether an
//! event payload or a subject's attributes make a trigger fire.

use chrono::{Duration, NaiveDate};
use serde_json::Value;

use crate::condition::{as_date, as_number, lookup, loose_eq, same_anniversary};
use crate::error::CoreError;
use crate::types::Timestamp;
use crate::workflow::{EventFilters, RecurrenceRule};

/// Payload field searched for keywords when a filter does not name one.
pub const DEFAULT_KEYWORDS_FIELD: &str = "message";

/// Payload field holding the inbound channel of message events.
pub const CHANNEL_TYPE_FIELD: &str = "channel_type";

// ---------------------------------------------------------------------------
// Occurrence keys
// ---------------------------------------------------------------------------

/// Occurrence key for an event firing: the event id.
pub fn event_occurrence_key(event_id: &str) -> String {
    event_id.to_string()
}

/// Occurrence key for a recurring firing: the occurrence's calendar date.
pub fn recurring_occurrence_key(occurrence: NaiveDate) -> String {
    occurrence.format("%Y-%m-%d").to_string()
}

/// Occurrence key for a one-shot scheduled firing.
pub fn scheduled_occurrence_key(at: Timestamp) -> String {
    format!("scheduled:{}", at.to_rfc3339())
}

// ---------------------------------------------------------------------------
// Event filters
// ---------------------------------------------------------------------------

/// Whether an event payload satisfies every filter.
pub fn filters_match(filters: &EventFilters, payload: &Value) -> bool {
    if !filters.channel_types.is_empty() {
        let Some(channel) = lookup(payload, CHANNEL_TYPE_FIELD).and_then(Value::as_str) else {
            return false;
        };
        if !filters
            .channel_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(channel))
        {
            return false;
        }
    }

    for (field, expected) in &filters.equals {
        match lookup(payload, field) {
            Some(actual) if loose_eq(actual, expected) => {}
            _ => return false,
        }
    }

    if !filters.keywords.is_empty() {
        let field = filters
            .keywords_field
            .as_deref()
            .unwrap_or(DEFAULT_KEYWORDS_FIELD);
        let Some(text) = lookup(payload, field).and_then(Value::as_str) else {
            return false;
        };
        let text = text.to_lowercase();
        if !filters
            .keywords
            .iter()
            .any(|k| !k.is_empty() && text.contains(&k.to_lowercase()))
        {
            return false;
        }
    }

    true
}

// ---------------------------------------------------------------------------
// Recurring rules
// ---------------------------------------------------------------------------

/// If `rule` fires for this subject on `today`, the date of the occurrence
/// it fires for. Two evaluations on the same day (or across days, for
/// inactivity) yield the same date, which makes the firing idempotent.
///
/// Attribute values that put the occurrence outside the calendar are a
/// validation error for this subject only.
pub fn recurring_occurrence(
    rule: &RecurrenceRule,
    attrs: &Value,
    today: NaiveDate,
) -> Result<Option<NaiveDate>, CoreError> {
    match rule {
        RecurrenceRule::AnniversaryOf { field, days_before } => {
            let Some(date) = lookup(attrs, field).and_then(as_date) else {
                return Ok(None);
            };
            let target = shift_days(today, i64::from(*days_before), field)?;
            Ok(same_anniversary(date, target).then_some(target))
        }
        RecurrenceRule::Inactivity { field, days } => {
            let Some(value) = lookup(attrs, field) else {
                return Ok(None);
            };
            let threshold = i64::from(*days);
            if let Some(last) = as_date(value) {
                let due = shift_days(last, threshold, field)?;
                return Ok((due <= today).then_some(due));
            }
            let Some(since) = as_number(value) else {
                return Ok(None);
            };
            if !since.is_finite() || since.abs() > MAX_DAY_COUNT {
                return Err(CoreError::Validation(format!(
                    "Attribute '{field}' is not a usable day count: {since}"
                )));
            }
            // A numeric "days since" attribute counts up by one every day,
            // so the occurrence date is the day it crossed the threshold.
            let since = since.floor() as i64;
            if since < threshold {
                return Ok(None);
            }
            shift_days(today, threshold - since, field).map(Some)
        }
    }
}

/// Largest day count accepted from a numeric attribute, about 27,000 years.
const MAX_DAY_COUNT: f64 = 10_000_000.0;

fn shift_days(date: NaiveDate, days: i64, field: &str) -> Result<NaiveDate, CoreError> {
    Duration::try_days(days)
        .and_then(|delta| date.checked_add_signed(delta))
        .ok_or_else(|| {
            CoreError::Validation(format!(
                "Attribute '{field}' moves the occurrence out of the calendar range"
            ))
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn occurs(rule: &RecurrenceRule, attrs: &Value, today: NaiveDate) -> Option<NaiveDate> {
        recurring_occurrence(rule, attrs, today).unwrap()
    }

    #[test]
    fn empty_filters_match_anything() {
        assert!(filters_match(&EventFilters::default(), &json!({})));
    }

    #[test]
    fn equals_filter_uses_loose_equality() {
        let filters = EventFilters {
            equals: BTreeMap::from([("new_status".to_string(), json!("QUALIFIED"))]),
            ..Default::default()
        };
        assert!(filters_match(&filters, &json!({"new_status": "QUALIFIED"})));
        assert!(!filters_match(&filters, &json!({"new_status": "LOST"})));
        assert!(!filters_match(&filters, &json!({})));
    }

    #[test]
    fn keyword_filter_is_case_insensitive() {
        let filters = EventFilters {
            keywords: vec!["price".into(), "quote".into()],
            ..Default::default()
        };
        assert!(filters_match(&filters, &json!({"message": "Can I get a QUOTE?"})));
        assert!(!filters_match(&filters, &json!({"message": "hello"})));
        assert!(!filters_match(&filters, &json!({"body": "quote"})));
    }

    #[test]
    fn channel_type_filter_requires_listed_channel() {
        let filters = EventFilters {
            channel_types: vec!["sms".into(), "whatsapp".into()],
            ..Default::default()
        };
        assert!(filters_match(&filters, &json!({"channel_type": "SMS"})));
        assert!(!filters_match(&filters, &json!({"channel_type": "email"})));
        assert!(!filters_match(&filters, &json!({})));
    }

    #[test]
    fn birthday_fires_days_before() {
        let rule = RecurrenceRule::AnniversaryOf {
            field: "birthday".into(),
            days_before: 3,
        };
        let attrs = json!({"birthday": "1988-07-10"});
        assert_eq!(
            occurs(&rule, &attrs, day(2025, 7, 7)),
            Some(day(2025, 7, 10))
        );
        assert_eq!(occurs(&rule, &attrs, day(2025, 7, 8)), None);
    }

    #[test]
    fn anniversary_across_year_boundary() {
        let rule = RecurrenceRule::AnniversaryOf {
            field: "birthday".into(),
            days_before: 5,
        };
        let attrs = json!({"birthday": "2000-01-02"});
        assert_eq!(
            occurs(&rule, &attrs, day(2025, 12, 28)),
            Some(day(2026, 1, 2))
        );
    }

    #[test]
    fn inactivity_from_date_is_stable_across_days() {
        let rule = RecurrenceRule::Inactivity {
            field: "last_purchase_date".into(),
            days: 90,
        };
        let attrs = json!({"last_purchase_date": "2025-01-01"});
        let first = occurs(&rule, &attrs, day(2025, 4, 1));
        let later = occurs(&rule, &attrs, day(2025, 4, 20));
        assert_eq!(first, Some(day(2025, 4, 1)));
        assert_eq!(first, later);
        assert_eq!(occurs(&rule, &attrs, day(2025, 3, 31)), None);
    }

    #[test]
    fn inactivity_from_day_counter() {
        let rule = RecurrenceRule::Inactivity {
            field: "days_since_last_purchase".into(),
            days: 90,
        };
        let occurrence =
            occurs(&rule, &json!({"days_since_last_purchase": 95}), day(2025, 6, 15));
        assert_eq!(occurrence, Some(day(2025, 6, 10)));
        assert_eq!(
            occurs(&rule, &json!({"days_since_last_purchase": 10}), day(2025, 6, 15)),
            None
        );
    }

    #[test]
    fn out_of_range_day_counter_is_rejected() {
        let rule = RecurrenceRule::Inactivity {
            field: "days_since_last_purchase".into(),
            days: 90,
        };
        for value in [json!(1.0e12), json!(1.0e9), json!(-1.0e12), json!("NaN"), json!("inf")] {
            let attrs = json!({"days_since_last_purchase": value});
            assert_matches!(
                recurring_occurrence(&rule, &attrs, day(2025, 6, 15)),
                Err(CoreError::Validation(_))
            );
        }
    }

    #[test]
    fn dates_near_the_calendar_edge_are_rejected() {
        let rule = RecurrenceRule::Inactivity {
            field: "last_purchase_date".into(),
            days: u32::MAX,
        };
        let attrs = json!({"last_purchase_date": "2025-01-01"});
        assert_matches!(
            recurring_occurrence(&rule, &attrs, day(2025, 6, 15)),
            Err(CoreError::Validation(_))
        );

        let rule = RecurrenceRule::AnniversaryOf {
            field: "birthday".into(),
            days_before: 1,
        };
        let attrs = json!({"birthday": "2000-01-01"});
        assert_matches!(
            recurring_occurrence(&rule, &attrs, NaiveDate::MAX),
            Err(CoreError::Validation(_))
        );
    }

    #[test]
    fn missing_attribute_never_fires() {
        let rule = RecurrenceRule::AnniversaryOf {
            field: "birthday".into(),
            days_before: 0,
        };
        assert_eq!(occurs(&rule, &json!({}), day(2025, 1, 1)), None);
    }

    #[test]
    fn occurrence_keys_are_stable() {
        assert_eq!(recurring_occurrence_key(day(2025, 11, 28)), "2025-11-28");
        let at = Utc.with_ymd_and_hms(2025, 11, 28, 5, 0, 0).unwrap();
        assert_eq!(scheduled_occurrence_key(at), "scheduled:2025-11-28T05:00:00+00:00");
        assert_eq!(event_occurrence_key("evt-1"), "evt-1");
    }
}
