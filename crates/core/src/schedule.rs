//! Delay arithmetic and retry backoff.
//!
//! Delays are relative to the moment the previous action actually
//! completed, not to the enrollment start. A worker that was offline for a
//! while therefore shifts every later step by the outage instead of
//! bunching them up.

use chrono::Duration;

use crate::enrollment::Enrollment;
use crate::types::Timestamp;
use crate::workflow::WorkflowDefinition;

/// Default number of attempts per action before the enrollment fails.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default base delay of the first retry.
pub const DEFAULT_RETRY_BASE_SECS: i64 = 60;

/// Default ceiling for a single retry delay.
pub const DEFAULT_RETRY_MAX_SECS: i64 = 3600;

// ---------------------------------------------------------------------------
// Step scheduling
// ---------------------------------------------------------------------------

/// When action 0 of a fresh enrollment becomes due. `None` if the
/// definition has no actions.
pub fn initial_run_at(def: &WorkflowDefinition, enrolled_at: Timestamp) -> Option<Timestamp> {
    def.action(0).map(|first| enrolled_at + first.delay())
}

/// When the action after the one just completed becomes due, or `None` if
/// the completed action was the last one.
///
/// `enrollment.current_action_index` is the index of the action that just
/// completed.
pub fn schedule_next(
    enrollment: &Enrollment,
    def: &WorkflowDefinition,
    completed_at: Timestamp,
) -> Option<Timestamp> {
    def.action(enrollment.current_action_index + 1)
        .map(|next| completed_at + next.delay())
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Exponential backoff for transient dispatch failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per action, counting the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::seconds(DEFAULT_RETRY_BASE_SECS),
            max_delay: Duration::seconds(DEFAULT_RETRY_MAX_SECS),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`. Jitter is applied by the caller.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        let factor = 1i32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Whether another attempt is allowed after `attempts` failures.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrollment::EnrollmentStatus;
    use crate::workflow::{Action, ActionKind, EventFilters, Trigger, WorkflowStatus};
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn definition(delays: &[u32]) -> WorkflowDefinition {
        WorkflowDefinition {
            id: 1,
            tenant_id: 1,
            name: "Nurture".into(),
            status: WorkflowStatus::Active,
            version: 1,
            triggers: vec![Trigger::Event {
                event_name: "contact_created".into(),
                filters: EventFilters::default(),
            }],
            conditions: vec![],
            actions: delays
                .iter()
                .enumerate()
                .map(|(i, d)| Action::new(i as u32, ActionKind::WaitDelay, *d, json!({})))
                .collect(),
            variables: vec![],
        }
    }

    fn enrollment_at(index: u32, enrolled_at: Timestamp) -> Enrollment {
        Enrollment {
            id: 1,
            tenant_id: 1,
            workflow_id: 1,
            workflow_version: 1,
            subject_id: 5,
            status: EnrollmentStatus::Active,
            current_action_index: index,
            attempts: 0,
            enrolled_at,
            next_run_at: Some(enrolled_at),
            last_error: None,
            cancel_reason: None,
            completed_at: None,
            lease_owner: None,
            lease_expires_at: None,
            version: 1,
            updated_at: enrolled_at,
        }
    }

    #[test]
    fn first_step_is_relative_to_enrollment() {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let def = definition(&[60, 1440]);
        assert_eq!(initial_run_at(&def, t0), Some(t0 + Duration::minutes(60)));
        assert_eq!(initial_run_at(&definition(&[]), t0), None);
    }

    #[test]
    fn late_run_shifts_following_steps() {
        // Worker offline from T0+60 to T0+90: action 0 runs at T0+90 and
        // action 1 is due 1440 minutes after that, not after T0+60.
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let def = definition(&[60, 1440, 10080]);
        let ran_at = t0 + Duration::minutes(90);
        let next = schedule_next(&enrollment_at(0, t0), &def, ran_at);
        assert_eq!(next, Some(ran_at + Duration::minutes(1440)));
    }

    #[test]
    fn last_step_has_no_successor() {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let def = definition(&[60, 1440, 10080]);
        assert_eq!(schedule_next(&enrollment_at(2, t0), &def, t0), None);
    }

    #[test]
    fn zero_delay_runs_immediately() {
        let t0 = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
        let def = definition(&[0, 0]);
        assert_eq!(schedule_next(&enrollment_at(0, t0), &def, t0), Some(t0));
    }

    #[test]
    fn backoff_doubles_from_base() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::seconds(60));
        assert_eq!(policy.backoff(2), Duration::seconds(120));
        assert_eq!(policy.backoff(3), Duration::seconds(240));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(10), Duration::seconds(3600));
        assert_eq!(policy.backoff(200), Duration::seconds(3600));
    }

    #[test]
    fn retries_stop_at_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }
}
