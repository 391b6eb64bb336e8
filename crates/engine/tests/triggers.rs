mod common;

use std::collections::BTreeMap;
use std::time::Duration as StdDuration;

use cadence_core::catalog;
use cadence_core::dispatch::DispatchRequest;
use cadence_core::enrollment::EnrollmentStatus;
use cadence_core::trigger::{
    event_occurrence_key, recurring_occurrence_key, scheduled_occurrence_key,
};
use cadence_core::workflow::{Condition, EventFilters, RecurrenceRule, Trigger, WorkflowStatus};
use cadence_engine::triggers::AUDIENCE_MARKER_SUBJECT;
use cadence_events::DomainEvent;
use chrono::{Duration, NaiveDate, TimeZone, Utc};
use common::*;
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn purchase(subject: i64, id: &str, amount: f64) -> DomainEvent {
    DomainEvent::new(TENANT, "purchase_completed")
        .for_subject(subject)
        .with_id(id)
        .with_payload(json!({"amount": amount, "channel_type": "web"}))
}

fn purchase_trigger(filters: EventFilters) -> Vec<Trigger> {
    vec![Trigger::Event {
        event_name: "purchase_completed".into(),
        filters,
    }]
}

// ---------------------------------------------------------------------------
// Event triggers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn matching_event_enrolls_the_subject() {
    let h = Harness::new();
    let wf = h.workflow_with(purchase_trigger(EventFilters::default()), vec![], vec![email(0, 60)]);
    let subject = h.subject(contact());

    let report = h.engine.handle_event(&purchase(subject, "evt-1", 80.0)).await.unwrap();
    assert_eq!(report.fired, 1);
    assert_eq!(report.enrolled, 1);

    let enrollments = h.store.enrollments_for(wf.id, subject);
    assert_eq!(enrollments.len(), 1);
    assert_eq!(
        h.store.firing(wf.id, subject, &event_occurrence_key("evt-1")),
        Some(Some(enrollments[0].id))
    );
}

#[tokio::test]
async fn redelivered_event_is_a_duplicate_occurrence() {
    let h = Harness::new();
    let wf = h.workflow_with(purchase_trigger(EventFilters::default()), vec![], vec![email(0, 60)]);
    let subject = h.subject(contact());
    let event = purchase(subject, "evt-1", 80.0);

    h.engine.handle_event(&event).await.unwrap();
    let enrollment = h.store.enrollments_for(wf.id, subject).pop().unwrap();
    h.engine.cancel(enrollment.id, "Manual stop").await.unwrap();

    // Even with the earlier run ended, the same event never enrolls twice.
    let report = h.engine.handle_event(&event).await.unwrap();
    assert_eq!(report.duplicate_occurrence, 1);
    assert_eq!(report.enrolled, 0);
    assert_eq!(h.store.enrollments_for(wf.id, subject).len(), 1);
}

#[tokio::test]
async fn new_event_while_enrolled_reports_already_enrolled() {
    let h = Harness::new();
    let wf = h.workflow_with(purchase_trigger(EventFilters::default()), vec![], vec![email(0, 60)]);
    let subject = h.subject(contact());

    h.engine.handle_event(&purchase(subject, "evt-1", 80.0)).await.unwrap();
    let report = h.engine.handle_event(&purchase(subject, "evt-2", 90.0)).await.unwrap();
    assert_eq!(report.already_enrolled, 1);
    assert_eq!(report.enrolled, 0);
    assert_eq!(h.store.enrollments_for(wf.id, subject).len(), 1);
    // The occurrence is consumed even though no enrollment was attached.
    assert_eq!(h.store.firing(wf.id, subject, &event_occurrence_key("evt-2")), Some(None));
}

#[tokio::test]
async fn filters_select_which_events_fire() {
    let h = Harness::new();
    let filters = EventFilters {
        equals: BTreeMap::from([("channel_type".to_string(), json!("web"))]),
        ..Default::default()
    };
    let wf = h.workflow_with(purchase_trigger(filters), vec![], vec![email(0, 60)]);
    let subject = h.subject(contact());

    let in_store = DomainEvent::new(TENANT, "purchase_completed")
        .for_subject(subject)
        .with_payload(json!({"amount": 80, "channel_type": "pos"}));
    let report = h.engine.handle_event(&in_store).await.unwrap();
    assert_eq!(report.fired, 0);

    let other_name = DomainEvent::new(TENANT, "cart_abandoned").for_subject(subject);
    assert_eq!(h.engine.handle_event(&other_name).await.unwrap().fired, 0);

    let report = h.engine.handle_event(&purchase(subject, "evt-1", 80.0)).await.unwrap();
    assert_eq!(report.enrolled, 1);
    assert_eq!(h.store.enrollments_for(wf.id, subject).len(), 1);
}

#[tokio::test]
async fn conditions_see_the_event_payload() {
    let h = Harness::new();
    let wf = h.workflow_with(
        purchase_trigger(EventFilters::default()),
        vec![
            Condition::new("amount", "greater_than", json!(100)),
            Condition::new("firstName", "equals", json!("Marie")),
        ],
        vec![email(0, 60)],
    );
    let subject = h.subject(contact());

    let report = h.engine.handle_event(&purchase(subject, "small", 40.0)).await.unwrap();
    assert_eq!(report.fired, 1);
    assert_eq!(report.conditions_failed, 1);
    assert_eq!(h.store.firing(wf.id, subject, &event_occurrence_key("small")), None);

    let report = h.engine.handle_event(&purchase(subject, "large", 250.0)).await.unwrap();
    assert_eq!(report.enrolled, 1);
}

#[tokio::test]
async fn events_stay_within_their_tenant() {
    let h = Harness::new();
    h.workflow_with(purchase_trigger(EventFilters::default()), vec![], vec![email(0, 60)]);
    let subject = h.subject(contact());

    let foreign = DomainEvent::new(TENANT + 1, "purchase_completed").for_subject(subject);
    let report = h.engine.handle_event(&foreign).await.unwrap();
    assert_eq!(report.fired, 0);
    assert!(h.store.enrollments().is_empty());
}

#[tokio::test]
async fn paused_workflows_do_not_fire() {
    let h = Harness::new();
    let wf = h.workflow_with(purchase_trigger(EventFilters::default()), vec![], vec![email(0, 60)]);
    h.store.set_workflow_status(wf.id, WorkflowStatus::Paused).unwrap();
    let subject = h.subject(contact());

    let report = h.engine.handle_event(&purchase(subject, "evt-1", 80.0)).await.unwrap();
    assert_eq!(report.fired, 0);
}

#[tokio::test]
async fn events_without_a_known_subject_enroll_nobody() {
    let h = Harness::new();
    h.workflow_with(purchase_trigger(EventFilters::default()), vec![], vec![email(0, 60)]);

    let anonymous = DomainEvent::new(TENANT, "purchase_completed");
    assert_eq!(h.engine.handle_event(&anonymous).await.unwrap().fired, 0);

    let report = h.engine.handle_event(&purchase(404, "evt-1", 80.0)).await.unwrap();
    assert_eq!(report.fired, 1);
    assert_eq!(report.errors, 1);
    assert!(h.store.enrollments().is_empty());
}

#[tokio::test]
async fn catalog_campaign_runs_end_to_end() {
    let h = Harness::new();
    let mut def = catalog::instantiate("abandoned-cart-recovery", TENANT).unwrap();
    def.status = WorkflowStatus::Active;
    let wf = h.store.insert_workflow(def).unwrap();
    let subject = h.subject(json!({
        "firstName": "Marie",
        "email": "marie@example.com",
        "phone": "+33612345678",
        "phone_verified": true
    }));

    let event = DomainEvent::new(TENANT, "cart_abandoned")
        .for_subject(subject)
        .with_payload(json!({"cart_total": 120, "item_count": 2}));
    assert_eq!(h.engine.handle_event(&event).await.unwrap().enrolled, 1);

    h.advance(60);
    assert_eq!(h.engine.sweep_once().await.unwrap().dispatched, 1);
    let calls = h.channel.calls();
    let DispatchRequest::Email(message) = &calls[0].request else {
        panic!("expected an email, got {:?}", calls[0].request);
    };
    assert_eq!(message.subject, "You left something behind...");
    assert!(message.body.starts_with("Hi Marie,"));
    assert_eq!(message.template.as_deref(), Some("transactional"));

    let enrollment = h.store.enrollments_for(wf.id, subject).pop().unwrap();
    assert_eq!(enrollment.current_action_index, 1);
}

// ---------------------------------------------------------------------------
// Recurring triggers
// ---------------------------------------------------------------------------

fn birthday_workflow(h: &Harness) -> i64 {
    h.workflow_with(
        vec![Trigger::Recurring {
            rule: RecurrenceRule::AnniversaryOf {
                field: "birthday".into(),
                days_before: 7,
            },
        }],
        vec![],
        vec![email(0, 0)],
    )
    .id
}

#[tokio::test]
async fn birthday_fires_once_per_year() {
    let h = Harness::new();
    let wf = birthday_workflow(&h);
    let marie = h.subject(json!({
        "firstName": "Marie",
        "email": "m@example.com",
        "birthday": "1990-03-08"
    }));
    let paul = h.subject(json!({
        "firstName": "Paul",
        "email": "p@example.com",
        "birthday": "1985-07-14"
    }));

    let report = h.engine.triggers().evaluate_recurring().await.unwrap();
    assert_eq!(report.fired, 1);
    assert_eq!(report.enrolled, 1);
    assert!(h.store.enrollments_for(wf, paul).is_empty());

    let key = recurring_occurrence_key(NaiveDate::from_ymd_opt(2025, 3, 8).unwrap());
    assert_eq!(key, "2025-03-08");
    assert!(h.store.firing(wf, marie, &key).is_some());

    // A second pass the same day changes nothing.
    h.advance(120);
    let again = h.engine.triggers().evaluate_recurring().await.unwrap();
    assert_eq!(again.duplicate_occurrence, 1);
    assert_eq!(again.enrolled, 0);
    assert_eq!(h.store.enrollments_for(wf, marie).len(), 1);

    // Next year is a new occurrence.
    h.engine.sweep_once().await.unwrap();
    h.clock.set(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
    let next_year = h.engine.triggers().evaluate_recurring().await.unwrap();
    assert_eq!(next_year.enrolled, 1);
    assert_eq!(h.store.enrollments_for(wf, marie).len(), 2);
}

#[tokio::test]
async fn inactivity_fires_once_across_days() {
    let h = Harness::new();
    let wf = h.workflow_with(
        vec![Trigger::Recurring {
            rule: RecurrenceRule::Inactivity {
                field: "days_since_last_purchase".into(),
                days: 90,
            },
        }],
        vec![],
        vec![email(0, 0)],
    );
    let subject = h.subject(json!({"email": "m@example.com", "days_since_last_purchase": 95}));

    assert_eq!(h.engine.triggers().evaluate_recurring().await.unwrap().enrolled, 1);
    h.engine.sweep_once().await.unwrap();
    assert_eq!(h.store.enrollments_for(wf.id, subject)[0].status, EnrollmentStatus::Completed);

    // The attribute counts up a day later; the occurrence date does not move.
    h.store.upsert_subject(
        TENANT,
        Some(subject),
        json!({"email": "m@example.com", "days_since_last_purchase": 96}),
    );
    h.advance(24 * 60);
    let report = h.engine.triggers().evaluate_recurring().await.unwrap();
    assert_eq!(report.duplicate_occurrence, 1);
    assert_eq!(h.store.enrollments_for(wf.id, subject).len(), 1);
}

#[tokio::test]
async fn malformed_subject_is_skipped_while_the_rest_enroll() {
    let h = Harness::new();
    let wf = h.workflow_with(
        vec![Trigger::Recurring {
            rule: RecurrenceRule::Inactivity {
                field: "days_since_last_purchase".into(),
                days: 90,
            },
        }],
        vec![],
        vec![email(0, 0)],
    );
    let first = h.subject(json!({"email": "a@example.com", "days_since_last_purchase": 120}));
    let broken = h.subject(json!({"email": "b@example.com", "days_since_last_purchase": 1.0e12}));
    let second = h.subject(json!({"email": "c@example.com", "days_since_last_purchase": 91}));

    let report = h.engine.triggers().evaluate_recurring().await.unwrap();
    assert_eq!(report.errors, 1);
    assert_eq!(report.enrolled, 2);
    assert_eq!(h.store.enrollments_for(wf.id, first).len(), 1);
    assert_eq!(h.store.enrollments_for(wf.id, second).len(), 1);
    assert!(h.store.enrollments_for(wf.id, broken).is_empty());

    // A later pass still runs and reports the same subject again.
    let report = h.engine.triggers().evaluate_recurring().await.unwrap();
    assert_eq!(report.errors, 1);
    assert_eq!(report.duplicate_occurrence, 2);
}

// ---------------------------------------------------------------------------
// Scheduled triggers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scheduled_trigger_fans_out_once() {
    let h = Harness::new();
    let at = t0() + Duration::minutes(60);
    let wf = h.workflow_with(vec![Trigger::Scheduled { at }], vec![], vec![email(0, 0)]);
    let first = h.subject(contact());
    let second = h.subject(contact());

    let early = h.engine.triggers().evaluate_scheduled().await.unwrap();
    assert_eq!(early.fired, 0);

    h.advance(61);
    let report = h.engine.triggers().evaluate_scheduled().await.unwrap();
    assert_eq!(report.fired, 2);
    assert_eq!(report.enrolled, 2);
    assert_eq!(h.store.enrollments_for(wf.id, first).len(), 1);
    assert_eq!(h.store.enrollments_for(wf.id, second).len(), 1);
    assert!(h
        .store
        .firing(wf.id, AUDIENCE_MARKER_SUBJECT, &scheduled_occurrence_key(at))
        .is_some());

    // Subjects created after the fan-out are not swept in later.
    let late = h.subject(contact());
    let again = h.engine.triggers().evaluate_scheduled().await.unwrap();
    assert_eq!(again.fired, 0);
    assert!(h.store.enrollments_for(wf.id, late).is_empty());
    assert_eq!(h.store.firing_count(), 3);
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

#[tokio::test]
async fn published_events_reach_the_listener() {
    let h = Harness::new();
    let wf = h.workflow_with(
        purchase_trigger(EventFilters::default()),
        vec![],
        vec![email(0, 600)],
    );
    let subject = h.subject(contact());

    let cancel = CancellationToken::new();
    let handles = h.engine.spawn(cancel.clone());
    assert!(h.engine.publish_event(purchase(subject, "evt-1", 80.0)) >= 1);

    let mut enrolled = false;
    for _ in 0..100 {
        if !h.store.enrollments_for(wf.id, subject).is_empty() {
            enrolled = true;
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(10)).await;
    }

    cancel.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
    assert!(enrolled);
}
