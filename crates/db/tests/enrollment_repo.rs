//! Integration tests for the engine's tables.
//!
//! Exercises the repositories against a real database:
//! - Bootstrap and status seed data
//! - Workflow versioning
//! - Single active enrollment per (workflow, subject)
//! - Leases and optimistic version checks
//! - Trigger firing idempotency

use cadence_core::enrollment::{Enrollment, EnrollmentStatus, NewEnrollment};
use cadence_core::workflow::{
    Action, ActionKind, EventFilters, Trigger, WorkflowDefinition, WorkflowStatus,
};
use cadence_db::repositories::enrollment_repo::ACTIVE_PAIR_CONSTRAINT;
use cadence_db::repositories::{EnrollmentRepo, SubjectRepo, TriggerFiringRepo, WorkflowRepo};
use chrono::{Duration, Utc};
use serde_json::json;
use sqlx::PgPool;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn definition(tenant_id: i64) -> WorkflowDefinition {
    WorkflowDefinition {
        id: 0,
        tenant_id,
        name: "Welcome".to_string(),
        status: WorkflowStatus::Active,
        version: 1,
        triggers: vec![Trigger::Event {
            event_name: "contact_created".to_string(),
            filters: EventFilters::default(),
        }],
        conditions: vec![],
        actions: vec![
            Action::new(0, ActionKind::SendEmail, 0, json!({"subject": "Hi", "body": "Hello"})),
            Action::new(1, ActionKind::WaitDelay, 60, json!({})),
        ],
        variables: vec![],
    }
}

fn new_enrollment(workflow_id: i64, subject_id: i64) -> NewEnrollment {
    let now = Utc::now();
    NewEnrollment {
        tenant_id: 1,
        workflow_id,
        workflow_version: 1,
        subject_id,
        enrolled_at: now,
        next_run_at: now,
    }
}

async fn workflow_id(pool: &PgPool) -> i64 {
    WorkflowRepo::create(pool, &definition(1)).await.unwrap().id
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_bootstrap(pool: PgPool) {
    cadence_db::health_check(&pool).await.unwrap();

    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM enrollment_statuses")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count.0, 4);
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_update_definition_keeps_old_version(pool: PgPool) {
    let created = WorkflowRepo::create(&pool, &definition(1)).await.unwrap();
    assert_eq!(created.version, 1);

    let mut edited = definition(1);
    edited.name = "Welcome v2".to_string();
    edited.actions.truncate(1);
    let updated = WorkflowRepo::update_definition(&pool, created.id, &edited)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.version, 2);
    assert_eq!(updated.actions.0.len(), 1);

    let v1 = WorkflowRepo::find_version(&pool, created.id, 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(v1.actions.0.len(), 2);
    assert_eq!(v1.name, "Welcome");

    let current: WorkflowDefinition = WorkflowRepo::find_by_id(&pool, created.id)
        .await
        .unwrap()
        .unwrap()
        .try_into()
        .unwrap();
    assert_eq!(current.version, 2);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_list_active_filters_status_and_tenant(pool: PgPool) {
    let a = WorkflowRepo::create(&pool, &definition(1)).await.unwrap();
    let b = WorkflowRepo::create(&pool, &definition(1)).await.unwrap();
    WorkflowRepo::create(&pool, &definition(2)).await.unwrap();
    WorkflowRepo::set_status(&pool, b.id, WorkflowStatus::Paused)
        .await
        .unwrap();

    let active = WorkflowRepo::list_active(&pool, 1).await.unwrap();
    assert_eq!(active.iter().map(|w| w.id).collect::<Vec<_>>(), vec![a.id]);
    assert_eq!(WorkflowRepo::list_all_active(&pool).await.unwrap().len(), 2);
}

// ---------------------------------------------------------------------------
// Enrollments
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_second_active_enrollment_rejected(pool: PgPool) {
    let wf = workflow_id(&pool).await;
    EnrollmentRepo::create(&pool, &new_enrollment(wf, 10))
        .await
        .unwrap();

    let err = EnrollmentRepo::create(&pool, &new_enrollment(wf, 10))
        .await
        .unwrap_err();
    assert!(cadence_db::is_unique_violation(&err, ACTIVE_PAIR_CONSTRAINT));
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_reenroll_after_terminal_state(pool: PgPool) {
    let wf = workflow_id(&pool).await;
    let row = EnrollmentRepo::create(&pool, &new_enrollment(wf, 10))
        .await
        .unwrap();

    let mut done: Enrollment = row.try_into().unwrap();
    done.status = EnrollmentStatus::Cancelled;
    done.next_run_at = None;
    done.cancel_reason = Some("unsubscribed".to_string());
    EnrollmentRepo::update_if_version(&pool, &done)
        .await
        .unwrap()
        .unwrap();

    EnrollmentRepo::create(&pool, &new_enrollment(wf, 10))
        .await
        .unwrap();
    assert_eq!(
        EnrollmentRepo::list_for_subject(&pool, 1, 10)
            .await
            .unwrap()
            .len(),
        2
    );
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_stale_version_write_is_rejected(pool: PgPool) {
    let wf = workflow_id(&pool).await;
    let row = EnrollmentRepo::create(&pool, &new_enrollment(wf, 10))
        .await
        .unwrap();
    let original: Enrollment = row.try_into().unwrap();

    let mut first = original.clone();
    first.current_action_index = 1;
    let written = EnrollmentRepo::update_if_version(&pool, &first)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(written.version, original.version + 1);

    let mut stale = original.clone();
    stale.status = EnrollmentStatus::Failed;
    stale.next_run_at = None;
    assert!(EnrollmentRepo::update_if_version(&pool, &stale)
        .await
        .unwrap()
        .is_none());
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_lease_is_exclusive_until_expiry(pool: PgPool) {
    let wf = workflow_id(&pool).await;
    let row = EnrollmentRepo::create(&pool, &new_enrollment(wf, 10))
        .await
        .unwrap();
    let now = Utc::now();
    let until = now + Duration::seconds(300);

    assert!(EnrollmentRepo::try_lease(&pool, row.id, "worker-a", now, until)
        .await
        .unwrap()
        .is_some());
    assert!(EnrollmentRepo::try_lease(&pool, row.id, "worker-b", now, until)
        .await
        .unwrap()
        .is_none());
    // Not even the holder can lease it twice.
    assert!(EnrollmentRepo::try_lease(&pool, row.id, "worker-a", now, until)
        .await
        .unwrap()
        .is_none());

    // Leased rows are not listed as due.
    assert!(EnrollmentRepo::list_due(&pool, now, 10).await.unwrap().is_empty());

    // After expiry anyone may take it.
    let later = until + Duration::seconds(1);
    let taken = EnrollmentRepo::try_lease(
        &pool,
        row.id,
        "worker-b",
        later,
        later + Duration::seconds(300),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(taken.lease_owner.as_deref(), Some("worker-b"));

    assert!(!EnrollmentRepo::release(&pool, row.id, "worker-a").await.unwrap());
    assert!(EnrollmentRepo::release(&pool, row.id, "worker-b").await.unwrap());
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_list_due_orders_oldest_first(pool: PgPool) {
    let wf = workflow_id(&pool).await;
    let now = Utc::now();

    let mut later = new_enrollment(wf, 1);
    later.next_run_at = now - Duration::minutes(1);
    let mut earlier = new_enrollment(wf, 2);
    earlier.next_run_at = now - Duration::minutes(5);
    let mut future = new_enrollment(wf, 3);
    future.next_run_at = now + Duration::minutes(5);

    for input in [&later, &earlier, &future] {
        EnrollmentRepo::create(&pool, input).await.unwrap();
    }

    let due = EnrollmentRepo::list_due(&pool, now, 10).await.unwrap();
    let subjects: Vec<i64> = due.iter().map(|r| r.subject_id).collect();
    assert_eq!(subjects, vec![2, 1]);
}

// ---------------------------------------------------------------------------
// Trigger firings and subjects
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_occurrence_recorded_once(pool: PgPool) {
    let wf = workflow_id(&pool).await;
    let now = Utc::now();

    assert!(TriggerFiringRepo::record(&pool, wf, 10, "2025-07-10", now).await.unwrap());
    assert!(!TriggerFiringRepo::record(&pool, wf, 10, "2025-07-10", now).await.unwrap());
    assert!(TriggerFiringRepo::record(&pool, wf, 10, "2026-07-10", now).await.unwrap());

    TriggerFiringRepo::forget(&pool, wf, 10, "2025-07-10").await.unwrap();
    assert!(TriggerFiringRepo::find(&pool, wf, 10, "2025-07-10")
        .await
        .unwrap()
        .is_none());
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_subjects_scoped_by_tenant(pool: PgPool) {
    let s = SubjectRepo::upsert(&pool, None, 1, &json!({"firstName": "Marie"}))
        .await
        .unwrap();
    SubjectRepo::upsert(&pool, None, 2, &json!({"firstName": "Other"}))
        .await
        .unwrap();

    assert!(SubjectRepo::find(&pool, 2, s.id).await.unwrap().is_none());
    assert_eq!(SubjectRepo::list_for_tenant(&pool, 1).await.unwrap().len(), 1);

    let updated = SubjectRepo::upsert(&pool, Some(s.id), 1, &json!({"firstName": "Marie-Claire"}))
        .await
        .unwrap();
    assert_eq!(updated.attributes["firstName"], "Marie-Claire");
}
