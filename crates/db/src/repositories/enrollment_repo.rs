//! Repository for the `enrollments` table.
//!
//! Every state change is a conditional update on `version`; a `None` result
//! means another writer got there first and the caller must re-read. The
//! partial unique index `uq_enrollments_active_pair` enforces one active
//! enrollment per (workflow, subject).

use cadence_core::enrollment::{Enrollment, NewEnrollment};
use cadence_core::types::{DbId, Timestamp};
use sqlx::PgPool;

use crate::models::enrollment::EnrollmentRow;
use crate::models::status::ACTIVE;

/// Column list for `enrollments` queries.
const COLUMNS: &str = "\
    id, tenant_id, workflow_id, workflow_version, subject_id, status_id, \
    current_action_index, attempts, enrolled_at, next_run_at, \
    last_error, cancel_reason, completed_at, \
    lease_owner, lease_expires_at, version, created_at, updated_at";

/// Name of the index guarding the single-active invariant.
pub const ACTIVE_PAIR_CONSTRAINT: &str = "uq_enrollments_active_pair";

/// Provides persistence for enrollments.
pub struct EnrollmentRepo;

impl EnrollmentRepo {
    /// Insert a new active enrollment at action 0.
    ///
    /// Fails with a unique violation on [`ACTIVE_PAIR_CONSTRAINT`] when the
    /// subject already has an active enrollment in the workflow.
    pub async fn create(
        pool: &PgPool,
        input: &NewEnrollment,
    ) -> Result<EnrollmentRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO enrollments \
                 (tenant_id, workflow_id, workflow_version, subject_id, status_id, \
                  enrolled_at, next_run_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, EnrollmentRow>(&query)
            .bind(input.tenant_id)
            .bind(input.workflow_id)
            .bind(input.workflow_version)
            .bind(input.subject_id)
            .bind(ACTIVE)
            .bind(input.enrolled_at)
            .bind(input.next_run_at)
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<EnrollmentRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM enrollments WHERE id = $1");
        sqlx::query_as::<_, EnrollmentRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// The active enrollment of a subject in a workflow, if any.
    pub async fn find_active(
        pool: &PgPool,
        workflow_id: DbId,
        subject_id: DbId,
    ) -> Result<Option<EnrollmentRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM enrollments \
             WHERE workflow_id = $1 AND subject_id = $2 AND status_id = $3"
        );
        sqlx::query_as::<_, EnrollmentRow>(&query)
            .bind(workflow_id)
            .bind(subject_id)
            .bind(ACTIVE)
            .fetch_optional(pool)
            .await
    }

    /// Active enrollments due at `now` and not held by a live lease, oldest
    /// first.
    pub async fn list_due(
        pool: &PgPool,
        now: Timestamp,
        limit: i64,
    ) -> Result<Vec<EnrollmentRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM enrollments \
             WHERE status_id = $1 AND next_run_at <= $2 \
               AND (lease_expires_at IS NULL OR lease_expires_at <= $2) \
             ORDER BY next_run_at ASC, id ASC \
             LIMIT $3"
        );
        sqlx::query_as::<_, EnrollmentRow>(&query)
            .bind(ACTIVE)
            .bind(now)
            .bind(limit)
            .fetch_all(pool)
            .await
    }

    /// Take the lease on an active enrollment.
    ///
    /// Succeeds only when the enrollment has no lease or its lease has
    /// expired. A live lease is exclusive, even against the owner that holds
    /// it. Returns the leased row, or `None` when the lease is taken or the
    /// enrollment is no longer active. The lease does not bump `version`.
    pub async fn try_lease(
        pool: &PgPool,
        id: DbId,
        owner: &str,
        now: Timestamp,
        until: Timestamp,
    ) -> Result<Option<EnrollmentRow>, sqlx::Error> {
        let query = format!(
            "UPDATE enrollments \
             SET lease_owner = $2, lease_expires_at = $4 \
             WHERE id = $1 AND status_id = $5 \
               AND (lease_expires_at IS NULL OR lease_expires_at <= $3) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, EnrollmentRow>(&query)
            .bind(id)
            .bind(owner)
            .bind(now)
            .bind(until)
            .bind(ACTIVE)
            .fetch_optional(pool)
            .await
    }

    /// Drop `owner`'s lease. A lease taken over by someone else is left
    /// alone.
    pub async fn release(pool: &PgPool, id: DbId, owner: &str) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE enrollments \
             SET lease_owner = NULL, lease_expires_at = NULL \
             WHERE id = $1 AND lease_owner = $2",
        )
        .bind(id)
        .bind(owner)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Write the mutable state of `next` if the row is still at
    /// `next.version`. Bumps `version`. Returns `None` on a stale write.
    pub async fn update_if_version(
        pool: &PgPool,
        next: &Enrollment,
    ) -> Result<Option<EnrollmentRow>, sqlx::Error> {
        let query = format!(
            "UPDATE enrollments \
             SET status_id = $3, current_action_index = $4, attempts = $5, \
                 next_run_at = $6, last_error = $7, cancel_reason = $8, \
                 completed_at = $9, version = version + 1 \
             WHERE id = $1 AND version = $2 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, EnrollmentRow>(&query)
            .bind(next.id)
            .bind(next.version)
            .bind(next.status.id())
            .bind(next.current_action_index as i32)
            .bind(next.attempts as i32)
            .bind(next.next_run_at)
            .bind(&next.last_error)
            .bind(&next.cancel_reason)
            .bind(next.completed_at)
            .fetch_optional(pool)
            .await
    }

    /// All enrollments of a subject, newest first.
    pub async fn list_for_subject(
        pool: &PgPool,
        tenant_id: DbId,
        subject_id: DbId,
    ) -> Result<Vec<EnrollmentRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM enrollments \
             WHERE tenant_id = $1 AND subject_id = $2 \
             ORDER BY enrolled_at DESC, id DESC"
        );
        sqlx::query_as::<_, EnrollmentRow>(&query)
            .bind(tenant_id)
            .bind(subject_id)
            .fetch_all(pool)
            .await
    }
}
