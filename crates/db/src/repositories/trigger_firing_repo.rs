//! Repository for the `trigger_firings` idempotency ledger.

use cadence_core::types::{DbId, Timestamp};
use sqlx::PgPool;

use crate::models::trigger_firing::TriggerFiring;

/// Column list for `trigger_firings` queries.
const COLUMNS: &str = "\
    id, workflow_id, subject_id, occurrence_key, enrollment_id, \
    fired_at, created_at, updated_at";

/// Provides the trigger firing ledger.
pub struct TriggerFiringRepo;

impl TriggerFiringRepo {
    /// Record an occurrence. Returns `false` if it was already recorded.
    pub async fn record(
        pool: &PgPool,
        workflow_id: DbId,
        subject_id: DbId,
        occurrence_key: &str,
        fired_at: Timestamp,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "INSERT INTO trigger_firings (workflow_id, subject_id, occurrence_key, fired_at) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (workflow_id, subject_id, occurrence_key) DO NOTHING",
        )
        .bind(workflow_id)
        .bind(subject_id)
        .bind(occurrence_key)
        .bind(fired_at)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Link a recorded occurrence to the enrollment it produced.
    pub async fn attach_enrollment(
        pool: &PgPool,
        workflow_id: DbId,
        subject_id: DbId,
        occurrence_key: &str,
        enrollment_id: DbId,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE trigger_firings SET enrollment_id = $4 \
             WHERE workflow_id = $1 AND subject_id = $2 AND occurrence_key = $3",
        )
        .bind(workflow_id)
        .bind(subject_id)
        .bind(occurrence_key)
        .bind(enrollment_id)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Remove a recorded occurrence so it can fire again. Used when
    /// enrolling failed for a reason unrelated to the occurrence itself.
    pub async fn forget(
        pool: &PgPool,
        workflow_id: DbId,
        subject_id: DbId,
        occurrence_key: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "DELETE FROM trigger_firings \
             WHERE workflow_id = $1 AND subject_id = $2 AND occurrence_key = $3",
        )
        .bind(workflow_id)
        .bind(subject_id)
        .bind(occurrence_key)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn find(
        pool: &PgPool,
        workflow_id: DbId,
        subject_id: DbId,
        occurrence_key: &str,
    ) -> Result<Option<TriggerFiring>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM trigger_firings \
             WHERE workflow_id = $1 AND subject_id = $2 AND occurrence_key = $3"
        );
        sqlx::query_as::<_, TriggerFiring>(&query)
            .bind(workflow_id)
            .bind(subject_id)
            .bind(occurrence_key)
            .fetch_optional(pool)
            .await
    }
}
