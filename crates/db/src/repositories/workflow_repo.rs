//! Repository for `workflows` and `workflow_versions`.
//!
//! Edits never rewrite a version in place: `update_definition` appends a new
//! `workflow_versions` row and moves `current_version`, so enrollments keep
//! executing the body they started on.

use cadence_core::types::DbId;
use cadence_core::workflow::{WorkflowDefinition, WorkflowStatus};
use sqlx::types::Json;
use sqlx::PgPool;

use crate::models::workflow::WorkflowRow;

/// Column list for the header/version join.
const COLUMNS: &str = "\
    w.id, w.tenant_id, v.name, w.status, v.version, \
    v.triggers, v.conditions, v.actions, v.variables, \
    w.created_at, w.updated_at";

/// Provides CRUD operations for workflow definitions.
pub struct WorkflowRepo;

impl WorkflowRepo {
    /// Insert a new workflow at version 1. `def.id` and `def.version` are
    /// ignored.
    pub async fn create(
        pool: &PgPool,
        def: &WorkflowDefinition,
    ) -> Result<WorkflowRow, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let (id,): (DbId,) = sqlx::query_as(
            "INSERT INTO workflows (tenant_id, name, status, current_version) \
             VALUES ($1, $2, $3, 1) \
             RETURNING id",
        )
        .bind(def.tenant_id)
        .bind(&def.name)
        .bind(def.status.as_str())
        .fetch_one(&mut *tx)
        .await?;

        insert_version(&mut tx, id, 1, def).await?;
        tx.commit().await?;

        Self::find_version(pool, id, 1)
            .await?
            .ok_or(sqlx::Error::RowNotFound)
    }

    /// Append `def` as the next version of workflow `id`. Returns the new
    /// current row, or `None` if the workflow does not exist.
    pub async fn update_definition(
        pool: &PgPool,
        id: DbId,
        def: &WorkflowDefinition,
    ) -> Result<Option<WorkflowRow>, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let version: Option<(i32,)> = sqlx::query_as(
            "UPDATE workflows \
             SET current_version = current_version + 1, name = $2 \
             WHERE id = $1 \
             RETURNING current_version",
        )
        .bind(id)
        .bind(&def.name)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((version,)) = version else {
            return Ok(None);
        };

        insert_version(&mut tx, id, version, def).await?;
        tx.commit().await?;

        Self::find_version(pool, id, version).await
    }

    /// Change the lifecycle status. Returns `true` if the workflow exists.
    pub async fn set_status(
        pool: &PgPool,
        id: DbId,
        status: WorkflowStatus,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("UPDATE workflows SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// The current version of a workflow.
    pub async fn find_by_id(pool: &PgPool, id: DbId) -> Result<Option<WorkflowRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM workflows w \
             JOIN workflow_versions v ON v.workflow_id = w.id AND v.version = w.current_version \
             WHERE w.id = $1"
        );
        sqlx::query_as::<_, WorkflowRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// A specific version, carrying the workflow's current status.
    pub async fn find_version(
        pool: &PgPool,
        id: DbId,
        version: i32,
    ) -> Result<Option<WorkflowRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM workflows w \
             JOIN workflow_versions v ON v.workflow_id = w.id \
             WHERE w.id = $1 AND v.version = $2"
        );
        sqlx::query_as::<_, WorkflowRow>(&query)
            .bind(id)
            .bind(version)
            .fetch_optional(pool)
            .await
    }

    /// Current versions of a tenant's active workflows.
    pub async fn list_active(
        pool: &PgPool,
        tenant_id: DbId,
    ) -> Result<Vec<WorkflowRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM workflows w \
             JOIN workflow_versions v ON v.workflow_id = w.id AND v.version = w.current_version \
             WHERE w.tenant_id = $1 AND w.status = $2 \
             ORDER BY w.id"
        );
        sqlx::query_as::<_, WorkflowRow>(&query)
            .bind(tenant_id)
            .bind(WorkflowStatus::Active.as_str())
            .fetch_all(pool)
            .await
    }

    /// Current versions of every active workflow across tenants.
    pub async fn list_all_active(pool: &PgPool) -> Result<Vec<WorkflowRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM workflows w \
             JOIN workflow_versions v ON v.workflow_id = w.id AND v.version = w.current_version \
             WHERE w.status = $1 \
             ORDER BY w.tenant_id, w.id"
        );
        sqlx::query_as::<_, WorkflowRow>(&query)
            .bind(WorkflowStatus::Active.as_str())
            .fetch_all(pool)
            .await
    }
}

async fn insert_version(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    workflow_id: DbId,
    version: i32,
    def: &WorkflowDefinition,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO workflow_versions \
             (workflow_id, version, name, triggers, conditions, actions, variables) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(workflow_id)
    .bind(version)
    .bind(&def.name)
    .bind(Json(&def.triggers))
    .bind(Json(&def.conditions))
    .bind(Json(&def.actions))
    .bind(Json(&def.variables))
    .execute(&mut **tx)
    .await?;
    Ok(())
}
