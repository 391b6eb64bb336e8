//! Repository for the read-only `subjects` projection.
//!
//! The engine only reads subjects. `upsert` exists for the projection sync
//! and for tests.

use cadence_core::types::DbId;
use sqlx::PgPool;

use crate::models::subject::Subject;

/// Column list for `subjects` queries.
const COLUMNS: &str = "id, tenant_id, attributes, created_at, updated_at";

/// Provides read access to subject attributes.
pub struct SubjectRepo;

impl SubjectRepo {
    pub async fn find(
        pool: &PgPool,
        tenant_id: DbId,
        id: DbId,
    ) -> Result<Option<Subject>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM subjects WHERE tenant_id = $1 AND id = $2");
        sqlx::query_as::<_, Subject>(&query)
            .bind(tenant_id)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Every subject of a tenant.
    pub async fn list_for_tenant(
        pool: &PgPool,
        tenant_id: DbId,
    ) -> Result<Vec<Subject>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM subjects WHERE tenant_id = $1 ORDER BY id");
        sqlx::query_as::<_, Subject>(&query)
            .bind(tenant_id)
            .fetch_all(pool)
            .await
    }

    /// Insert a subject, or replace its attributes when `id` is given and
    /// exists.
    pub async fn upsert(
        pool: &PgPool,
        id: Option<DbId>,
        tenant_id: DbId,
        attributes: &serde_json::Value,
    ) -> Result<Subject, sqlx::Error> {
        match id {
            Some(id) => {
                let query = format!(
                    "INSERT INTO subjects (id, tenant_id, attributes) VALUES ($1, $2, $3) \
                     ON CONFLICT (id) DO UPDATE SET attributes = EXCLUDED.attributes \
                     RETURNING {COLUMNS}"
                );
                sqlx::query_as::<_, Subject>(&query)
                    .bind(id)
                    .bind(tenant_id)
                    .bind(attributes)
                    .fetch_one(pool)
                    .await
            }
            None => {
                let query = format!(
                    "INSERT INTO subjects (tenant_id, attributes) VALUES ($1, $2) \
                     RETURNING {COLUMNS}"
                );
                sqlx::query_as::<_, Subject>(&query)
                    .bind(tenant_id)
                    .bind(attributes)
                    .fetch_one(pool)
                    .await
            }
        }
    }
}
