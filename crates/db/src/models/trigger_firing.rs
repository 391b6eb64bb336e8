//! Trigger firing ledger rows.

use cadence_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

/// A row from the `trigger_firings` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct TriggerFiring {
    pub id: DbId,
    pub workflow_id: DbId,
    pub subject_id: DbId,
    pub occurrence_key: String,
    pub enrollment_id: Option<DbId>,
    pub fired_at: Timestamp,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}
