//! Enrollment rows.

use cadence_core::enrollment::{Enrollment, EnrollmentStatus};
use cadence_core::error::CoreError;
use cadence_core::types::{DbId, Timestamp};
use serde::Serialize;
use sqlx::FromRow;

use super::status::StatusId;

/// A row from the `enrollments` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct EnrollmentRow {
    pub id: DbId,
    pub tenant_id: DbId,
    pub workflow_id: DbId,
    pub workflow_version: i32,
    pub subject_id: DbId,
    pub status_id: StatusId,
    pub current_action_index: i32,
    pub attempts: i32,
    pub enrolled_at: Timestamp,
    pub next_run_at: Option<Timestamp>,
    pub last_error: Option<String>,
    pub cancel_reason: Option<String>,
    pub completed_at: Option<Timestamp>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<Timestamp>,
    pub version: i64,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

fn non_negative(value: i32, column: &str) -> Result<u32, CoreError> {
    u32::try_from(value)
        .map_err(|_| CoreError::Internal(format!("Negative {column} in enrollments row")))
}

impl TryFrom<EnrollmentRow> for Enrollment {
    type Error = CoreError;

    fn try_from(row: EnrollmentRow) -> Result<Self, Self::Error> {
        Ok(Enrollment {
            id: row.id,
            tenant_id: row.tenant_id,
            workflow_id: row.workflow_id,
            workflow_version: row.workflow_version,
            subject_id: row.subject_id,
            status: EnrollmentStatus::from_id(row.status_id)?,
            current_action_index: non_negative(row.current_action_index, "current_action_index")?,
            attempts: non_negative(row.attempts, "attempts")?,
            enrolled_at: row.enrolled_at,
            next_run_at: row.next_run_at,
            last_error: row.last_error,
            cancel_reason: row.cancel_reason,
            completed_at: row.completed_at,
            lease_owner: row.lease_owner,
            lease_expires_at: row.lease_expires_at,
            version: row.version,
            updated_at: row.updated_at,
        })
    }
}
