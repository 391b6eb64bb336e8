//! Workflow rows: the `workflows` header joined with one `workflow_versions`
//! body.

use cadence_core::error::CoreError;
use cadence_core::types::{DbId, Timestamp};
use cadence_core::workflow::{Action, Condition, Trigger, WorkflowDefinition, WorkflowStatus};
use sqlx::types::Json;
use sqlx::FromRow;

/// One version of a workflow, as selected by `WorkflowRepo`.
#[derive(Debug, Clone, FromRow)]
pub struct WorkflowRow {
    pub id: DbId,
    pub tenant_id: DbId,
    pub name: String,
    pub status: String,
    pub version: i32,
    pub triggers: Json<Vec<Trigger>>,
    pub conditions: Json<Vec<Condition>>,
    pub actions: Json<Vec<Action>>,
    pub variables: Json<Vec<String>>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl TryFrom<WorkflowRow> for WorkflowDefinition {
    type Error = CoreError;

    fn try_from(row: WorkflowRow) -> Result<Self, Self::Error> {
        Ok(WorkflowDefinition {
            id: row.id,
            tenant_id: row.tenant_id,
            name: row.name,
            status: WorkflowStatus::parse(&row.status)?,
            version: row.version,
            triggers: row.triggers.0,
            conditions: row.conditions.0,
            actions: row.actions.0,
            variables: row.variables.0,
        })
    }
}
