use crate::types::DbId;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: DbId },

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Subject {subject_id} is already enrolled in workflow {workflow_id}")]
    AlreadyEnrolled { workflow_id: DbId, subject_id: DbId },

    #[error("Enrollment {0} is leased by another worker")]
    LeaseConflict(DbId),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
