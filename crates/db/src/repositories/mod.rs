//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods that
//! accept `&PgPool` as the first argument.

pub mod enrollment_repo;
pub mod subject_repo;
pub mod trigger_firing_repo;
pub mod workflow_repo;

pub use enrollment_repo::EnrollmentRepo;
pub use subject_repo::SubjectRepo;
pub use trigger_firing_repo::TriggerFiringRepo;
pub use workflow_repo::WorkflowRepo;
