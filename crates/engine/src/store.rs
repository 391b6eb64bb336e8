//! Persistence seams of the engine.
//!
//! The manager, trigger evaluator and scheduler only talk to these traits.
//! [`crate::pg::PgStore`] backs them with Postgres; [`crate::memory::InMemoryStore`]
//! keeps everything in process for tests and single-node tooling.

use std::sync::Arc;

use async_trait::async_trait;
use cadence_core::enrollment::{Enrollment, NewEnrollment};
use cadence_core::types::{Attributes, DbId, Timestamp};
use cadence_core::workflow::WorkflowDefinition;

use crate::error::EngineResult;

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Current version of a workflow.
    async fn get(&self, workflow_id: DbId) -> EngineResult<Option<WorkflowDefinition>>;

    /// A pinned version, carrying the workflow's current status.
    async fn get_version(
        &self,
        workflow_id: DbId,
        version: i32,
    ) -> EngineResult<Option<WorkflowDefinition>>;

    /// Active workflows of one tenant.
    async fn list_active(&self, tenant_id: DbId) -> EngineResult<Vec<WorkflowDefinition>>;

    /// Active workflows of every tenant.
    async fn list_all_active(&self) -> EngineResult<Vec<WorkflowDefinition>>;
}

#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    /// Insert an active enrollment. Must fail with
    /// `CoreError::AlreadyEnrolled` when the pair already has an active one,
    /// atomically with respect to concurrent callers.
    async fn create(&self, input: NewEnrollment) -> EngineResult<Enrollment>;

    async fn get(&self, id: DbId) -> EngineResult<Option<Enrollment>>;

    /// Active, due, unleased enrollments, oldest `next_run_at` first.
    async fn list_due(&self, now: Timestamp, limit: usize) -> EngineResult<Vec<Enrollment>>;

    /// Take a time-bounded lease. `None` if anyone, `owner` included, holds
    /// a live lease or the enrollment is not active.
    async fn try_lease(
        &self,
        id: DbId,
        owner: &str,
        now: Timestamp,
        until: Timestamp,
    ) -> EngineResult<Option<Enrollment>>;

    async fn release(&self, id: DbId, owner: &str) -> EngineResult<()>;

    /// Persist `next` if the stored row is still at `next.version`; the
    /// stored version is bumped. `None` on a stale write.
    async fn update(&self, next: &Enrollment) -> EngineResult<Option<Enrollment>>;
}

/// Idempotency ledger of trigger firings keyed by
/// `(workflow_id, subject_id, occurrence_key)`.
#[async_trait]
pub trait FiringLedger: Send + Sync {
    /// `false` if the occurrence was already recorded.
    async fn record(
        &self,
        workflow_id: DbId,
        subject_id: DbId,
        occurrence_key: &str,
        fired_at: Timestamp,
    ) -> EngineResult<bool>;

    async fn attach(
        &self,
        workflow_id: DbId,
        subject_id: DbId,
        occurrence_key: &str,
        enrollment_id: DbId,
    ) -> EngineResult<()>;

    async fn forget(
        &self,
        workflow_id: DbId,
        subject_id: DbId,
        occurrence_key: &str,
    ) -> EngineResult<()>;

    async fn contains(
        &self,
        workflow_id: DbId,
        subject_id: DbId,
        occurrence_key: &str,
    ) -> EngineResult<bool>;
}

/// A subject and its attribute bag.
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectRecord {
    pub id: DbId,
    pub attributes: Attributes,
}

/// Read-only access to the CRM's subjects.
#[async_trait]
pub trait SubjectDirectory: Send + Sync {
    async fn attributes(
        &self,
        tenant_id: DbId,
        subject_id: DbId,
    ) -> EngineResult<Option<Attributes>>;

    /// Every subject of a tenant: the audience of scheduled and recurring
    /// triggers.
    async fn audience(&self, tenant_id: DbId) -> EngineResult<Vec<SubjectRecord>>;
}

/// The four stores an engine runs against.
#[derive(Clone)]
pub struct Stores {
    pub workflows: Arc<dyn WorkflowStore>,
    pub enrollments: Arc<dyn EnrollmentStore>,
    pub ledger: Arc<dyn FiringLedger>,
    pub subjects: Arc<dyn SubjectDirectory>,
}

impl Stores {
    /// Use one value for every store.
    pub fn from_single<S>(store: Arc<S>) -> Self
    where
        S: WorkflowStore + EnrollmentStore + FiringLedger + SubjectDirectory + 'static,
    {
        Self {
            workflows: store.clone(),
            enrollments: store.clone(),
            ledger: store.clone(),
            subjects: store,
        }
    }
}
