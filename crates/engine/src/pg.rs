//! Postgres-backed stores over the `cadence-db` repositories.

use std::sync::Arc;

use async_trait::async_trait;
use cadence_core::enrollment::{Enrollment, NewEnrollment};
use cadence_core::error::CoreError;
use cadence_core::types::{Attributes, DbId, Timestamp};
use cadence_core::template::lint_variables;
use cadence_core::workflow::{validate_definition, WorkflowDefinition, WorkflowStatus};
use cadence_db::models::enrollment::EnrollmentRow;
use cadence_db::models::workflow::WorkflowRow;
use cadence_db::repositories::{
    enrollment_repo::ACTIVE_PAIR_CONSTRAINT, EnrollmentRepo, SubjectRepo, TriggerFiringRepo,
    WorkflowRepo,
};
use cadence_db::{is_unique_violation, DbPool};

use crate::error::EngineResult;
use crate::store::{
    EnrollmentStore, FiringLedger, Stores, SubjectDirectory, SubjectRecord, WorkflowStore,
};

#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Validate and save a new workflow at version 1.
    pub async fn create_workflow(
        &self,
        def: &WorkflowDefinition,
    ) -> EngineResult<WorkflowDefinition> {
        validate_definition(def)?;
        let saved = workflow(WorkflowRepo::create(&self.pool, def).await?)?;
        lint_variables(&saved);
        tracing::info!(workflow_id = saved.id, tenant_id = saved.tenant_id, "Workflow created");
        Ok(saved)
    }

    /// Validate and save `def` as the next version of workflow `id`.
    pub async fn update_workflow(
        &self,
        id: DbId,
        def: &WorkflowDefinition,
    ) -> EngineResult<WorkflowDefinition> {
        validate_definition(def)?;
        let row = WorkflowRepo::update_definition(&self.pool, id, def)
            .await?
            .ok_or(CoreError::NotFound { entity: "workflow", id })?;
        let saved = workflow(row)?;
        lint_variables(&saved);
        tracing::info!(workflow_id = id, version = saved.version, "Workflow updated");
        Ok(saved)
    }

    pub async fn set_workflow_status(&self, id: DbId, status: WorkflowStatus) -> EngineResult<()> {
        if !WorkflowRepo::set_status(&self.pool, id, status).await? {
            return Err(CoreError::NotFound { entity: "workflow", id }.into());
        }
        tracing::info!(workflow_id = id, status = status.as_str(), "Workflow status changed");
        Ok(())
    }
}

impl Stores {
    /// Every store backed by one Postgres pool.
    pub fn postgres(pool: DbPool) -> Self {
        Self::from_single(Arc::new(PgStore::new(pool)))
    }
}

fn workflow(row: WorkflowRow) -> EngineResult<WorkflowDefinition> {
    Ok(WorkflowDefinition::try_from(row)?)
}

fn workflows(rows: Vec<WorkflowRow>) -> EngineResult<Vec<WorkflowDefinition>> {
    rows.into_iter().map(workflow).collect()
}

fn enrollment(row: EnrollmentRow) -> EngineResult<Enrollment> {
    Ok(Enrollment::try_from(row)?)
}

#[async_trait]
impl WorkflowStore for PgStore {
    async fn get(&self, workflow_id: DbId) -> EngineResult<Option<WorkflowDefinition>> {
        WorkflowRepo::find_by_id(&self.pool, workflow_id)
            .await?
            .map(workflow)
            .transpose()
    }

    async fn get_version(
        &self,
        workflow_id: DbId,
        version: i32,
    ) -> EngineResult<Option<WorkflowDefinition>> {
        WorkflowRepo::find_version(&self.pool, workflow_id, version)
            .await?
            .map(workflow)
            .transpose()
    }

    async fn list_active(&self, tenant_id: DbId) -> EngineResult<Vec<WorkflowDefinition>> {
        workflows(WorkflowRepo::list_active(&self.pool, tenant_id).await?)
    }

    async fn list_all_active(&self) -> EngineResult<Vec<WorkflowDefinition>> {
        workflows(WorkflowRepo::list_all_active(&self.pool).await?)
    }
}

#[async_trait]
impl EnrollmentStore for PgStore {
    async fn create(&self, input: NewEnrollment) -> EngineResult<Enrollment> {
        match EnrollmentRepo::create(&self.pool, &input).await {
            Ok(row) => enrollment(row),
            Err(e) if is_unique_violation(&e, ACTIVE_PAIR_CONSTRAINT) => {
                Err(CoreError::AlreadyEnrolled {
                    workflow_id: input.workflow_id,
                    subject_id: input.subject_id,
                }
                .into())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, id: DbId) -> EngineResult<Option<Enrollment>> {
        EnrollmentRepo::find_by_id(&self.pool, id)
            .await?
            .map(enrollment)
            .transpose()
    }

    async fn list_due(&self, now: Timestamp, limit: usize) -> EngineResult<Vec<Enrollment>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        EnrollmentRepo::list_due(&self.pool, now, limit)
            .await?
            .into_iter()
            .map(enrollment)
            .collect()
    }

    async fn try_lease(
        &self,
        id: DbId,
        owner: &str,
        now: Timestamp,
        until: Timestamp,
    ) -> EngineResult<Option<Enrollment>> {
        EnrollmentRepo::try_lease(&self.pool, id, owner, now, until)
            .await?
            .map(enrollment)
            .transpose()
    }

    async fn release(&self, id: DbId, owner: &str) -> EngineResult<()> {
        if !EnrollmentRepo::release(&self.pool, id, owner).await? {
            tracing::debug!(enrollment_id = id, owner, "Lease was no longer held at release");
        }
        Ok(())
    }

    async fn update(&self, next: &Enrollment) -> EngineResult<Option<Enrollment>> {
        EnrollmentRepo::update_if_version(&self.pool, next)
            .await?
            .map(enrollment)
            .transpose()
    }
}

#[async_trait]
impl FiringLedger for PgStore {
    async fn record(
        &self,
        workflow_id: DbId,
        subject_id: DbId,
        occurrence_key: &str,
        fired_at: Timestamp,
    ) -> EngineResult<bool> {
        Ok(
            TriggerFiringRepo::record(&self.pool, workflow_id, subject_id, occurrence_key, fired_at)
                .await?,
        )
    }

    async fn attach(
        &self,
        workflow_id: DbId,
        subject_id: DbId,
        occurrence_key: &str,
        enrollment_id: DbId,
    ) -> EngineResult<()> {
        TriggerFiringRepo::attach_enrollment(
            &self.pool,
            workflow_id,
            subject_id,
            occurrence_key,
            enrollment_id,
        )
        .await?;
        Ok(())
    }

    async fn forget(
        &self,
        workflow_id: DbId,
        subject_id: DbId,
        occurrence_key: &str,
    ) -> EngineResult<()> {
        TriggerFiringRepo::forget(&self.pool, workflow_id, subject_id, occurrence_key).await?;
        Ok(())
    }

    async fn contains(
        &self,
        workflow_id: DbId,
        subject_id: DbId,
        occurrence_key: &str,
    ) -> EngineResult<bool> {
        Ok(TriggerFiringRepo::find(&self.pool, workflow_id, subject_id, occurrence_key)
            .await?
            .is_some())
    }
}

#[async_trait]
impl SubjectDirectory for PgStore {
    async fn attributes(
        &self,
        tenant_id: DbId,
        subject_id: DbId,
    ) -> EngineResult<Option<Attributes>> {
        Ok(SubjectRepo::find(&self.pool, tenant_id, subject_id)
            .await?
            .map(|s| s.attributes))
    }

    async fn audience(&self, tenant_id: DbId) -> EngineResult<Vec<SubjectRecord>> {
        Ok(SubjectRepo::list_for_tenant(&self.pool, tenant_id)
            .await?
            .into_iter()
            .map(|s| SubjectRecord {
                id: s.id,
                attributes: s.attributes,
            })
            .collect())
    }
}
