//! In-process store implementing every persistence seam.
//!
//! Mirrors the Postgres semantics the engine relies on: one active
//! enrollment per (workflow, subject), version-checked updates, leases that
//! leave `version` alone and a unique firing ledger. All state sits behind a
//! single mutex, so each trait call is atomic.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use cadence_core::enrollment::{Enrollment, EnrollmentStatus, NewEnrollment};
use cadence_core::error::CoreError;
use cadence_core::template::lint_variables;
use cadence_core::types::{Attributes, DbId, Timestamp};
use cadence_core::workflow::{validate_definition, WorkflowDefinition, WorkflowStatus};

use crate::error::EngineResult;
use crate::store::{EnrollmentStore, FiringLedger, SubjectDirectory, SubjectRecord, WorkflowStore};

type FiringKey = (DbId, DbId, String);

struct StoredWorkflow {
    status: WorkflowStatus,
    current_version: i32,
    versions: BTreeMap<i32, WorkflowDefinition>,
}

impl StoredWorkflow {
    fn version(&self, version: i32) -> Option<WorkflowDefinition> {
        self.versions.get(&version).map(|def| WorkflowDefinition {
            status: self.status,
            ..def.clone()
        })
    }

    fn current(&self) -> Option<WorkflowDefinition> {
        self.version(self.current_version)
    }
}

#[derive(Default)]
struct State {
    workflows: BTreeMap<DbId, StoredWorkflow>,
    enrollments: BTreeMap<DbId, Enrollment>,
    firings: HashMap<FiringKey, Option<DbId>>,
    subjects: BTreeMap<(DbId, DbId), Attributes>,
    next_workflow_id: DbId,
    next_enrollment_id: DbId,
    next_subject_id: DbId,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -- Workflows ----------------------------------------------------------

    /// Save a new workflow at version 1 and return it with its id.
    pub fn insert_workflow(
        &self,
        def: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, CoreError> {
        validate_definition(&def)?;
        let mut state = self.lock();
        state.next_workflow_id += 1;
        let id = state.next_workflow_id;
        let saved = WorkflowDefinition {
            id,
            version: 1,
            ..def
        };
        state.workflows.insert(
            id,
            StoredWorkflow {
                status: saved.status,
                current_version: 1,
                versions: BTreeMap::from([(1, saved.clone())]),
            },
        );
        lint_variables(&saved);
        Ok(saved)
    }

    /// Save `def` as the next version of workflow `id`. Enrollments keep
    /// the version they were created on.
    pub fn update_workflow(
        &self,
        id: DbId,
        def: WorkflowDefinition,
    ) -> Result<WorkflowDefinition, CoreError> {
        validate_definition(&def)?;
        let mut state = self.lock();
        let stored = state
            .workflows
            .get_mut(&id)
            .ok_or(CoreError::NotFound { entity: "workflow", id })?;
        let version = stored.current_version + 1;
        let saved = WorkflowDefinition {
            id,
            version,
            status: stored.status,
            ..def
        };
        stored.versions.insert(version, saved.clone());
        stored.current_version = version;
        lint_variables(&saved);
        Ok(saved)
    }

    pub fn set_workflow_status(&self, id: DbId, status: WorkflowStatus) -> Result<(), CoreError> {
        let mut state = self.lock();
        let stored = state
            .workflows
            .get_mut(&id)
            .ok_or(CoreError::NotFound { entity: "workflow", id })?;
        stored.status = status;
        Ok(())
    }

    // -- Subjects -----------------------------------------------------------

    /// Insert or replace a subject's attributes. Returns its id.
    pub fn upsert_subject(
        &self,
        tenant_id: DbId,
        id: Option<DbId>,
        attributes: Attributes,
    ) -> DbId {
        let mut state = self.lock();
        let id = match id {
            Some(id) => {
                state.next_subject_id = state.next_subject_id.max(id);
                id
            }
            None => {
                state.next_subject_id += 1;
                state.next_subject_id
            }
        };
        state.subjects.insert((tenant_id, id), attributes);
        id
    }

    // -- Inspection ---------------------------------------------------------

    /// Every enrollment, in id order.
    pub fn enrollments(&self) -> Vec<Enrollment> {
        self.lock().enrollments.values().cloned().collect()
    }

    /// Enrollments of one (workflow, subject) pair, in id order.
    pub fn enrollments_for(&self, workflow_id: DbId, subject_id: DbId) -> Vec<Enrollment> {
        self.lock()
            .enrollments
            .values()
            .filter(|e| e.workflow_id == workflow_id && e.subject_id == subject_id)
            .cloned()
            .collect()
    }

    /// `Some(enrollment_id)` for a recorded occurrence; the inner value is
    /// `None` until an enrollment is attached.
    pub fn firing(
        &self,
        workflow_id: DbId,
        subject_id: DbId,
        occurrence_key: &str,
    ) -> Option<Option<DbId>> {
        self.lock()
            .firings
            .get(&(workflow_id, subject_id, occurrence_key.to_string()))
            .copied()
    }

    pub fn firing_count(&self) -> usize {
        self.lock().firings.len()
    }
}

// ---------------------------------------------------------------------------
// WorkflowStore
// ---------------------------------------------------------------------------

#[async_trait]
impl WorkflowStore for InMemoryStore {
    async fn get(&self, workflow_id: DbId) -> EngineResult<Option<WorkflowDefinition>> {
        Ok(self.lock().workflows.get(&workflow_id).and_then(StoredWorkflow::current))
    }

    async fn get_version(
        &self,
        workflow_id: DbId,
        version: i32,
    ) -> EngineResult<Option<WorkflowDefinition>> {
        Ok(self
            .lock()
            .workflows
            .get(&workflow_id)
            .and_then(|w| w.version(version)))
    }

    async fn list_active(&self, tenant_id: DbId) -> EngineResult<Vec<WorkflowDefinition>> {
        Ok(self
            .lock()
            .workflows
            .values()
            .filter_map(StoredWorkflow::current)
            .filter(|def| def.tenant_id == tenant_id && def.is_active())
            .collect())
    }

    async fn list_all_active(&self) -> EngineResult<Vec<WorkflowDefinition>> {
        Ok(self
            .lock()
            .workflows
            .values()
            .filter_map(StoredWorkflow::current)
            .filter(WorkflowDefinition::is_active)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// EnrollmentStore
// ---------------------------------------------------------------------------

#[async_trait]
impl EnrollmentStore for InMemoryStore {
    async fn create(&self, input: NewEnrollment) -> EngineResult<Enrollment> {
        let mut state = self.lock();
        let duplicate = state.enrollments.values().any(|e| {
            e.is_active() && e.workflow_id == input.workflow_id && e.subject_id == input.subject_id
        });
        if duplicate {
            return Err(CoreError::AlreadyEnrolled {
                workflow_id: input.workflow_id,
                subject_id: input.subject_id,
            }
            .into());
        }

        state.next_enrollment_id += 1;
        let enrollment = Enrollment {
            id: state.next_enrollment_id,
            tenant_id: input.tenant_id,
            workflow_id: input.workflow_id,
            workflow_version: input.workflow_version,
            subject_id: input.subject_id,
            status: EnrollmentStatus::Active,
            current_action_index: 0,
            attempts: 0,
            enrolled_at: input.enrolled_at,
            next_run_at: Some(input.next_run_at),
            last_error: None,
            cancel_reason: None,
            completed_at: None,
            lease_owner: None,
            lease_expires_at: None,
            version: 1,
            updated_at: input.enrolled_at,
        };
        state.enrollments.insert(enrollment.id, enrollment.clone());
        Ok(enrollment)
    }

    async fn get(&self, id: DbId) -> EngineResult<Option<Enrollment>> {
        Ok(self.lock().enrollments.get(&id).cloned())
    }

    async fn list_due(&self, now: Timestamp, limit: usize) -> EngineResult<Vec<Enrollment>> {
        let state = self.lock();
        let mut due: Vec<Enrollment> = state
            .enrollments
            .values()
            .filter(|e| e.is_due(now) && !e.is_leased(now))
            .cloned()
            .collect();
        due.sort_by_key(|e| (e.next_run_at, e.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn try_lease(
        &self,
        id: DbId,
        owner: &str,
        now: Timestamp,
        until: Timestamp,
    ) -> EngineResult<Option<Enrollment>> {
        let mut state = self.lock();
        let Some(enrollment) = state.enrollments.get_mut(&id) else {
            return Ok(None);
        };
        if !enrollment.is_active() || enrollment.is_leased(now) {
            return Ok(None);
        }
        enrollment.lease_owner = Some(owner.to_string());
        enrollment.lease_expires_at = Some(until);
        Ok(Some(enrollment.clone()))
    }

    async fn release(&self, id: DbId, owner: &str) -> EngineResult<()> {
        let mut state = self.lock();
        if let Some(enrollment) = state.enrollments.get_mut(&id) {
            if enrollment.lease_owner.as_deref() == Some(owner) {
                enrollment.lease_owner = None;
                enrollment.lease_expires_at = None;
            }
        }
        Ok(())
    }

    async fn update(&self, next: &Enrollment) -> EngineResult<Option<Enrollment>> {
        let mut state = self.lock();
        let Some(stored) = state.enrollments.get_mut(&next.id) else {
            return Ok(None);
        };
        if stored.version != next.version {
            return Ok(None);
        }
        stored.status = next.status;
        stored.current_action_index = next.current_action_index;
        stored.attempts = next.attempts;
        stored.next_run_at = next.next_run_at;
        stored.last_error = next.last_error.clone();
        stored.cancel_reason = next.cancel_reason.clone();
        stored.completed_at = next.completed_at;
        stored.updated_at = next.updated_at;
        stored.version += 1;
        Ok(Some(stored.clone()))
    }
}

// ---------------------------------------------------------------------------
// FiringLedger
// ---------------------------------------------------------------------------

#[async_trait]
impl FiringLedger for InMemoryStore {
    async fn record(
        &self,
        workflow_id: DbId,
        subject_id: DbId,
        occurrence_key: &str,
        _fired_at: Timestamp,
    ) -> EngineResult<bool> {
        let mut state = self.lock();
        let key = (workflow_id, subject_id, occurrence_key.to_string());
        if state.firings.contains_key(&key) {
            return Ok(false);
        }
        state.firings.insert(key, None);
        Ok(true)
    }

    async fn attach(
        &self,
        workflow_id: DbId,
        subject_id: DbId,
        occurrence_key: &str,
        enrollment_id: DbId,
    ) -> EngineResult<()> {
        let mut state = self.lock();
        if let Some(slot) = state
            .firings
            .get_mut(&(workflow_id, subject_id, occurrence_key.to_string()))
        {
            *slot = Some(enrollment_id);
        }
        Ok(())
    }

    async fn forget(
        &self,
        workflow_id: DbId,
        subject_id: DbId,
        occurrence_key: &str,
    ) -> EngineResult<()> {
        self.lock()
            .firings
            .remove(&(workflow_id, subject_id, occurrence_key.to_string()));
        Ok(())
    }

    async fn contains(
        &self,
        workflow_id: DbId,
        subject_id: DbId,
        occurrence_key: &str,
    ) -> EngineResult<bool> {
        Ok(self
            .lock()
            .firings
            .contains_key(&(workflow_id, subject_id, occurrence_key.to_string())))
    }
}

// ---------------------------------------------------------------------------
// SubjectDirectory
// ---------------------------------------------------------------------------

#[async_trait]
impl SubjectDirectory for InMemoryStore {
    async fn attributes(
        &self,
        tenant_id: DbId,
        subject_id: DbId,
    ) -> EngineResult<Option<Attributes>> {
        Ok(self.lock().subjects.get(&(tenant_id, subject_id)).cloned())
    }

    async fn audience(&self, tenant_id: DbId) -> EngineResult<Vec<SubjectRecord>> {
        Ok(self
            .lock()
            .subjects
            .range((tenant_id, DbId::MIN)..=(tenant_id, DbId::MAX))
            .map(|((_, id), attributes)| SubjectRecord {
                id: *id,
                attributes: attributes.clone(),
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
