//! Enrollment lifecycle.
//!
//! Every mutation reads the enrollment, computes the next state with one of
//! the pure transition functions below and writes it back conditionally on
//! `version`. A stale write re-reads and recomputes, up to
//! [`MAX_CONFLICT_RETRIES`] times.

use std::sync::Arc;

use cadence_core::clock::Clock;
use cadence_core::enrollment::{Enrollment, EnrollmentSnapshot, EnrollmentStatus, NewEnrollment};
use cadence_core::error::CoreError;
use cadence_core::schedule::{initial_run_at, schedule_next};
use cadence_core::types::{DbId, Timestamp};
use cadence_core::workflow::WorkflowDefinition;

use crate::error::{EngineError, EngineResult};
use crate::store::{EnrollmentStore, Stores, WorkflowStore};

/// Attempts at a version-checked write before giving up with `Conflict`.
pub const MAX_CONFLICT_RETRIES: usize = 5;

/// Longest `last_error` / `cancel_reason` kept on an enrollment.
const MAX_REASON_LENGTH: usize = 2000;

#[derive(Clone)]
pub struct EnrollmentManager {
    workflows: Arc<dyn WorkflowStore>,
    enrollments: Arc<dyn EnrollmentStore>,
    clock: Arc<dyn Clock>,
}

impl EnrollmentManager {
    pub fn new(stores: &Stores, clock: Arc<dyn Clock>) -> Self {
        Self {
            workflows: stores.workflows.clone(),
            enrollments: stores.enrollments.clone(),
            clock,
        }
    }

    /// Enroll a subject in the current version of a workflow.
    ///
    /// Fails with `AlreadyEnrolled` while the pair has an active
    /// enrollment, and with `Validation` when the workflow is not active or
    /// has no actions.
    pub async fn create(&self, workflow_id: DbId, subject_id: DbId) -> EngineResult<Enrollment> {
        let def = self
            .workflows
            .get(workflow_id)
            .await?
            .ok_or(CoreError::NotFound {
                entity: "workflow",
                id: workflow_id,
            })?;
        self.create_for(&def, subject_id).await
    }

    /// [`create`](Self::create) with an already loaded definition.
    pub async fn create_for(
        &self,
        def: &WorkflowDefinition,
        subject_id: DbId,
    ) -> EngineResult<Enrollment> {
        if !def.is_active() {
            return Err(CoreError::Validation(format!(
                "Workflow {} is {}, only ACTIVE workflows accept enrollments",
                def.id,
                def.status.as_str()
            ))
            .into());
        }
        let now = self.clock.now();
        let next_run_at = initial_run_at(def, now).ok_or_else(|| {
            CoreError::Validation(format!("Workflow {} has no actions", def.id))
        })?;

        let enrollment = self
            .enrollments
            .create(NewEnrollment {
                tenant_id: def.tenant_id,
                workflow_id: def.id,
                workflow_version: def.version,
                subject_id,
                enrolled_at: now,
                next_run_at,
            })
            .await?;

        tracing::info!(
            enrollment_id = enrollment.id,
            workflow_id = def.id,
            workflow_version = def.version,
            subject_id,
            next_run_at = %next_run_at,
            "Subject enrolled"
        );
        Ok(enrollment)
    }

    /// Record that the current action completed at `completed_at` and move
    /// to the next one, or complete the enrollment after the last.
    pub async fn advance(&self, id: DbId, completed_at: Timestamp) -> EngineResult<Enrollment> {
        let def = self.pinned_definition(id).await?;
        let (next, _) = self
            .transition(id, |e| advanced(e, &def, completed_at).map(Some))
            .await?;
        Ok(next)
    }

    /// [`advance`](Self::advance), but only if the enrollment is still at
    /// `expected_index`. Guards a worker whose lease expired mid-dispatch
    /// against advancing a step someone else already moved past.
    pub async fn advance_from(
        &self,
        id: DbId,
        expected_index: u32,
        completed_at: Timestamp,
    ) -> EngineResult<Enrollment> {
        let def = self.pinned_definition(id).await?;
        let (next, _) = self
            .transition(id, |e| {
                if e.is_active() && e.current_action_index != expected_index {
                    return Err(CoreError::Conflict(format!(
                        "Enrollment {id} moved from action {expected_index} to {}",
                        e.current_action_index
                    )));
                }
                advanced(e, &def, completed_at).map(Some)
            })
            .await?;
        Ok(next)
    }

    /// Count a transient failure of the current action and reschedule it.
    pub async fn retry_later(
        &self,
        id: DbId,
        error: &str,
        at: Timestamp,
    ) -> EngineResult<Enrollment> {
        let now = self.clock.now();
        let (next, _) = self
            .transition(id, |e| retried(e, error, at, now).map(Some))
            .await?;
        Ok(next)
    }

    /// Push the current action to `at` without counting an attempt.
    pub async fn postpone(&self, id: DbId, at: Timestamp) -> EngineResult<Enrollment> {
        let now = self.clock.now();
        let (next, _) = self
            .transition(id, |e| postponed(e, at, now).map(Some))
            .await?;
        Ok(next)
    }

    /// Cancel an active enrollment. A terminal one is returned unchanged.
    pub async fn cancel(&self, id: DbId, reason: &str) -> EngineResult<Enrollment> {
        let now = self.clock.now();
        let (next, changed) = self.transition(id, |e| Ok(cancelled(e, reason, now))).await?;
        if changed {
            tracing::info!(enrollment_id = id, reason, "Enrollment cancelled");
        } else {
            tracing::debug!(
                enrollment_id = id,
                status = next.status.as_str(),
                "Cancel on ended enrollment ignored"
            );
        }
        Ok(next)
    }

    /// Move an active enrollment to FAILED.
    pub async fn fail(&self, id: DbId, error: &str) -> EngineResult<Enrollment> {
        let now = self.clock.now();
        let (next, _) = self.transition(id, |e| failed(e, error, now).map(Some)).await?;
        tracing::warn!(enrollment_id = id, error, "Enrollment failed");
        Ok(next)
    }

    pub async fn get_status(&self, id: DbId) -> EngineResult<EnrollmentSnapshot> {
        Ok(self.load(id).await?.snapshot())
    }

    async fn load(&self, id: DbId) -> EngineResult<Enrollment> {
        self.enrollments
            .get(id)
            .await?
            .ok_or_else(|| CoreError::NotFound { entity: "enrollment", id }.into())
    }

    async fn pinned_definition(&self, id: DbId) -> EngineResult<WorkflowDefinition> {
        let enrollment = self.load(id).await?;
        self.workflows
            .get_version(enrollment.workflow_id, enrollment.workflow_version)
            .await?
            .ok_or_else(|| {
                CoreError::Internal(format!(
                    "Enrollment {id} pins missing workflow {} v{}",
                    enrollment.workflow_id, enrollment.workflow_version
                ))
                .into()
            })
    }

    /// Read, compute, write-if-unchanged. `apply` returning `None` leaves
    /// the enrollment as it is; the flag tells whether anything was written.
    async fn transition<F>(&self, id: DbId, mut apply: F) -> EngineResult<(Enrollment, bool)>
    where
        F: FnMut(&Enrollment) -> Result<Option<Enrollment>, CoreError> + Send,
    {
        for attempt in 1..=MAX_CONFLICT_RETRIES {
            let current = self.load(id).await?;
            let Some(next) = apply(&current)? else {
                return Ok((current, false));
            };
            if let Some(written) = self.enrollments.update(&next).await? {
                return Ok((written, true));
            }
            tracing::debug!(enrollment_id = id, attempt, "Stale enrollment write, re-reading");
        }
        Err(EngineError::Core(CoreError::Conflict(format!(
            "Enrollment {id} changed concurrently {MAX_CONFLICT_RETRIES} times"
        ))))
    }
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// State after the current action completed at `completed_at`.
pub fn advanced(
    e: &Enrollment,
    def: &WorkflowDefinition,
    completed_at: Timestamp,
) -> Result<Enrollment, CoreError> {
    e.status.validate_transition(EnrollmentStatus::Active)?;
    if e.current_action_index >= def.action_count() {
        return Err(CoreError::Internal(format!(
            "Enrollment {} is past the last action of workflow {} v{}",
            e.id, def.id, def.version
        )));
    }

    let mut next = e.clone();
    next.current_action_index = e.current_action_index + 1;
    next.attempts = 0;
    next.last_error = None;
    next.updated_at = completed_at;
    match schedule_next(e, def, completed_at) {
        Some(at) => next.next_run_at = Some(at),
        None => {
            next.status = EnrollmentStatus::Completed;
            next.next_run_at = None;
            next.completed_at = Some(completed_at);
        }
    }
    Ok(next)
}

/// State after a transient failure, rescheduled at `at`.
pub fn retried(
    e: &Enrollment,
    error: &str,
    at: Timestamp,
    now: Timestamp,
) -> Result<Enrollment, CoreError> {
    e.status.validate_transition(EnrollmentStatus::Active)?;
    let mut next = e.clone();
    next.attempts = e.attempts.saturating_add(1);
    next.last_error = Some(truncate(error));
    next.next_run_at = Some(at);
    next.updated_at = now;
    Ok(next)
}

/// State with the current action moved to `at`.
pub fn postponed(e: &Enrollment, at: Timestamp, now: Timestamp) -> Result<Enrollment, CoreError> {
    e.status.validate_transition(EnrollmentStatus::Active)?;
    let mut next = e.clone();
    next.next_run_at = Some(at);
    next.updated_at = now;
    Ok(next)
}

/// State after cancellation; `None` if the enrollment already ended.
pub fn cancelled(e: &Enrollment, reason: &str, now: Timestamp) -> Option<Enrollment> {
    if e.status.is_terminal() {
        return None;
    }
    let mut next = e.clone();
    next.status = EnrollmentStatus::Cancelled;
    next.next_run_at = None;
    next.cancel_reason = Some(truncate(reason));
    next.updated_at = now;
    Some(next)
}

/// State after a permanent failure.
pub fn failed(e: &Enrollment, error: &str, now: Timestamp) -> Result<Enrollment, CoreError> {
    e.status.validate_transition(EnrollmentStatus::Failed)?;
    let mut next = e.clone();
    next.status = EnrollmentStatus::Failed;
    next.next_run_at = None;
    next.last_error = Some(truncate(error));
    next.updated_at = now;
    Ok(next)
}

fn truncate(text: &str) -> String {
    match text.char_indices().nth(MAX_REASON_LENGTH) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
