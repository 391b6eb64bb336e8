//! Enrollment records and their state machine.
//!
//! `Active -> {Completed, Cancelled, Failed}`. Every terminal state is
//! final; `Active -> Active` covers advancing the cursor and rescheduling a
//! retry.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{DbId, Timestamp};

// ---------------------------------------------------------------------------
// EnrollmentStatus
// ---------------------------------------------------------------------------

/// Status IDs match the `enrollment_statuses` seed data (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrollmentStatus {
    Active = 1,
    Completed = 2,
    Cancelled = 3,
    Failed = 4,
}

impl EnrollmentStatus {
    pub fn id(self) -> i16 {
        self as i16
    }

    pub fn from_id(id: i16) -> Result<Self, CoreError> {
        match id {
            1 => Ok(Self::Active),
            2 => Ok(Self::Completed),
            3 => Ok(Self::Cancelled),
            4 => Ok(Self::Failed),
            other => Err(CoreError::Internal(format!(
                "Unknown enrollment status id {other}"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }

    /// Whether `self -> to` is allowed.
    pub fn can_transition(self, to: Self) -> bool {
        matches!((self, to), (Self::Active, _))
    }

    /// Like [`can_transition`](Self::can_transition) but with a descriptive
    /// error.
    pub fn validate_transition(self, to: Self) -> Result<(), CoreError> {
        if self.can_transition(to) {
            Ok(())
        } else {
            Err(CoreError::InvalidTransition(format!(
                "{} -> {}",
                self.as_str(),
                to.as_str()
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Enrollment
// ---------------------------------------------------------------------------

/// One subject's progress through one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: DbId,
    pub tenant_id: DbId,
    pub workflow_id: DbId,
    /// Definition version this enrollment executes.
    pub workflow_version: i32,
    pub subject_id: DbId,
    pub status: EnrollmentStatus,
    pub current_action_index: u32,
    /// Failed attempts of the current action.
    pub attempts: u32,
    pub enrolled_at: Timestamp,
    /// Set iff `status` is `Active`.
    pub next_run_at: Option<Timestamp>,
    pub last_error: Option<String>,
    pub cancel_reason: Option<String>,
    pub completed_at: Option<Timestamp>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<Timestamp>,
    /// Optimistic lock counter, bumped by every write.
    pub version: i64,
    pub updated_at: Timestamp,
}

impl Enrollment {
    pub fn is_active(&self) -> bool {
        self.status == EnrollmentStatus::Active
    }

    /// Active and `next_run_at <= now`.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.is_active() && self.next_run_at.is_some_and(|at| at <= now)
    }

    /// Whether another worker holds an unexpired lease.
    pub fn is_leased(&self, now: Timestamp) -> bool {
        self.lease_expires_at.is_some_and(|until| until > now)
    }

    pub fn snapshot(&self) -> EnrollmentSnapshot {
        EnrollmentSnapshot::from(self)
    }
}

/// Read-only view returned by `get_status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrollmentSnapshot {
    pub id: DbId,
    pub workflow_id: DbId,
    pub subject_id: DbId,
    pub status: EnrollmentStatus,
    pub current_action_index: u32,
    pub attempts: u32,
    pub enrolled_at: Timestamp,
    pub next_run_at: Option<Timestamp>,
    pub last_error: Option<String>,
    pub cancel_reason: Option<String>,
    pub completed_at: Option<Timestamp>,
}

impl From<&Enrollment> for EnrollmentSnapshot {
    fn from(e: &Enrollment) -> Self {
        Self {
            id: e.id,
            workflow_id: e.workflow_id,
            subject_id: e.subject_id,
            status: e.status,
            current_action_index: e.current_action_index,
            attempts: e.attempts,
            enrolled_at: e.enrolled_at,
            next_run_at: e.next_run_at,
            last_error: e.last_error.clone(),
            cancel_reason: e.cancel_reason.clone(),
            completed_at: e.completed_at,
        }
    }
}

/// Fields of a brand-new enrollment; the store assigns `id` and `version`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEnrollment {
    pub tenant_id: DbId,
    pub workflow_id: DbId,
    pub workflow_version: i32,
    pub subject_id: DbId,
    pub enrolled_at: Timestamp,
    pub next_run_at: Timestamp,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
