//! Status IDs mapping to SMALLINT lookup tables.
//!
//! The enums themselves live in `cadence_core`; their discriminants match
//! the seed order (1-based) of the corresponding `*_statuses` table.

use cadence_core::enrollment::EnrollmentStatus;

/// Status ID type matching SMALLINT in the database.
pub type StatusId = i16;

/// `enrollments.status_id` of an active enrollment.
pub const ACTIVE: StatusId = EnrollmentStatus::Active as StatusId;

