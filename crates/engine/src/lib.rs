//! Cadence workflow engine.
//!
//! - [`manager::EnrollmentManager`]: enrollment lifecycle with optimistic
//!   concurrency.
//! - [`triggers::TriggerEvaluator`]: event, scheduled and recurring triggers.
//! - [`scheduler::ActionScheduler`]: the sweep that renders and dispatches
//!   due actions.
//! - [`store`]: persistence seams, backed by [`pg::PgStore`] or
//!   [`memory::InMemoryStore`].
//! - [`engine::Engine`]: everything wired together.

pub mod config;
pub mod engine;
pub mod error;
pub mod manager;
pub mod memory;
pub mod pg;
pub mod scheduler;
pub mod store;
pub mod triggers;

pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use scheduler::{Channels, SweepReport};
pub use store::Stores;
pub use triggers::TriggerReport;
