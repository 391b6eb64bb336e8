//! Pure domain logic for the Cadence workflow automation engine.
//!
//! Everything in this crate is free of I/O: definitions and their
//! validation, condition matching, template rendering, trigger matching,
//! delay arithmetic, and the channel capability traits implemented by the
//! delivery crate. The crate has zero internal dependencies so both the
//! repository layer and the engine can share it.

pub mod catalog;
pub mod clock;
pub mod condition;
pub mod dispatch;
pub mod enrollment;
pub mod error;
pub mod schedule;
pub mod template;
pub mod trigger;
pub mod types;
pub mod workflow;
