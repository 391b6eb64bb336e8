//! Row types for the engine's tables and their conversion into domain types.

pub mod enrollment;
pub mod status;
pub mod subject;
pub mod trigger_firing;
pub mod workflow;
