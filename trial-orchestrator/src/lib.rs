//! Federated clinical-trial workflow orchestration engine.
//!
//! Coordinates a multi-stage clinical-research workflow (patient screening,
//! cohort formation, cohort monitoring) across independently-held data sites.
//! Stage work runs as background jobs that callers poll; federated stages fan
//! a query out to every registered site in parallel and merge the aggregate
//! results without moving patient-level records.

pub mod analyst;
pub mod analytics;
pub mod config;
pub mod context;
pub mod error;
pub mod federated;
pub mod handlers;
pub mod jobs;
pub mod screening;
pub mod workflow;

pub use context::Orchestrator;
pub use error::{EngineResult, OrchestratorError};
