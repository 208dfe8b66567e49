//! Typed failures surfaced by the workflow and job APIs.
//!
//! Failures inside a stage handler or a single site's call never reach this
//! type: they are contained where they happen (the job's `error` field, the
//! site result's `errors` list). This enum covers only the synchronous,
//! caller-facing violations.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Another record already occupies an exclusive slot: a second active
    /// workflow, or a second non-terminal job for the same workflow stage.
    #[error("{0}")]
    Conflict(String),

    /// The requested action is not valid for the record's current status.
    #[error("{0}")]
    InvalidState(String),

    /// Unknown workflow or job id.
    #[error("{0}")]
    NotFound(String),
}

impl OrchestratorError {
    pub fn conflict(message: impl Into<String>) -> Self {
        OrchestratorError::Conflict(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        OrchestratorError::InvalidState(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        OrchestratorError::NotFound(message.into())
    }
}

pub type EngineResult<T> = Result<T, OrchestratorError>;
