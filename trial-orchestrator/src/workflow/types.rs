//! Data models for clinical-trial workflows.
//!
//! A workflow captures the end-to-end lifecycle of one trial, moving through
//! three ordered stages:
//!
//! 1. Patient Screening - federated eligibility screening
//! 2. Cohort Formation - analytics queries to define treatment arms
//! 3. Cohort Monitoring - federated treatment-arm monitoring
//!
//! Each stage records its own status, timestamps, input/output data, and
//! errors so the workflow can be paused, inspected, and resumed at any point.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ordered stages of a clinical-trial workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStage {
    PatientScreening,
    CohortFormation,
    CohortMonitoring,
}

/// Canonical ordering used by the engine to determine "next stage".
pub const STAGE_ORDER: [WorkflowStage; 3] = [
    WorkflowStage::PatientScreening,
    WorkflowStage::CohortFormation,
    WorkflowStage::CohortMonitoring,
];

impl WorkflowStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStage::PatientScreening => "patient_screening",
            WorkflowStage::CohortFormation => "cohort_formation",
            WorkflowStage::CohortMonitoring => "cohort_monitoring",
        }
    }

    /// The stage after this one, or `None` at the end of the order.
    pub fn next(&self) -> Option<WorkflowStage> {
        let idx = STAGE_ORDER.iter().position(|s| s == self)?;
        STAGE_ORDER.get(idx + 1).copied()
    }
}

impl fmt::Display for WorkflowStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution status of an individual stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::NotStarted => "not_started",
            StageStatus::InProgress => "in_progress",
            StageStatus::Completed => "completed",
            StageStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Overall status of the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Created => "created",
            WorkflowStatus::Running => "running",
            WorkflowStatus::Paused => "paused",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
        }
    }

    /// A workflow counts as active while it still occupies the
    /// single-active-workflow slot.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Created | WorkflowStatus::Running | WorkflowStatus::Paused
        )
    }
}

impl fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the stage analyst suggests doing after a stage completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationAction {
    Proceed,
    Adjust,
    Review,
    Alert,
}

/// A typed analysis of a completed stage, stored on its [`StageResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecommendation {
    pub stage: WorkflowStage,
    pub recommendation: RecommendationAction,
    /// Quality of the stage's output, 0.0 (unusable) to 1.0 (clean).
    pub quality_score: f64,
    pub stage_summary: String,
    #[serde(default)]
    pub anomalies: Vec<String>,
    /// Suggested focus areas for the next stage.
    #[serde(default)]
    pub focus_areas: Vec<String>,
}

/// Tracks execution state and data for a single workflow stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: WorkflowStage,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Payload sent to the stage (e.g. screening criteria).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_data: Option<serde_json::Value>,
    /// Result returned by the stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data: Option<serde_json::Value>,
    /// Error message if the stage failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Analyst recommendation recorded after the stage completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<StageRecommendation>,
}

impl StageResult {
    pub fn new(stage: WorkflowStage) -> Self {
        Self {
            stage,
            status: StageStatus::NotStarted,
            started_at: None,
            completed_at: None,
            input_data: None,
            output_data: None,
            error: None,
            recommendation: None,
        }
    }

    /// Wipe the stage back to a fresh not-started state.
    pub(crate) fn reset(&mut self) {
        *self = StageResult::new(self.stage);
    }
}

/// Create a fresh stages map with every stage not started.
pub fn new_stages() -> HashMap<WorkflowStage, StageResult> {
    STAGE_ORDER
        .iter()
        .map(|stage| (*stage, StageResult::new(*stage)))
        .collect()
}

/// A single message in a stage conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    /// "user" or "ai".
    pub role: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Full representation of a clinical-trial workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique workflow identifier (UUID).
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Trial name used across screening and monitoring.
    pub trial_name: String,
    pub status: WorkflowStatus,
    /// The stage the workflow is currently at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<WorkflowStage>,
    /// Per-stage execution state, always populated for every stage.
    pub stages: HashMap<WorkflowStage, StageResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Per-stage conversation history.
    #[serde(default)]
    pub conversations: HashMap<WorkflowStage, Vec<ConversationMessage>>,
}

impl Workflow {
    /// The stage record, inserting a fresh one if it is somehow missing.
    pub(crate) fn stage_mut(&mut self, stage: WorkflowStage) -> &mut StageResult {
        self.stages
            .entry(stage)
            .or_insert_with(|| StageResult::new(stage))
    }

    pub fn stage(&self, stage: WorkflowStage) -> Option<&StageResult> {
        self.stages.get(&stage)
    }
}

/// Payload to create a new workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowCreateRequest {
    /// Human-readable workflow name.
    pub name: String,
    /// Free-text description of the trial.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Trial identifier used in screening and monitoring.
    pub trial_name: String,
}

/// Payload to update a stage's status and results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageUpdateRequest {
    /// New status for the stage.
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageUpdateRequest {
    pub fn status(status: StageStatus) -> Self {
        Self {
            status,
            input_data: None,
            output_data: None,
            error: None,
        }
    }

    pub fn completed(output_data: Option<serde_json::Value>) -> Self {
        Self {
            output_data,
            ..Self::status(StageStatus::Completed)
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::status(StageStatus::Failed)
        }
    }
}

/// Lightweight view of a workflow for list endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub trial_name: String,
    pub status: WorkflowStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<WorkflowStage>,
    /// Stage name -> status mapping.
    pub stages_summary: BTreeMap<String, StageStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
