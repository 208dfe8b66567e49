//! Workflow state machine.
//!
//! Manages lifecycle and state transitions for clinical-trial workflows.
//! The engine is CRUD + state management only; it does not execute stage
//! work itself. Stage execution happens through background jobs; their
//! outcomes are recorded back here via [`WorkflowEngine::update_stage`].

use std::collections::HashMap;

use chrono::Utc;
use uuid::Uuid;

use trial_orchestrator_sdk::{log_stage_updated, OrchestratorEvent};

use crate::error::{EngineResult, OrchestratorError};

use super::store::WorkflowStore;
use super::types::{
    new_stages, ConversationMessage, StageRecommendation, StageResult, StageStatus,
    StageUpdateRequest, Workflow, WorkflowCreateRequest, WorkflowStage, WorkflowStatus,
    STAGE_ORDER,
};

#[derive(Clone)]
pub struct WorkflowEngine {
    store: WorkflowStore,
}

impl WorkflowEngine {
    pub fn new(store: WorkflowStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &WorkflowStore {
        &self.store
    }

    /// Create a new workflow, auto-started at the first stage.
    ///
    /// Fails with a conflict while another workflow is active.
    pub fn create(&self, request: WorkflowCreateRequest) -> EngineResult<Workflow> {
        let now = Utc::now();
        let workflow = Workflow {
            id: Uuid::new_v4().to_string(),
            name: request.name,
            description: request.description,
            trial_name: request.trial_name,
            status: WorkflowStatus::Running,
            current_stage: Some(STAGE_ORDER[0]),
            stages: new_stages(),
            created_at: now,
            updated_at: now,
            conversations: HashMap::new(),
        };
        let workflow = self.store.insert_new(workflow)?;
        OrchestratorEvent::WorkflowCreated {
            workflow_id: workflow.id.clone(),
            name: workflow.name.clone(),
        }
        .emit();
        Ok(workflow)
    }

    /// Re-pin the workflow at the first stage, paused.
    ///
    /// Allowed from `created` or `paused` (idempotent for auto-started
    /// workflows).
    pub fn start(&self, workflow_id: &str) -> EngineResult<Workflow> {
        self.store.update(workflow_id, |workflow| {
            if !matches!(
                workflow.status,
                WorkflowStatus::Created | WorkflowStatus::Paused
            ) {
                return Err(OrchestratorError::invalid_state(format!(
                    "Cannot start workflow in '{}' state. \
                     Only workflows in 'created' or 'paused' state can be started.",
                    workflow.status
                )));
            }
            workflow.status = WorkflowStatus::Paused;
            workflow.current_stage = Some(STAGE_ORDER[0]);
            Ok(workflow.clone())
        })
    }

    /// Resume a paused or failed workflow at its current stage.
    ///
    /// If the current stage failed, it is reset to not-started so the caller
    /// can re-run it.
    pub fn resume(&self, workflow_id: &str) -> EngineResult<Workflow> {
        self.store.update(workflow_id, |workflow| {
            if !matches!(
                workflow.status,
                WorkflowStatus::Paused | WorkflowStatus::Failed
            ) {
                return Err(OrchestratorError::invalid_state(format!(
                    "Cannot resume workflow in '{}' state. \
                     Only workflows in 'paused' or 'failed' state can be resumed.",
                    workflow.status
                )));
            }
            let current = workflow.current_stage.ok_or_else(|| {
                OrchestratorError::invalid_state(
                    "Workflow has no current stage to resume from.".to_string(),
                )
            })?;

            let stage_result = workflow.stage_mut(current);
            if stage_result.status == StageStatus::Failed {
                stage_result.status = StageStatus::NotStarted;
                stage_result.error = None;
            }
            workflow.status = WorkflowStatus::Running;
            Ok(workflow.clone())
        })
    }

    /// Move the workflow to the next stage without executing it.
    ///
    /// The current stage must already be completed. Advancing past the final
    /// stage completes the workflow and clears the current stage.
    pub fn advance(&self, workflow_id: &str) -> EngineResult<Workflow> {
        let workflow = self.store.update(workflow_id, |workflow| {
            if !matches!(
                workflow.status,
                WorkflowStatus::Running | WorkflowStatus::Paused
            ) {
                return Err(OrchestratorError::invalid_state(format!(
                    "Cannot advance workflow in '{}' state.",
                    workflow.status
                )));
            }
            let current = workflow.current_stage.ok_or_else(|| {
                OrchestratorError::invalid_state("Workflow has no current stage.".to_string())
            })?;

            let current_result = workflow.stage_mut(current);
            if current_result.status != StageStatus::Completed {
                return Err(OrchestratorError::invalid_state(format!(
                    "Current stage '{}' is not completed (status={}). \
                     Complete it before advancing.",
                    current, current_result.status
                )));
            }

            match current.next() {
                Some(next) => {
                    workflow.current_stage = Some(next);
                    workflow.status = WorkflowStatus::Running;
                }
                None => {
                    // All stages done
                    workflow.status = WorkflowStatus::Completed;
                    workflow.current_stage = None;
                }
            }
            Ok(workflow.clone())
        })?;

        OrchestratorEvent::WorkflowAdvanced {
            workflow_id: workflow.id.clone(),
            stage: workflow.current_stage.map(|s| s.as_str().to_string()),
        }
        .emit();
        Ok(workflow)
    }

    /// Pause a running workflow so it can be resumed later.
    pub fn pause(&self, workflow_id: &str) -> EngineResult<Workflow> {
        self.store.update(workflow_id, |workflow| {
            if !matches!(
                workflow.status,
                WorkflowStatus::Running | WorkflowStatus::Paused
            ) {
                return Err(OrchestratorError::invalid_state(format!(
                    "Cannot pause workflow in '{}' state.",
                    workflow.status
                )));
            }
            workflow.status = WorkflowStatus::Paused;
            Ok(workflow.clone())
        })
    }

    /// Update a stage's status and results.
    ///
    /// This is the bridge between stage execution and the workflow tracker:
    /// job outcomes land here, and callers use it directly to mark a stage
    /// complete by hand or to reset one for a rerun. Resetting a stage to
    /// not-started also resets every later stage so no stale downstream
    /// output survives the rerun.
    pub fn update_stage(
        &self,
        workflow_id: &str,
        stage: WorkflowStage,
        request: StageUpdateRequest,
    ) -> EngineResult<Workflow> {
        let status = request.status;
        let workflow = self.store.update(workflow_id, |workflow| {
            let stage_result = workflow.stage_mut(stage);
            stage_result.status = status;

            match status {
                StageStatus::InProgress => {
                    stage_result.started_at = Some(Utc::now());
                    stage_result.error = None;
                    workflow.status = WorkflowStatus::Running;
                }
                StageStatus::Completed => {
                    stage_result.completed_at = Some(Utc::now());
                    stage_result.error = None;
                }
                StageStatus::Failed => {
                    stage_result.completed_at = Some(Utc::now());
                    stage_result.error = request.error.clone();
                    workflow.status = WorkflowStatus::Failed;
                }
                StageStatus::NotStarted => {
                    // Reset: move current_stage back to this stage so the
                    // caller can re-run it, and keep the workflow running.
                    stage_result.reset();
                    workflow.current_stage = Some(stage);
                    workflow.status = WorkflowStatus::Running;

                    let mut later = stage.next();
                    while let Some(s) = later {
                        workflow.stage_mut(s).reset();
                        later = s.next();
                    }
                }
            }

            if let Some(input) = request.input_data {
                workflow.stage_mut(stage).input_data = Some(input);
            }
            if let Some(output) = request.output_data {
                workflow.stage_mut(stage).output_data = Some(output);
            }
            Ok(workflow.clone())
        })?;

        log_stage_updated!(workflow_id, stage, status);
        Ok(workflow)
    }

    /// Record the analyst's recommendation on a stage.
    pub fn record_recommendation(
        &self,
        workflow_id: &str,
        stage: WorkflowStage,
        recommendation: StageRecommendation,
    ) -> EngineResult<()> {
        self.store.update(workflow_id, |workflow| {
            workflow.stage_mut(stage).recommendation = Some(recommendation);
            Ok(())
        })
    }

    /// Delete a workflow, freeing the single-active slot.
    pub fn delete(&self, workflow_id: &str) -> EngineResult<()> {
        if !self.store.delete(workflow_id) {
            return Err(OrchestratorError::not_found(format!(
                "Workflow '{}' not found.",
                workflow_id
            )));
        }
        Ok(())
    }

    pub fn get(&self, workflow_id: &str) -> EngineResult<Workflow> {
        self.store.get(workflow_id).ok_or_else(|| {
            OrchestratorError::not_found(format!("Workflow '{}' not found.", workflow_id))
        })
    }

    /// The result for a specific stage of a workflow.
    pub fn get_stage(
        &self,
        workflow_id: &str,
        stage: WorkflowStage,
    ) -> EngineResult<StageResult> {
        let workflow = self.get(workflow_id)?;
        workflow
            .stage(stage)
            .cloned()
            .ok_or_else(|| OrchestratorError::not_found(format!("Stage '{}' not found.", stage)))
    }

    /// The persisted conversation for a workflow stage.
    pub fn get_conversation(
        &self,
        workflow_id: &str,
        stage: WorkflowStage,
    ) -> EngineResult<Vec<ConversationMessage>> {
        let workflow = self.get(workflow_id)?;
        Ok(workflow
            .conversations
            .get(&stage)
            .cloned()
            .unwrap_or_default())
    }

    /// Replace the conversation history for a workflow stage.
    pub fn save_conversation(
        &self,
        workflow_id: &str,
        stage: WorkflowStage,
        messages: Vec<ConversationMessage>,
    ) -> EngineResult<()> {
        self.store.update(workflow_id, |workflow| {
            workflow.conversations.insert(stage, messages);
            Ok(())
        })
    }
}
