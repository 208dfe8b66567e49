//! In-memory workflow registry.
//!
//! All data lives in a process-local map keyed by workflow id and is lost
//! when the process exits; durable persistence is out of scope. The store is
//! a cheap cloneable handle, constructed explicitly and owned by the
//! orchestrator context; there is no hidden global instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::error::{EngineResult, OrchestratorError};

use super::types::{Workflow, WorkflowSummary};

#[derive(Clone, Default)]
pub struct WorkflowStore {
    workflows: Arc<Mutex<HashMap<String, Workflow>>>,
}

impl WorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a brand-new workflow.
    ///
    /// At most one workflow may be active (created, running, or paused) at a
    /// time; the check and the insert happen under a single lock acquisition
    /// so two concurrent creations cannot both succeed.
    pub fn insert_new(&self, workflow: Workflow) -> EngineResult<Workflow> {
        let mut workflows = self.workflows.lock().unwrap();
        if let Some(active) = workflows.values().find(|w| w.status.is_active()) {
            return Err(OrchestratorError::conflict(format!(
                "Workflow '{}' ({}) is already {}. Complete or delete it before creating another.",
                active.name, active.id, active.status
            )));
        }
        workflows.insert(workflow.id.clone(), workflow.clone());
        Ok(workflow)
    }

    /// Insert or replace a workflow record.
    pub fn save(&self, workflow: Workflow) {
        let mut workflows = self.workflows.lock().unwrap();
        workflows.insert(workflow.id.clone(), workflow);
    }

    /// Apply a mutation to one workflow as a single critical section.
    ///
    /// Every engine transition goes through here, so two concurrent updates
    /// to the same record (say, a stage completion and an advance) serialize
    /// instead of interleaving into a lost update. `updated_at` is stamped on
    /// success.
    pub fn update<T>(
        &self,
        workflow_id: &str,
        mutate: impl FnOnce(&mut Workflow) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut workflows = self.workflows.lock().unwrap();
        let workflow = workflows.get_mut(workflow_id).ok_or_else(|| {
            OrchestratorError::not_found(format!("Workflow '{}' not found.", workflow_id))
        })?;
        let out = mutate(workflow)?;
        workflow.updated_at = Utc::now();
        Ok(out)
    }

    /// Retrieve a workflow by id.
    pub fn get(&self, workflow_id: &str) -> Option<Workflow> {
        let workflows = self.workflows.lock().unwrap();
        workflows.get(workflow_id).cloned()
    }

    /// Lightweight summaries for every workflow.
    pub fn list(&self) -> Vec<WorkflowSummary> {
        let workflows = self.workflows.lock().unwrap();
        workflows.values().map(summarize).collect()
    }

    /// Summaries for workflows matching a trial name.
    pub fn list_by_trial(&self, trial_name: &str) -> Vec<WorkflowSummary> {
        let workflows = self.workflows.lock().unwrap();
        workflows
            .values()
            .filter(|w| w.trial_name == trial_name)
            .map(summarize)
            .collect()
    }

    /// Delete a workflow. Returns `true` if it existed.
    pub fn delete(&self, workflow_id: &str) -> bool {
        let mut workflows = self.workflows.lock().unwrap();
        workflows.remove(workflow_id).is_some()
    }

    pub fn count(&self) -> usize {
        let workflows = self.workflows.lock().unwrap();
        workflows.len()
    }

    /// The currently active workflow, if any.
    pub fn active_workflow(&self) -> Option<Workflow> {
        let workflows = self.workflows.lock().unwrap();
        workflows
            .values()
            .find(|w| w.status.is_active())
            .cloned()
    }
}

fn summarize(workflow: &Workflow) -> WorkflowSummary {
    WorkflowSummary {
        id: workflow.id.clone(),
        name: workflow.name.clone(),
        description: workflow.description.clone(),
        trial_name: workflow.trial_name.clone(),
        status: workflow.status,
        current_stage: workflow.current_stage,
        stages_summary: workflow
            .stages
            .iter()
            .map(|(stage, result)| (stage.as_str().to_string(), result.status))
            .collect(),
        created_at: workflow.created_at,
        updated_at: workflow.updated_at,
    }
}
