//! The orchestrator context.
//!
//! One explicitly constructed object owning the workflow store, the job
//! store, and the stage handler wiring. Every operation goes through a
//! context instance: tests build isolated ones, and nothing hides behind a
//! process-wide singleton.

use serde_json::Value;

use crate::error::EngineResult;
use crate::jobs::{Job, JobStatus, JobStore, StageHandlers};
use crate::workflow::{
    StageStatus, StageUpdateRequest, WorkflowEngine, WorkflowStage, WorkflowStore,
};

pub struct Orchestrator {
    engine: WorkflowEngine,
    jobs: JobStore,
    handlers: StageHandlers,
}

impl Orchestrator {
    pub fn new(handlers: StageHandlers) -> Self {
        Self {
            engine: WorkflowEngine::new(WorkflowStore::new()),
            jobs: JobStore::new(),
            handlers,
        }
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    /// Submit a stage's work as a background job.
    ///
    /// Marks the stage in-progress (recording the payload as its input) and
    /// returns the pending job immediately. When the job reaches a terminal
    /// status, its outcome is merged back into the stage record: result into
    /// `output_data` on completion, error message onto the stage on failure.
    /// The caller polls the job (or reads the stage) to observe completion,
    /// then calls `advance` itself.
    pub fn submit_stage_job(
        &self,
        workflow_id: &str,
        stage: WorkflowStage,
        payload: Value,
        description: &str,
    ) -> EngineResult<Job> {
        // Surface an unknown workflow before any job bookkeeping happens
        self.engine.get(workflow_id)?;

        let handler = self.handlers.handler_for(stage);
        let job = self.jobs.submit(
            workflow_id.to_string(),
            stage,
            payload.clone(),
            handler,
            description.to_string(),
        )?;

        self.engine.update_stage(
            workflow_id,
            stage,
            StageUpdateRequest {
                status: StageStatus::InProgress,
                input_data: Some(payload),
                output_data: None,
                error: None,
            },
        )?;

        // Watch for the terminal transition and merge it into the stage
        let engine = self.engine.clone();
        let jobs = self.jobs.clone();
        let job_id = job.id.clone();
        let workflow_id = workflow_id.to_string();
        tokio::spawn(async move {
            let Some(done) = jobs.wait_for_terminal(&job_id).await else {
                return;
            };
            let update = match done.status {
                JobStatus::Completed => StageUpdateRequest::completed(done.result.clone()),
                _ => StageUpdateRequest::failed(
                    done.error
                        .clone()
                        .unwrap_or_else(|| "Stage job failed.".to_string()),
                ),
            };
            if let Err(err) = engine.update_stage(&workflow_id, stage, update) {
                eprintln!(
                    "Failed to record job {} outcome on workflow {}: {}",
                    job_id, workflow_id, err
                );
            }
        });

        Ok(job)
    }

    /// Submit a stage job and wait until its outcome is merged into the
    /// workflow's stage record. Convenience for callers that stay connected.
    pub async fn run_stage_job(
        &self,
        workflow_id: &str,
        stage: WorkflowStage,
        payload: Value,
        description: &str,
    ) -> EngineResult<Job> {
        let job = self.submit_stage_job(workflow_id, stage, payload, description)?;
        let done = self.jobs.wait_for_terminal(&job.id).await.unwrap_or(job);
        // The merge watcher races with us; wait for the stage record to settle
        loop {
            let stage_result = self.engine.get_stage(workflow_id, stage)?;
            if stage_result.status != StageStatus::InProgress {
                return Ok(done);
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}
