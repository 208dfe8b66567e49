//! In-memory background-job system for long-running stage operations.
//!
//! Submitting a job returns immediately with the job record; the actual work
//! runs on its own tokio task and callers poll [`JobStore::get`] (or
//! [`JobStore::get_latest_for_stage`] after reconnecting) until the job
//! reaches a terminal status. Jobs are kept after completion so a caller that
//! navigated away can come back for the result. There is no cancellation and
//! no automatic retry: a failed job stays failed until the caller explicitly
//! resubmits.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use trial_orchestrator_sdk::{async_trait, log_job_completed, log_job_failed, log_job_submitted};

use crate::error::{EngineResult, OrchestratorError};
use crate::workflow::WorkflowStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One asynchronous unit of work bound to a (workflow, stage) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub workflow_id: String,
    pub stage: WorkflowStage,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// The request body forwarded to the stage handler.
    pub payload: Value,
    /// Set only when the job completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Set only when the job failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Human-readable label, e.g. "Natural language screening".
    pub description: String,
}

/// Snapshot broadcast on every job status change.
#[derive(Debug, Clone)]
pub struct JobEvent {
    pub job_id: String,
    pub workflow_id: String,
    pub stage: WorkflowStage,
    pub status: JobStatus,
}

/// A stage's long-running work, invoked by the job store on a background
/// task. Must tolerate being submitted again after a stage rerun.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn run(&self, payload: Value) -> anyhow::Result<Value>;
}

/// One handler per stage, wired at startup.
///
/// Construction is exhaustive by shape: there is no way to submit a job for
/// a stage key that has no handler.
#[derive(Clone)]
pub struct StageHandlers {
    pub screening: Arc<dyn StageHandler>,
    pub cohort: Arc<dyn StageHandler>,
    pub monitoring: Arc<dyn StageHandler>,
}

impl StageHandlers {
    pub fn handler_for(&self, stage: WorkflowStage) -> Arc<dyn StageHandler> {
        match stage {
            WorkflowStage::PatientScreening => self.screening.clone(),
            WorkflowStage::CohortFormation => self.cohort.clone(),
            WorkflowStage::CohortMonitoring => self.monitoring.clone(),
        }
    }
}

#[derive(Default)]
struct JobMap {
    jobs: HashMap<String, Job>,
    /// (workflow id, stage) -> most recent job id for that key.
    stage_jobs: HashMap<(String, WorkflowStage), String>,
}

/// Thread-safe job store, a cheap cloneable handle.
#[derive(Clone)]
pub struct JobStore {
    map: Arc<Mutex<JobMap>>,
    events: broadcast::Sender<JobEvent>,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore {
    pub fn new() -> Self {
        // Capacity sized for bursts of status changes; a lagging subscriber
        // just re-reads the store.
        let (events, _) = broadcast::channel(256);
        Self {
            map: Arc::new(Mutex::new(JobMap::default())),
            events,
        }
    }

    /// Submit a job for background execution.
    ///
    /// Returns the new job (status = pending) immediately. Fails with a
    /// conflict while a pending or running job exists for the same
    /// (workflow, stage) key; the conflict check and the insert of the new
    /// job happen under a single lock acquisition so concurrent submissions
    /// for one key cannot both succeed.
    pub fn submit(
        &self,
        workflow_id: String,
        stage: WorkflowStage,
        payload: Value,
        handler: Arc<dyn StageHandler>,
        description: String,
    ) -> EngineResult<Job> {
        let job = Job {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.clone(),
            stage,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            payload: payload.clone(),
            result: None,
            error: None,
            description,
        };

        {
            let mut map = self.map.lock().unwrap();
            if let Some(existing_id) = map.stage_jobs.get(&(workflow_id.clone(), stage)) {
                if let Some(existing) = map.jobs.get(existing_id) {
                    if !existing.status.is_terminal() {
                        return Err(OrchestratorError::conflict(format!(
                            "A job is already {} for stage '{}'. \
                             Please wait for it to finish.",
                            existing.status, stage
                        )));
                    }
                }
            }
            map.jobs.insert(job.id.clone(), job.clone());
            map.stage_jobs.insert((workflow_id, stage), job.id.clone());
        }

        let _ = self.events.send(JobEvent {
            job_id: job.id.clone(),
            workflow_id: job.workflow_id.clone(),
            stage,
            status: JobStatus::Pending,
        });
        log_job_submitted!(job.id, job.workflow_id, stage);

        // Launch the background task
        let store = self.clone();
        let job_id = job.id.clone();
        tokio::spawn(async move {
            store.run(job_id, handler, payload).await;
        });

        Ok(job)
    }

    /// Execute the handler on its own task and record the outcome.
    ///
    /// Any handler failure is captured into the job's error field; nothing
    /// escapes, and a panicking handler is absorbed as a failed job rather
    /// than taking the process down.
    async fn run(&self, job_id: String, handler: Arc<dyn StageHandler>, payload: Value) {
        self.transition(&job_id, JobStatus::Running, None, None);

        let outcome = tokio::spawn(async move { handler.run(payload).await }).await;
        match outcome {
            Ok(Ok(result)) => {
                self.transition(&job_id, JobStatus::Completed, Some(result), None);
                log_job_completed!(job_id);
            }
            Ok(Err(err)) => {
                let message = format!("{:#}", err);
                self.transition(&job_id, JobStatus::Failed, None, Some(message.clone()));
                log_job_failed!(job_id, message);
            }
            Err(join_err) => {
                let message = format!("Stage handler panicked: {}", join_err);
                self.transition(&job_id, JobStatus::Failed, None, Some(message.clone()));
                log_job_failed!(job_id, message);
            }
        }
    }

    /// Apply one status transition under the lock and broadcast it.
    ///
    /// Terminal jobs are immutable: a transition against a completed or
    /// failed job is dropped.
    fn transition(
        &self,
        job_id: &str,
        status: JobStatus,
        result: Option<Value>,
        error: Option<String>,
    ) {
        let event = {
            let mut map = self.map.lock().unwrap();
            let Some(job) = map.jobs.get_mut(job_id) else {
                return;
            };
            if job.status.is_terminal() {
                return;
            }
            job.status = status;
            match status {
                JobStatus::Running => job.started_at = Some(Utc::now()),
                JobStatus::Completed => {
                    job.completed_at = Some(Utc::now());
                    job.result = result;
                }
                JobStatus::Failed => {
                    job.completed_at = Some(Utc::now());
                    job.error = error;
                }
                JobStatus::Pending => {}
            }
            JobEvent {
                job_id: job.id.clone(),
                workflow_id: job.workflow_id.clone(),
                stage: job.stage,
                status,
            }
        };
        let _ = self.events.send(event);
    }

    /// Poll a job's status and result.
    pub fn get(&self, job_id: &str) -> Option<Job> {
        let map = self.map.lock().unwrap();
        map.jobs.get(job_id).cloned()
    }

    /// The most recent job for a workflow+stage if it is still pending or
    /// running.
    pub fn get_active_for_stage(&self, workflow_id: &str, stage: WorkflowStage) -> Option<Job> {
        self.get_latest_for_stage(workflow_id, stage)
            .filter(|job| !job.status.is_terminal())
    }

    /// The most recent job for a workflow+stage regardless of status.
    ///
    /// Lets a caller that navigated away and returned resume polling or read
    /// a result it missed, without resubmitting.
    pub fn get_latest_for_stage(&self, workflow_id: &str, stage: WorkflowStage) -> Option<Job> {
        let map = self.map.lock().unwrap();
        let job_id = map.stage_jobs.get(&(workflow_id.to_string(), stage))?;
        map.jobs.get(job_id).cloned()
    }

    /// Subscribe to job status changes.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Wait until the given job reaches a terminal status.
    ///
    /// The external contract stays poll-based; this just wakes on status
    /// broadcasts instead of busy-polling. Returns `None` for an unknown id.
    pub async fn wait_for_terminal(&self, job_id: &str) -> Option<Job> {
        let mut events = self.subscribe();
        loop {
            match self.get(job_id) {
                None => return None,
                Some(job) if job.status.is_terminal() => return Some(job),
                Some(_) => {}
            }
            match events.recv().await {
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return self.get(job_id),
            }
        }
    }
}
