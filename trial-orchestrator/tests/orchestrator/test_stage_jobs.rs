//! Tests for stage jobs: non-blocking submission, polling, outcome merging
//! into the workflow, and the one-active-job-per-stage invariant.

use super::common::*;

use std::sync::Arc;

use serde_json::json;

use trial_orchestrator::jobs::JobStatus;
use trial_orchestrator::workflow::{StageStatus, StageUpdateRequest, WorkflowStage, WorkflowStatus};
use trial_orchestrator::{Orchestrator, OrchestratorError};

#[tokio::test]
async fn completed_job_result_is_merged_into_the_stage() {
    let orchestrator = echo_orchestrator();
    let workflow = orchestrator.engine().create(create_request("Trial A")).unwrap();

    let payload = json!({"trial_name": "PROSTATE-CANCER", "inclusion": []});
    let job = orchestrator
        .run_stage_job(
            &workflow.id,
            WorkflowStage::PatientScreening,
            payload.clone(),
            "screening",
        )
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.result.as_ref().unwrap(), &payload);

    let stage = orchestrator
        .engine()
        .get_stage(&workflow.id, WorkflowStage::PatientScreening)
        .unwrap();
    assert_eq!(stage.status, StageStatus::Completed);
    assert_eq!(stage.input_data.as_ref().unwrap(), &payload);
    assert_eq!(stage.output_data.as_ref().unwrap(), &payload);

    // The merged completion makes advance eligible
    let advanced = orchestrator.engine().advance(&workflow.id).unwrap();
    assert_eq!(advanced.current_stage, Some(WorkflowStage::CohortFormation));
}

#[tokio::test]
async fn submission_returns_immediately_and_is_pollable() {
    let release = Arc::new(tokio::sync::Notify::new());
    let orchestrator = Orchestrator::new(uniform_handlers(Arc::new(BlockedHandler(
        release.clone(),
    ))));
    let workflow = orchestrator.engine().create(create_request("Trial A")).unwrap();

    let job = orchestrator
        .submit_stage_job(
            &workflow.id,
            WorkflowStage::PatientScreening,
            json!({}),
            "screening",
        )
        .unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    // A reconnecting caller finds the same job by its stage key
    let found = orchestrator
        .jobs()
        .get_active_for_stage(&workflow.id, WorkflowStage::PatientScreening)
        .unwrap();
    assert_eq!(found.id, job.id);

    release.notify_one();
    let done = orchestrator.jobs().wait_for_terminal(&job.id).await.unwrap();
    assert_eq!(done.status, JobStatus::Completed);
}

#[tokio::test]
async fn second_submission_for_the_same_stage_conflicts() {
    let release = Arc::new(tokio::sync::Notify::new());
    let orchestrator = Orchestrator::new(uniform_handlers(Arc::new(BlockedHandler(
        release.clone(),
    ))));
    let workflow = orchestrator.engine().create(create_request("Trial A")).unwrap();

    let first = orchestrator
        .submit_stage_job(&workflow.id, WorkflowStage::PatientScreening, json!({}), "")
        .unwrap();

    let second = orchestrator.submit_stage_job(
        &workflow.id,
        WorkflowStage::PatientScreening,
        json!({}),
        "",
    );
    assert!(matches!(second, Err(OrchestratorError::Conflict(_))));

    // After the first job terminates, the key is free again
    release.notify_one();
    orchestrator.jobs().wait_for_terminal(&first.id).await.unwrap();
    release.notify_one();
    assert!(orchestrator
        .submit_stage_job(&workflow.id, WorkflowStage::PatientScreening, json!({}), "")
        .is_ok());
}

#[tokio::test]
async fn failed_job_marks_the_stage_and_workflow_failed() {
    let orchestrator = Orchestrator::new(uniform_handlers(Arc::new(FailingHandler(
        "all sites unreachable",
    ))));
    let workflow = orchestrator.engine().create(create_request("Trial A")).unwrap();

    let job = orchestrator
        .run_stage_job(&workflow.id, WorkflowStage::PatientScreening, json!({}), "")
        .await
        .unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.as_ref().unwrap().contains("all sites unreachable"));

    let stage = orchestrator
        .engine()
        .get_stage(&workflow.id, WorkflowStage::PatientScreening)
        .unwrap();
    assert_eq!(stage.status, StageStatus::Failed);
    assert!(stage.error.as_ref().unwrap().contains("all sites unreachable"));
    assert_eq!(
        orchestrator.engine().get(&workflow.id).unwrap().status,
        WorkflowStatus::Failed
    );

    // No automatic retry: the job stays failed until the caller acts
    let latest = orchestrator
        .jobs()
        .get_latest_for_stage(&workflow.id, WorkflowStage::PatientScreening)
        .unwrap();
    assert_eq!(latest.status, JobStatus::Failed);
}

#[tokio::test]
async fn resetting_a_stage_makes_a_new_submission_legal() {
    let orchestrator = echo_orchestrator();
    let workflow = orchestrator.engine().create(create_request("Trial A")).unwrap();

    let first = orchestrator
        .run_stage_job(&workflow.id, WorkflowStage::PatientScreening, json!({}), "")
        .await
        .unwrap();
    assert_eq!(first.status, JobStatus::Completed);

    // Rerun: reset the stage, then submit again for the same key
    orchestrator
        .engine()
        .update_stage(
            &workflow.id,
            WorkflowStage::PatientScreening,
            StageUpdateRequest::status(StageStatus::NotStarted),
        )
        .unwrap();
    let stage = orchestrator
        .engine()
        .get_stage(&workflow.id, WorkflowStage::PatientScreening)
        .unwrap();
    assert!(stage.output_data.is_none());

    let second = orchestrator
        .run_stage_job(&workflow.id, WorkflowStage::PatientScreening, json!({}), "")
        .await
        .unwrap();
    assert_ne!(second.id, first.id);
    assert_eq!(second.status, JobStatus::Completed);
}

#[tokio::test]
async fn submitting_for_an_unknown_workflow_is_not_found() {
    let orchestrator = echo_orchestrator();
    let result = orchestrator.submit_stage_job(
        "missing",
        WorkflowStage::PatientScreening,
        json!({}),
        "",
    );
    assert!(matches!(result, Err(OrchestratorError::NotFound(_))));
}

#[tokio::test]
async fn stages_run_independently_per_workflow_key() {
    let release = Arc::new(tokio::sync::Notify::new());
    let orchestrator = Orchestrator::new(uniform_handlers(Arc::new(BlockedHandler(
        release.clone(),
    ))));
    let workflow = orchestrator.engine().create(create_request("Trial A")).unwrap();

    orchestrator
        .submit_stage_job(&workflow.id, WorkflowStage::PatientScreening, json!({}), "")
        .unwrap();

    // A different stage of the same workflow is its own key
    assert!(orchestrator
        .submit_stage_job(&workflow.id, WorkflowStage::CohortMonitoring, json!({}), "")
        .is_ok());

    release.notify_one();
    release.notify_one();
}
