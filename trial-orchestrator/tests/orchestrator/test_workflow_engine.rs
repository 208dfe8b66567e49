//! Tests for the workflow state machine: creation, advancing, pausing,
//! resuming, stage overrides, and the single-active-workflow invariant.

use super::common::*;

use serde_json::json;

use trial_orchestrator::workflow::{
    ConversationMessage, StageStatus, StageUpdateRequest, WorkflowEngine, WorkflowStage,
    WorkflowStatus, WorkflowStore, STAGE_ORDER,
};
use trial_orchestrator::OrchestratorError;

fn engine() -> WorkflowEngine {
    WorkflowEngine::new(WorkflowStore::new())
}

fn complete_stage(engine: &WorkflowEngine, id: &str, stage: WorkflowStage) {
    engine
        .update_stage(id, stage, StageUpdateRequest::completed(Some(json!({"ok": true}))))
        .unwrap();
}

#[test]
fn create_auto_starts_at_screening() {
    let engine = engine();
    let workflow = engine.create(create_request("Trial A")).unwrap();

    assert_eq!(workflow.status, WorkflowStatus::Running);
    assert_eq!(workflow.current_stage, Some(WorkflowStage::PatientScreening));
    for stage in STAGE_ORDER {
        assert_eq!(
            workflow.stage(stage).unwrap().status,
            StageStatus::NotStarted
        );
    }
}

#[test]
fn second_create_conflicts_while_one_is_active() {
    let engine = engine();
    let first = engine.create(create_request("Trial A")).unwrap();

    let second = engine.create(create_request("Trial B"));
    assert!(matches!(second, Err(OrchestratorError::Conflict(_))));

    // Deleting the active workflow frees the slot
    engine.delete(&first.id).unwrap();
    assert!(engine.create(create_request("Trial B")).is_ok());
}

#[test]
fn completing_every_stage_completes_the_workflow() {
    let engine = engine();
    let workflow = engine.create(create_request("Trial A")).unwrap();

    for (i, stage) in STAGE_ORDER.iter().enumerate() {
        complete_stage(&engine, &workflow.id, *stage);
        let advanced = engine.advance(&workflow.id).unwrap();
        if i + 1 < STAGE_ORDER.len() {
            assert_eq!(advanced.current_stage, Some(STAGE_ORDER[i + 1]));
            assert_eq!(advanced.status, WorkflowStatus::Running);
        } else {
            assert_eq!(advanced.current_stage, None);
            assert_eq!(advanced.status, WorkflowStatus::Completed);
        }
    }

    // A completed workflow cannot advance further
    let again = engine.advance(&workflow.id);
    assert!(matches!(again, Err(OrchestratorError::InvalidState(_))));

    // The slot is free again for a new workflow
    assert!(engine.create(create_request("Trial B")).is_ok());
}

#[test]
fn advance_requires_the_current_stage_to_be_completed() {
    let engine = engine();
    let workflow = engine.create(create_request("Trial A")).unwrap();

    let result = engine.advance(&workflow.id);
    assert!(matches!(result, Err(OrchestratorError::InvalidState(_))));

    // Completing a later stage does not let the current one be skipped
    complete_stage(&engine, &workflow.id, WorkflowStage::CohortFormation);
    let result = engine.advance(&workflow.id);
    assert!(matches!(result, Err(OrchestratorError::InvalidState(_))));
}

#[test]
fn manual_completion_without_output_permits_advance() {
    let engine = engine();
    let workflow = engine.create(create_request("Trial A")).unwrap();

    engine
        .update_stage(
            &workflow.id,
            WorkflowStage::PatientScreening,
            StageUpdateRequest::status(StageStatus::Completed),
        )
        .unwrap();

    let advanced = engine.advance(&workflow.id).unwrap();
    assert_eq!(advanced.current_stage, Some(WorkflowStage::CohortFormation));
}

#[test]
fn pause_and_resume_round_trip() {
    let engine = engine();
    let workflow = engine.create(create_request("Trial A")).unwrap();

    let paused = engine.pause(&workflow.id).unwrap();
    assert_eq!(paused.status, WorkflowStatus::Paused);

    let resumed = engine.resume(&workflow.id).unwrap();
    assert_eq!(resumed.status, WorkflowStatus::Running);

    // Resume is only valid from paused or failed
    let again = engine.resume(&workflow.id);
    assert!(matches!(again, Err(OrchestratorError::InvalidState(_))));
}

#[test]
fn start_re_pins_a_paused_workflow_at_the_first_stage() {
    let engine = engine();
    let workflow = engine.create(create_request("Trial A")).unwrap();

    // start is only valid from created or paused
    let early = engine.start(&workflow.id);
    assert!(matches!(early, Err(OrchestratorError::InvalidState(_))));

    complete_stage(&engine, &workflow.id, WorkflowStage::PatientScreening);
    engine.advance(&workflow.id).unwrap();
    engine.pause(&workflow.id).unwrap();

    let started = engine.start(&workflow.id).unwrap();
    assert_eq!(started.status, WorkflowStatus::Paused);
    assert_eq!(started.current_stage, Some(WorkflowStage::PatientScreening));
}

#[test]
fn resume_after_failure_resets_the_failed_stage() {
    let engine = engine();
    let workflow = engine.create(create_request("Trial A")).unwrap();

    engine
        .update_stage(
            &workflow.id,
            WorkflowStage::PatientScreening,
            StageUpdateRequest::failed("site_a unreachable"),
        )
        .unwrap();
    let failed = engine.get(&workflow.id).unwrap();
    assert_eq!(failed.status, WorkflowStatus::Failed);

    let resumed = engine.resume(&workflow.id).unwrap();
    assert_eq!(resumed.status, WorkflowStatus::Running);
    let stage = resumed.stage(WorkflowStage::PatientScreening).unwrap();
    assert_eq!(stage.status, StageStatus::NotStarted);
    assert!(stage.error.is_none());
}

#[test]
fn resetting_a_stage_cascades_to_later_stages() {
    let engine = engine();
    let workflow = engine.create(create_request("Trial A")).unwrap();

    complete_stage(&engine, &workflow.id, WorkflowStage::PatientScreening);
    engine.advance(&workflow.id).unwrap();
    complete_stage(&engine, &workflow.id, WorkflowStage::CohortFormation);
    engine.advance(&workflow.id).unwrap();

    let rewound = engine
        .update_stage(
            &workflow.id,
            WorkflowStage::PatientScreening,
            StageUpdateRequest::status(StageStatus::NotStarted),
        )
        .unwrap();

    assert_eq!(rewound.current_stage, Some(WorkflowStage::PatientScreening));
    assert_eq!(rewound.status, WorkflowStatus::Running);
    for stage in STAGE_ORDER {
        let result = rewound.stage(stage).unwrap();
        assert_eq!(result.status, StageStatus::NotStarted);
        assert!(result.output_data.is_none());
        assert!(result.completed_at.is_none());
        assert!(result.error.is_none());
    }
}

#[test]
fn unknown_ids_are_not_found() {
    let engine = engine();
    assert!(matches!(
        engine.get("missing"),
        Err(OrchestratorError::NotFound(_))
    ));
    assert!(matches!(
        engine.advance("missing"),
        Err(OrchestratorError::NotFound(_))
    ));
    assert!(matches!(
        engine.delete("missing"),
        Err(OrchestratorError::NotFound(_))
    ));
}

#[test]
fn listing_and_trial_filtering() {
    let engine = engine();
    let workflow = engine.create(create_request("Trial A")).unwrap();

    let all = engine.store().list();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, workflow.id);
    assert_eq!(
        all[0].stages_summary["patient_screening"],
        StageStatus::NotStarted
    );

    assert_eq!(engine.store().list_by_trial("PROSTATE-CANCER").len(), 1);
    assert!(engine.store().list_by_trial("OTHER-TRIAL").is_empty());
}

#[test]
fn conversations_round_trip_per_stage() {
    let engine = engine();
    let workflow = engine.create(create_request("Trial A")).unwrap();

    assert!(engine
        .get_conversation(&workflow.id, WorkflowStage::PatientScreening)
        .unwrap()
        .is_empty());

    engine
        .save_conversation(
            &workflow.id,
            WorkflowStage::PatientScreening,
            vec![ConversationMessage {
                role: "user".to_string(),
                text: "Which criteria were applied?".to_string(),
                timestamp: None,
            }],
        )
        .unwrap();

    let messages = engine
        .get_conversation(&workflow.id, WorkflowStage::PatientScreening)
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, "user");

    // Other stages keep their own history
    assert!(engine
        .get_conversation(&workflow.id, WorkflowStage::CohortFormation)
        .unwrap()
        .is_empty());
}
