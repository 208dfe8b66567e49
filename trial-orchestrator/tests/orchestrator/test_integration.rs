//! Full workflow walk: three stages against in-process sites backed by
//! record files, exercising screening, cohort formation, and monitoring
//! end to end.

use super::common::*;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use trial_orchestrator::analytics::ScriptedAnalytics;
use trial_orchestrator::federated::{
    FederatedCoordinator, FederatedScreeningResponse, LocalSite, MonitoringQueryResponse,
    MonitoringRecord, RoundConfig, RoundStatus, VisitRecord,
};
use trial_orchestrator::handlers::default_handlers;
use trial_orchestrator::jobs::JobStatus;
use trial_orchestrator::screening::{PatientRecord, RuleBasedEvaluator};
use trial_orchestrator::workflow::{StageStatus, WorkflowStage, WorkflowStatus};
use trial_orchestrator::Orchestrator;
use trial_orchestrator_sdk::{ScreeningCriteria, SiteClient};

fn patient(id: &str, age: u32, conditions: &[&str], psa: f64) -> PatientRecord {
    PatientRecord {
        patient_id: id.to_string(),
        age,
        gender: "male".to_string(),
        conditions: conditions.iter().map(|c| c.to_string()).collect(),
        medications: vec![],
        labs: BTreeMap::from([("PSA".to_string(), psa)]),
    }
}

fn monitoring_record(id: &str, status: &str, response: Option<&str>) -> MonitoringRecord {
    MonitoringRecord {
        patient_id: id.to_string(),
        status: status.to_string(),
        dropout_reason: None,
        visits: vec![
            VisitRecord {
                visit: 1,
                completed: true,
            },
            VisitRecord {
                visit: 2,
                completed: true,
            },
        ],
        adverse_events: vec![],
        response: response.map(|r| r.to_string()),
        labs: vec![],
    }
}

fn write_patients(dir: &Path, patients: &[PatientRecord]) {
    std::fs::create_dir_all(dir).unwrap();
    for record in patients {
        let path = dir.join(format!("patient_{}.json", record.patient_id));
        std::fs::write(path, serde_json::to_string_pretty(record).unwrap()).unwrap();
    }
}

fn write_monitoring(dir: &Path, records: &[MonitoringRecord]) {
    std::fs::create_dir_all(dir).unwrap();
    for record in records {
        let path = dir.join(format!("patient_{}.json", record.patient_id));
        std::fs::write(path, serde_json::to_string_pretty(record).unwrap()).unwrap();
    }
}

fn trial_criteria() -> ScreeningCriteria {
    serde_json::from_value(json!({
        "trial_name": "PROSTATE-CANCER",
        "inclusion": [
            {"category": "demographic", "field": "age", "operator": "gte", "value": 18,
             "description": "Age >= 18"},
            {"category": "condition", "field": "condition_name", "operator": "in",
             "value": ["prostate cancer"], "description": "Diagnosed prostate cancer"}
        ],
        "exclusion": [
            {"category": "condition", "field": "condition_name", "operator": "in",
             "value": ["severe renal impairment"], "description": "Severe renal impairment"}
        ]
    }))
    .unwrap()
}

#[tokio::test]
async fn full_workflow_against_local_sites() {
    let root = create_temp_dir("full_workflow");

    // site_a: one eligible, one under-age
    write_patients(
        &root.join("ehr/site_a"),
        &[
            patient("A001", 64, &["Metastatic prostate cancer"], 8.2),
            patient("A002", 17, &["Prostate cancer"], 4.0),
        ],
    );
    // site_b: one eligible, one excluded by renal impairment
    write_patients(
        &root.join("ehr/site_b"),
        &[
            patient("B101", 58, &["Prostate cancer"], 12.1),
            patient(
                "B104",
                80,
                &["Prostate cancer", "Severe renal impairment"],
                9.8,
            ),
        ],
    );
    write_monitoring(
        &root.join("monitoring/site_a"),
        &[monitoring_record("A001", "active", Some("PR"))],
    );
    write_monitoring(
        &root.join("monitoring/site_b"),
        &[
            monitoring_record("B101", "active", Some("SD")),
            monitoring_record("B102", "dropped_out", None),
        ],
    );

    let evaluator = Arc::new(RuleBasedEvaluator);
    let sites: Vec<Arc<dyn SiteClient>> = vec![
        Arc::new(LocalSite::new(
            "site_a",
            root.join("ehr/site_a"),
            root.join("monitoring/site_a"),
            evaluator.clone(),
        )),
        Arc::new(LocalSite::new(
            "site_b",
            root.join("ehr/site_b"),
            root.join("monitoring/site_b"),
            evaluator,
        )),
    ];
    let coordinator = Arc::new(FederatedCoordinator::new(
        sites,
        RoundConfig {
            screening_timeout: Duration::from_secs(30),
            monitoring_timeout: Duration::from_secs(30),
            max_concurrent_sites: 4,
        },
    ));
    let analytics = Arc::new(ScriptedAnalytics::new(json!({"arms": 2})));
    let orchestrator = Orchestrator::new(default_handlers(coordinator, analytics));

    let workflow = orchestrator.engine().create(create_request("Trial A")).unwrap();

    // Stage 1: federated screening
    let job = orchestrator
        .run_stage_job(
            &workflow.id,
            WorkflowStage::PatientScreening,
            serde_json::to_value(trial_criteria()).unwrap(),
            "Federated eligibility screening",
        )
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let screening: FederatedScreeningResponse =
        serde_json::from_value(job.result.unwrap()).unwrap();
    assert_eq!(screening.aggregate_total_patients, 4);
    assert_eq!(screening.aggregate_eligible_patients, 2);
    assert_eq!(screening.eligibility_rate_pct, 50.0);
    assert_eq!(screening.status, RoundStatus::Completed);
    // No record content crosses the site boundary
    for site in &screening.site_results {
        assert!(site.errors.is_empty());
        for detail in &site.patient_audit_details {
            assert!(!detail.final_reason.contains("PSA\":"));
        }
    }

    orchestrator.engine().advance(&workflow.id).unwrap();

    // Stage 2: cohort formation through the analytics seam
    let job = orchestrator
        .run_stage_job(
            &workflow.id,
            WorkflowStage::CohortFormation,
            json!({"query": "Split eligible patients into arms"}),
            "Cohort definition",
        )
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    orchestrator.engine().advance(&workflow.id).unwrap();

    // Stage 3: federated monitoring
    let job = orchestrator
        .run_stage_job(
            &workflow.id,
            WorkflowStage::CohortMonitoring,
            json!({
                "trial_name": "PROSTATE-CANCER",
                "query_type": "dropout_summary"
            }),
            "Dropout summary",
        )
        .await
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);

    let monitoring: MonitoringQueryResponse =
        serde_json::from_value(job.result.unwrap()).unwrap();
    assert_eq!(monitoring.global_result.total_patients_monitored, 3);
    assert_eq!(monitoring.status, RoundStatus::Completed);

    let finished = orchestrator.engine().advance(&workflow.id).unwrap();
    assert_eq!(finished.status, WorkflowStatus::Completed);
    assert_eq!(finished.current_stage, None);
    for stage in trial_orchestrator::workflow::STAGE_ORDER {
        assert_eq!(finished.stage(stage).unwrap().status, StageStatus::Completed);
    }

    cleanup_temp_dir(&root);
}

#[tokio::test]
async fn a_site_with_missing_data_reports_errors_not_records() {
    let root = create_temp_dir("missing_data");
    write_patients(
        &root.join("ehr/site_a"),
        &[patient("A001", 64, &["Prostate cancer"], 8.2)],
    );

    let evaluator = Arc::new(RuleBasedEvaluator);
    let sites: Vec<Arc<dyn SiteClient>> = vec![
        Arc::new(LocalSite::new(
            "site_a",
            root.join("ehr/site_a"),
            root.join("monitoring/site_a"),
            evaluator.clone(),
        )),
        // Points at a directory that does not exist
        Arc::new(LocalSite::new(
            "site_b",
            root.join("ehr/site_b"),
            root.join("monitoring/site_b"),
            evaluator,
        )),
    ];
    let coordinator = FederatedCoordinator::new(
        sites,
        RoundConfig {
            screening_timeout: Duration::from_secs(30),
            monitoring_timeout: Duration::from_secs(30),
            max_concurrent_sites: 4,
        },
    );

    let response = coordinator.run_screening_round(&trial_criteria()).await;

    // site_b contributes only error entries, site_a is unaffected
    assert_eq!(response.aggregate_total_patients, 1);
    assert_eq!(response.aggregate_eligible_patients, 1);
    let site_b = response
        .site_results
        .iter()
        .find(|r| r.site_id == "site_b")
        .unwrap();
    assert!(!site_b.errors.is_empty());
    assert_eq!(site_b.total_patients, 0);

    cleanup_temp_dir(&root);
}
