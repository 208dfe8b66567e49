//! Tests for federated rounds: parallel dispatch, per-site isolation,
//! timeout budgets, and cross-site aggregation.

use super::common::*;

use std::sync::Arc;
use std::time::{Duration, Instant};

use trial_orchestrator::federated::{GlobalMonitoringMetrics, RoundStatus};
use trial_orchestrator_sdk::{
    MonitoringParams, MonitoringQuery, MonitoringQueryType, SiteClient,
};

fn monitoring_query(query_type: MonitoringQueryType) -> MonitoringQuery {
    MonitoringQuery {
        trial_name: "PROSTATE-CANCER".to_string(),
        query_type,
        parameters: MonitoringParams::default(),
        natural_language_query: None,
    }
}

#[tokio::test]
async fn one_failing_site_degrades_only_its_own_contribution() {
    let sites: Vec<Arc<dyn SiteClient>> = vec![
        Arc::new(StaticSite::new("site_a", 10, 4)),
        Arc::new(StaticSite::new("site_b", 20, 9)),
        Arc::new(BrokenSite("site_c".to_string())),
    ];
    let coordinator = test_coordinator(sites, Duration::from_secs(5));

    let response = coordinator.run_screening_round(&empty_criteria()).await;

    assert_eq!(response.aggregate_total_patients, 30);
    assert_eq!(response.aggregate_eligible_patients, 13);
    assert!((response.eligibility_rate_pct - 43.33).abs() < 0.01);
    assert_eq!(response.status, RoundStatus::Partial);

    // The failed site is present, carrying only its error
    assert_eq!(response.site_results.len(), 3);
    let failed = response
        .site_results
        .iter()
        .find(|r| r.site_id == "site_c")
        .unwrap();
    assert_eq!(failed.total_patients, 0);
    assert!(failed.errors[0].contains("records store offline"));

    // The healthy sites' contributions are intact
    let site_a = response
        .site_results
        .iter()
        .find(|r| r.site_id == "site_a")
        .unwrap();
    assert_eq!(site_a.eligible_patients, 4);
}

#[tokio::test]
async fn a_stalled_site_is_bounded_by_its_timeout() {
    let sites: Vec<Arc<dyn SiteClient>> = vec![
        Arc::new(StaticSite::new("site_a", 10, 4)),
        Arc::new(StalledSite("site_b".to_string())),
    ];
    let coordinator = test_coordinator(sites, Duration::from_millis(200));

    let started = Instant::now();
    let response = coordinator.run_screening_round(&empty_criteria()).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    assert_eq!(response.status, RoundStatus::Partial);
    let stalled = response
        .site_results
        .iter()
        .find(|r| r.site_id == "site_b")
        .unwrap();
    assert!(stalled.errors[0].contains("timed out"));
    assert_eq!(response.aggregate_total_patients, 10);
}

#[tokio::test]
async fn a_clean_round_reports_completed() {
    let sites: Vec<Arc<dyn SiteClient>> = vec![
        Arc::new(StaticSite::new("site_a", 5, 2)),
        Arc::new(StaticSite::new("site_b", 5, 3)),
    ];
    let coordinator = test_coordinator(sites, Duration::from_secs(5));

    let response = coordinator.run_screening_round(&empty_criteria()).await;
    assert_eq!(response.status, RoundStatus::Completed);
    assert_eq!(response.aggregate_eligible_patients, 5);
    assert_eq!(response.eligibility_rate_pct, 50.0);
    assert!(response.message.contains("5 of 10"));
}

#[tokio::test]
async fn monitoring_round_merges_site_metrics() {
    let sites: Vec<Arc<dyn SiteClient>> = vec![
        Arc::new(StaticSite::new("site_a", 10, 0)),
        Arc::new(StaticSite::new("site_b", 30, 0)),
    ];
    let coordinator = test_coordinator(sites, Duration::from_secs(5));

    let response = coordinator
        .run_monitoring_round(&monitoring_query(MonitoringQueryType::VisitProgress))
        .await;

    assert_eq!(response.status, RoundStatus::Completed);
    assert_eq!(response.global_result.total_patients_monitored, 40);
    assert_eq!(response.global_result.total_sites, 2);

    let Some(GlobalMonitoringMetrics::VisitProgress {
        total_scheduled_visits,
        completed_visits,
        adherence_rate_pct,
        ..
    }) = response.global_result.metrics
    else {
        panic!("expected merged visit progress");
    };
    assert_eq!(total_scheduled_visits, 80);
    assert_eq!(completed_visits, 40);
    assert_eq!(adherence_rate_pct, 50.0);
}

#[tokio::test]
async fn monitoring_round_with_every_site_down_still_returns() {
    let sites: Vec<Arc<dyn SiteClient>> = vec![
        Arc::new(BrokenSite("site_a".to_string())),
        Arc::new(BrokenSite("site_b".to_string())),
    ];
    let coordinator = test_coordinator(sites, Duration::from_secs(5));

    let response = coordinator
        .run_monitoring_round(&monitoring_query(MonitoringQueryType::OverallProgress))
        .await;

    assert_eq!(response.status, RoundStatus::Partial);
    assert!(response.global_result.metrics.is_none());
    assert_eq!(response.global_result.total_patients_monitored, 0);
    assert_eq!(response.site_results.len(), 2);
}
