//! Common test utilities for orchestrator tests

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use trial_orchestrator::federated::{FederatedCoordinator, RoundConfig};
use trial_orchestrator::jobs::{StageHandler, StageHandlers};
use trial_orchestrator::workflow::WorkflowCreateRequest;
use trial_orchestrator::Orchestrator;
use trial_orchestrator_sdk::{
    async_trait, MonitoringMetrics, MonitoringQuery, ScreeningCriteria, SiteClient,
    SiteMonitoringResult, SiteScreeningResult,
};

/// Create a temporary directory for testing
pub fn create_temp_dir(name: &str) -> PathBuf {
    let temp_dir = std::env::temp_dir().join(format!("trial_orchestrator_test_{}", name));
    // Start from a clean slate so reruns see only their own files
    std::fs::remove_dir_all(&temp_dir).ok();
    std::fs::create_dir_all(&temp_dir).unwrap();
    temp_dir
}

/// Clean up temporary directory
pub fn cleanup_temp_dir(path: &PathBuf) {
    if path.exists() {
        std::fs::remove_dir_all(path).ok();
    }
}

/// Handler that returns its payload untouched
pub struct EchoHandler;

#[async_trait]
impl StageHandler for EchoHandler {
    async fn run(&self, payload: Value) -> anyhow::Result<Value> {
        Ok(payload)
    }
}

/// Handler that always fails with the given message
pub struct FailingHandler(pub &'static str);

#[async_trait]
impl StageHandler for FailingHandler {
    async fn run(&self, _payload: Value) -> anyhow::Result<Value> {
        anyhow::bail!("{}", self.0)
    }
}

/// Handler that holds its job running until released
pub struct BlockedHandler(pub Arc<tokio::sync::Notify>);

#[async_trait]
impl StageHandler for BlockedHandler {
    async fn run(&self, payload: Value) -> anyhow::Result<Value> {
        self.0.notified().await;
        Ok(payload)
    }
}

/// The same handler wired for every stage
pub fn uniform_handlers(handler: Arc<dyn StageHandler>) -> StageHandlers {
    StageHandlers {
        screening: handler.clone(),
        cohort: handler.clone(),
        monitoring: handler,
    }
}

/// An orchestrator whose handlers echo their payloads
pub fn echo_orchestrator() -> Orchestrator {
    Orchestrator::new(uniform_handlers(Arc::new(EchoHandler)))
}

/// Create sample workflow request
pub fn create_request(name: &str) -> WorkflowCreateRequest {
    WorkflowCreateRequest {
        name: name.to_string(),
        description: Some("test workflow".to_string()),
        trial_name: "PROSTATE-CANCER".to_string(),
    }
}

/// Criteria with no structured rules, enough for mock sites
pub fn empty_criteria() -> ScreeningCriteria {
    ScreeningCriteria {
        trial_name: "PROSTATE-CANCER".to_string(),
        inclusion: vec![],
        exclusion: vec![],
        natural_language_criteria: None,
    }
}

/// Site returning fixed screening counts
pub struct StaticSite {
    pub id: String,
    pub total: usize,
    pub eligible: usize,
}

impl StaticSite {
    pub fn new(id: &str, total: usize, eligible: usize) -> Self {
        Self {
            id: id.to_string(),
            total,
            eligible,
        }
    }
}

#[async_trait]
impl SiteClient for StaticSite {
    fn site_id(&self) -> &str {
        &self.id
    }

    async fn screen(&self, _criteria: &ScreeningCriteria) -> anyhow::Result<SiteScreeningResult> {
        Ok(SiteScreeningResult {
            site_id: self.id.clone(),
            total_patients: self.total,
            eligible_patients: self.eligible,
            ..Default::default()
        })
    }

    async fn monitor(&self, query: &MonitoringQuery) -> anyhow::Result<SiteMonitoringResult> {
        Ok(SiteMonitoringResult {
            site_id: self.id.clone(),
            query_type: query.query_type,
            total_patients_monitored: self.total,
            metrics: Some(MonitoringMetrics::VisitProgress {
                total_scheduled_visits: self.total * 2,
                completed_visits: self.total,
                missed_visits: self.total,
            }),
            data_as_of: None,
            errors: vec![],
        })
    }
}

/// Site whose calls always fail
pub struct BrokenSite(pub String);

#[async_trait]
impl SiteClient for BrokenSite {
    fn site_id(&self) -> &str {
        &self.0
    }

    async fn screen(&self, _criteria: &ScreeningCriteria) -> anyhow::Result<SiteScreeningResult> {
        anyhow::bail!("records store offline")
    }

    async fn monitor(&self, _query: &MonitoringQuery) -> anyhow::Result<SiteMonitoringResult> {
        anyhow::bail!("records store offline")
    }
}

/// Site that never answers within any reasonable budget
pub struct StalledSite(pub String);

#[async_trait]
impl SiteClient for StalledSite {
    fn site_id(&self) -> &str {
        &self.0
    }

    async fn screen(&self, _criteria: &ScreeningCriteria) -> anyhow::Result<SiteScreeningResult> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(SiteScreeningResult::from_error(&self.0, "unreachable"))
    }

    async fn monitor(&self, query: &MonitoringQuery) -> anyhow::Result<SiteMonitoringResult> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(SiteMonitoringResult::from_error(
            &self.0,
            query.query_type,
            "unreachable",
        ))
    }
}

/// Coordinator with tight test budgets
pub fn test_coordinator(
    sites: Vec<Arc<dyn SiteClient>>,
    timeout: Duration,
) -> FederatedCoordinator {
    FederatedCoordinator::new(
        sites,
        RoundConfig {
            screening_timeout: timeout,
            monitoring_timeout: timeout,
            max_concurrent_sites: 8,
        },
    )
}
