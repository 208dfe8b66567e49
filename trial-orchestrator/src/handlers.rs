//! Stage handlers: the work each workflow stage performs when submitted as
//! a job.
//!
//! Screening and monitoring delegate to the federated round coordinator;
//! cohort formation is a direct call into the analytics collaborator. Every
//! handler takes its payload as opaque JSON and parses it into the stage's
//! typed request, so a malformed payload fails the job rather than anything
//! upstream.

use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;

use trial_orchestrator_sdk::{async_trait, MonitoringQuery, ScreeningCriteria};

use crate::analytics::{CohortAnalytics, CohortQuery};
use crate::federated::FederatedCoordinator;
use crate::jobs::{StageHandler, StageHandlers};

/// Runs a federated screening round over the payload's criteria.
pub struct ScreeningHandler {
    coordinator: Arc<FederatedCoordinator>,
}

impl ScreeningHandler {
    pub fn new(coordinator: Arc<FederatedCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl StageHandler for ScreeningHandler {
    async fn run(&self, payload: Value) -> anyhow::Result<Value> {
        let criteria: ScreeningCriteria = serde_json::from_value(payload)
            .context("Screening payload is not valid screening criteria")?;
        let response = self.coordinator.run_screening_round(&criteria).await;
        Ok(serde_json::to_value(response)?)
    }
}

/// Forwards the payload's cohort query to the analytics collaborator.
pub struct CohortHandler {
    analytics: Arc<dyn CohortAnalytics>,
}

impl CohortHandler {
    pub fn new(analytics: Arc<dyn CohortAnalytics>) -> Self {
        Self { analytics }
    }
}

#[async_trait]
impl StageHandler for CohortHandler {
    async fn run(&self, payload: Value) -> anyhow::Result<Value> {
        let query: CohortQuery =
            serde_json::from_value(payload).context("Cohort payload is not a valid query")?;
        self.analytics.run_query(&query).await
    }
}

/// Runs a federated monitoring round over the payload's query.
pub struct MonitoringHandler {
    coordinator: Arc<FederatedCoordinator>,
}

impl MonitoringHandler {
    pub fn new(coordinator: Arc<FederatedCoordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl StageHandler for MonitoringHandler {
    async fn run(&self, payload: Value) -> anyhow::Result<Value> {
        let query: MonitoringQuery = serde_json::from_value(payload)
            .context("Monitoring payload is not a valid monitoring query")?;
        let response = self.coordinator.run_monitoring_round(&query).await;
        Ok(serde_json::to_value(response)?)
    }
}

/// Wire the standard handler for every stage.
pub fn default_handlers(
    coordinator: Arc<FederatedCoordinator>,
    analytics: Arc<dyn CohortAnalytics>,
) -> StageHandlers {
    StageHandlers {
        screening: Arc::new(ScreeningHandler::new(coordinator.clone())),
        cohort: Arc::new(CohortHandler::new(analytics)),
        monitoring: Arc::new(MonitoringHandler::new(coordinator)),
    }
}
