//! Cohort-formation analytics seam.
//!
//! Cohort formation is a direct analytic call rather than a federated round:
//! the stage handler forwards the query to whatever engine is wired in here.
//! The real engine (survival analysis, cohort queries over trial data) lives
//! outside this crate.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use trial_orchestrator_sdk::async_trait;

/// A cohort-formation query forwarded to the analytics collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CohortQuery {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// The analytic engine behind the cohort-formation stage.
#[async_trait]
pub trait CohortAnalytics: Send + Sync {
    async fn run_query(&self, query: &CohortQuery) -> anyhow::Result<Value>;
}

/// Analytics that answers every query with a pre-configured response,
/// echoing the query back alongside it. Used by the demo binary and tests.
pub struct ScriptedAnalytics {
    response: Value,
}

impl ScriptedAnalytics {
    pub fn new(response: Value) -> Self {
        Self { response }
    }
}

#[async_trait]
impl CohortAnalytics for ScriptedAnalytics {
    async fn run_query(&self, query: &CohortQuery) -> anyhow::Result<Value> {
        Ok(serde_json::json!({
            "query": query.query,
            "result": self.response,
        }))
    }
}
