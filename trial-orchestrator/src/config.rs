//! Orchestrator configuration: the site registry and round budgets.
//!
//! Loaded from a YAML file, overridable via `TRIAL_ORCHESTRATOR_CONFIG`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use trial_orchestrator_sdk::SiteClient;

use crate::federated::{LocalSite, RemoteSite, RoundConfig};
use crate::screening::EligibilityEvaluator;

/// One entry of the site registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SiteConfig {
    /// In-process site over local record directories.
    Local {
        id: String,
        ehr_dir: PathBuf,
        monitoring_dir: PathBuf,
    },
    /// Externally hosted site service.
    Remote { id: String, endpoint: String },
}

fn default_screening_timeout_secs() -> u64 {
    900
}

fn default_monitoring_timeout_secs() -> u64 {
    120
}

fn default_max_concurrent_sites() -> usize {
    8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub sites: Vec<SiteConfig>,
    #[serde(default = "default_screening_timeout_secs")]
    pub screening_timeout_secs: u64,
    #[serde(default = "default_monitoring_timeout_secs")]
    pub monitoring_timeout_secs: u64,
    #[serde(default = "default_max_concurrent_sites")]
    pub max_concurrent_sites: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            sites: Vec::new(),
            screening_timeout_secs: default_screening_timeout_secs(),
            monitoring_timeout_secs: default_monitoring_timeout_secs(),
            max_concurrent_sites: default_max_concurrent_sites(),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config YAML from: {}", path.display()))
    }

    /// The config path from `TRIAL_ORCHESTRATOR_CONFIG`, or the given
    /// fallback.
    pub fn path_from_env(fallback: &str) -> PathBuf {
        std::env::var("TRIAL_ORCHESTRATOR_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(fallback))
    }

    pub fn round_config(&self) -> RoundConfig {
        RoundConfig {
            screening_timeout: Duration::from_secs(self.screening_timeout_secs),
            monitoring_timeout: Duration::from_secs(self.monitoring_timeout_secs),
            max_concurrent_sites: self.max_concurrent_sites,
        }
    }

    /// Build a site client for every registry entry. Local sites share the
    /// given evaluator.
    pub fn build_sites(
        &self,
        evaluator: Arc<dyn EligibilityEvaluator>,
    ) -> Vec<Arc<dyn SiteClient>> {
        self.sites
            .iter()
            .map(|site| -> Arc<dyn SiteClient> {
                match site {
                    SiteConfig::Local {
                        id,
                        ehr_dir,
                        monitoring_dir,
                    } => Arc::new(LocalSite::new(
                        id.clone(),
                        ehr_dir.clone(),
                        monitoring_dir.clone(),
                        evaluator.clone(),
                    )),
                    SiteConfig::Remote { id, endpoint } => {
                        Arc::new(RemoteSite::new(id.clone(), endpoint.clone()))
                    }
                }
            })
            .collect()
    }
}
