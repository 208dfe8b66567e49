//! Federated round coordinator.
//!
//! Dispatches one query to every registered site concurrently and collects
//! whatever comes back. Each site call is isolated: a failure or timeout in
//! one site produces an error-only result for that site and leaves every
//! other site's work untouched. A round therefore always completes; there
//! is nothing a single site can do to abort it.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tokio::time::timeout;

use trial_orchestrator_sdk::{
    log_round_complete, log_round_start, log_site_completed, log_site_failed, MonitoringQuery,
    ScreeningCriteria, SiteClient, SiteMonitoringResult, SiteScreeningResult,
};

use super::aggregate::{
    aggregate_monitoring, aggregate_screening, FederatedScreeningResponse,
    MonitoringQueryResponse,
};

/// Budgets for one federated round.
#[derive(Debug, Clone)]
pub struct RoundConfig {
    /// Per-site budget for a screening round. Screening walks every patient
    /// through the audit pipeline, so this is generous.
    pub screening_timeout: Duration,
    /// Per-site budget for a monitoring query.
    pub monitoring_timeout: Duration,
    /// Maximum sites queried at once.
    pub max_concurrent_sites: usize,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            screening_timeout: Duration::from_secs(900),
            monitoring_timeout: Duration::from_secs(120),
            max_concurrent_sites: 8,
        }
    }
}

pub struct FederatedCoordinator {
    sites: Vec<Arc<dyn SiteClient>>,
    config: RoundConfig,
}

impl FederatedCoordinator {
    pub fn new(sites: Vec<Arc<dyn SiteClient>>, config: RoundConfig) -> Self {
        Self { sites, config }
    }

    pub fn site_count(&self) -> usize {
        self.sites.len()
    }

    /// Execute one federated screening round.
    ///
    /// The identical criteria go to every site in parallel; the round waits
    /// until each site has returned, failed, or exhausted its timeout, then
    /// merges the aggregate counts.
    pub async fn run_screening_round(
        &self,
        criteria: &ScreeningCriteria,
    ) -> FederatedScreeningResponse {
        log_round_start!(criteria.trial_name, "screening", self.sites.len());

        let budget = self.config.screening_timeout;
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_sites));
        let mut tasks = FuturesUnordered::new();

        for site in &self.sites {
            let site = site.clone();
            let semaphore = semaphore.clone();
            let criteria = criteria.clone();
            tasks.push(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            SiteScreeningResult::from_error(
                                site.site_id(),
                                format!("Site '{}' dispatch queue closed.", site.site_id()),
                            ),
                            true,
                        )
                    }
                };
                match timeout(budget, site.screen(&criteria)).await {
                    Ok(Ok(result)) => {
                        log_site_completed!(
                            result.site_id,
                            format!(
                                "{} / {} eligible",
                                result.eligible_patients, result.total_patients
                            )
                        );
                        (result, false)
                    }
                    Ok(Err(err)) => {
                        let message =
                            format!("Site '{}' screening failed: {:#}", site.site_id(), err);
                        log_site_failed!(site.site_id(), message);
                        (SiteScreeningResult::from_error(site.site_id(), message), true)
                    }
                    Err(_) => {
                        let message = format!(
                            "Site '{}' screening timed out after {}s.",
                            site.site_id(),
                            budget.as_secs()
                        );
                        log_site_failed!(site.site_id(), message);
                        (SiteScreeningResult::from_error(site.site_id(), message), true)
                    }
                }
            });
        }

        let mut site_results = Vec::new();
        let mut failed_sites = 0;
        while let Some((result, failed)) = tasks.next().await {
            if failed {
                failed_sites += 1;
            }
            site_results.push(result);
        }
        // Deterministic ordering regardless of completion order
        site_results.sort_by(|a, b| a.site_id.cmp(&b.site_id));

        let response = aggregate_screening(criteria, site_results, failed_sites);
        log_round_complete!(
            "screening",
            response.status,
            response.site_results.len() - failed_sites
        );
        response
    }

    /// Execute one federated monitoring query.
    pub async fn run_monitoring_round(&self, query: &MonitoringQuery) -> MonitoringQueryResponse {
        log_round_start!(query.trial_name, "monitoring", self.sites.len());

        let budget = self.config.monitoring_timeout;
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_sites));
        let mut tasks = FuturesUnordered::new();

        for site in &self.sites {
            let site = site.clone();
            let semaphore = semaphore.clone();
            let query = query.clone();
            tasks.push(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            SiteMonitoringResult::from_error(
                                site.site_id(),
                                query.query_type,
                                format!("Site '{}' dispatch queue closed.", site.site_id()),
                            ),
                            true,
                        )
                    }
                };
                match timeout(budget, site.monitor(&query)).await {
                    Ok(Ok(result)) => {
                        log_site_completed!(
                            result.site_id,
                            format!("{} patients monitored", result.total_patients_monitored)
                        );
                        (result, false)
                    }
                    Ok(Err(err)) => {
                        let message =
                            format!("Site '{}' monitoring failed: {:#}", site.site_id(), err);
                        log_site_failed!(site.site_id(), message);
                        (
                            SiteMonitoringResult::from_error(
                                site.site_id(),
                                query.query_type,
                                message,
                            ),
                            true,
                        )
                    }
                    Err(_) => {
                        let message = format!(
                            "Site '{}' monitoring timed out after {}s.",
                            site.site_id(),
                            budget.as_secs()
                        );
                        log_site_failed!(site.site_id(), message);
                        (
                            SiteMonitoringResult::from_error(
                                site.site_id(),
                                query.query_type,
                                message,
                            ),
                            true,
                        )
                    }
                }
            });
        }

        let mut site_results = Vec::new();
        let mut failed_sites = 0;
        while let Some((result, failed)) = tasks.next().await {
            if failed {
                failed_sites += 1;
            }
            site_results.push(result);
        }
        site_results.sort_by(|a, b| a.site_id.cmp(&b.site_id));

        let response = aggregate_monitoring(query, site_results, failed_sites);
        log_round_complete!(
            "monitoring",
            response.status,
            response.site_results.len() - failed_sites
        );
        response
    }
}
