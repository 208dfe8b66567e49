//! Cross-site aggregation.
//!
//! Merges the per-site aggregates of one federated round into a single
//! global result. Additive metrics are summed across sites; rates are
//! derived as sum(numerator)/sum(denominator) and defined as 0 when the
//! denominator is 0. Per-site errors are concatenated into the round result
//! without ever failing the aggregation itself.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use trial_orchestrator_sdk::{
    LabTrendPoint, MonitoringMetrics, MonitoringQuery, MonitoringQueryType, ScreeningCriteria,
    SiteMonitoringResult, SiteScreeningResult,
};

/// Overall outcome of a federated round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    /// Every site reported clean data.
    Completed,
    /// At least one site produced nothing (failure or timeout).
    Partial,
    /// All sites reported, but some recorded non-fatal errors.
    CompletedWithWarnings,
}

impl RoundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundStatus::Completed => "completed",
            RoundStatus::Partial => "partial",
            RoundStatus::CompletedWithWarnings => "completed_with_warnings",
        }
    }
}

impl std::fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Percentage with a zero-safe denominator, rounded to two decimals.
pub(crate) fn pct(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        round2(100.0 * numerator as f64 / denominator as f64)
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn round_status(failed_sites: usize, any_errors: bool) -> RoundStatus {
    if failed_sites > 0 {
        RoundStatus::Partial
    } else if any_errors {
        RoundStatus::CompletedWithWarnings
    } else {
        RoundStatus::Completed
    }
}

// ============================================================================
// Screening
// ============================================================================

/// Combined screening response returned after all sites report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederatedScreeningResponse {
    pub trial_name: String,
    pub criteria: ScreeningCriteria,
    pub site_results: Vec<SiteScreeningResult>,
    pub aggregate_total_patients: usize,
    pub aggregate_eligible_patients: usize,
    /// sum(eligible) / sum(total), as a percentage; 0 when no patients.
    pub eligibility_rate_pct: f64,
    pub aggregate_corrected_count: usize,
    pub aggregate_flagged_for_review: usize,
    pub aggregate_high_confidence: usize,
    pub aggregate_low_confidence: usize,
    pub status: RoundStatus,
    pub message: String,
}

/// Merge screening results from every site into one response.
///
/// `failed_sites` counts sites whose adapter failed or timed out outright;
/// their error-only placeholder results are included in `site_results`.
pub fn aggregate_screening(
    criteria: &ScreeningCriteria,
    site_results: Vec<SiteScreeningResult>,
    failed_sites: usize,
) -> FederatedScreeningResponse {
    let aggregate_total: usize = site_results.iter().map(|r| r.total_patients).sum();
    let aggregate_eligible: usize = site_results.iter().map(|r| r.eligible_patients).sum();
    let aggregate_corrected: usize = site_results.iter().map(|r| r.corrected_count).sum();
    let aggregate_flagged: usize = site_results
        .iter()
        .map(|r| r.flagged_for_review_count)
        .sum();
    let aggregate_high: usize = site_results.iter().map(|r| r.high_confidence_count).sum();
    let aggregate_low: usize = site_results.iter().map(|r| r.low_confidence_count).sum();

    let any_errors = site_results.iter().any(|r| !r.errors.is_empty());
    let status = round_status(failed_sites, any_errors);
    let reporting = site_results.len() - failed_sites;

    let mut audit_summary = String::new();
    if aggregate_corrected > 0 || aggregate_flagged > 0 {
        audit_summary = format!(
            " | Self-correction: {} decision(s) corrected, {} flagged for review, \
             {} high-confidence, {} low-confidence.",
            aggregate_corrected, aggregate_flagged, aggregate_high, aggregate_low
        );
    }

    let message = format!(
        "Screening complete. {} of {} total patients across {} site(s) are eligible \
         for trial '{}'.{}",
        aggregate_eligible, aggregate_total, reporting, criteria.trial_name, audit_summary
    );

    FederatedScreeningResponse {
        trial_name: criteria.trial_name.clone(),
        criteria: criteria.clone(),
        site_results,
        aggregate_total_patients: aggregate_total,
        aggregate_eligible_patients: aggregate_eligible,
        eligibility_rate_pct: pct(aggregate_eligible, aggregate_total),
        aggregate_corrected_count: aggregate_corrected,
        aggregate_flagged_for_review: aggregate_flagged,
        aggregate_high_confidence: aggregate_high,
        aggregate_low_confidence: aggregate_low,
        status,
        message,
    }
}

// ============================================================================
// Monitoring
// ============================================================================

/// Monitoring metrics merged across every reporting site, with the derived
/// rates that only make sense globally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GlobalMonitoringMetrics {
    AdverseEvents {
        total_patients: usize,
        num_sites: usize,
        total_ae_count: usize,
        patients_with_any_ae: usize,
        ae_rate_pct: f64,
        by_grade: BTreeMap<String, usize>,
        by_severity: BTreeMap<String, usize>,
        sae_count: usize,
        sae_patients: usize,
        sae_rate_pct: f64,
        /// The ten most frequent events across all sites.
        top_adverse_events: BTreeMap<String, usize>,
        by_category: BTreeMap<String, usize>,
    },
    VisitProgress {
        total_patients: usize,
        num_sites: usize,
        total_scheduled_visits: usize,
        completed_visits: usize,
        missed_visits: usize,
        adherence_rate_pct: f64,
    },
    ResponseSummary {
        total_patients: usize,
        num_sites: usize,
        assessed_patients: usize,
        response_distribution: BTreeMap<String, usize>,
        overall_response_rate_pct: f64,
        disease_control_rate_pct: f64,
        progressive_disease_rate_pct: f64,
    },
    DropoutSummary {
        total_patients: usize,
        num_sites: usize,
        active_patients: usize,
        dropout_count: usize,
        dropout_rate_pct: f64,
        retention_rate_pct: f64,
        by_reason: BTreeMap<String, usize>,
    },
    LabTrends {
        total_patients: usize,
        num_sites: usize,
        /// Count-weighted means per lab and visit.
        lab_trends: BTreeMap<String, Vec<LabTrendPoint>>,
        labs_reported: Vec<String>,
    },
    OverallProgress {
        total_patients: usize,
        num_sites: usize,
        active_patients: usize,
        dropout_count: usize,
        retention_rate_pct: f64,
        visit_adherence_pct: f64,
        ae_rate_pct: f64,
        sae_rate_pct: f64,
        overall_response_rate_pct: f64,
        disease_control_rate_pct: f64,
    },
}

/// Global aggregate for one monitoring query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateMonitoringResult {
    pub query_type: MonitoringQueryType,
    pub total_sites: usize,
    pub total_patients_monitored: usize,
    /// `None` when no site produced metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<GlobalMonitoringMetrics>,
}

/// Combined monitoring response returned after all sites report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringQueryResponse {
    pub trial_name: String,
    pub query: MonitoringQuery,
    pub site_results: Vec<SiteMonitoringResult>,
    pub global_result: AggregateMonitoringResult,
    pub status: RoundStatus,
    pub message: String,
}

/// Merge monitoring results from every site into one response.
pub fn aggregate_monitoring(
    query: &MonitoringQuery,
    site_results: Vec<SiteMonitoringResult>,
    failed_sites: usize,
) -> MonitoringQueryResponse {
    let merged = merge_monitoring(query.query_type, &site_results);
    let total_patients: usize = site_results
        .iter()
        .map(|r| r.total_patients_monitored)
        .sum();
    let reporting_sites = site_results.iter().filter(|r| r.metrics.is_some()).count();

    let any_errors = site_results.iter().any(|r| !r.errors.is_empty());
    let status = round_status(failed_sites, any_errors);

    let message = format!(
        "Monitoring query '{}' completed across {} site(s) covering {} patients.",
        query.query_type.as_str(),
        reporting_sites,
        total_patients
    );

    MonitoringQueryResponse {
        trial_name: query.trial_name.clone(),
        query: query.clone(),
        global_result: AggregateMonitoringResult {
            query_type: query.query_type,
            total_sites: reporting_sites,
            total_patients_monitored: total_patients,
            metrics: merged,
        },
        site_results,
        status,
        message,
    }
}

/// Merge site-level metrics of the given query type. Sites without metrics
/// (failures) are skipped; `None` when nothing merged.
pub fn merge_monitoring(
    query_type: MonitoringQueryType,
    site_results: &[SiteMonitoringResult],
) -> Option<GlobalMonitoringMetrics> {
    match query_type {
        MonitoringQueryType::AdverseEvents => merge_adverse_events(site_results),
        MonitoringQueryType::VisitProgress => merge_visit_progress(site_results),
        MonitoringQueryType::ResponseSummary => merge_response_summary(site_results),
        MonitoringQueryType::DropoutSummary => merge_dropout_summary(site_results),
        MonitoringQueryType::LabTrends => merge_lab_trends(site_results),
        MonitoringQueryType::OverallProgress => merge_overall_progress(site_results),
    }
}

fn merge_counts(into: &mut BTreeMap<String, usize>, from: &BTreeMap<String, usize>) {
    for (key, count) in from {
        *into.entry(key.clone()).or_insert(0) += count;
    }
}

fn merge_adverse_events(site_results: &[SiteMonitoringResult]) -> Option<GlobalMonitoringMetrics> {
    let mut num_sites = 0;
    let mut total_patients = 0;
    let mut total_ae = 0;
    let mut patients_with_ae = 0;
    let mut saes = 0;
    let mut sae_patient_total = 0;
    let mut merged_by_grade = BTreeMap::new();
    let mut merged_by_severity = BTreeMap::new();
    let mut merged_by_category = BTreeMap::new();
    let mut merged_freq: BTreeMap<String, usize> = BTreeMap::new();

    for r in site_results {
        let Some(MonitoringMetrics::AdverseEvents {
            total_ae_count,
            patients_with_any_ae,
            sae_count,
            sae_patients,
            by_grade,
            by_severity,
            by_category,
            event_counts,
        }) = &r.metrics
        else {
            continue;
        };
        num_sites += 1;
        total_patients += r.total_patients_monitored;
        total_ae += total_ae_count;
        patients_with_ae += patients_with_any_ae;
        saes += sae_count;
        sae_patient_total += sae_patients;
        merge_counts(&mut merged_by_grade, by_grade);
        merge_counts(&mut merged_by_severity, by_severity);
        merge_counts(&mut merged_by_category, by_category);
        merge_counts(&mut merged_freq, event_counts);
    }

    if num_sites == 0 {
        return None;
    }

    let mut freq: Vec<(String, usize)> = merged_freq.into_iter().collect();
    freq.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let top_adverse_events: BTreeMap<String, usize> = freq.into_iter().take(10).collect();

    Some(GlobalMonitoringMetrics::AdverseEvents {
        total_patients,
        num_sites,
        total_ae_count: total_ae,
        patients_with_any_ae: patients_with_ae,
        ae_rate_pct: pct(patients_with_ae, total_patients),
        by_grade: merged_by_grade,
        by_severity: merged_by_severity,
        sae_count: saes,
        sae_patients: sae_patient_total,
        sae_rate_pct: pct(sae_patient_total, total_patients),
        top_adverse_events,
        by_category: merged_by_category,
    })
}

fn merge_visit_progress(site_results: &[SiteMonitoringResult]) -> Option<GlobalMonitoringMetrics> {
    let mut num_sites = 0;
    let mut total_patients = 0;
    let mut scheduled = 0;
    let mut completed = 0;
    let mut missed = 0;

    for r in site_results {
        let Some(MonitoringMetrics::VisitProgress {
            total_scheduled_visits,
            completed_visits,
            missed_visits,
        }) = &r.metrics
        else {
            continue;
        };
        num_sites += 1;
        total_patients += r.total_patients_monitored;
        scheduled += total_scheduled_visits;
        completed += completed_visits;
        missed += missed_visits;
    }

    if num_sites == 0 {
        return None;
    }

    Some(GlobalMonitoringMetrics::VisitProgress {
        total_patients,
        num_sites,
        total_scheduled_visits: scheduled,
        completed_visits: completed,
        missed_visits: missed,
        adherence_rate_pct: pct(completed, scheduled),
    })
}

fn merge_response_summary(site_results: &[SiteMonitoringResult]) -> Option<GlobalMonitoringMetrics> {
    let mut num_sites = 0;
    let mut total_patients = 0;
    let mut assessed = 0;
    let mut merged_dist: BTreeMap<String, usize> = BTreeMap::new();

    for r in site_results {
        let Some(MonitoringMetrics::ResponseSummary {
            assessed_patients,
            response_distribution,
        }) = &r.metrics
        else {
            continue;
        };
        num_sites += 1;
        total_patients += r.total_patients_monitored;
        assessed += assessed_patients;
        merge_counts(&mut merged_dist, response_distribution);
    }

    if num_sites == 0 {
        return None;
    }

    let cr = merged_dist.get("CR").copied().unwrap_or(0);
    let pr = merged_dist.get("PR").copied().unwrap_or(0);
    let sd = merged_dist.get("SD").copied().unwrap_or(0);
    let pd = merged_dist.get("PD").copied().unwrap_or(0);

    Some(GlobalMonitoringMetrics::ResponseSummary {
        total_patients,
        num_sites,
        assessed_patients: assessed,
        response_distribution: merged_dist,
        overall_response_rate_pct: pct(cr + pr, assessed),
        disease_control_rate_pct: pct(cr + pr + sd, assessed),
        progressive_disease_rate_pct: pct(pd, assessed),
    })
}

fn merge_dropout_summary(site_results: &[SiteMonitoringResult]) -> Option<GlobalMonitoringMetrics> {
    let mut num_sites = 0;
    let mut total_patients = 0;
    let mut active = 0;
    let mut dropouts = 0;
    let mut merged_reasons: BTreeMap<String, usize> = BTreeMap::new();

    for r in site_results {
        let Some(MonitoringMetrics::DropoutSummary {
            active_patients,
            dropout_count,
            by_reason,
        }) = &r.metrics
        else {
            continue;
        };
        num_sites += 1;
        total_patients += r.total_patients_monitored;
        active += active_patients;
        dropouts += dropout_count;
        merge_counts(&mut merged_reasons, by_reason);
    }

    if num_sites == 0 {
        return None;
    }

    Some(GlobalMonitoringMetrics::DropoutSummary {
        total_patients,
        num_sites,
        active_patients: active,
        dropout_count: dropouts,
        dropout_rate_pct: pct(dropouts, total_patients),
        retention_rate_pct: pct(total_patients - dropouts.min(total_patients), total_patients),
        by_reason: merged_reasons,
    })
}

fn merge_lab_trends(site_results: &[SiteMonitoringResult]) -> Option<GlobalMonitoringMetrics> {
    let mut num_sites = 0;
    let mut total_patients = 0;
    // lab -> visit -> [(site mean, site count)]
    let mut visit_data: BTreeMap<String, BTreeMap<u32, Vec<(f64, usize)>>> = BTreeMap::new();

    for r in site_results {
        let Some(MonitoringMetrics::LabTrends { lab_trends }) = &r.metrics else {
            continue;
        };
        num_sites += 1;
        total_patients += r.total_patients_monitored;
        for (lab_name, points) in lab_trends {
            let by_visit = visit_data.entry(lab_name.clone()).or_default();
            for point in points {
                by_visit
                    .entry(point.visit)
                    .or_default()
                    .push((point.mean, point.count));
            }
        }
    }

    if num_sites == 0 {
        return None;
    }

    let mut merged_trends: BTreeMap<String, Vec<LabTrendPoint>> = BTreeMap::new();
    for (lab_name, by_visit) in visit_data {
        let mut trend = Vec::new();
        for (visit, entries) in by_visit {
            let total_count: usize = entries.iter().map(|(_, c)| c).sum();
            let mean = if total_count == 0 {
                0.0
            } else {
                let weighted: f64 = entries.iter().map(|(m, c)| m * *c as f64).sum();
                round2(weighted / total_count as f64)
            };
            trend.push(LabTrendPoint {
                visit,
                count: total_count,
                mean,
            });
        }
        merged_trends.insert(lab_name, trend);
    }

    let labs_reported = merged_trends.keys().cloned().collect();
    Some(GlobalMonitoringMetrics::LabTrends {
        total_patients,
        num_sites,
        lab_trends: merged_trends,
        labs_reported,
    })
}

fn merge_overall_progress(site_results: &[SiteMonitoringResult]) -> Option<GlobalMonitoringMetrics> {
    struct SiteProgress {
        patients: usize,
        active: usize,
        dropouts: usize,
        retention: f64,
        adherence: f64,
        ae: f64,
        sae: f64,
        orr: f64,
        dcr: f64,
    }

    let mut sites = Vec::new();
    for r in site_results {
        let Some(MonitoringMetrics::OverallProgress {
            active_patients,
            dropout_count,
            retention_rate_pct,
            visit_adherence_pct,
            ae_rate_pct,
            sae_rate_pct,
            overall_response_rate_pct,
            disease_control_rate_pct,
        }) = &r.metrics
        else {
            continue;
        };
        sites.push(SiteProgress {
            patients: r.total_patients_monitored,
            active: *active_patients,
            dropouts: *dropout_count,
            retention: *retention_rate_pct,
            adherence: *visit_adherence_pct,
            ae: *ae_rate_pct,
            sae: *sae_rate_pct,
            orr: *overall_response_rate_pct,
            dcr: *disease_control_rate_pct,
        });
    }

    if sites.is_empty() {
        return None;
    }

    // Rates are averaged weighted by each site's patient count
    let total_patients: usize = sites.iter().map(|s| s.patients).sum();
    let wavg = |field: fn(&SiteProgress) -> f64| -> f64 {
        if total_patients == 0 {
            return 0.0;
        }
        let weighted: f64 = sites
            .iter()
            .map(|s| field(s) * s.patients as f64)
            .sum();
        round2(weighted / total_patients as f64)
    };

    Some(GlobalMonitoringMetrics::OverallProgress {
        total_patients,
        num_sites: sites.len(),
        active_patients: sites.iter().map(|s| s.active).sum(),
        dropout_count: sites.iter().map(|s| s.dropouts).sum(),
        retention_rate_pct: wavg(|s| s.retention),
        visit_adherence_pct: wavg(|s| s.adherence),
        ae_rate_pct: wavg(|s| s.ae),
        sae_rate_pct: wavg(|s| s.sae),
        overall_response_rate_pct: wavg(|s| s.orr),
        disease_control_rate_pct: wavg(|s| s.dcr),
    })
}
