//! Site client adapters.
//!
//! [`LocalSite`] runs a site in-process over a directory of record files,
//! the shape used by the bundled sample data and by tests. [`RemoteSite`]
//! forwards queries to an external site service over HTTP. Either way, only
//! aggregate results leave the adapter; record content never does.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use trial_orchestrator_sdk::{
    async_trait, ConfidenceLevel, LabTrendPoint, MonitoringMetrics, MonitoringQuery,
    MonitoringQueryType, ScreeningCriteria, SiteClient, SiteMonitoringResult,
    SiteScreeningResult,
};

use crate::screening::{
    criterion_label, criterion_matches, EligibilityEvaluator, PatientRecord, ScreeningAuditor,
    ELIGIBLE,
};

// ============================================================================
// Local site record models
// ============================================================================

/// One protocol visit in a patient's monitoring record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitRecord {
    pub visit: u32,
    pub completed: bool,
}

/// One adverse event in a patient's monitoring record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdverseEventRecord {
    pub name: String,
    /// CTCAE grade 1-5.
    pub grade: u32,
    pub severity: String,
    pub category: String,
    #[serde(default)]
    pub serious: bool,
}

/// One lab measurement in a patient's monitoring record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabMeasurement {
    pub lab_name: String,
    pub visit: u32,
    pub value: f64,
}

/// A patient's monitoring data as held by a local site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringRecord {
    pub patient_id: String,
    /// "active" or "dropped_out".
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dropout_reason: Option<String>,
    #[serde(default)]
    pub visits: Vec<VisitRecord>,
    #[serde(default)]
    pub adverse_events: Vec<AdverseEventRecord>,
    /// Latest RECIST response assessment (CR, PR, SD, PD).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default)]
    pub labs: Vec<LabMeasurement>,
}

// ============================================================================
// Local site
// ============================================================================

/// An in-process site over local record directories.
///
/// Screening loads `patient_*.json` files from the EHR directory and walks
/// each patient through the screening auditor pipeline; monitoring computes
/// aggregates from `patient_*.json` files in the monitoring directory.
pub struct LocalSite {
    site_id: String,
    ehr_dir: PathBuf,
    monitoring_dir: PathBuf,
    evaluator: Arc<dyn EligibilityEvaluator>,
}

impl LocalSite {
    pub fn new(
        site_id: impl Into<String>,
        ehr_dir: impl Into<PathBuf>,
        monitoring_dir: impl Into<PathBuf>,
        evaluator: Arc<dyn EligibilityEvaluator>,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            ehr_dir: ehr_dir.into(),
            monitoring_dir: monitoring_dir.into(),
            evaluator,
        }
    }
}

/// Load all `patient_*.json` records from a site directory.
///
/// Load failures are recorded per file (name only, never content) and do not
/// abort the rest of the directory.
async fn load_records<T: DeserializeOwned>(dir: &Path, errors: &mut Vec<String>) -> Vec<T> {
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(read_dir) => read_dir,
        Err(_) => {
            errors.push(format!("Directory not found: {}", dir.display()));
            return Vec::new();
        }
    };

    let mut files = Vec::new();
    while let Ok(Some(entry)) = read_dir.next_entry().await {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with("patient_") && name.ends_with(".json") {
            files.push(entry.path());
        }
    }
    files.sort();

    let mut records = Vec::new();
    for path in files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str::<T>(&contents) {
                Ok(record) => records.push(record),
                Err(err) => errors.push(format!("Failed to load {}: {}", name, err)),
            },
            Err(err) => errors.push(format!("Failed to load {}: {}", name, err)),
        }
    }
    records
}

#[async_trait]
impl SiteClient for LocalSite {
    fn site_id(&self) -> &str {
        &self.site_id
    }

    async fn screen(&self, criteria: &ScreeningCriteria) -> anyhow::Result<SiteScreeningResult> {
        let mut errors = Vec::new();
        let patients: Vec<PatientRecord> = load_records(&self.ehr_dir, &mut errors).await;
        let total = patients.len();

        if total == 0 {
            errors.push(format!(
                "No patient_*.json files found in {}",
                self.ehr_dir.display()
            ));
            return Ok(SiteScreeningResult {
                site_id: self.site_id.clone(),
                errors,
                ..Default::default()
            });
        }

        let auditor = ScreeningAuditor::new(self.evaluator.clone());

        let mut eligible = 0;
        let mut high_conf = 0;
        let mut medium_conf = 0;
        let mut low_conf = 0;
        let mut corrected = 0;
        let mut flagged = 0;
        let mut details = Vec::new();

        for patient in &patients {
            match auditor.screen_and_audit(patient, criteria).await {
                Ok(detail) => {
                    if detail.final_decision == ELIGIBLE {
                        eligible += 1;
                    }
                    match detail.confidence {
                        ConfidenceLevel::High => high_conf += 1,
                        ConfidenceLevel::Medium => medium_conf += 1,
                        ConfidenceLevel::Low => low_conf += 1,
                    }
                    if detail.was_corrected {
                        corrected += 1;
                    }
                    if detail.flagged_for_review {
                        flagged += 1;
                    }
                    details.push(detail);
                }
                Err(err) => {
                    errors.push(format!("Failed to screen {}: {:#}", patient.patient_id, err));
                }
            }
        }

        // Per-criterion diagnostics over the structured rules
        let mut inclusion_pass_counts = BTreeMap::new();
        for criterion in &criteria.inclusion {
            let passes = patients
                .iter()
                .filter(|p| criterion_matches(p, criterion).unwrap_or(false))
                .count();
            inclusion_pass_counts.insert(criterion_label(criterion), passes);
        }
        let mut exclusion_hit_counts = BTreeMap::new();
        for criterion in &criteria.exclusion {
            let hits = patients
                .iter()
                .filter(|p| criterion_matches(p, criterion).unwrap_or(false))
                .count();
            exclusion_hit_counts.insert(criterion_label(criterion), hits);
        }

        Ok(SiteScreeningResult {
            site_id: self.site_id.clone(),
            total_patients: total,
            eligible_patients: eligible,
            inclusion_pass_counts,
            exclusion_hit_counts,
            data_as_of: Some(Utc::now().date_naive()),
            errors,
            patient_audit_details: details,
            high_confidence_count: high_conf,
            medium_confidence_count: medium_conf,
            low_confidence_count: low_conf,
            corrected_count: corrected,
            flagged_for_review_count: flagged,
        })
    }

    async fn monitor(&self, query: &MonitoringQuery) -> anyhow::Result<SiteMonitoringResult> {
        let mut errors = Vec::new();
        let records: Vec<MonitoringRecord> =
            load_records(&self.monitoring_dir, &mut errors).await;

        if records.is_empty() {
            errors.push(format!(
                "No patient_*.json files found in {}",
                self.monitoring_dir.display()
            ));
            return Ok(SiteMonitoringResult {
                site_id: self.site_id.clone(),
                query_type: query.query_type,
                total_patients_monitored: 0,
                metrics: None,
                data_as_of: None,
                errors,
            });
        }

        let metrics = compute_metrics(&records, query);
        Ok(SiteMonitoringResult {
            site_id: self.site_id.clone(),
            query_type: query.query_type,
            total_patients_monitored: records.len(),
            metrics: Some(metrics),
            data_as_of: Some(Utc::now().date_naive()),
            errors,
        })
    }
}

/// Compute the site-level aggregate for one monitoring query.
pub fn compute_metrics(records: &[MonitoringRecord], query: &MonitoringQuery) -> MonitoringMetrics {
    match query.query_type {
        MonitoringQueryType::AdverseEvents => {
            compute_adverse_events(records, query.parameters.grade_threshold.unwrap_or(1))
        }
        MonitoringQueryType::VisitProgress => compute_visit_progress(records),
        MonitoringQueryType::ResponseSummary => compute_response_summary(records),
        MonitoringQueryType::DropoutSummary => compute_dropout_summary(records),
        MonitoringQueryType::LabTrends => {
            compute_lab_trends(records, query.parameters.lab_name.as_deref())
        }
        MonitoringQueryType::OverallProgress => compute_overall_progress(records),
    }
}

fn compute_adverse_events(records: &[MonitoringRecord], grade_threshold: u32) -> MonitoringMetrics {
    let mut total_ae = 0;
    let mut patients_with_ae = 0;
    let mut by_grade: BTreeMap<String, usize> = BTreeMap::new();
    let mut by_severity: BTreeMap<String, usize> = BTreeMap::new();
    let mut by_category: BTreeMap<String, usize> = BTreeMap::new();
    let mut event_counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut sae_count = 0;
    let mut sae_patients = 0;

    for record in records {
        let filtered: Vec<_> = record
            .adverse_events
            .iter()
            .filter(|ae| ae.grade >= grade_threshold)
            .collect();
        if !filtered.is_empty() {
            patients_with_ae += 1;
        }
        total_ae += filtered.len();
        for ae in &filtered {
            *by_grade.entry(format!("grade_{}", ae.grade)).or_insert(0) += 1;
            *by_severity.entry(ae.severity.clone()).or_insert(0) += 1;
            *by_category.entry(ae.category.clone()).or_insert(0) += 1;
            *event_counts.entry(ae.name.clone()).or_insert(0) += 1;
        }
        // Serious events are counted regardless of the grade filter
        let serious = record.adverse_events.iter().filter(|ae| ae.serious).count();
        sae_count += serious;
        if serious > 0 {
            sae_patients += 1;
        }
    }

    MonitoringMetrics::AdverseEvents {
        total_ae_count: total_ae,
        patients_with_any_ae: patients_with_ae,
        sae_count,
        sae_patients,
        by_grade,
        by_severity,
        by_category,
        event_counts,
    }
}

fn compute_visit_progress(records: &[MonitoringRecord]) -> MonitoringMetrics {
    let mut scheduled = 0;
    let mut completed = 0;
    for record in records {
        scheduled += record.visits.len();
        completed += record.visits.iter().filter(|v| v.completed).count();
    }
    MonitoringMetrics::VisitProgress {
        total_scheduled_visits: scheduled,
        completed_visits: completed,
        missed_visits: scheduled - completed,
    }
}

fn compute_response_summary(records: &[MonitoringRecord]) -> MonitoringMetrics {
    let mut distribution: BTreeMap<String, usize> = BTreeMap::new();
    let mut assessed = 0;
    for record in records {
        if let Some(response) = &record.response {
            assessed += 1;
            *distribution.entry(response.clone()).or_insert(0) += 1;
        }
    }
    MonitoringMetrics::ResponseSummary {
        assessed_patients: assessed,
        response_distribution: distribution,
    }
}

fn compute_dropout_summary(records: &[MonitoringRecord]) -> MonitoringMetrics {
    let mut active = 0;
    let mut dropouts = 0;
    let mut by_reason: BTreeMap<String, usize> = BTreeMap::new();
    for record in records {
        if record.status == "active" {
            active += 1;
        } else {
            dropouts += 1;
            let reason = record
                .dropout_reason
                .clone()
                .unwrap_or_else(|| "unspecified".to_string());
            *by_reason.entry(reason).or_insert(0) += 1;
        }
    }
    MonitoringMetrics::DropoutSummary {
        active_patients: active,
        dropout_count: dropouts,
        by_reason,
    }
}

fn compute_lab_trends(records: &[MonitoringRecord], lab_filter: Option<&str>) -> MonitoringMetrics {
    // lab -> visit -> values
    let mut values: BTreeMap<String, BTreeMap<u32, Vec<f64>>> = BTreeMap::new();
    for record in records {
        for lab in &record.labs {
            if let Some(filter) = lab_filter {
                if !lab.lab_name.eq_ignore_ascii_case(filter) {
                    continue;
                }
            }
            values
                .entry(lab.lab_name.clone())
                .or_default()
                .entry(lab.visit)
                .or_default()
                .push(lab.value);
        }
    }

    let mut lab_trends: BTreeMap<String, Vec<LabTrendPoint>> = BTreeMap::new();
    for (lab_name, by_visit) in values {
        let mut points = Vec::new();
        for (visit, samples) in by_visit {
            let count = samples.len();
            let mean = if count == 0 {
                0.0
            } else {
                let total: f64 = samples.iter().sum();
                ((total / count as f64) * 100.0).round() / 100.0
            };
            points.push(LabTrendPoint { visit, count, mean });
        }
        lab_trends.insert(lab_name, points);
    }
    MonitoringMetrics::LabTrends { lab_trends }
}

fn compute_overall_progress(records: &[MonitoringRecord]) -> MonitoringMetrics {
    let total = records.len();
    let pct = |n: usize, d: usize| -> f64 {
        if d == 0 {
            0.0
        } else {
            ((100.0 * n as f64 / d as f64) * 100.0).round() / 100.0
        }
    };

    let active = records.iter().filter(|r| r.status == "active").count();
    let dropouts = total - active;

    let scheduled: usize = records.iter().map(|r| r.visits.len()).sum();
    let completed: usize = records
        .iter()
        .map(|r| r.visits.iter().filter(|v| v.completed).count())
        .sum();

    let patients_with_ae = records
        .iter()
        .filter(|r| !r.adverse_events.is_empty())
        .count();
    let sae_patients = records
        .iter()
        .filter(|r| r.adverse_events.iter().any(|ae| ae.serious))
        .count();

    let assessed = records.iter().filter(|r| r.response.is_some()).count();
    let responders = records
        .iter()
        .filter(|r| matches!(r.response.as_deref(), Some("CR") | Some("PR")))
        .count();
    let controlled = records
        .iter()
        .filter(|r| matches!(r.response.as_deref(), Some("CR") | Some("PR") | Some("SD")))
        .count();

    MonitoringMetrics::OverallProgress {
        active_patients: active,
        dropout_count: dropouts,
        retention_rate_pct: pct(active, total),
        visit_adherence_pct: pct(completed, scheduled),
        ae_rate_pct: pct(patients_with_ae, total),
        sae_rate_pct: pct(sae_patients, total),
        overall_response_rate_pct: pct(responders, assessed),
        disease_control_rate_pct: pct(controlled, assessed),
    }
}

// ============================================================================
// Remote site
// ============================================================================

/// HTTP adapter for an externally hosted site service.
///
/// The service owns its records and exposes the same aggregate-only
/// contract; transport failures surface as this site's error entry through
/// the round coordinator's isolation.
pub struct RemoteSite {
    site_id: String,
    endpoint: String,
    client: reqwest::Client,
}

impl RemoteSite {
    pub fn new(site_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl SiteClient for RemoteSite {
    fn site_id(&self) -> &str {
        &self.site_id
    }

    async fn screen(&self, criteria: &ScreeningCriteria) -> anyhow::Result<SiteScreeningResult> {
        let url = self.url("screen");
        let response = self
            .client
            .post(&url)
            .json(criteria)
            .send()
            .await
            .with_context(|| format!("Screening request to {} failed", url))?
            .error_for_status()
            .with_context(|| format!("Screening request to {} was rejected", url))?;
        response
            .json()
            .await
            .with_context(|| format!("Screening response from {} was not valid", url))
    }

    async fn monitor(&self, query: &MonitoringQuery) -> anyhow::Result<SiteMonitoringResult> {
        let url = self.url("monitor");
        let response = self
            .client
            .post(&url)
            .json(query)
            .send()
            .await
            .with_context(|| format!("Monitoring request to {} failed", url))?
            .error_for_status()
            .with_context(|| format!("Monitoring request to {} was rejected", url))?;
        response
            .json()
            .await
            .with_context(|| format!("Monitoring response from {} was not valid", url))
    }
}
