//! Contracts for trial-orchestrator data sites.
//!
//! A *site* is an independent holder of patient-level records. The
//! orchestrator fans queries out to sites and merges what comes back, but
//! patient-level data never crosses the site boundary: a site returns only
//! pre-aggregated counts, rates, and derived summaries. This crate defines
//! that boundary: the [`SiteClient`] trait, the query types the orchestrator
//! distributes, the aggregate result types sites report back, and the
//! structured log events both sides emit.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// Re-export async trait for convenience
pub use async_trait::async_trait;

// ============================================================================
// Screening criteria
// ============================================================================

/// The domain a single criterion applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionCategory {
    /// Age, gender, race.
    Demographic,
    /// Diagnosis names or codes.
    Condition,
    /// Lab test value ranges.
    Lab,
    /// Current or past medications.
    Medication,
}

/// Comparison operators for criterion values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Value is a member of a list.
    In,
    /// Value is NOT a member of a list.
    Nin,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Neq => "neq",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::In => "in",
            Operator::Nin => "nin",
        }
    }
}

/// A single inclusion or exclusion rule.
///
/// Examples: age >= 18 is `Criterion { category: Demographic, field: "age",
/// operator: Gte, value: 18 }`; "diagnosis contains breast cancer" is
/// `Criterion { category: Condition, field: "condition_name", operator: In,
/// value: ["breast cancer"] }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Criterion {
    pub category: CriterionCategory,
    /// Field in the site's record to evaluate.
    pub field: String,
    pub operator: Operator,
    /// Reference value (number, string, or list).
    pub value: serde_json::Value,
    /// When category is `Lab`, the specific lab test name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lab_name: Option<String>,
    /// Human-readable explanation of the criterion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Full set of criteria the orchestrator distributes for one screening round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningCriteria {
    /// Name or ID of the clinical trial.
    pub trial_name: String,
    /// Patients MUST satisfy all of these.
    #[serde(default)]
    pub inclusion: Vec<Criterion>,
    /// Patients matching ANY of these are excluded.
    #[serde(default)]
    pub exclusion: Vec<Criterion>,
    /// Optional free-text eligibility description, interpreted by the
    /// site's evaluator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub natural_language_criteria: Option<String>,
}

// ============================================================================
// Screening results
// ============================================================================

/// Confidence in a screening decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

/// Audit trail for a single patient's screening decision.
///
/// Contains decisions and reasoning only, never record content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientAuditDetail {
    pub patient_id: String,
    /// First-pass decision: ELIGIBLE or INELIGIBLE.
    pub initial_decision: String,
    pub initial_reason: String,
    /// Final decision after audit and possible re-screen.
    pub final_decision: String,
    pub final_reason: String,
    pub confidence: ConfidenceLevel,
    /// Whether the auditor caused the decision to change.
    pub was_corrected: bool,
    /// Number of screening passes (1 = single, 2 = re-screened).
    pub screening_passes: u32,
    /// Whether this patient was flagged for human review.
    pub flagged_for_review: bool,
    #[serde(default)]
    pub audit_issues: Vec<String>,
}

/// Aggregate counts a single site reports back after screening.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteScreeningResult {
    pub site_id: String,
    /// Total patients in the site's records.
    pub total_patients: usize,
    /// Patients satisfying all inclusion and no exclusion criteria.
    pub eligible_patients: usize,
    /// Per-criterion count of patients passing each inclusion rule.
    #[serde(default)]
    pub inclusion_pass_counts: BTreeMap<String, usize>,
    /// Per-criterion count of patients hitting each exclusion rule.
    #[serde(default)]
    pub exclusion_hit_counts: BTreeMap<String, usize>,
    /// Date the site's records were last refreshed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_as_of: Option<NaiveDate>,
    /// Non-fatal issues encountered during screening. Messages identify
    /// patients by id at most, never by record content.
    #[serde(default)]
    pub errors: Vec<String>,
    /// Per-patient audit trail (decisions only, no record content).
    #[serde(default)]
    pub patient_audit_details: Vec<PatientAuditDetail>,
    #[serde(default)]
    pub high_confidence_count: usize,
    #[serde(default)]
    pub medium_confidence_count: usize,
    #[serde(default)]
    pub low_confidence_count: usize,
    /// Patients whose decision was changed by the auditor.
    #[serde(default)]
    pub corrected_count: usize,
    /// Patients flagged for human review.
    #[serde(default)]
    pub flagged_for_review_count: usize,
}

impl SiteScreeningResult {
    /// A result carrying nothing but an error entry, used when the site
    /// itself failed or timed out.
    pub fn from_error(site_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            errors: vec![error.into()],
            ..Default::default()
        }
    }
}

// ============================================================================
// Monitoring queries
// ============================================================================

/// The kinds of monitoring questions a site can answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitoringQueryType {
    AdverseEvents,
    VisitProgress,
    ResponseSummary,
    DropoutSummary,
    LabTrends,
    OverallProgress,
}

impl MonitoringQueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitoringQueryType::AdverseEvents => "adverse_events",
            MonitoringQueryType::VisitProgress => "visit_progress",
            MonitoringQueryType::ResponseSummary => "response_summary",
            MonitoringQueryType::DropoutSummary => "dropout_summary",
            MonitoringQueryType::LabTrends => "lab_trends",
            MonitoringQueryType::OverallProgress => "overall_progress",
        }
    }
}

/// Optional parameters refining a monitoring query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MonitoringParams {
    /// Only count adverse events at or above this grade.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade_threshold: Option<u32>,
    /// Restrict lab-trend queries to this lab test.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lab_name: Option<String>,
}

/// A monitoring query the orchestrator distributes to every site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringQuery {
    pub trial_name: String,
    pub query_type: MonitoringQueryType,
    #[serde(default)]
    pub parameters: MonitoringParams,
    /// The original free-text question, when the query came from one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub natural_language_query: Option<String>,
}

// ============================================================================
// Monitoring results
// ============================================================================

/// One point of a per-lab trend line: the site-local mean at a visit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabTrendPoint {
    pub visit: u32,
    pub count: usize,
    pub mean: f64,
}

/// The aggregate metrics a site computes for one monitoring query.
///
/// One variant per [`MonitoringQueryType`]; all values are site-level
/// aggregates over the site's own records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MonitoringMetrics {
    AdverseEvents {
        total_ae_count: usize,
        patients_with_any_ae: usize,
        sae_count: usize,
        sae_patients: usize,
        by_grade: BTreeMap<String, usize>,
        by_severity: BTreeMap<String, usize>,
        by_category: BTreeMap<String, usize>,
        /// Raw per-event frequencies; the aggregator keeps the global top 10.
        event_counts: BTreeMap<String, usize>,
    },
    VisitProgress {
        total_scheduled_visits: usize,
        completed_visits: usize,
        missed_visits: usize,
    },
    ResponseSummary {
        assessed_patients: usize,
        /// RECIST category -> patient count (CR, PR, SD, PD).
        response_distribution: BTreeMap<String, usize>,
    },
    DropoutSummary {
        active_patients: usize,
        dropout_count: usize,
        by_reason: BTreeMap<String, usize>,
    },
    LabTrends {
        lab_trends: BTreeMap<String, Vec<LabTrendPoint>>,
    },
    OverallProgress {
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

/// What a single site reports back for one monitoring query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteMonitoringResult {
    pub site_id: String,
    pub query_type: MonitoringQueryType,
    /// Patients covered by this site's monitoring data.
    pub total_patients_monitored: usize,
    /// `None` when the site failed outright; see `errors`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MonitoringMetrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_as_of: Option<NaiveDate>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl SiteMonitoringResult {
    /// A result carrying nothing but an error entry.
    pub fn from_error(
        site_id: impl Into<String>,
        query_type: MonitoringQueryType,
        error: impl Into<String>,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            query_type,
            total_patients_monitored: 0,
            metrics: None,
            data_as_of: None,
            errors: vec![error.into()],
        }
    }
}

// ============================================================================
// Site contract
// ============================================================================

/// Contract a data site implements to participate in federated rounds.
///
/// Implementations must never surface individual-record fields: results carry
/// aggregate counts only, and error strings identify a patient by id at most.
/// Both methods must be safe to call again after a stage rerun.
#[async_trait]
pub trait SiteClient: Send + Sync {
    /// Unique identifier for this site.
    fn site_id(&self) -> &str;

    /// Evaluate the criteria against the site's local records and return
    /// aggregate eligibility counts.
    async fn screen(&self, criteria: &ScreeningCriteria) -> anyhow::Result<SiteScreeningResult>;

    /// Answer a monitoring query from the site's local monitoring data.
    async fn monitor(&self, query: &MonitoringQuery) -> anyhow::Result<SiteMonitoringResult>;
}

// ============================================================================
// Structured log events
// ============================================================================

/// Structured logging events emitted by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// Workflow created and auto-started.
    WorkflowCreated {
        workflow_id: String,
        name: String,
    },
    /// Workflow moved to the next stage (`None` = all stages done).
    WorkflowAdvanced {
        workflow_id: String,
        stage: Option<String>,
    },
    /// A stage's status changed.
    StageUpdated {
        workflow_id: String,
        stage: String,
        status: String,
    },
    /// Job accepted for background execution.
    JobSubmitted {
        job_id: String,
        workflow_id: String,
        stage: String,
    },
    /// Job finished successfully.
    JobCompleted {
        job_id: String,
    },
    /// Job handler failed; the error is recorded on the job.
    JobFailed {
        job_id: String,
        error: String,
    },
    /// Federated round started.
    RoundStarted {
        trial_name: String,
        kind: String,
        sites: usize,
    },
    /// One site reported back.
    SiteCompleted {
        site_id: String,
        summary: String,
    },
    /// One site failed or timed out; the round continues without it.
    SiteFailed {
        site_id: String,
        error: String,
    },
    /// Federated round finished.
    RoundCompleted {
        kind: String,
        status: String,
        sites_reporting: usize,
    },
}

impl OrchestratorEvent {
    /// Emit this event to stderr for log collectors.
    pub fn emit(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            use std::io::Write;
            eprintln!("__TRIAL_EVENT__:{}", json);
            // Force flush stderr in async/concurrent contexts
            let _ = std::io::stderr().flush();
        }
    }
}

/// Helper macros for structured event logging
#[macro_export]
macro_rules! log_job_submitted {
    ($job_id:expr, $workflow_id:expr, $stage:expr) => {
        $crate::OrchestratorEvent::JobSubmitted {
            job_id: $job_id.to_string(),
            workflow_id: $workflow_id.to_string(),
            stage: $stage.to_string(),
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_job_completed {
    ($job_id:expr) => {
        $crate::OrchestratorEvent::JobCompleted {
            job_id: $job_id.to_string(),
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_job_failed {
    ($job_id:expr, $error:expr) => {
        $crate::OrchestratorEvent::JobFailed {
            job_id: $job_id.to_string(),
            error: $error.to_string(),
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_round_start {
    ($trial:expr, $kind:expr, $sites:expr) => {
        $crate::OrchestratorEvent::RoundStarted {
            trial_name: $trial.to_string(),
            kind: $kind.to_string(),
            sites: $sites,
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_site_completed {
    ($site_id:expr, $summary:expr) => {
        $crate::OrchestratorEvent::SiteCompleted {
            site_id: $site_id.to_string(),
            summary: $summary.to_string(),
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_site_failed {
    ($site_id:expr, $error:expr) => {
        $crate::OrchestratorEvent::SiteFailed {
            site_id: $site_id.to_string(),
            error: $error.to_string(),
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_round_complete {
    ($kind:expr, $status:expr, $reporting:expr) => {
        $crate::OrchestratorEvent::RoundCompleted {
            kind: $kind.to_string(),
            status: $status.to_string(),
            sites_reporting: $reporting,
        }
        .emit();
    };
}

#[macro_export]
macro_rules! log_stage_updated {
    ($workflow_id:expr, $stage:expr, $status:expr) => {
        $crate::OrchestratorEvent::StageUpdated {
            workflow_id: $workflow_id.to_string(),
            stage: $stage.to_string(),
            status: $status.to_string(),
        }
        .emit();
    };
}

// ============================================================================
// Console Logging Macros (for CLI binaries)
// ============================================================================

/// Logs an informational message.
///
/// # Example
/// ```
/// use trial_orchestrator_sdk::log_info;
/// log_info!("Loading site registry...");
/// ```
#[macro_export]
macro_rules! log_info {
    ($message:expr) => {
        println!("\x1b[36mℹ {}\x1b[0m", $message);
    };
    ($fmt:expr, $($arg:tt)*) => {
        println!("\x1b[36mℹ {}\x1b[0m", format!($fmt, $($arg)*));
    };
}

/// Logs a warning message.
#[macro_export]
macro_rules! log_warning {
    ($message:expr) => {
        println!("\x1b[33m⚠ Warning: {}\x1b[0m", $message);
    };
    ($fmt:expr, $($arg:tt)*) => {
        println!("\x1b[33m⚠ Warning: {}\x1b[0m", format!($fmt, $($arg)*));
    };
}

/// Logs the start of a parallel site dispatch.
///
/// Outputs:
/// ```text
/// → Dispatching to 3 sites in parallel
/// ```
#[macro_export]
macro_rules! log_dispatch_start {
    ($num_sites:expr) => {
        println!(
            "\x1b[36m→ Dispatching to {} sites in parallel\x1b[0m",
            $num_sites
        );
    };
}

/// Logs the completion of a parallel site dispatch.
#[macro_export]
macro_rules! log_dispatch_complete {
    ($num_sites:expr) => {
        println!("\x1b[32m✓ {} sites reported\x1b[0m", $num_sites);
    };
}
