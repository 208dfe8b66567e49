//! Self-correcting patient screening.
//!
//! A two-pass screen → audit → (re-screen) pipeline: an initial eligibility
//! decision, a second audit pass that reviews it and scores confidence, and
//! a reflection pass that re-screens only when the auditor disagrees. The
//! auditor catches evaluation errors without relying on human review for
//! every patient, but uncertain outcomes are still flagged for review:
//! decisions are corrected or flagged, never silently discarded.
//!
//! The evaluator behind the pipeline is pluggable: a model-backed evaluator
//! slots in behind [`EligibilityEvaluator`], while [`RuleBasedEvaluator`]
//! applies structured criteria deterministically.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use trial_orchestrator_sdk::{
    async_trait, ConfidenceLevel, Criterion, CriterionCategory, Operator, PatientAuditDetail,
    ScreeningCriteria,
};

pub const ELIGIBLE: &str = "ELIGIBLE";
pub const INELIGIBLE: &str = "INELIGIBLE";

/// One patient's record as held by a local site. Never crosses the site
/// boundary; only decisions derived from it do.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatientRecord {
    pub patient_id: String,
    pub age: u32,
    pub gender: String,
    #[serde(default)]
    pub conditions: Vec<String>,
    #[serde(default)]
    pub medications: Vec<String>,
    /// Latest value per lab test name.
    #[serde(default)]
    pub labs: BTreeMap<String, f64>,
}

/// One screening pass's outcome for a patient.
#[derive(Debug, Clone)]
pub struct ScreeningDecision {
    /// ELIGIBLE or INELIGIBLE.
    pub decision: String,
    pub reason: String,
}

/// Whether the auditor agrees with the initial decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditVerdict {
    Agree,
    Disagree,
}

/// Result of the auditor's review of a screening decision.
#[derive(Debug, Clone)]
pub struct AuditReview {
    pub verdict: AuditVerdict,
    pub confidence: ConfidenceLevel,
    /// Issues the auditor identified with the initial decision.
    pub issues: Vec<String>,
    /// Corrected decision when the auditor disagrees.
    pub corrected_decision: Option<String>,
    pub corrected_reason: Option<String>,
}

/// The evaluation collaborator behind the screening pipeline.
///
/// Must be safe to invoke again for the same patient after a stage rerun.
#[async_trait]
pub trait EligibilityEvaluator: Send + Sync {
    /// First-pass eligibility decision.
    async fn screen(
        &self,
        patient: &PatientRecord,
        criteria: &ScreeningCriteria,
    ) -> anyhow::Result<ScreeningDecision>;

    /// Review an initial decision against the criteria and patient data.
    async fn audit(
        &self,
        patient: &PatientRecord,
        criteria: &ScreeningCriteria,
        initial: &ScreeningDecision,
    ) -> anyhow::Result<AuditReview>;

    /// Re-screen with the auditor's feedback incorporated.
    async fn rescreen(
        &self,
        patient: &PatientRecord,
        criteria: &ScreeningCriteria,
        review: &AuditReview,
    ) -> anyhow::Result<ScreeningDecision>;
}

/// Runs the full screen → audit → (reflect) pipeline for single patients.
pub struct ScreeningAuditor {
    evaluator: Arc<dyn EligibilityEvaluator>,
}

impl ScreeningAuditor {
    pub fn new(evaluator: Arc<dyn EligibilityEvaluator>) -> Self {
        Self { evaluator }
    }

    /// Screen one patient with audit and possible self-correction.
    ///
    /// The reflection pass runs only when the auditor disagrees with the
    /// initial decision. A patient is flagged for human review when the
    /// confidence is low, when a correction happened without high
    /// confidence, or when the auditor agreed but still raised issues
    /// without high confidence.
    pub async fn screen_and_audit(
        &self,
        patient: &PatientRecord,
        criteria: &ScreeningCriteria,
    ) -> anyhow::Result<PatientAuditDetail> {
        let initial = self.evaluator.screen(patient, criteria).await?;
        let review = self.evaluator.audit(patient, criteria, &initial).await?;

        let mut final_decision = initial.clone();
        let mut was_corrected = false;
        let mut screening_passes = 1;

        if review.verdict == AuditVerdict::Disagree {
            final_decision = self.evaluator.rescreen(patient, criteria, &review).await?;
            was_corrected = final_decision.decision != initial.decision;
            screening_passes = 2;
        }

        let confidence = review.confidence;
        let flagged_for_review = confidence == ConfidenceLevel::Low
            || (was_corrected && confidence != ConfidenceLevel::High)
            || (review.verdict == AuditVerdict::Agree
                && !review.issues.is_empty()
                && confidence != ConfidenceLevel::High);

        Ok(PatientAuditDetail {
            patient_id: patient.patient_id.clone(),
            initial_decision: initial.decision,
            initial_reason: initial.reason,
            final_decision: final_decision.decision,
            final_reason: final_decision.reason,
            confidence,
            was_corrected,
            screening_passes,
            flagged_for_review,
            audit_issues: review.issues,
        })
    }
}

// ============================================================================
// Rule-based evaluation
// ============================================================================

/// Human-readable label for a criterion, used as the key in per-criterion
/// pass/hit counts.
pub(crate) fn criterion_label(criterion: &Criterion) -> String {
    criterion.description.clone().unwrap_or_else(|| {
        format!(
            "{} {} {}",
            criterion.field,
            criterion.operator.as_str(),
            criterion.value
        )
    })
}

/// Evaluate one criterion against a patient record.
///
/// `Err` carries the reason the criterion could not be evaluated (missing
/// lab, non-numeric reference value); the caller decides how that degrades
/// the decision.
pub(crate) fn criterion_matches(
    patient: &PatientRecord,
    criterion: &Criterion,
) -> Result<bool, String> {
    match criterion.category {
        CriterionCategory::Demographic => match criterion.field.as_str() {
            "age" => compare_number(patient.age as f64, criterion.operator, &criterion.value),
            "gender" => compare_string(&patient.gender, criterion.operator, &criterion.value),
            other => Err(format!("Unknown demographic field '{}'.", other)),
        },
        CriterionCategory::Condition => {
            Ok(any_entry_matches(&patient.conditions, criterion.operator, &criterion.value)?)
        }
        CriterionCategory::Medication => {
            Ok(any_entry_matches(&patient.medications, criterion.operator, &criterion.value)?)
        }
        CriterionCategory::Lab => {
            let lab_name = criterion
                .lab_name
                .as_deref()
                .unwrap_or(criterion.field.as_str());
            let value = patient
                .labs
                .get(lab_name)
                .copied()
                .ok_or_else(|| format!("Lab '{}' not present in record.", lab_name))?;
            compare_number(value, criterion.operator, &criterion.value)
        }
    }
}

fn reference_numbers(value: &serde_json::Value) -> Result<Vec<f64>, String> {
    match value {
        serde_json::Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_f64()
                    .ok_or_else(|| format!("Criterion value '{}' is not numeric.", v))
            })
            .collect(),
        other => Ok(vec![other
            .as_f64()
            .ok_or_else(|| format!("Criterion value '{}' is not numeric.", other))?]),
    }
}

fn compare_number(
    actual: f64,
    operator: Operator,
    reference: &serde_json::Value,
) -> Result<bool, String> {
    let numbers = reference_numbers(reference)?;
    let first = *numbers
        .first()
        .ok_or_else(|| "Criterion value list is empty.".to_string())?;
    Ok(match operator {
        Operator::Eq => actual == first,
        Operator::Neq => actual != first,
        Operator::Gt => actual > first,
        Operator::Gte => actual >= first,
        Operator::Lt => actual < first,
        Operator::Lte => actual <= first,
        Operator::In => numbers.contains(&actual),
        Operator::Nin => !numbers.contains(&actual),
    })
}

fn reference_strings(value: &serde_json::Value) -> Result<Vec<String>, String> {
    match value {
        serde_json::Value::Array(items) => items
            .iter()
            .map(|v| {
                v.as_str()
                    .map(|s| s.to_lowercase())
                    .ok_or_else(|| format!("Criterion value '{}' is not a string.", v))
            })
            .collect(),
        serde_json::Value::String(s) => Ok(vec![s.to_lowercase()]),
        other => Err(format!("Criterion value '{}' is not a string.", other)),
    }
}

fn compare_string(
    actual: &str,
    operator: Operator,
    reference: &serde_json::Value,
) -> Result<bool, String> {
    let candidates = reference_strings(reference)?;
    let actual = actual.to_lowercase();
    Ok(match operator {
        Operator::Eq => candidates.first().map(|c| *c == actual).unwrap_or(false),
        Operator::Neq => candidates.first().map(|c| *c != actual).unwrap_or(true),
        Operator::In => candidates.contains(&actual),
        Operator::Nin => !candidates.contains(&actual),
        _ => return Err(format!("Operator '{}' not valid for strings.", operator.as_str())),
    })
}

/// True when any entry (condition, medication) matches the criterion. String
/// matching is case-insensitive and substring-based, so "metastatic breast
/// cancer" matches a "breast cancer" criterion.
fn any_entry_matches(
    entries: &[String],
    operator: Operator,
    reference: &serde_json::Value,
) -> Result<bool, String> {
    let candidates = reference_strings(reference)?;
    let hit = entries.iter().any(|entry| {
        let entry = entry.to_lowercase();
        candidates.iter().any(|candidate| entry.contains(candidate))
    });
    match operator {
        Operator::Eq | Operator::In => Ok(hit),
        Operator::Neq | Operator::Nin => Ok(!hit),
        _ => Err(format!(
            "Operator '{}' not valid for list fields.",
            operator.as_str()
        )),
    }
}

/// Deterministic evaluator that applies structured inclusion/exclusion
/// criteria directly to the record.
///
/// Free-text criteria need a model-backed evaluator; here they are recorded
/// as an issue and the patient is left ineligible with low confidence, which
/// flags the decision for human review downstream.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuleBasedEvaluator;

impl RuleBasedEvaluator {
    fn evaluate(
        &self,
        patient: &PatientRecord,
        criteria: &ScreeningCriteria,
    ) -> (ScreeningDecision, Vec<String>) {
        let mut issues = Vec::new();

        if criteria.natural_language_criteria.is_some()
            && criteria.inclusion.is_empty()
            && criteria.exclusion.is_empty()
        {
            issues.push(
                "Free-text criteria cannot be evaluated without a model-backed evaluator."
                    .to_string(),
            );
            return (
                ScreeningDecision {
                    decision: INELIGIBLE.to_string(),
                    reason: "Criteria could not be evaluated against the record.".to_string(),
                },
                issues,
            );
        }

        for criterion in &criteria.inclusion {
            match criterion_matches(patient, criterion) {
                Ok(true) => {}
                Ok(false) => {
                    return (
                        ScreeningDecision {
                            decision: INELIGIBLE.to_string(),
                            reason: format!(
                                "Does not meet inclusion criterion: {}.",
                                criterion_label(criterion)
                            ),
                        },
                        issues,
                    );
                }
                Err(issue) => {
                    // Unevaluable inclusion counts as not satisfied
                    issues.push(issue);
                    return (
                        ScreeningDecision {
                            decision: INELIGIBLE.to_string(),
                            reason: format!(
                                "Could not evaluate inclusion criterion: {}.",
                                criterion_label(criterion)
                            ),
                        },
                        issues,
                    );
                }
            }
        }

        for criterion in &criteria.exclusion {
            match criterion_matches(patient, criterion) {
                Ok(true) => {
                    return (
                        ScreeningDecision {
                            decision: INELIGIBLE.to_string(),
                            reason: format!(
                                "Meets exclusion criterion: {}.",
                                criterion_label(criterion)
                            ),
                        },
                        issues,
                    );
                }
                Ok(false) => {}
                Err(issue) => issues.push(issue),
            }
        }

        (
            ScreeningDecision {
                decision: ELIGIBLE.to_string(),
                reason: "Meets all inclusion criteria with no exclusions.".to_string(),
            },
            issues,
        )
    }

    fn confidence_from_issues(issues: &[String]) -> ConfidenceLevel {
        match issues.len() {
            0 => ConfidenceLevel::High,
            1 => ConfidenceLevel::Medium,
            _ => ConfidenceLevel::Low,
        }
    }
}

#[async_trait]
impl EligibilityEvaluator for RuleBasedEvaluator {
    async fn screen(
        &self,
        patient: &PatientRecord,
        criteria: &ScreeningCriteria,
    ) -> anyhow::Result<ScreeningDecision> {
        let (decision, _) = self.evaluate(patient, criteria);
        Ok(decision)
    }

    async fn audit(
        &self,
        patient: &PatientRecord,
        criteria: &ScreeningCriteria,
        initial: &ScreeningDecision,
    ) -> anyhow::Result<AuditReview> {
        let (recomputed, issues) = self.evaluate(patient, criteria);
        let verdict = if recomputed.decision == initial.decision {
            AuditVerdict::Agree
        } else {
            AuditVerdict::Disagree
        };
        let confidence = Self::confidence_from_issues(&issues);
        let (corrected_decision, corrected_reason) = match verdict {
            AuditVerdict::Agree => (None, None),
            AuditVerdict::Disagree => (Some(recomputed.decision), Some(recomputed.reason)),
        };
        Ok(AuditReview {
            verdict,
            confidence,
            issues,
            corrected_decision,
            corrected_reason,
        })
    }

    async fn rescreen(
        &self,
        patient: &PatientRecord,
        criteria: &ScreeningCriteria,
        _review: &AuditReview,
    ) -> anyhow::Result<ScreeningDecision> {
        let (decision, _) = self.evaluate(patient, criteria);
        Ok(decision)
    }
}
