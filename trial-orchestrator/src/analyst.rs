//! Stage analysis and auto-advance.
//!
//! After a stage completes, an analyst examines its output and recommends
//! what to do next: proceed, adjust parameters, hold for review, or alert.
//! The recommendation is recorded on the stage; when it is `proceed` and the
//! caller opted in, the workflow is advanced on their behalf. The analyst is
//! a collaborator behind a trait; a model-backed implementation plugs in
//! the same way as the bundled heuristic one.

use serde_json::Value;

use trial_orchestrator_sdk::async_trait;

use crate::context::Orchestrator;
use crate::error::EngineResult;
use crate::federated::FederatedScreeningResponse;
use crate::workflow::{
    RecommendationAction, StageRecommendation, StageStatus, Workflow, WorkflowStage,
};

/// Analysis collaborator invoked on a completed stage's output.
#[async_trait]
pub trait StageAnalyst: Send + Sync {
    async fn analyze(
        &self,
        workflow: &Workflow,
        stage: WorkflowStage,
        output: &Value,
    ) -> anyhow::Result<StageRecommendation>;
}

/// What came out of analyzing a stage.
#[derive(Debug, Clone)]
pub struct AnalysisOutcome {
    pub recommendation: StageRecommendation,
    /// Whether the workflow was advanced on the caller's behalf.
    pub auto_advanced: bool,
}

impl Orchestrator {
    /// Analyze a completed stage and record the recommendation on it.
    ///
    /// If the analyst itself fails, the stage gets a conservative `review`
    /// recommendation instead of an error; analysis never breaks a
    /// workflow. With `auto_advance` set and a `proceed` recommendation for
    /// the current, completed stage, `advance` is called on the caller's
    /// behalf.
    pub async fn analyze_stage(
        &self,
        workflow_id: &str,
        stage: WorkflowStage,
        auto_advance: bool,
        analyst: &dyn StageAnalyst,
    ) -> EngineResult<AnalysisOutcome> {
        let workflow = self.engine().get(workflow_id)?;
        let output = workflow
            .stage(stage)
            .and_then(|s| s.output_data.clone())
            .unwrap_or(Value::Null);

        let recommendation = match analyst.analyze(&workflow, stage, &output).await {
            Ok(recommendation) => recommendation,
            Err(err) => StageRecommendation {
                stage,
                recommendation: RecommendationAction::Review,
                quality_score: 0.5,
                stage_summary: format!(
                    "Automated analysis unavailable ({}). Manual review recommended.",
                    err
                ),
                anomalies: vec![],
                focus_areas: vec![],
            },
        };

        self.engine()
            .record_recommendation(workflow_id, stage, recommendation.clone())?;

        let mut auto_advanced = false;
        if auto_advance && recommendation.recommendation == RecommendationAction::Proceed {
            let stage_completed = workflow
                .stage(stage)
                .map(|s| s.status == StageStatus::Completed)
                .unwrap_or(false);
            if workflow.current_stage == Some(stage) && stage_completed {
                match self.engine().advance(workflow_id) {
                    Ok(_) => auto_advanced = true,
                    Err(err) => {
                        eprintln!(
                            "Auto-advance declined for workflow {}: {}",
                            workflow_id, err
                        );
                    }
                }
            }
        }

        Ok(AnalysisOutcome {
            recommendation,
            auto_advanced,
        })
    }
}

/// Analyst that scores a stage from the structure of its output alone.
///
/// Screening output is judged on site errors and review flags; any other
/// output on the presence of an error field. Stands in where no model-backed
/// analyst is wired.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicAnalyst;

#[async_trait]
impl StageAnalyst for HeuristicAnalyst {
    async fn analyze(
        &self,
        _workflow: &Workflow,
        stage: WorkflowStage,
        output: &Value,
    ) -> anyhow::Result<StageRecommendation> {
        let mut anomalies = Vec::new();
        let mut focus_areas = Vec::new();
        let mut quality: f64 = 1.0;
        let mut summary = "Stage output recorded.".to_string();

        if let Ok(response) = serde_json::from_value::<FederatedScreeningResponse>(output.clone())
        {
            for site in &response.site_results {
                for error in &site.errors {
                    anomalies.push(format!("[{}] {}", site.site_id, error));
                    quality -= 0.15;
                }
            }
            if response.aggregate_flagged_for_review > 0 {
                focus_areas.push(format!(
                    "Review {} flagged screening decision(s) before forming the cohort.",
                    response.aggregate_flagged_for_review
                ));
                quality -= 0.1;
            }
            if response.aggregate_total_patients == 0 {
                anomalies.push("No patients screened across any site.".to_string());
                quality -= 0.5;
            }
            summary = format!(
                "{} of {} patients eligible ({}%) across {} site(s).",
                response.aggregate_eligible_patients,
                response.aggregate_total_patients,
                response.eligibility_rate_pct,
                response.site_results.len()
            );
        } else if output.is_null() {
            anomalies.push("Stage produced no output.".to_string());
            quality = 0.3;
        } else if let Some(error) = output.get("error").and_then(|e| e.as_str()) {
            anomalies.push(error.to_string());
            quality = 0.2;
        }

        let quality_score = quality.clamp(0.0, 1.0);
        let recommendation = if anomalies.is_empty() && quality_score >= 0.8 {
            RecommendationAction::Proceed
        } else if quality_score >= 0.6 {
            RecommendationAction::Adjust
        } else if quality_score >= 0.3 {
            RecommendationAction::Review
        } else {
            RecommendationAction::Alert
        };

        Ok(StageRecommendation {
            stage,
            recommendation,
            quality_score,
            stage_summary: summary,
            anomalies,
            focus_areas,
        })
    }
}
