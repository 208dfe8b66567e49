//! Demo CLI: walks one clinical-trial workflow end to end against the
//! configured data sites.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use trial_orchestrator::analytics::ScriptedAnalytics;
use trial_orchestrator::config::{OrchestratorConfig, SiteConfig};
use trial_orchestrator::federated::{FederatedCoordinator, MonitoringRecord, VisitRecord};
use trial_orchestrator::handlers::default_handlers;
use trial_orchestrator::jobs::JobStatus;
use trial_orchestrator::screening::{PatientRecord, RuleBasedEvaluator};
use trial_orchestrator::workflow::{WorkflowCreateRequest, WorkflowStage};
use trial_orchestrator::Orchestrator;

use trial_orchestrator_sdk::{
    log_info, log_warning, MonitoringParams, MonitoringQuery, MonitoringQueryType,
    ScreeningCriteria,
};

#[derive(Parser)]
#[command(
    name = "trial-orchestrator",
    about = "Federated clinical-trial workflow orchestration demo"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write sample site data and a site registry for the demo
    Init {
        /// Directory to create the sample data in
        #[arg(long, default_value = "demo-data")]
        dir: PathBuf,
    },
    /// Walk one workflow through all three stages against the configured sites
    Run {
        /// Path to the site registry / round configuration
        #[arg(long, default_value = "orchestrator.yaml")]
        config: PathBuf,
        #[arg(long, default_value = "Demo Trial Workflow")]
        name: String,
        /// Trial identifier used across screening and monitoring
        #[arg(long, default_value = "PROSTATE-CANCER")]
        trial: String,
        /// JSON file with screening criteria; a built-in demo set if omitted
        #[arg(long)]
        criteria: Option<PathBuf>,
        /// Monitoring query type (adverse_events, visit_progress, response_summary,
        /// dropout_summary, lab_trends, overall_progress)
        #[arg(long, default_value = "overall_progress")]
        monitoring_query: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Init { dir } => init_sample_data(&dir),
        Command::Run {
            config,
            name,
            trial,
            criteria,
            monitoring_query,
        } => run_demo(&config, name, trial, criteria, &monitoring_query).await,
    }
}

async fn run_demo(
    config_path: &Path,
    name: String,
    trial: String,
    criteria_path: Option<PathBuf>,
    monitoring_query: &str,
) -> Result<()> {
    let config_path = if config_path == Path::new("orchestrator.yaml") {
        OrchestratorConfig::path_from_env("orchestrator.yaml")
    } else {
        config_path.to_path_buf()
    };
    let config = OrchestratorConfig::load(&config_path)?;
    if config.sites.is_empty() {
        bail!(
            "No sites configured in {}. Run `trial-orchestrator init` to create demo data.",
            config_path.display()
        );
    }
    log_info!("Loaded {} site(s) from {}", config.sites.len(), config_path.display());

    let query_type: MonitoringQueryType =
        serde_json::from_value(json!(monitoring_query)).with_context(|| {
            format!("'{}' is not a recognized monitoring query type", monitoring_query)
        })?;

    let criteria = match criteria_path {
        Some(path) => {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read criteria file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse criteria from: {}", path.display()))?
        }
        None => demo_criteria(&trial),
    };

    let evaluator = Arc::new(RuleBasedEvaluator);
    let coordinator = Arc::new(FederatedCoordinator::new(
        config.build_sites(evaluator),
        config.round_config(),
    ));
    let analytics = Arc::new(ScriptedAnalytics::new(json!({
        "summary": "Treatment arms defined from the eligible screening population.",
        "arms": ["treatment", "control"],
    })));
    let orchestrator = Orchestrator::new(default_handlers(coordinator, analytics));

    let workflow = orchestrator.engine().create(WorkflowCreateRequest {
        name,
        description: Some("End-to-end demo run".to_string()),
        trial_name: trial.clone(),
    })?;
    println!("\x1b[1;36m═══ Workflow {} created ═══\x1b[0m", workflow.id);

    // Stage 1: federated screening
    banner("STAGE 1: Patient Screening");
    let job = orchestrator
        .run_stage_job(
            &workflow.id,
            WorkflowStage::PatientScreening,
            serde_json::to_value(&criteria)?,
            "Federated eligibility screening",
        )
        .await?;
    print_job_outcome(&job)?;
    orchestrator.engine().advance(&workflow.id)?;

    // Stage 2: cohort formation
    banner("STAGE 2: Cohort Formation");
    let job = orchestrator
        .run_stage_job(
            &workflow.id,
            WorkflowStage::CohortFormation,
            json!({"query": "Form treatment arms from the eligible population"}),
            "Cohort definition query",
        )
        .await?;
    print_job_outcome(&job)?;
    orchestrator.engine().advance(&workflow.id)?;

    // Stage 3: federated monitoring
    banner("STAGE 3: Cohort Monitoring");
    let monitoring = MonitoringQuery {
        trial_name: trial,
        query_type,
        parameters: MonitoringParams::default(),
        natural_language_query: None,
    };
    let job = orchestrator
        .run_stage_job(
            &workflow.id,
            WorkflowStage::CohortMonitoring,
            serde_json::to_value(&monitoring)?,
            "Federated monitoring query",
        )
        .await?;
    print_job_outcome(&job)?;
    orchestrator.engine().advance(&workflow.id)?;

    let finished = orchestrator.engine().get(&workflow.id)?;
    println!("\n{}", "=".repeat(80));
    println!(
        "Workflow {} finished with status '{}'.",
        finished.id, finished.status
    );
    println!("{}", "=".repeat(80));
    Ok(())
}

fn banner(title: &str) {
    println!("\n{}", "=".repeat(80));
    println!("{}", title);
    println!("{}", "=".repeat(80));
}

fn print_job_outcome(job: &trial_orchestrator::jobs::Job) -> Result<()> {
    match job.status {
        JobStatus::Completed => {
            if let Some(result) = &job.result {
                println!("{}", serde_json::to_string_pretty(result)?);
            }
            println!("\x1b[32m✓ Job {} completed\x1b[0m", job.id);
            Ok(())
        }
        _ => {
            let error = job.error.as_deref().unwrap_or("unknown error");
            log_warning!("Job {} failed: {}", job.id, error);
            bail!("Stage job failed: {}", error)
        }
    }
}

fn demo_criteria(trial: &str) -> ScreeningCriteria {
    serde_json::from_value(json!({
        "trial_name": trial,
        "inclusion": [
            {
                "category": "demographic",
                "field": "age",
                "operator": "gte",
                "value": 18,
                "description": "Age >= 18"
            },
            {
                "category": "condition",
                "field": "condition_name",
                "operator": "in",
                "value": ["prostate cancer"],
                "description": "Diagnosed prostate cancer"
            }
        ],
        "exclusion": [
            {
                "category": "condition",
                "field": "condition_name",
                "operator": "in",
                "value": ["severe renal impairment"],
                "description": "Severe renal impairment"
            }
        ]
    }))
    .expect("demo criteria are well-formed")
}

// ============================================================================
// Sample data
// ============================================================================

fn init_sample_data(dir: &Path) -> Result<()> {
    let patients = demo_patients();
    let monitoring = demo_monitoring_records();

    for (site, records) in &patients {
        let ehr_dir = dir.join("ehr").join(site);
        std::fs::create_dir_all(&ehr_dir)
            .with_context(|| format!("Failed to create {}", ehr_dir.display()))?;
        for record in records {
            let path = ehr_dir.join(format!("patient_{}.json", record.patient_id));
            std::fs::write(&path, serde_json::to_string_pretty(record)?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
    }
    for (site, records) in &monitoring {
        let monitoring_dir = dir.join("monitoring").join(site);
        std::fs::create_dir_all(&monitoring_dir)
            .with_context(|| format!("Failed to create {}", monitoring_dir.display()))?;
        for record in records {
            let path = monitoring_dir.join(format!("patient_{}.json", record.patient_id));
            std::fs::write(&path, serde_json::to_string_pretty(record)?)
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
    }

    let config = OrchestratorConfig {
        sites: patients
            .iter()
            .map(|(site, _)| SiteConfig::Local {
                id: site.to_string(),
                ehr_dir: dir.join("ehr").join(site),
                monitoring_dir: dir.join("monitoring").join(site),
            })
            .collect(),
        ..Default::default()
    };
    let config_path = dir.join("orchestrator.yaml");
    std::fs::write(&config_path, serde_yaml::to_string(&config)?)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    log_info!("Sample data written to {}", dir.display());
    log_info!(
        "Next: trial-orchestrator run --config {}",
        config_path.display()
    );
    Ok(())
}

fn demo_patients() -> Vec<(&'static str, Vec<PatientRecord>)> {
    let patient = |id: &str, age: u32, conditions: &[&str], psa: f64| PatientRecord {
        patient_id: id.to_string(),
        age,
        gender: "male".to_string(),
        conditions: conditions.iter().map(|c| c.to_string()).collect(),
        medications: vec![],
        labs: [("PSA".to_string(), psa)].into_iter().collect(),
    };

    vec![
        (
            "site_a",
            vec![
                patient("A001", 64, &["Metastatic prostate cancer"], 8.2),
                patient("A002", 17, &["Prostate cancer"], 4.0),
                patient(
                    "A003",
                    71,
                    &["Prostate cancer", "Severe renal impairment"],
                    11.0,
                ),
            ],
        ),
        (
            "site_b",
            vec![
                patient("B101", 58, &["Prostate cancer"], 12.1),
                patient("B102", 66, &["Localized prostate cancer"], 6.4),
                patient("B103", 45, &["Hypertension"], 1.1),
                patient(
                    "B104",
                    80,
                    &["Prostate cancer", "Severe renal impairment"],
                    9.8,
                ),
            ],
        ),
    ]
}

fn demo_monitoring_records() -> Vec<(&'static str, Vec<MonitoringRecord>)> {
    use trial_orchestrator::federated::{AdverseEventRecord, LabMeasurement};

    let visit = |visit: u32, completed: bool| VisitRecord { visit, completed };
    let psa = |visit: u32, value: f64| LabMeasurement {
        lab_name: "PSA".to_string(),
        visit,
        value,
    };

    vec![
        (
            "site_a",
            vec![
                MonitoringRecord {
                    patient_id: "A001".to_string(),
                    status: "active".to_string(),
                    dropout_reason: None,
                    visits: vec![visit(1, true), visit(2, true), visit(3, false)],
                    adverse_events: vec![AdverseEventRecord {
                        name: "Fatigue".to_string(),
                        grade: 1,
                        severity: "mild".to_string(),
                        category: "constitutional".to_string(),
                        serious: false,
                    }],
                    response: Some("PR".to_string()),
                    labs: vec![psa(1, 8.2), psa(2, 5.4)],
                },
                MonitoringRecord {
                    patient_id: "A004".to_string(),
                    status: "dropped_out".to_string(),
                    dropout_reason: Some("withdrew consent".to_string()),
                    visits: vec![visit(1, true)],
                    adverse_events: vec![],
                    response: None,
                    labs: vec![psa(1, 7.0)],
                },
            ],
        ),
        (
            "site_b",
            vec![
                MonitoringRecord {
                    patient_id: "B101".to_string(),
                    status: "active".to_string(),
                    dropout_reason: None,
                    visits: vec![visit(1, true), visit(2, true)],
                    adverse_events: vec![AdverseEventRecord {
                        name: "Neutropenia".to_string(),
                        grade: 3,
                        severity: "severe".to_string(),
                        category: "hematologic".to_string(),
                        serious: true,
                    }],
                    response: Some("SD".to_string()),
                    labs: vec![psa(1, 12.1), psa(2, 10.3)],
                },
                MonitoringRecord {
                    patient_id: "B102".to_string(),
                    status: "active".to_string(),
                    dropout_reason: None,
                    visits: vec![visit(1, true), visit(2, false)],
                    adverse_events: vec![],
                    response: Some("CR".to_string()),
                    labs: vec![psa(1, 6.4), psa(2, 1.2)],
                },
            ],
        ),
    ]
}
