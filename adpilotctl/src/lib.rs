#![allow(clippy::result_large_err)]

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use adpilot_core::{
    generate_landing_page_variants, generate_rsa_variants, AdpilotConfig, ApprovalStatus,
    ApprovalWorkflow, Clock, CreateExperiment, DataSource, EstimatedConnector, ExperimentEngine,
    ExperimentStatus, ExperimentType, FixtureKeywordConnector, FixtureSerpConnector, GuardConfig,
    GuardrailSystem, LandingPageCreative, MetricPoint, PlanOptions, PlanOrchestrator,
    PlannedChanges, Prng, ProductConfig, RsaCreative, SqliteApprovalStore, SqliteCacheStore,
    SqliteExperimentStore, SqliteGuardrailStore, StatsConfig, SyntheticSerpConnector,
    SystemClock, TargetMetric, VariantStrategy, VoteDecision, WasteAnalyzer,
};
use chrono::NaiveDate;
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::{generate, Shell};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Builder;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] adpilot_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("cache error: {0}")]
    Cache(#[from] adpilot_core::CacheError),
    #[error("plan error: {0}")]
    Plan(#[from] adpilot_core::PlanError),
    #[error("experiment error: {0}")]
    Experiment(#[from] adpilot_core::ExperimentError),
    #[error("guardrail error: {0}")]
    Guardrail(#[from] adpilot_core::GuardrailError),
    #[error("approval error: {0}")]
    Approval(#[from] adpilot_core::ApprovalError),
    #[error("waste error: {0}")]
    Waste(#[from] adpilot_core::WasteError),
    #[error("guardrail violations block this proposal: {0}")]
    GuardrailViolation(String),
    #[error("required resource missing: {0}")]
    MissingResource(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Config(_) => "ConfigInvalid",
            AppError::Io(_) => "StorageFailure",
            AppError::Serialize(_) => "ValidationFailed",
            AppError::Cache(_) => "StorageFailure",
            AppError::Plan(_) => "PlanFailed",
            AppError::Experiment(adpilot_core::ExperimentError::InvalidTransition { .. }) => {
                "StateConflict"
            }
            AppError::Experiment(adpilot_core::ExperimentError::GuardFailed { .. }) => {
                "GuardrailViolation"
            }
            AppError::Experiment(_) => "ValidationFailed",
            AppError::Guardrail(_) => "StorageFailure",
            AppError::Approval(adpilot_core::ApprovalError::Unauthorized { .. }) => "Unauthorized",
            AppError::Approval(adpilot_core::ApprovalError::InvalidState { .. }) => "StateConflict",
            AppError::Approval(_) => "ValidationFailed",
            AppError::Waste(_) => "ValidationFailed",
            AppError::GuardrailViolation(_) => "GuardrailViolation",
            AppError::MissingResource(_) => "ConfigInvalid",
            AppError::InvalidArgument(_) => "ValidationFailed",
        }
    }

    /// The single structured record emitted on fatal failure.
    pub fn to_record(&self) -> String {
        serde_json::json!({
            "kind": self.kind(),
            "message": self.to_string(),
            "context": "adpilotctl",
        })
        .to_string()
    }
}

#[derive(Parser, Debug)]
#[command(name = "adpilotctl", about = "Offline marketing-intelligence pipeline")]
pub struct Cli {
    /// Alternate path for adpilot.toml
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Path to the product configuration (required by `plan` and
    /// `experiment create`)
    #[arg(long)]
    pub product: Option<PathBuf>,
    /// Override for paths.data_dir
    #[arg(long)]
    pub data_dir: Option<PathBuf>,
    /// Override for paths.plans_dir
    #[arg(long)]
    pub plans_dir: Option<PathBuf>,
    /// Seed for every probabilistic component
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the plan orchestrator and emit campaign artifacts
    Plan(PlanArgs),
    /// Experiment lifecycle operations
    #[command(subcommand)]
    Experiment(ExperimentCommands),
    /// Search-term waste analysis
    #[command(subcommand)]
    Waste(WasteCommands),
    /// Guardrailed change approval workflow
    #[command(subcommand)]
    Approval(ApprovalCommands),
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Collect, score and cluster without emitting artifacts
    #[arg(long)]
    pub dry_run: bool,
    /// Keyword-planner fixture (JSON); omitted sources fall back to the
    /// estimation connector
    #[arg(long)]
    pub kwp_fixture: Option<PathBuf>,
    /// Search-console fixture (JSON)
    #[arg(long)]
    pub gsc_fixture: Option<PathBuf>,
    /// SERP snapshot fixture (JSON); defaults to the synthetic connector
    #[arg(long)]
    pub serp_fixture: Option<PathBuf>,
    /// Clusters to include in competitor analysis
    #[arg(long, default_value_t = 3)]
    pub competitor_top_k: usize,
}

#[derive(Subcommand, Debug)]
pub enum ExperimentCommands {
    /// Create a draft experiment from a spec file
    Create(ExperimentCreateArgs),
    /// Start a draft experiment (guard-checked)
    Start { id: String },
    /// Pause an active experiment
    Pause { id: String },
    /// Resume a paused experiment
    Resume { id: String },
    /// Complete an active experiment, naming the winner
    Complete {
        id: String,
        /// Variant id, variant name, or `control`
        winner: String,
    },
    /// Abort an active or paused experiment
    Abort {
        id: String,
        #[arg(long, default_value = "operator abort")]
        reason: String,
    },
    /// List experiments
    List(ExperimentListArgs),
    /// Ingest daily variant metrics from a CSV file
    Record { id: String, csv: PathBuf },
    /// Run frequentist and Bayesian analysis
    Analyze { id: String },
    /// Reweight variants by Thompson sampling over observed metrics
    Allocate { id: String },
    /// Export an experiment with metrics, analysis and audit trail
    Export { id: String },
}

#[derive(Args, Debug)]
pub struct ExperimentCreateArgs {
    /// Experiment spec file (JSON)
    pub spec: PathBuf,
}

#[derive(Args, Debug)]
pub struct ExperimentListArgs {
    #[arg(long)]
    pub status: Option<String>,
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Subcommand, Debug)]
pub enum WasteCommands {
    /// Analyze a search-term report CSV
    Analyze(WasteAnalyzeArgs),
}

#[derive(Args, Debug)]
pub struct WasteAnalyzeArgs {
    pub csv: PathBuf,
    /// Also write the negative-keyword recommendations as CSV
    #[arg(long)]
    pub negatives_out: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum ApprovalCommands {
    /// Validate a planned-changes file against the guardrails and submit
    /// it for approval
    Submit(ApprovalSubmitArgs),
    /// Vote on a pending request
    Vote(ApprovalVoteArgs),
    /// Cancel a pending request
    Cancel {
        id: String,
        #[arg(long)]
        by: String,
    },
    /// List requests, running the expiry and escalation sweeps first
    List(ApprovalListArgs),
}

#[derive(Args, Debug)]
pub struct ApprovalSubmitArgs {
    /// Planned-changes file (JSON)
    pub changes: PathBuf,
    #[arg(long)]
    pub by: String,
    #[arg(long, default_value = "budget_update")]
    pub change_type: String,
    /// Proceed despite non-critical guardrail violations
    #[arg(long)]
    pub override_violations: bool,
}

#[derive(Args, Debug)]
pub struct ApprovalVoteArgs {
    pub id: String,
    #[arg(long)]
    pub approver: String,
    #[arg(long, value_enum)]
    pub decision: VoteArg,
    #[arg(long)]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum VoteArg {
    Approve,
    Reject,
}

#[derive(Args, Debug)]
pub struct ApprovalListArgs {
    #[arg(long)]
    pub status: Option<String>,
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

/// Experiment spec document consumed by `experiment create`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
struct ExperimentSpecFile {
    experiment_type: ExperimentType,
    product: String,
    target_id: String,
    target_metric: TargetMetric,
    #[serde(default)]
    strategies: Vec<VariantStrategy>,
    #[serde(default)]
    rsa_base: Option<RsaCreative>,
    #[serde(default)]
    landing_page_base: Option<LandingPageCreative>,
    #[serde(default)]
    min_sample_size: Option<u64>,
    #[serde(default)]
    confidence_level: Option<f64>,
}

struct App {
    config: AdpilotConfig,
    product_path: Option<PathBuf>,
    seed: u64,
    format: OutputFormat,
    clock: Arc<dyn Clock>,
}

impl App {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => adpilot_core::load_adpilot_config(path)?,
            None => AdpilotConfig::default(),
        };
        if let Some(data_dir) = &cli.data_dir {
            config.paths.data_dir = data_dir.to_string_lossy().into_owned();
        }
        if let Some(plans_dir) = &cli.plans_dir {
            config.paths.plans_dir = plans_dir.to_string_lossy().into_owned();
        }
        Ok(Self {
            config,
            product_path: cli.product.clone(),
            seed: cli.seed,
            format: cli.format,
            clock: Arc::new(SystemClock),
        })
    }

    fn product(&self) -> Result<ProductConfig> {
        let path = self.product_path.as_ref().ok_or_else(|| {
            AppError::MissingResource("--product <file> is required for this command".to_string())
        })?;
        Ok(adpilot_core::load_product_config(path)?)
    }

    fn data_path(&self, name: &str) -> PathBuf {
        Path::new(&self.config.paths.data_dir).join(name)
    }

    fn cache_store(&self) -> Result<SqliteCacheStore> {
        fs::create_dir_all(&self.config.paths.data_dir)?;
        let store = SqliteCacheStore::builder()
            .path(self.data_path("cache.sqlite"))
            .ttl_hours(self.config.quota.cache_ttl_hours)
            .ceiling("serp_calls", self.config.quota.serp_calls_per_day)
            .ceiling("keyword_calls", self.config.quota.keyword_calls_per_day)
            .build()?;
        store.initialize()?;
        Ok(store)
    }

    fn experiment_engine(&self) -> Result<ExperimentEngine> {
        fs::create_dir_all(&self.config.paths.data_dir)?;
        let store = SqliteExperimentStore::builder()
            .path(self.data_path("experiments.sqlite"))
            .build()?;
        store.initialize()?;
        let stats = StatsConfig {
            monte_carlo_samples: self.config.experiment.monte_carlo_samples,
            sequential_peeks: self.config.experiment.sequential_peeks,
            futility_floor: self.config.experiment.futility_floor,
        };
        Ok(ExperimentEngine::new(store, self.clock.clone(), stats))
    }

    fn guardrail_system(&self) -> Result<GuardrailSystem> {
        fs::create_dir_all(&self.config.paths.data_dir)?;
        let store = SqliteGuardrailStore::builder()
            .path(self.data_path("guardrails.sqlite"))
            .build()?;
        store.initialize()?;
        Ok(GuardrailSystem::new(
            store,
            self.config.guardrail.clone(),
            self.clock.clone(),
        ))
    }

    fn approval_workflow(&self) -> Result<ApprovalWorkflow> {
        fs::create_dir_all(&self.config.paths.data_dir)?;
        let store = SqliteApprovalStore::builder()
            .path(self.data_path("approvals.sqlite"))
            .build()?;
        store.initialize()?;
        Ok(ApprovalWorkflow::new(
            store,
            self.config.approval.clone(),
            self.clock.clone(),
        ))
    }

    fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce(&T) -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
            OutputFormat::Text => println!("{}", text(value)),
        }
        Ok(())
    }
}

pub fn run(cli: Cli) -> Result<()> {
    tracing_fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init()
        .ok();

    if let Commands::Completions { shell } = &cli.command {
        let mut command = Cli::command();
        generate(*shell, &mut command, "adpilotctl", &mut std::io::stdout());
        return Ok(());
    }

    let app = App::new(&cli)?;
    match &cli.command {
        Commands::Plan(args) => run_plan(&app, args),
        Commands::Experiment(command) => run_experiment(&app, command),
        Commands::Waste(command) => match command {
            WasteCommands::Analyze(args) => run_waste_analyze(&app, args),
        },
        Commands::Approval(command) => run_approval(&app, command),
        Commands::Completions { .. } => Ok(()),
    }
}

fn run_plan(app: &App, args: &PlanArgs) -> Result<()> {
    let product = app.product()?;
    let cache = app.cache_store()?;

    let mut orchestrator = PlanOrchestrator::new(
        app.config.clone(),
        product,
        cache,
        app.clock.clone(),
    );
    if let Some(path) = &args.kwp_fixture {
        orchestrator = orchestrator.with_connector(Arc::new(FixtureKeywordConnector::from_file(
            "keyword_calls",
            "kwp",
            DataSource::Kwp,
            path,
        )?));
    }
    if let Some(path) = &args.gsc_fixture {
        orchestrator = orchestrator.with_connector(Arc::new(FixtureKeywordConnector::from_file(
            "keyword_calls",
            "gsc",
            DataSource::Gsc,
            path,
        )?));
    }
    orchestrator = orchestrator.with_connector(Arc::new(EstimatedConnector::new()));
    orchestrator = match &args.serp_fixture {
        Some(path) => {
            orchestrator.with_serp(Arc::new(FixtureSerpConnector::from_file("serp", path)?))
        }
        None => orchestrator.with_serp(Arc::new(SyntheticSerpConnector::new())),
    };

    let options = PlanOptions {
        dry_run: args.dry_run,
        competitor_top_k: args.competitor_top_k,
        ..PlanOptions::default()
    };

    let runtime = Builder::new_multi_thread().enable_all().build()?;
    let outcome = runtime.block_on(orchestrator.run(&options))?;

    app.emit(&outcome.summary, |summary| {
        let mut lines = vec![format!(
            "plan for {} ({}): {} keywords in {} ad groups",
            summary.product, summary.date, summary.total_keywords, summary.total_ad_groups
        )];
        lines.push(format!(
            "serp calls used: {}, cache hit rate: {:.4}",
            summary.serp_calls_used, summary.cache_hit_rate
        ));
        match &outcome.directory {
            Some(directory) => lines.push(format!("artifacts: {}", directory.display())),
            None => lines.push("dry run, no artifacts emitted".to_string()),
        }
        for warning in &summary.warnings {
            lines.push(format!("warning: {warning}"));
        }
        lines.join("\n")
    })
}

fn run_experiment(app: &App, command: &ExperimentCommands) -> Result<()> {
    let engine = app.experiment_engine()?;
    match command {
        ExperimentCommands::Create(args) => {
            let raw = fs::read_to_string(&args.spec)?;
            let spec: ExperimentSpecFile = serde_json::from_str(&raw)?;
            let max_similarity = app.config.experiment.max_similarity_to_control;

            let variants = match spec.experiment_type {
                ExperimentType::Rsa => {
                    let base = spec.rsa_base.clone().ok_or_else(|| {
                        AppError::InvalidArgument(
                            "rsa experiments need an rsa_base creative".to_string(),
                        )
                    })?;
                    let product = app.product()?;
                    generate_rsa_variants(
                        &base,
                        &product.anchor_headline,
                        &spec.strategies,
                        max_similarity,
                    )?
                }
                ExperimentType::LandingPage => {
                    let base = spec.landing_page_base.clone().ok_or_else(|| {
                        AppError::InvalidArgument(
                            "landing page experiments need a landing_page_base".to_string(),
                        )
                    })?;
                    generate_landing_page_variants(&base, &spec.strategies, max_similarity)?
                }
            };

            let experiment = engine.create(CreateExperiment {
                experiment_type: spec.experiment_type,
                product: spec.product,
                target_id: spec.target_id,
                target_metric: spec.target_metric,
                variants,
                min_sample_size: spec
                    .min_sample_size
                    .unwrap_or(app.config.experiment.default_min_sample_size),
                confidence_level: spec
                    .confidence_level
                    .unwrap_or(app.config.experiment.default_confidence),
                guards: GuardConfig {
                    min_sample_size: app.config.experiment.default_min_sample_size,
                    min_duration_days: app.config.experiment.min_duration_days,
                    max_similarity,
                    daily_spend_ceiling: app.config.experiment.daily_spend_ceiling,
                },
            })?;
            app.emit(&experiment, |experiment| {
                format!(
                    "created {} ({} variants, status {})",
                    experiment.id,
                    experiment.variants.len(),
                    experiment.status
                )
            })
        }
        ExperimentCommands::Start { id } => {
            let experiment = engine.start(id)?;
            app.emit(&experiment, |experiment| {
                format!("{} is now {}", experiment.id, experiment.status)
            })
        }
        ExperimentCommands::Pause { id } => {
            let experiment = engine.pause(id)?;
            app.emit(&experiment, |experiment| {
                format!("{} is now {}", experiment.id, experiment.status)
            })
        }
        ExperimentCommands::Resume { id } => {
            let experiment = engine.resume(id)?;
            app.emit(&experiment, |experiment| {
                format!("{} is now {}", experiment.id, experiment.status)
            })
        }
        ExperimentCommands::Complete { id, winner } => {
            let experiment = engine.complete(id, winner)?;
            app.emit(&experiment, |experiment| {
                format!(
                    "{} completed, winner {}",
                    experiment.id,
                    experiment.winner_variant_id.as_deref().unwrap_or("-")
                )
            })
        }
        ExperimentCommands::Abort { id, reason } => {
            let experiment = engine.abort(id, reason)?;
            app.emit(&experiment, |experiment| {
                format!("{} aborted", experiment.id)
            })
        }
        ExperimentCommands::List(args) => {
            let status = args
                .status
                .as_deref()
                .map(ExperimentStatus::from_str)
                .transpose()?;
            let experiments = engine.list(status, args.limit)?;
            app.emit(&experiments, |experiments| {
                if experiments.is_empty() {
                    return "no experiments".to_string();
                }
                experiments
                    .iter()
                    .map(|experiment| {
                        format!(
                            "{}  {}  {}  {} variants",
                            experiment.id,
                            experiment.status,
                            experiment.target_metric,
                            experiment.variants.len()
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        ExperimentCommands::Record { id, csv } => {
            let points = read_metric_csv(id, csv)?;
            for point in &points {
                engine.record_metrics(point)?;
            }
            let count = points.len();
            app.emit(&count, |count| format!("recorded {count} metric rows"))
        }
        ExperimentCommands::Analyze { id } => {
            let mut rng = Prng::from_seed(app.seed);
            let report = engine.analyze(id, &mut rng)?;
            app.emit(&report, |report| {
                let mut lines = vec![format!(
                    "{} on {}: decision {:?} ({})",
                    report.experiment_id, report.target_metric, report.decision, report.note
                )];
                for variant in &report.variants {
                    lines.push(format!(
                        "  {}: rate {:.4}, p {:.4} (adj {:.4}), P(beat control) {:.3}",
                        variant.variant_id,
                        variant.rate,
                        variant.z_test.p_value,
                        variant.adjusted_p_value,
                        variant.bayesian.prob_variant_beats_control
                    ));
                }
                lines.join("\n")
            })
        }
        ExperimentCommands::Allocate { id } => {
            let mut rng = Prng::from_seed(app.seed);
            let pairs = engine.reallocate(id, &mut rng)?;
            app.emit(&pairs, |pairs| {
                pairs
                    .iter()
                    .map(|(variant, weight)| format!("{variant}: {weight:.3}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
        ExperimentCommands::Export { id } => {
            let export = engine.export(id)?;
            println!("{}", serde_json::to_string_pretty(&export)?);
            Ok(())
        }
    }
}

fn run_waste_analyze(app: &App, args: &WasteAnalyzeArgs) -> Result<()> {
    let rows = WasteAnalyzer::read_report(&args.csv)?;
    let analyzer = WasteAnalyzer::new(app.config.waste.clone());
    let report = analyzer.analyze(&rows);
    if let Some(out) = &args.negatives_out {
        WasteAnalyzer::write_negatives_csv(out, &report.recommendations)?;
    }
    app.emit(&report, |report| {
        let mut lines = vec![format!(
            "{} terms, ${:.2} spend, ${:.2} wasted",
            report.total_terms, report.total_cost, report.total_wasted_cost
        )];
        lines.push(format!(
            "categories: {} high-cost, {} low-ctr, {} poor-quality",
            report.high_cost_no_convert.len(),
            report.low_ctr_high_impr.len(),
            report.poor_quality.len()
        ));
        for rec in report.recommendations.iter().take(10) {
            lines.push(format!(
                "  {} [{}] saves ${:.2} ({})",
                rec.term,
                rec.match_type,
                rec.estimated_savings,
                rec.reason
            ));
        }
        lines.join("\n")
    })
}

fn run_approval(app: &App, command: &ApprovalCommands) -> Result<()> {
    let workflow = app.approval_workflow()?;
    match command {
        ApprovalCommands::Submit(args) => {
            let raw = fs::read_to_string(&args.changes)?;
            let changes: PlannedChanges = serde_json::from_str(&raw)?;

            let validation = app.guardrail_system()?.validate_proposal(&changes)?;
            if !validation.passed {
                let summary = validation
                    .violations
                    .iter()
                    .map(|violation| format!("{}:{}", violation.rule, violation.severity))
                    .collect::<Vec<_>>()
                    .join(", ");
                if !validation.can_override {
                    return Err(AppError::GuardrailViolation(summary));
                }
                if !args.override_violations {
                    return Err(AppError::GuardrailViolation(format!(
                        "{summary} (pass --override-violations to proceed)"
                    )));
                }
            }

            let request = workflow.submit(changes, &args.by, &args.change_type)?;
            app.emit(&request, |request| {
                format!(
                    "{} submitted: severity {}, status {}, needs {} approval(s)",
                    request.id, request.severity, request.status, request.required_approvals
                )
            })
        }
        ApprovalCommands::Vote(args) => {
            let decision = match args.decision {
                VoteArg::Approve => VoteDecision::Approve,
                VoteArg::Reject => VoteDecision::Reject,
            };
            let request =
                workflow.vote(&args.id, &args.approver, decision, args.comment.clone())?;
            app.emit(&request, |request| {
                format!(
                    "{}: {} of {} approvals, status {}",
                    request.id,
                    request.approvals(),
                    request.required_approvals,
                    request.status
                )
            })
        }
        ApprovalCommands::Cancel { id, by } => {
            let request = workflow.cancel(id, by)?;
            app.emit(&request, |request| {
                format!("{} is now {}", request.id, request.status)
            })
        }
        ApprovalCommands::List(args) => {
            workflow.expire_due()?;
            workflow.escalate_due()?;
            let status = args
                .status
                .as_deref()
                .map(ApprovalStatus::from_str)
                .transpose()?;
            let requests = workflow.list(status, args.limit)?;
            app.emit(&requests, |requests| {
                if requests.is_empty() {
                    return "no approval requests".to_string();
                }
                requests
                    .iter()
                    .map(|request| {
                        format!(
                            "{}  {}  {}  {}/{} approvals  expires {}",
                            request.id,
                            request.severity,
                            request.status,
                            request.approvals(),
                            request.required_approvals,
                            request.expires_at.format("%Y-%m-%d %H:%M")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })
        }
    }
}

#[derive(Debug, Deserialize)]
struct MetricCsvRow {
    date: String,
    variant_id: String,
    impressions: u64,
    clicks: u64,
    cost: f64,
    conversions: u64,
    #[serde(default)]
    conversion_value: f64,
}

fn read_metric_csv(experiment_id: &str, path: &Path) -> Result<Vec<MetricPoint>> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|err| AppError::InvalidArgument(format!("cannot read {path:?}: {err}")))?;
    let mut points = Vec::new();
    for row in reader.deserialize::<MetricCsvRow>() {
        let row = row.map_err(|err| AppError::InvalidArgument(err.to_string()))?;
        let date = NaiveDate::parse_from_str(&row.date, "%Y-%m-%d").map_err(|err| {
            AppError::InvalidArgument(format!("bad date {}: {err}", row.date))
        })?;
        points.push(MetricPoint {
            experiment_id: experiment_id.to_string(),
            variant_id: row.variant_id,
            date,
            impressions: row.impressions,
            clicks: row.clicks,
            cost: row.cost,
            conversions: row.conversions,
            conversion_value: row.conversion_value,
            view_through_conversions: 0,
        });
    }
    Ok(points)
}
