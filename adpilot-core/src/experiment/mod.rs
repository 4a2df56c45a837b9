mod engine;
mod models;
mod stats;
mod store;
mod variants;

use std::path::PathBuf;

use thiserror::Error;

pub use engine::{
    AnalysisReport, CreateExperiment, ExperimentEngine, ExperimentExport, GuardCheck, GuardReport,
    VariantAnalysis,
};
pub use models::{
    Experiment, ExperimentStatus, ExperimentType, GuardConfig, MetricPoint, TargetMetric,
    Variant, VariantPayload,
};
pub use stats::{
    bayesian_compare, bonferroni_adjust, required_sample_size, sequential_decision,
    thompson_allocation, two_proportion_z_test, BayesianComparison, Counts, SequentialDecision,
    SequentialOutcome, StatsConfig, ZTestResult,
};
pub use store::{
    AuditRow, ConversionSummary, SqliteExperimentStore, SqliteExperimentStoreBuilder,
    VariantTotals,
};
pub use variants::{
    generate_landing_page_variants, generate_rsa_variants, page_similarity, rsa_similarity,
    LandingPageCreative, RsaCreative, VariantStrategy,
};

#[derive(Debug, Error)]
pub enum ExperimentError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("experiment {experiment_id} not found")]
    NotFound { experiment_id: String },
    #[error("experiment store path not configured")]
    MissingStore,
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("transition:{from}->{to} is not allowed")]
    InvalidTransition { from: String, to: String },
    #[error("guard:{name} failed: {message}")]
    GuardFailed { name: String, message: String },
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("winner '{0}' does not match any variant or 'control'")]
    UnknownWinner(String),
    #[error("statistics error: {0}")]
    Stats(String),
    #[error("insufficient data: {0}")]
    InsufficientData(String),
}

pub type ExperimentResult<T> = std::result::Result<T, ExperimentError>;
