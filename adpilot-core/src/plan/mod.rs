mod artifacts;
mod connectors;
mod models;
mod orchestrator;

use std::path::PathBuf;

use thiserror::Error;

pub use artifacts::{round_money, round_rate, round_score, ArtifactWriter, PlanArtifacts};
pub use connectors::{
    EstimatedConnector, FixtureKeywordConnector, FixtureSerpConnector, KeywordConnector,
    SerpConnector, SerpSnapshot, SyntheticSerpConnector,
};
pub use models::{
    AdGroupKeyword, AdGroupPlan, CompetitorEntry, CompetitorReport, PlanRunOutcome, PlanSummary,
    TopOpportunity,
};
pub use orchestrator::{PlanOptions, PlanOrchestrator};

use crate::cache::CacheError;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("config error: {0}")]
    Config(#[from] crate::error::ConfigError),
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("connector {name} failed: {message}")]
    Connector { name: String, message: String },
    #[error("plan run cancelled before artifact emission")]
    Cancelled,
    #[error("collection task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("fixture {path} is malformed: {message}")]
    Fixture { path: PathBuf, message: String },
}

pub type PlanResult<T> = std::result::Result<T, PlanError>;
