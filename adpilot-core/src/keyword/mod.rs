mod cluster;
mod merge;
mod models;
mod scoring;

use thiserror::Error;

pub use cluster::{Cluster, ClusterEngine, ClusterOutcome};
pub use merge::{precedence_merge, MergeDiagnostic, MergeOutcome};
pub use models::{
    normalize_keyword, significant_word_count, DataSource, KeywordRecord, MatchType,
};
pub use scoring::{KeywordScorer, ScoreBreakdown};

#[derive(Debug, Error)]
pub enum KeywordError {
    #[error("unknown data source: {0}")]
    UnknownSource(String),
    #[error("unknown match type: {0}")]
    UnknownMatchType(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type KeywordResult<T> = std::result::Result<T, KeywordError>;
