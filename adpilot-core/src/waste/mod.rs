mod analyzer;

use thiserror::Error;

pub use analyzer::{
    CategorizedTerm, NegativeLevel, NegativeRecommendation, SearchTermRow, WasteAnalyzer,
    WasteCategory, WasteReport,
};

#[derive(Debug, Error)]
pub enum WasteError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
}

pub type WasteResult<T> = std::result::Result<T, WasteError>;
