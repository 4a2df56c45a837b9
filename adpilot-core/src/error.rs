use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures raised while loading the pipeline or product TOML documents.
/// Every variant names the offending file so an operator can trace a
/// typo straight to the document that carries it.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("{path} is not valid TOML: {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("{path} rejected: {reason}")]
    Rejected { path: PathBuf, reason: String },
}

impl ConfigError {
    pub fn rejected(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        ConfigError::Rejected {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
