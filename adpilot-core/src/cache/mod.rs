mod store;

use std::path::PathBuf;

use thiserror::Error;

pub use store::{SqliteCacheStore, SqliteCacheStoreBuilder};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache store path not configured")]
    MissingStore,
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("quota exhausted for {api}: {used}/{ceiling} daily calls")]
    QuotaExhausted { api: String, used: u64, ceiling: u64 },
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;

/// Outcome of a content-cache read. Payloads are stored as opaque text;
/// callers deserialize them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Hit(String),
    Miss,
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheLookup::Hit(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaUsage {
    pub api: String,
    pub used: u64,
    pub ceiling: u64,
}

impl QuotaUsage {
    pub fn remaining(&self) -> u64 {
        self.ceiling.saturating_sub(self.used)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
