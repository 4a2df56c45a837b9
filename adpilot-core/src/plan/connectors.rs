use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::keyword::{normalize_keyword, DataSource, KeywordRecord};

use super::{PlanError, PlanResult};

/// A keyword data source. Production deployments wrap remote planner and
/// search-console APIs behind this contract; the core ships the offline
/// fixture and estimation connectors.
pub trait KeywordConnector: Send + Sync {
    /// Logical API name charged against the quota ledger.
    fn api(&self) -> &str;
    /// Endpoint identity for cache addressing.
    fn endpoint(&self) -> &str;
    fn source(&self) -> DataSource;
    fn fetch(&self, query: &str, market: &str) -> PlanResult<Vec<KeywordRecord>>;
}

/// SERP snapshot returned by the competitor-analysis connector.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SerpSnapshot {
    pub features: BTreeSet<String>,
    pub competitors: Vec<String>,
}

pub trait SerpConnector: Send + Sync {
    fn endpoint(&self) -> &str;
    fn fetch(&self, keyword: &str, market: &str) -> PlanResult<SerpSnapshot>;
}

#[derive(Debug, Clone, Deserialize)]
struct FixtureRow {
    query: String,
    market: String,
    keyword: String,
    #[serde(default)]
    volume: Option<u64>,
    #[serde(default)]
    cpc: Option<f64>,
    #[serde(default)]
    competition: Option<f64>,
    #[serde(default)]
    serp_features: Vec<String>,
}

/// Deserialized keyword fixture, used in place of live planner or
/// search-console transports.
#[derive(Debug, Clone)]
pub struct FixtureKeywordConnector {
    api: String,
    endpoint: String,
    source: DataSource,
    rows: Vec<FixtureRow>,
}

impl FixtureKeywordConnector {
    pub fn from_file(
        api: impl Into<String>,
        endpoint: impl Into<String>,
        source: DataSource,
        path: impl AsRef<Path>,
    ) -> PlanResult<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let rows: Vec<FixtureRow> =
            serde_json::from_str(&raw).map_err(|err| PlanError::Fixture {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
        Ok(Self {
            api: api.into(),
            endpoint: endpoint.into(),
            source,
            rows,
        })
    }
}

impl KeywordConnector for FixtureKeywordConnector {
    fn api(&self) -> &str {
        &self.api
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn source(&self) -> DataSource {
        self.source
    }

    fn fetch(&self, query: &str, market: &str) -> PlanResult<Vec<KeywordRecord>> {
        let query = normalize_keyword(query);
        let mut records = Vec::new();
        for row in &self.rows {
            if normalize_keyword(&row.query) != query || row.market != market {
                continue;
            }
            let mut record = KeywordRecord::new(&row.keyword, self.source, market);
            record.volume = row.volume;
            record.cpc = row.cpc;
            record.competition = row.competition;
            record.serp_features = row.serp_features.iter().cloned().collect();
            records.push(record);
        }
        Ok(records)
    }
}

fn stable_hash(input: &str) -> u64 {
    let digest = Sha256::digest(input.as_bytes());
    u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}

const ESTIMATED_SUFFIXES: &[&str] = &["", "chrome extension", "online", "converter", "free"];

/// Derives ESTIMATED records from seed queries when no external source
/// covers them. Volumes and competition are hash-derived so runs are
/// reproducible without any network access.
#[derive(Debug, Clone, Default)]
pub struct EstimatedConnector;

impl EstimatedConnector {
    pub fn new() -> Self {
        Self
    }
}

impl KeywordConnector for EstimatedConnector {
    fn api(&self) -> &str {
        "keyword_calls"
    }

    fn endpoint(&self) -> &str {
        "estimated"
    }

    fn source(&self) -> DataSource {
        DataSource::Estimated
    }

    fn fetch(&self, query: &str, market: &str) -> PlanResult<Vec<KeywordRecord>> {
        let query = normalize_keyword(query);
        let mut records = Vec::new();
        for suffix in ESTIMATED_SUFFIXES {
            let keyword = if suffix.is_empty() {
                query.clone()
            } else {
                format!("{query} {suffix}")
            };
            let keyword = normalize_keyword(&keyword);
            let hash = stable_hash(&format!("{keyword}|{market}"));
            let mut record = KeywordRecord::new(&keyword, DataSource::Estimated, market);
            record.volume = Some(50 + hash % 950);
            record.competition = Some(((hash >> 8) % 60) as f64 / 100.0);
            records.push(record);
        }
        Ok(records)
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SerpFixtureRow {
    keyword: String,
    market: String,
    #[serde(default)]
    features: Vec<String>,
    #[serde(default)]
    competitors: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FixtureSerpConnector {
    endpoint: String,
    rows: Vec<SerpFixtureRow>,
}

impl FixtureSerpConnector {
    pub fn from_file(endpoint: impl Into<String>, path: impl AsRef<Path>) -> PlanResult<Self> {
        let path: &Path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let rows: Vec<SerpFixtureRow> =
            serde_json::from_str(&raw).map_err(|err| PlanError::Fixture {
                path: PathBuf::from(path),
                message: err.to_string(),
            })?;
        Ok(Self {
            endpoint: endpoint.into(),
            rows,
        })
    }
}

impl SerpConnector for FixtureSerpConnector {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn fetch(&self, keyword: &str, market: &str) -> PlanResult<SerpSnapshot> {
        let keyword = normalize_keyword(keyword);
        for row in &self.rows {
            if normalize_keyword(&row.keyword) == keyword && row.market == market {
                return Ok(SerpSnapshot {
                    features: row.features.iter().cloned().collect(),
                    competitors: row.competitors.clone(),
                });
            }
        }
        Ok(SerpSnapshot::default())
    }
}

const SYNTHETIC_FEATURES: &[&str] = &[
    "ai_overview",
    "featured_snippet",
    "people_also_ask",
    "video_results",
];

const SYNTHETIC_COMPETITORS: &[&str] = &[
    "cloudconvert.com",
    "convertio.co",
    "online-convert.com",
    "smallpdf.com",
    "zamzar.com",
    "freeconvert.com",
];

/// Hash-derived SERP snapshots for fully offline runs: the same keyword
/// and market always observe the same page shape.
#[derive(Debug, Clone, Default)]
pub struct SyntheticSerpConnector;

impl SyntheticSerpConnector {
    pub fn new() -> Self {
        Self
    }
}

impl SerpConnector for SyntheticSerpConnector {
    fn endpoint(&self) -> &str {
        "serp-synthetic"
    }

    fn fetch(&self, keyword: &str, market: &str) -> PlanResult<SerpSnapshot> {
        let hash = stable_hash(&format!("serp|{}|{market}", normalize_keyword(keyword)));
        let mut features = BTreeSet::new();
        for (bit, feature) in SYNTHETIC_FEATURES.iter().enumerate() {
            if hash >> bit & 1 == 1 {
                features.insert((*feature).to_string());
            }
        }
        let mut competitors = Vec::new();
        let start = (hash % SYNTHETIC_COMPETITORS.len() as u64) as usize;
        for offset in 0..3 {
            competitors
                .push(SYNTHETIC_COMPETITORS[(start + offset) % SYNTHETIC_COMPETITORS.len()].to_string());
        }
        Ok(SerpSnapshot {
            features,
            competitors,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimated_connector_is_deterministic() {
        let connector = EstimatedConnector::new();
        let first = connector.fetch("webp to png", "US").unwrap();
        let second = connector.fetch("webp to png", "US").unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), ESTIMATED_SUFFIXES.len());
        assert!(first.iter().all(|r| r.data_source == DataSource::Estimated));
        assert!(first.iter().all(|r| r.volume.unwrap() >= 50));

        let other_market = connector.fetch("webp to png", "AU").unwrap();
        assert_ne!(first[0].volume, other_market[0].volume);
    }

    #[test]
    fn fixture_connector_filters_by_query_and_market() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kwp.json");
        fs::write(
            &path,
            r#"[
                {"query": "webp to png", "market": "US", "keyword": "webp to png converter", "volume": 1200, "cpc": 0.8},
                {"query": "webp to png", "market": "AU", "keyword": "webp to png tool", "volume": 300},
                {"query": "color picker", "market": "US", "keyword": "color picker extension", "volume": 900}
            ]"#,
        )
        .unwrap();
        let connector =
            FixtureKeywordConnector::from_file("keyword_calls", "kwp", DataSource::Kwp, &path)
                .unwrap();
        let rows = connector.fetch("Webp  To PNG", "US").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].keyword, "webp to png converter");
        assert_eq!(rows[0].volume, Some(1200));
    }

    #[test]
    fn synthetic_serp_is_stable() {
        let connector = SyntheticSerpConnector::new();
        let a = connector.fetch("webp to png", "US").unwrap();
        let b = connector.fetch("webp to png", "US").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.competitors.len(), 3);
    }

    #[test]
    fn malformed_fixture_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{not json").unwrap();
        let err = FixtureKeywordConnector::from_file("keyword_calls", "kwp", DataSource::Kwp, &path)
            .unwrap_err();
        assert!(matches!(err, PlanError::Fixture { .. }));
    }
}
