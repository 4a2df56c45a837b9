use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;

use super::KeywordError;

/// Origin of a keyword record. Precedence (high to low): KWP > GSC >
/// ESTIMATED; the merger resolves duplicates with it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataSource {
    Kwp,
    Gsc,
    Estimated,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::Kwp => "KWP",
            DataSource::Gsc => "GSC",
            DataSource::Estimated => "ESTIMATED",
        }
    }

    pub fn precedence(&self) -> u8 {
        match self {
            DataSource::Kwp => 3,
            DataSource::Gsc => 2,
            DataSource::Estimated => 1,
        }
    }
}

impl fmt::Display for DataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataSource {
    type Err = KeywordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "KWP" => Ok(DataSource::Kwp),
            "GSC" => Ok(DataSource::Gsc),
            "ESTIMATED" => Ok(DataSource::Estimated),
            other => Err(KeywordError::UnknownSource(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Phrase,
    Broad,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchType::Exact => "exact",
            MatchType::Phrase => "phrase",
            MatchType::Broad => "broad",
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchType {
    type Err = KeywordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(MatchType::Exact),
            "phrase" => Ok(MatchType::Phrase),
            "broad" => Ok(MatchType::Broad),
            other => Err(KeywordError::UnknownMatchType(other.to_string())),
        }
    }
}

/// NFC-normalized, lowercased, whitespace-collapsed keyword text. Every
/// record entering the pipeline passes through here so dedup keys compare
/// byte-for-byte.
pub fn normalize_keyword(raw: &str) -> String {
    raw.nfc()
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

const STOPWORDS: &[&str] = &["to", "for", "a", "an", "the", "of", "in", "on", "and", "or"];

/// Token count with filler words removed; drives the long-tail term and
/// the match-type recommendation.
pub fn significant_word_count(keyword: &str) -> usize {
    keyword
        .split_whitespace()
        .filter(|word| !STOPWORDS.contains(word))
        .count()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeywordRecord {
    pub keyword: String,
    pub data_source: DataSource,
    /// Ordered market list; the first entry is the primary market used in
    /// dedup keys.
    pub markets: Vec<String>,
    pub volume: Option<u64>,
    pub cpc: Option<f64>,
    pub competition: Option<f64>,
    #[serde(default = "default_intent")]
    pub intent_score: f64,
    #[serde(default)]
    pub final_score: f64,
    #[serde(default = "default_match_type")]
    pub recommended_match_type: MatchType,
    #[serde(default)]
    pub serp_features: BTreeSet<String>,
    #[serde(default)]
    pub cluster: Option<String>,
}

fn default_intent() -> f64 {
    1.0
}

fn default_match_type() -> MatchType {
    MatchType::Broad
}

impl KeywordRecord {
    pub fn new(keyword: impl AsRef<str>, data_source: DataSource, market: impl Into<String>) -> Self {
        Self {
            keyword: normalize_keyword(keyword.as_ref()),
            data_source,
            markets: vec![market.into()],
            volume: None,
            cpc: None,
            competition: None,
            intent_score: 1.0,
            final_score: 0.0,
            recommended_match_type: MatchType::Broad,
            serp_features: BTreeSet::new(),
            cluster: None,
        }
    }

    pub fn primary_market(&self) -> &str {
        self.markets.first().map(String::as_str).unwrap_or("")
    }

    /// Uniqueness key across a merged set.
    pub fn dedup_key(&self) -> (String, String) {
        (self.keyword.clone(), self.primary_market().to_string())
    }
}
