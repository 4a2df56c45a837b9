mod detector;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use detector::AnomalyDetector;

#[derive(Debug, Error)]
pub enum AnomalyError {
    #[error("rule {0} is misconfigured: {1}")]
    RuleConfig(String, String),
}

pub type AnomalyResult<T> = std::result::Result<T, AnomalyError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyType {
    Performance,
    Budget,
    Traffic,
    Conversion,
    Quality,
    Security,
}

impl AnomalyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyType::Performance => "PERFORMANCE",
            AnomalyType::Budget => "BUDGET",
            AnomalyType::Traffic => "TRAFFIC",
            AnomalyType::Conversion => "CONVERSION",
            AnomalyType::Quality => "QUALITY",
            AnomalyType::Security => "SECURITY",
        }
    }
}

impl fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    /// Severity tiers from the relative deviation (in percent) between
    /// observed and expected.
    pub fn from_deviation(deviation_pct: f64) -> Self {
        let magnitude = deviation_pct.abs();
        if magnitude >= 150.0 {
            Severity::Critical
        } else if magnitude >= 100.0 {
            Severity::High
        } else if magnitude >= 50.0 {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeSeriesPoint {
    pub metric_key: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Anomaly {
    pub id: String,
    pub metric_key: String,
    pub rule_id: String,
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub observed: f64,
    pub expected: f64,
    pub threshold: f64,
    pub deviation_pct: f64,
    pub confidence: f64,
    pub possible_causes: Vec<String>,
    pub recommendations: Vec<String>,
    pub detected_at: DateTime<Utc>,
}

/// Rule families applied to each matching metric stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleKind {
    /// Baseline mean of the trailing window, flagged above
    /// `baseline * multiplier`.
    Threshold { baseline_period: usize, multiplier: f64 },
    /// Z-score against the trailing window.
    Statistical {
        window_size: usize,
        minimum_points: usize,
        z_threshold: f64,
    },
    /// Linear trend over the trailing window; percent change beyond the
    /// inflation threshold (up) or minimum decline (down, negative).
    Trend {
        trend_period: usize,
        inflation_threshold: f64,
        minimum_decline: f64,
    },
    /// Same-phase comparison against prior cycles of length `period`.
    Seasonal {
        period: usize,
        cycles: usize,
        threshold: f64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnomalyRule {
    pub id: String,
    /// Metric selector: an exact key, or a prefix ending in `*`.
    pub metric: String,
    pub anomaly_type: AnomalyType,
    pub kind: RuleKind,
    pub enabled: bool,
}

impl AnomalyRule {
    pub fn matches(&self, metric_key: &str) -> bool {
        match self.metric.strip_suffix('*') {
            Some(prefix) => metric_key.starts_with(prefix),
            None => self.metric == metric_key,
        }
    }
}
