use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::ExperimentError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentType {
    Rsa,
    LandingPage,
}

impl ExperimentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentType::Rsa => "rsa",
            ExperimentType::LandingPage => "landing_page",
        }
    }
}

impl fmt::Display for ExperimentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExperimentType {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rsa" => Ok(ExperimentType::Rsa),
            "landing_page" => Ok(ExperimentType::LandingPage),
            other => Err(ExperimentError::Validation(format!(
                "unknown experiment type: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Draft,
    Active,
    Paused,
    Completed,
    Aborted,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::Draft => "draft",
            ExperimentStatus::Active => "active",
            ExperimentStatus::Paused => "paused",
            ExperimentStatus::Completed => "completed",
            ExperimentStatus::Aborted => "aborted",
        }
    }

    pub fn terminal(&self) -> bool {
        matches!(self, ExperimentStatus::Completed | ExperimentStatus::Aborted)
    }

    /// The lifecycle admits exactly these edges; everything else is a
    /// state conflict.
    pub fn can_transition_to(&self, next: ExperimentStatus) -> bool {
        use ExperimentStatus::*;
        matches!(
            (self, next),
            (Draft, Active)
                | (Active, Paused)
                | (Paused, Active)
                | (Active, Completed)
                | (Active, Aborted)
                | (Paused, Aborted)
        )
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExperimentStatus {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(ExperimentStatus::Draft),
            "active" => Ok(ExperimentStatus::Active),
            "paused" => Ok(ExperimentStatus::Paused),
            "completed" => Ok(ExperimentStatus::Completed),
            "aborted" => Ok(ExperimentStatus::Aborted),
            other => Err(ExperimentError::Validation(format!(
                "unknown experiment status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TargetMetric {
    Ctr,
    Cvr,
    CwsClickRate,
}

impl TargetMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetMetric::Ctr => "ctr",
            TargetMetric::Cvr => "cvr",
            TargetMetric::CwsClickRate => "cws_click_rate",
        }
    }
}

impl fmt::Display for TargetMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetMetric {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ctr" => Ok(TargetMetric::Ctr),
            "cvr" => Ok(TargetMetric::Cvr),
            "cws_click_rate" => Ok(TargetMetric::CwsClickRate),
            other => Err(ExperimentError::Validation(format!(
                "unknown target metric: {other}"
            ))),
        }
    }
}

/// Type-specific creative payload. Variants are stored under their
/// experiment's id; nothing holds a back-reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VariantPayload {
    Rsa {
        headlines: Vec<String>,
        descriptions: Vec<String>,
        final_urls: Vec<String>,
        labels: Vec<String>,
    },
    LandingPage {
        content_path: String,
        routing_rules: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Variant {
    pub id: String,
    pub name: String,
    pub is_control: bool,
    pub weight: f64,
    pub similarity_to_control: f64,
    pub payload: VariantPayload,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GuardConfig {
    pub min_sample_size: u64,
    pub min_duration_days: i64,
    pub max_similarity: f64,
    pub daily_spend_ceiling: f64,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            min_sample_size: 1000,
            min_duration_days: 7,
            max_similarity: 0.9,
            daily_spend_ceiling: 100.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Experiment {
    pub id: String,
    pub experiment_type: ExperimentType,
    pub product: String,
    pub target_id: String,
    pub status: ExperimentStatus,
    pub target_metric: TargetMetric,
    pub variants: Vec<Variant>,
    pub min_sample_size: u64,
    pub confidence_level: f64,
    pub guards: GuardConfig,
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub winner_variant_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Experiment {
    pub fn control(&self) -> Option<&Variant> {
        self.variants.iter().find(|variant| variant.is_control)
    }

    pub fn variant(&self, id_or_name: &str) -> Option<&Variant> {
        self.variants
            .iter()
            .find(|variant| variant.id == id_or_name || variant.name == id_or_name)
    }

    /// Draft invariants: ids unique, at most one control, weights sane.
    /// A draft may be empty; activation additionally requires at least
    /// two variants, exactly one control, and weights summing to one.
    pub fn validate_draft(&self) -> Result<(), ExperimentError> {
        if !(0.0 < self.confidence_level && self.confidence_level < 1.0) {
            return Err(ExperimentError::Validation(
                "confidence_level must be inside (0, 1)".to_string(),
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for variant in &self.variants {
            if !seen.insert(variant.id.as_str()) {
                return Err(ExperimentError::Validation(format!(
                    "duplicate variant id: {}",
                    variant.id
                )));
            }
            if variant.weight < 0.0 {
                return Err(ExperimentError::Validation(format!(
                    "variant {} has negative weight",
                    variant.id
                )));
            }
        }
        if self.variants.iter().filter(|variant| variant.is_control).count() > 1 {
            return Err(ExperimentError::Validation(
                "at most one control variant is allowed".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validate_for_activation(&self) -> Result<(), ExperimentError> {
        self.validate_draft()?;
        if self.variants.len() < 2 {
            return Err(ExperimentError::Validation(
                "an active experiment needs at least two variants".to_string(),
            ));
        }
        let controls = self.variants.iter().filter(|variant| variant.is_control).count();
        if controls != 1 {
            return Err(ExperimentError::Validation(format!(
                "exactly one control required, found {controls}"
            )));
        }
        let weight_sum: f64 = self.variants.iter().map(|variant| variant.weight).sum();
        if (weight_sum - 1.0).abs() > 0.01 {
            return Err(ExperimentError::Validation(format!(
                "variant weights must sum to 1 +/- 0.01, got {weight_sum:.4}"
            )));
        }
        Ok(())
    }
}

/// One day of observed metrics for one variant. The `(experiment,
/// variant, date)` tuple is the primary key; re-recording a day replaces
/// it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricPoint {
    pub experiment_id: String,
    pub variant_id: String,
    pub date: NaiveDate,
    pub impressions: u64,
    pub clicks: u64,
    pub cost: f64,
    pub conversions: u64,
    pub conversion_value: f64,
    pub view_through_conversions: u64,
}
