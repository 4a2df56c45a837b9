use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// Top-level pipeline configuration, loaded from `adpilot.toml`.
///
/// Every section rejects unknown keys at parse time so a typo in an
/// operator-edited file fails loudly instead of silently falling back to a
/// default.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct AdpilotConfig {
    pub paths: PathsSection,
    pub quota: QuotaSection,
    pub scoring: ScoringSection,
    pub clustering: ClusteringSection,
    pub experiment: ExperimentSection,
    pub anomaly: AnomalySection,
    pub waste: WasteSection,
    pub guardrail: GuardrailSection,
    pub approval: ApprovalSection,
}

impl Default for AdpilotConfig {
    fn default() -> Self {
        Self {
            paths: PathsSection::default(),
            quota: QuotaSection::default(),
            scoring: ScoringSection::default(),
            clustering: ClusteringSection::default(),
            experiment: ExperimentSection::default(),
            anomaly: AnomalySection::default(),
            waste: WasteSection::default(),
            guardrail: GuardrailSection::default(),
            approval: ApprovalSection::default(),
        }
    }
}

impl AdpilotConfig {
    pub fn resolve_path<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        let path = candidate.as_ref();
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            Path::new(&self.paths.data_dir).join(path)
        }
    }

    pub fn validate(&self, origin: &Path) -> ConfigResult<()> {
        let fail = |reason: String| ConfigError::rejected(origin, reason);

        let weights = &self.scoring.weights;
        for (label, value) in [
            ("volume", weights.volume),
            ("intent", weights.intent),
            ("long_tail", weights.long_tail),
            ("competition", weights.competition),
            ("serp_blockers", weights.serp_blockers),
            ("source_penalty", weights.source_penalty),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(fail(format!("scoring weight {label} must be in [0, 1]")));
            }
        }

        if !(0.0 < self.experiment.default_confidence
            && self.experiment.default_confidence < 1.0)
        {
            return Err(fail(
                "experiment.default_confidence must be inside (0, 1)".to_string(),
            ));
        }
        if self.experiment.monte_carlo_samples == 0 {
            return Err(fail(
                "experiment.monte_carlo_samples must be positive".to_string(),
            ));
        }

        let tiers = &self.approval.tiers;
        if !(tiers.low < tiers.medium && tiers.medium < tiers.high && tiers.high < tiers.critical)
        {
            return Err(fail(
                "approval.tiers must be strictly ascending low < medium < high < critical"
                    .to_string(),
            ));
        }
        for (severity, row) in [
            ("low", &self.approval.matrix.low),
            ("medium", &self.approval.matrix.medium),
            ("high", &self.approval.matrix.high),
            ("critical", &self.approval.matrix.critical),
        ] {
            if row.required_approvals == 0 {
                return Err(fail(format!(
                    "approval.matrix.{severity}.required_approvals must be at least 1"
                )));
            }
            if row.approvers.is_empty() {
                return Err(fail(format!(
                    "approval.matrix.{severity}.approvers must not be empty"
                )));
            }
            if row.required_approvals as usize > row.approvers.len() {
                return Err(fail(format!(
                    "approval.matrix.{severity}: required_approvals exceeds approver set"
                )));
            }
        }
        if self.approval.expiration_hours == 0 {
            return Err(fail("approval.expiration_hours must be positive".to_string()));
        }

        if self.guardrail.max_change_pct <= 0.0 {
            return Err(fail("guardrail.max_change_pct must be positive".to_string()));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct PathsSection {
    pub data_dir: String,
    pub plans_dir: String,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
            plans_dir: "plans".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct QuotaSection {
    pub serp_calls_per_day: u64,
    pub keyword_calls_per_day: u64,
    pub cache_ttl_hours: i64,
}

impl Default for QuotaSection {
    fn default() -> Self {
        Self {
            serp_calls_per_day: 250,
            keyword_calls_per_day: 500,
            cache_ttl_hours: 24,
        }
    }
}

/// Weights for the multi-factor keyword score. Positive terms reward,
/// negative terms penalize; the final score is clamped to [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct ScoringWeights {
    pub volume: f64,
    pub intent: f64,
    pub long_tail: f64,
    pub competition: f64,
    pub serp_blockers: f64,
    pub source_penalty: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            volume: 0.35,
            intent: 0.25,
            long_tail: 0.15,
            competition: 0.15,
            serp_blockers: 0.10,
            source_penalty: 0.10,
        }
    }
}

/// Ranked intent dictionaries. The highest tier containing the longest
/// match inside a keyword decides the intent multiplier.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct IntentDictionaries {
    pub extension: Vec<String>,
    pub transactional: Vec<String>,
    pub commercial: Vec<String>,
    pub informational: Vec<String>,
}

impl Default for IntentDictionaries {
    fn default() -> Self {
        Self {
            extension: [
                "chrome extension",
                "firefox addon",
                "edge extension",
                "browser extension",
                "chrome plugin",
                "chrome addon",
            ]
            .map(str::to_string)
            .to_vec(),
            transactional: [
                "download",
                "install",
                "converter",
                "buy",
                "free tool",
                "online tool",
            ]
            .map(str::to_string)
            .to_vec(),
            commercial: [
                "best",
                "top",
                "vs",
                "alternative",
                "review",
                "compare",
                "pricing",
            ]
            .map(str::to_string)
            .to_vec(),
            informational: ["how to", "what is", "guide", "tutorial", "examples"]
                .map(str::to_string)
                .to_vec(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct ScoringSection {
    pub weights: ScoringWeights,
    pub intent: IntentDictionaries,
    /// SERP features that shrink reachable organic/paid real estate,
    /// weighted by how much of the page they consume.
    pub serp_feature_weights: BTreeMap<String, f64>,
    pub source_penalties: SourcePenalties,
}

impl Default for ScoringSection {
    fn default() -> Self {
        let serp_feature_weights = [
            ("ai_overview", 0.4),
            ("featured_snippet", 0.3),
            ("local_pack", 0.3),
            ("shopping_results", 0.25),
            ("people_also_ask", 0.2),
            ("video_results", 0.2),
            ("knowledge_panel", 0.15),
        ]
        .into_iter()
        .map(|(name, weight)| (name.to_string(), weight))
        .collect();
        Self {
            weights: ScoringWeights::default(),
            intent: IntentDictionaries::default(),
            serp_feature_weights,
            source_penalties: SourcePenalties::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct SourcePenalties {
    pub kwp: f64,
    pub gsc: f64,
    pub estimated: f64,
}

impl Default for SourcePenalties {
    fn default() -> Self {
        Self {
            kwp: 0.0,
            gsc: 0.1,
            estimated: 0.35,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct ClusteringSection {
    pub min_cluster_size: usize,
    pub primary_keyword_count: usize,
}

impl Default for ClusteringSection {
    fn default() -> Self {
        Self {
            min_cluster_size: 2,
            primary_keyword_count: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct ExperimentSection {
    pub default_confidence: f64,
    pub default_min_sample_size: u64,
    pub max_similarity_to_control: f64,
    pub monte_carlo_samples: u32,
    pub sequential_peeks: u32,
    pub futility_floor: f64,
    pub min_duration_days: i64,
    pub daily_spend_ceiling: f64,
}

impl Default for ExperimentSection {
    fn default() -> Self {
        Self {
            default_confidence: 0.95,
            default_min_sample_size: 1000,
            max_similarity_to_control: 0.9,
            monte_carlo_samples: 10_000,
            sequential_peeks: 5,
            futility_floor: 0.05,
            min_duration_days: 7,
            daily_spend_ceiling: 100.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct AnomalySection {
    pub ring_capacity: usize,
    pub cooldown_minutes: i64,
}

impl Default for AnomalySection {
    fn default() -> Self {
        Self {
            ring_capacity: 1000,
            cooldown_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct WasteSection {
    pub min_cost: f64,
    pub min_impressions: u64,
    pub low_ctr: f64,
    pub exact_confidence_threshold: f64,
}

impl Default for WasteSection {
    fn default() -> Self {
        Self {
            min_cost: 10.0,
            min_impressions: 100,
            low_ctr: 0.005,
            exact_confidence_threshold: 0.8,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct GuardrailSection {
    pub daily_cap_aud: f64,
    pub daily_cap_usd: f64,
    pub daily_cap_gbp: f64,
    pub max_change_pct: f64,
    pub min_quality_score: f64,
    pub min_landing_page_health: f64,
    pub claims_max_age_days: i64,
}

impl Default for GuardrailSection {
    fn default() -> Self {
        Self {
            daily_cap_aud: 50.0,
            daily_cap_usd: 40.0,
            daily_cap_gbp: 30.0,
            max_change_pct: 25.0,
            min_quality_score: 3.0,
            min_landing_page_health: 0.6,
            claims_max_age_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct BudgetTiers {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for BudgetTiers {
    fn default() -> Self {
        Self {
            low: 100.0,
            medium: 1_000.0,
            high: 5_000.0,
            critical: 10_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct ApprovalMatrixRow {
    pub required_approvals: u32,
    pub approvers: Vec<String>,
    pub escalation_after_hours: i64,
}

impl Default for ApprovalMatrixRow {
    fn default() -> Self {
        Self {
            required_approvals: 1,
            approvers: vec!["ops".to_string()],
            escalation_after_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct ApprovalMatrix {
    pub low: ApprovalMatrixRow,
    pub medium: ApprovalMatrixRow,
    pub high: ApprovalMatrixRow,
    pub critical: ApprovalMatrixRow,
}

impl Default for ApprovalMatrix {
    fn default() -> Self {
        Self {
            low: ApprovalMatrixRow {
                required_approvals: 1,
                approvers: vec!["ops".to_string()],
                escalation_after_hours: 24,
            },
            medium: ApprovalMatrixRow {
                required_approvals: 1,
                approvers: vec!["ops".to_string(), "marketing-lead".to_string()],
                escalation_after_hours: 12,
            },
            high: ApprovalMatrixRow {
                required_approvals: 2,
                approvers: vec![
                    "ops".to_string(),
                    "marketing-lead".to_string(),
                    "admin".to_string(),
                ],
                escalation_after_hours: 6,
            },
            critical: ApprovalMatrixRow {
                required_approvals: 3,
                approvers: vec![
                    "ops".to_string(),
                    "marketing-lead".to_string(),
                    "admin".to_string(),
                    "finance".to_string(),
                ],
                escalation_after_hours: 2,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct AutoApprovalSection {
    pub enabled: bool,
    pub allowlist: Vec<String>,
    pub max_budget_delta: f64,
}

impl Default for AutoApprovalSection {
    fn default() -> Self {
        Self {
            enabled: false,
            allowlist: Vec::new(),
            max_budget_delta: 100.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields, default)]
pub struct ApprovalSection {
    pub tiers: BudgetTiers,
    pub matrix: ApprovalMatrix,
    pub auto: AutoApprovalSection,
    pub expiration_hours: i64,
    pub administrators: Vec<String>,
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self {
            tiers: BudgetTiers::default(),
            matrix: ApprovalMatrix::default(),
            auto: AutoApprovalSection::default(),
            expiration_hours: 48,
            administrators: vec!["admin".to_string()],
        }
    }
}

/// Per-product configuration: seed queries, target pages, brand strings.
/// Shipped as its own document so one pipeline install serves a portfolio.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ProductConfig {
    pub name: String,
    pub markets: Vec<String>,
    pub seed_queries: Vec<String>,
    pub target_pages: Vec<TargetPage>,
    #[serde(default)]
    pub value_propositions: Vec<String>,
    #[serde(default)]
    pub pre_seeded_negatives: Vec<String>,
    #[serde(default)]
    pub brand_terms: Vec<String>,
    /// Anchor string pinned into the first headline of every RSA variant.
    pub anchor_headline: String,
}

impl ProductConfig {
    pub fn validate(&self, origin: &Path) -> ConfigResult<()> {
        let fail = |reason: String| ConfigError::rejected(origin, reason);
        if self.name.trim().is_empty() {
            return Err(fail("product name must not be empty".to_string()));
        }
        if self.markets.is_empty() {
            return Err(fail("at least one market is required".to_string()));
        }
        if self.seed_queries.is_empty() {
            return Err(fail("at least one seed query is required".to_string()));
        }
        if self.anchor_headline.trim().is_empty() {
            return Err(fail("anchor_headline must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn primary_market(&self) -> &str {
        self.markets.first().map(String::as_str).unwrap_or("US")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct TargetPage {
    pub url: String,
    pub purpose: String,
    #[serde(default)]
    pub use_case: Option<String>,
}

fn load_toml<T: DeserializeOwned>(path: &Path) -> ConfigResult<T> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigError::Toml {
        path: path.to_path_buf(),
        source,
    })
}

pub fn load_adpilot_config<P: AsRef<Path>>(path: P) -> ConfigResult<AdpilotConfig> {
    let path = path.as_ref();
    let config: AdpilotConfig = load_toml(path)?;
    config.validate(path)?;
    Ok(config)
}

pub fn load_product_config<P: AsRef<Path>>(path: P) -> ConfigResult<ProductConfig> {
    let path = path.as_ref();
    let product: ProductConfig = load_toml(path)?;
    product.validate(path)?;
    Ok(product)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(content: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = AdpilotConfig::default();
        assert!((config.scoring.weights.volume - 0.35).abs() < f64::EPSILON);
        assert_eq!(config.approval.expiration_hours, 48);
        assert_eq!(config.approval.matrix.critical.required_approvals, 3);
        assert_eq!(config.guardrail.max_change_pct, 25.0);
        assert_eq!(
            config.scoring.serp_feature_weights.get("ai_overview"),
            Some(&0.4)
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let (_dir, path) = write_temp("[scoring]\nbogus_option = 1\n");
        let err = load_adpilot_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Toml { .. }));
    }

    #[test]
    fn invalid_confidence_is_rejected() {
        let (_dir, path) = write_temp("[experiment]\ndefault_confidence = 1.5\n");
        let err = load_adpilot_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Rejected { .. }));
    }

    #[test]
    fn product_config_round_trips() {
        let (_dir, path) = write_temp(
            r#"
name = "webp-shift"
markets = ["US", "AU"]
seed_queries = ["webp to png", "image converter"]
anchor_headline = "WebP Shift Converter"

[[target_pages]]
url = "https://example.com/webp-to-png"
purpose = "conversion landing"
use_case = "webp-to-png"
"#,
        );
        let product = load_product_config(&path).unwrap();
        assert_eq!(product.primary_market(), "US");
        assert_eq!(product.target_pages.len(), 1);
    }

    #[test]
    fn empty_markets_fail_validation() {
        let (_dir, path) = write_temp(
            "name = \"x\"\nmarkets = []\nseed_queries = [\"q\"]\nanchor_headline = \"A\"\ntarget_pages = []\n",
        );
        assert!(matches!(
            load_product_config(&path).unwrap_err(),
            ConfigError::Rejected { .. }
        ));
    }
}
