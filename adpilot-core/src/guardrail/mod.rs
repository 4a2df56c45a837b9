mod rules;
mod store;
mod system;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::config::GuardrailSection;

pub use rules::{
    BudgetCapRule, ClaimsFreshnessRule, LandingPageHealthRule, MaxChangePctRule,
    MinQualityScoreRule,
};
pub use store::{SqliteGuardrailStore, SqliteGuardrailStoreBuilder, ValidationRow};
pub use system::GuardrailSystem;

#[derive(Debug, Error)]
pub enum GuardrailError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("guardrail store path not configured")]
    MissingStore,
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
}

pub type GuardrailResult<T> = std::result::Result<T, GuardrailError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MutationType {
    UpdateBudget,
    UpdateBid,
    AddKeyword,
    AddNegative,
    PauseCampaign,
    DeleteCampaign,
    CreateAdGroup,
}

impl MutationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationType::UpdateBudget => "UPDATE_BUDGET",
            MutationType::UpdateBid => "UPDATE_BID",
            MutationType::AddKeyword => "ADD_KEYWORD",
            MutationType::AddNegative => "ADD_NEGATIVE",
            MutationType::PauseCampaign => "PAUSE_CAMPAIGN",
            MutationType::DeleteCampaign => "DELETE_CAMPAIGN",
            MutationType::CreateAdGroup => "CREATE_AD_GROUP",
        }
    }

    pub fn is_structural_deletion(&self) -> bool {
        matches!(self, MutationType::DeleteCampaign)
    }
}

impl fmt::Display for MutationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mutation {
    pub mutation_type: MutationType,
    pub campaign: String,
    #[serde(default)]
    pub current_value: Option<f64>,
    #[serde(default)]
    pub proposed_value: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Mutation {
    pub fn budget_delta(&self) -> f64 {
        if self.mutation_type != MutationType::UpdateBudget {
            return 0.0;
        }
        self.proposed_value.unwrap_or(0.0) - self.current_value.unwrap_or(0.0)
    }

    pub fn is_budget_increase(&self) -> bool {
        self.budget_delta() > 0.0
    }
}

/// A batch of planned mutations awaiting validation and approval. The
/// core never applies these; it only grades them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlannedChanges {
    pub product: String,
    #[serde(default)]
    pub customer_id: Option<String>,
    pub mutations: Vec<Mutation>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl PlannedChanges {
    /// Short content hash identifying the proposal in audit rows.
    pub fn proposal_hash(&self) -> GuardrailResult<String> {
        let payload = serde_json::to_vec(self)?;
        let digest = Sha256::digest(&payload);
        Ok(hex::encode(&digest[..6]))
    }

    pub fn total_budget_delta(&self) -> f64 {
        self.mutations.iter().map(Mutation::budget_delta).sum()
    }

    pub fn has_structural_deletions(&self) -> bool {
        self.mutations
            .iter()
            .any(|mutation| mutation.mutation_type.is_structural_deletion())
    }

    pub fn affected_campaigns(&self) -> usize {
        self.mutations
            .iter()
            .map(|mutation| mutation.campaign.as_str())
            .collect::<std::collections::BTreeSet<_>>()
            .len()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ViolationSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationSeverity::Low => "low",
            ViolationSeverity::Medium => "medium",
            ViolationSeverity::High => "high",
            ViolationSeverity::Critical => "critical",
        }
    }
}

impl fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Violation {
    pub rule: String,
    pub severity: ViolationSeverity,
    pub message: String,
    #[serde(default)]
    pub campaign: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleOutcome {
    pub passed: bool,
    pub violations: Vec<Violation>,
}

impl RuleOutcome {
    pub fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    pub fn fail(violations: Vec<Violation>) -> Self {
        Self {
            passed: false,
            violations,
        }
    }
}

/// Read-only facts the rules consult: constraint limits plus the
/// collaborator tables maintained outside the core.
#[derive(Debug, Clone)]
pub struct GuardrailContext {
    pub constraints: GuardrailSection,
    pub quality_scores: BTreeMap<String, f64>,
    pub landing_page_health: BTreeMap<String, f64>,
    pub claims_validated_at: BTreeMap<String, DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

/// The contract every guardrail implements. New rules plug in behind
/// this without touching the dispatcher.
pub trait GuardrailRule: Send + Sync {
    fn id(&self) -> &'static str;
    fn validate(&self, proposal: &PlannedChanges, context: &GuardrailContext) -> RuleOutcome;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationOutcome {
    pub proposal_hash: String,
    pub passed: bool,
    pub violations: Vec<Violation>,
    pub can_override: bool,
}
