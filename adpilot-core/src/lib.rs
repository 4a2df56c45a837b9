#![allow(clippy::result_large_err)]

pub mod anomaly;
pub mod approval;
pub mod cache;
pub mod config;
pub mod error;
pub mod experiment;
pub mod guardrail;
pub mod keyword;
pub mod plan;
pub mod runtime;
mod sqlite;
pub mod waste;

pub use anomaly::{
    Anomaly, AnomalyDetector, AnomalyError, AnomalyResult, AnomalyRule, AnomalyType, RuleKind,
    Severity, TimeSeriesPoint,
};
pub use approval::{
    grade_severity, matrix_row, ApprovalDecision, ApprovalError, ApprovalRequest, ApprovalResult,
    ApprovalSeverity, ApprovalStatus, ApprovalWorkflow, SqliteApprovalStore,
    SqliteApprovalStoreBuilder, VoteDecision,
};
pub use cache::{
    CacheError, CacheLookup, CacheResult, CacheStats, QuotaUsage, SqliteCacheStore,
    SqliteCacheStoreBuilder,
};
pub use config::{
    load_adpilot_config, load_product_config, AdpilotConfig, ApprovalMatrix, ApprovalMatrixRow,
    ApprovalSection, AutoApprovalSection, BudgetTiers, ClusteringSection, ExperimentSection,
    GuardrailSection, IntentDictionaries, PathsSection, ProductConfig, QuotaSection,
    ScoringSection, ScoringWeights, SourcePenalties, TargetPage, WasteSection,
};
pub use error::{ConfigError, ConfigResult};
pub use experiment::{
    bayesian_compare, bonferroni_adjust, generate_landing_page_variants, generate_rsa_variants,
    page_similarity, required_sample_size, rsa_similarity, sequential_decision,
    thompson_allocation, two_proportion_z_test, AnalysisReport, AuditRow, BayesianComparison,
    ConversionSummary, Counts, CreateExperiment, Experiment, ExperimentEngine, ExperimentError,
    ExperimentExport,
    ExperimentResult, ExperimentStatus, ExperimentType, GuardCheck, GuardConfig, GuardReport,
    LandingPageCreative, MetricPoint, RsaCreative, SequentialDecision, SequentialOutcome,
    SqliteExperimentStore, SqliteExperimentStoreBuilder, StatsConfig, TargetMetric, Variant,
    VariantAnalysis, VariantPayload, VariantStrategy, VariantTotals, ZTestResult,
};
pub use guardrail::{
    GuardrailContext, GuardrailError, GuardrailResult, GuardrailRule, GuardrailSystem, Mutation,
    MutationType, PlannedChanges, RuleOutcome, SqliteGuardrailStore, SqliteGuardrailStoreBuilder,
    ValidationOutcome, ValidationRow, Violation, ViolationSeverity,
};
pub use keyword::{
    normalize_keyword, precedence_merge, significant_word_count, Cluster, ClusterEngine,
    ClusterOutcome, DataSource, KeywordError, KeywordRecord, KeywordResult, KeywordScorer,
    MatchType, MergeDiagnostic, MergeOutcome, ScoreBreakdown,
};
pub use plan::{
    AdGroupKeyword, AdGroupPlan, ArtifactWriter, CompetitorEntry, CompetitorReport,
    EstimatedConnector, FixtureKeywordConnector, FixtureSerpConnector, KeywordConnector,
    PlanArtifacts, PlanError, PlanOptions, PlanOrchestrator, PlanResult, PlanRunOutcome,
    PlanSummary, SerpConnector, SerpSnapshot, SyntheticSerpConnector, TopOpportunity,
};
pub use runtime::{Clock, FixedClock, Prng, SystemClock};
pub use waste::{
    CategorizedTerm, NegativeLevel, NegativeRecommendation, SearchTermRow, WasteAnalyzer,
    WasteCategory, WasteError, WasteReport, WasteResult,
};
