use std::sync::Arc;

use chrono::{NaiveDate, TimeZone, Utc};

use adpilot_core::{
    generate_rsa_variants, ApprovalSection, ApprovalSeverity, ApprovalStatus, ApprovalWorkflow,
    CreateExperiment, ExperimentEngine, ExperimentStatus, ExperimentType, FixedClock, GuardConfig,
    GuardrailSection, GuardrailSystem, MetricPoint, Mutation, MutationType, PlannedChanges, Prng,
    RsaCreative, SequentialDecision, SqliteApprovalStore, SqliteExperimentStore,
    SqliteGuardrailStore, StatsConfig, TargetMetric, VariantStrategy, VoteDecision,
};

fn clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap(),
    ))
}

fn engine(dir: &tempfile::TempDir) -> ExperimentEngine {
    let store = SqliteExperimentStore::builder()
        .path(dir.path().join("experiments.sqlite"))
        .build()
        .unwrap();
    store.initialize().unwrap();
    ExperimentEngine::new(store, clock(), StatsConfig::default())
}

fn base_creative() -> RsaCreative {
    RsaCreative {
        headlines: vec![
            "WebP Shift Converter".to_string(),
            "Convert WebP to PNG".to_string(),
            "Batch Image Conversion".to_string(),
        ],
        descriptions: vec![
            "Convert WebP images without leaving your browser.".to_string(),
            "Batch conversion with one click.".to_string(),
        ],
        final_urls: vec!["https://example.com/webp-to-png".to_string()],
    }
}

fn metric(experiment: &str, variant: &str, day: u32, impressions: u64, clicks: u64) -> MetricPoint {
    MetricPoint {
        experiment_id: experiment.to_string(),
        variant_id: variant.to_string(),
        date: NaiveDate::from_ymd_opt(2025, 6, day).unwrap(),
        impressions,
        clicks,
        cost: 12.5,
        conversions: clicks / 8,
        conversion_value: 30.0,
        view_through_conversions: 0,
    }
}

#[test]
fn generated_experiment_runs_to_completion() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(&dir);

    let variants = generate_rsa_variants(
        &base_creative(),
        "WebP Shift Converter",
        &[VariantStrategy::BenefitLed, VariantStrategy::ConversionFocused],
        0.9,
    )
    .unwrap();
    assert_eq!(variants.len(), 3);

    let experiment = engine
        .create(CreateExperiment {
            experiment_type: ExperimentType::Rsa,
            product: "webp-shift".to_string(),
            target_id: "ad-group-webp-png".to_string(),
            target_metric: TargetMetric::Ctr,
            variants,
            min_sample_size: 1000,
            confidence_level: 0.95,
            guards: GuardConfig::default(),
        })
        .unwrap();

    engine.start(&experiment.id).unwrap();

    // Three days of observations: benefit_led clearly ahead.
    for day in 2..5 {
        engine
            .record_metrics(&metric(&experiment.id, "control", day, 4000, 160))
            .unwrap();
        engine
            .record_metrics(&metric(&experiment.id, "benefit_led", day, 4000, 260))
            .unwrap();
        engine
            .record_metrics(&metric(&experiment.id, "conversion_focused", day, 4000, 170))
            .unwrap();
    }

    let mut rng = Prng::from_seed(7);
    let report = engine.analyze(&experiment.id, &mut rng).unwrap();
    assert_eq!(report.decision, SequentialDecision::StopSuccess);
    assert!(report.note.contains("benefit_led"));

    // Same seed, same data: the analysis is reproducible.
    let mut rng_again = Prng::from_seed(7);
    let again = engine.analyze(&experiment.id, &mut rng_again).unwrap();
    assert_eq!(report.variants, again.variants);

    let completed = engine.complete(&experiment.id, "benefit_led").unwrap();
    assert_eq!(completed.status, ExperimentStatus::Completed);

    let export = engine.export(&experiment.id).unwrap();
    assert_eq!(export.metrics.len(), 9);
    assert!(export.latest_analysis.is_some());
    assert_eq!(export.audit.first().unwrap().event, "created");
    assert_eq!(export.audit.last().unwrap().event, "completed");
}

fn budget_change(campaign: &str, current: f64, proposed: f64) -> PlannedChanges {
    PlannedChanges {
        product: "webp-shift".to_string(),
        customer_id: Some("123-456-7890".to_string()),
        mutations: vec![Mutation {
            mutation_type: MutationType::UpdateBudget,
            campaign: campaign.to_string(),
            current_value: Some(current),
            proposed_value: Some(proposed),
            currency: None,
            metadata: Default::default(),
        }],
        metadata: Default::default(),
    }
}

#[test]
fn guardrails_gate_the_approval_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let guardrail_store = SqliteGuardrailStore::builder()
        .path(dir.path().join("guardrails.sqlite"))
        .build()
        .unwrap();
    guardrail_store.initialize().unwrap();
    let approval_store = SqliteApprovalStore::builder()
        .path(dir.path().join("approvals.sqlite"))
        .build()
        .unwrap();
    approval_store.initialize().unwrap();

    let guardrails = GuardrailSystem::new(guardrail_store, GuardrailSection::default(), clock());
    let workflow = ApprovalWorkflow::new(approval_store, ApprovalSection::default(), clock());

    // Over the AUD cap: blocked outright, nobody can override.
    let blocked = guardrails
        .validate_proposal(&budget_change("A", 40.0, 70.0))
        .unwrap();
    assert!(!blocked.passed);
    assert!(!blocked.can_override);

    // A decrease passes every rule and flows into approval.
    let decrease = budget_change("A", 40.0, 35.0);
    let validation = guardrails.validate_proposal(&decrease).unwrap();
    assert!(validation.passed, "violations: {:?}", validation.violations);

    let request = workflow.submit(decrease, "ops", "budget_update").unwrap();
    assert_eq!(request.severity, ApprovalSeverity::Low);
    assert_eq!(request.status, ApprovalStatus::Pending);

    let approved = workflow
        .vote(&request.id, "ops", VoteDecision::Approve, None)
        .unwrap();
    assert_eq!(approved.status, ApprovalStatus::Approved);

    // The ready-for-application record carries the approved mutations.
    let ready = workflow.ready_changes(&request.id).unwrap().unwrap();
    let parsed: PlannedChanges = serde_json::from_str(&ready).unwrap();
    assert_eq!(parsed.mutations.len(), 1);
    assert_eq!(parsed.mutations[0].campaign, "A");
}
