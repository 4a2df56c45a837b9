use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::{TimeZone, Utc};

use adpilot_core::{
    AdpilotConfig, DataSource, EstimatedConnector, FixtureKeywordConnector, FixedClock,
    PlanOptions, PlanOrchestrator, PlanSummary, ProductConfig, SqliteCacheStore,
    SyntheticSerpConnector, TargetPage,
};

fn product() -> ProductConfig {
    ProductConfig {
        name: "webp-shift".to_string(),
        markets: vec!["US".to_string(), "AU".to_string()],
        seed_queries: vec!["webp to png".to_string(), "color picker".to_string()],
        target_pages: vec![
            TargetPage {
                url: "https://example.com/webp-to-png".to_string(),
                purpose: "conversion landing".to_string(),
                use_case: Some("webp-png".to_string()),
            },
            TargetPage {
                url: "https://example.com/color-picker".to_string(),
                purpose: "picker landing".to_string(),
                use_case: Some("color-picker".to_string()),
            },
        ],
        value_propositions: vec![
            "Converts locally, nothing leaves the browser".to_string(),
            "Batch mode included".to_string(),
        ],
        pre_seeded_negatives: vec!["crack".to_string(), "torrent".to_string()],
        brand_terms: vec!["webp shift".to_string()],
        anchor_headline: "WebP Shift Converter".to_string(),
    }
}

fn write_kwp_fixture(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("kwp.json");
    fs::write(
        &path,
        r#"[
            {"query": "webp to png", "market": "US", "keyword": "webp to png converter",
             "volume": 1200, "cpc": 0.8, "serp_features": ["featured_snippet"]},
            {"query": "webp to png", "market": "US", "keyword": "webp to png chrome extension",
             "volume": 1000, "competition": 0.2, "serp_features": ["featured_snippet"]},
            {"query": "color picker", "market": "US", "keyword": "color picker",
             "volume": 1200, "cpc": 0.8},
            {"query": "color picker", "market": "AU", "keyword": "color picker extension",
             "volume": 400, "competition": 0.3}
        ]"#,
    )
    .unwrap();
    path
}

fn orchestrator(dir: &Path) -> PlanOrchestrator {
    let mut config = AdpilotConfig::default();
    config.paths.plans_dir = dir.join("plans").to_string_lossy().into_owned();
    let cache = SqliteCacheStore::builder()
        .path(dir.join("cache.sqlite"))
        .ceiling("serp_calls", 100)
        .ceiling("keyword_calls", 100)
        .build()
        .unwrap();
    cache.initialize().unwrap();
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2025, 6, 2, 8, 0, 0).unwrap(),
    ));
    let kwp = write_kwp_fixture(dir);
    PlanOrchestrator::new(config, product(), cache, clock)
        .with_connector(Arc::new(
            FixtureKeywordConnector::from_file("keyword_calls", "kwp", DataSource::Kwp, kwp)
                .unwrap(),
        ))
        .with_connector(Arc::new(EstimatedConnector::new()))
        .with_serp(Arc::new(SyntheticSerpConnector::new()))
}

const ARTIFACTS: [&str; 8] = [
    "keywords.csv",
    "ads.json",
    "seo_pages.md",
    "competitors.md",
    "negatives.txt",
    "google-ads-script.js",
    "claims-validation.json",
    "summary.json",
];

#[tokio::test]
async fn full_run_emits_consistent_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let outcome = orchestrator(dir.path())
        .run(&PlanOptions::default())
        .await
        .unwrap();

    let summary = &outcome.summary;
    assert_eq!(summary.product, "webp-shift");
    assert_eq!(summary.date, "2025-06-02");
    assert!(summary.total_keywords >= 4);
    assert!(summary.total_ad_groups >= 1);
    assert_eq!(summary.data_source_counts.get("KWP"), Some(&4));
    assert!(summary.top_opportunities.len() <= 10);
    assert!(!summary.top_opportunities.is_empty());

    let directory = outcome.directory.unwrap();
    for name in ARTIFACTS {
        assert!(directory.join(name).exists(), "missing {name}");
    }

    // Fixture keywords survive into the table with their merged fields.
    let keywords = fs::read_to_string(directory.join("keywords.csv")).unwrap();
    assert!(keywords.contains("webp to png chrome extension"));
    assert!(keywords.contains("KWP"));

    // Pre-seeded negatives are carried into the plan.
    let negatives = fs::read_to_string(directory.join("negatives.txt")).unwrap();
    assert_eq!(negatives, "crack\ntorrent\n");

    // Every score in the table stays inside [0, 1].
    for line in keywords.lines().skip(1) {
        let fields: Vec<&str> = line.split(',').collect();
        let score: f64 = fields[7].parse().unwrap();
        assert!((0.0..=1.0).contains(&score), "score {score} out of range");
    }
}

#[tokio::test]
async fn summary_round_trips_through_json() {
    let dir = tempfile::tempdir().unwrap();
    let outcome = orchestrator(dir.path())
        .run(&PlanOptions::default())
        .await
        .unwrap();
    let directory = outcome.directory.unwrap();

    let raw = fs::read_to_string(directory.join("summary.json")).unwrap();
    let parsed: PlanSummary = serde_json::from_str(&raw).unwrap();
    assert_eq!(parsed, outcome.summary);

    let ads: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(directory.join("ads.json")).unwrap()).unwrap();
    assert_eq!(ads["product"], "webp-shift");
    assert!(ads["ad_groups"].as_array().unwrap().len() >= 1);
}

#[tokio::test]
async fn identical_runs_are_bytewise_identical() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = orchestrator(dir_a.path())
        .run(&PlanOptions::default())
        .await
        .unwrap();
    let b = orchestrator(dir_b.path())
        .run(&PlanOptions::default())
        .await
        .unwrap();
    let dir_a = a.directory.unwrap();
    let dir_b = b.directory.unwrap();
    for name in ARTIFACTS {
        assert_eq!(
            fs::read(dir_a.join(name)).unwrap(),
            fs::read(dir_b.join(name)).unwrap(),
            "{name} differs between identical runs"
        );
    }
}

#[tokio::test]
async fn rerun_overwrites_same_day_directory() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = orchestrator(dir.path());
    let first = orchestrator.run(&PlanOptions::default()).await.unwrap();
    let second = orchestrator.run(&PlanOptions::default()).await.unwrap();
    assert_eq!(first.directory, second.directory);
    // The second run sees cache hits, so the ledger stays flat.
    assert!(second.summary.cache_hit_rate > 0.0);
}

#[tokio::test]
async fn summary_seeds_anomaly_baselines() {
    use adpilot_core::AnomalyDetector;

    let dir = tempfile::tempdir().unwrap();
    let outcome = orchestrator(dir.path())
        .run(&PlanOptions::default())
        .await
        .unwrap();
    let timestamp = Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap();
    let points = outcome.summary.baseline_points(timestamp);
    assert!(points.iter().any(|point| point.metric_key == "keywords.total"));
    assert!(points
        .iter()
        .any(|point| point.metric_key.starts_with("volume.")));

    let detector = AnomalyDetector::with_default_rules(1000, 30);
    for point in points {
        // Fresh rings never alert on their first observation.
        assert!(detector.record(point).is_empty());
    }
}

#[tokio::test]
async fn quota_exhaustion_degrades_to_warning() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AdpilotConfig::default();
    config.paths.plans_dir = dir.path().join("plans").to_string_lossy().into_owned();
    let cache = SqliteCacheStore::builder()
        .path(dir.path().join("cache.sqlite"))
        .ceiling("keyword_calls", 1)
        .ceiling("serp_calls", 100)
        .build()
        .unwrap();
    cache.initialize().unwrap();
    let clock = Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2025, 6, 2, 8, 0, 0).unwrap(),
    ));
    let outcome = PlanOrchestrator::new(config, product(), cache, clock)
        .with_connector(Arc::new(EstimatedConnector::new()))
        .with_serp(Arc::new(SyntheticSerpConnector::new()))
        .run(&PlanOptions::default())
        .await
        .unwrap();
    assert!(outcome
        .summary
        .warnings
        .iter()
        .any(|warning| warning.contains("quota exhausted")));
    // One query still made it through before the ceiling.
    assert!(outcome.summary.total_keywords > 0);
}
