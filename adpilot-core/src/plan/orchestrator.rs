use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::cache::{CacheLookup, SqliteCacheStore};
use crate::config::{AdpilotConfig, ProductConfig};
use crate::keyword::{precedence_merge, Cluster, ClusterEngine, KeywordRecord, KeywordScorer};
use crate::runtime::Clock;

use super::artifacts::{round_rate, round_score, ArtifactWriter};
use super::connectors::{KeywordConnector, SerpConnector, SerpSnapshot};
use super::models::{
    AdGroupKeyword, AdGroupPlan, CompetitorReport, PlanRunOutcome, PlanSummary, TopOpportunity,
};
use super::PlanResult;

#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub dry_run: bool,
    pub competitor_top_k: usize,
    pub connector_timeout_secs: u64,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            competitor_top_k: 3,
            connector_timeout_secs: 30,
        }
    }
}

struct CollectResult {
    records: Vec<KeywordRecord>,
    warnings: Vec<String>,
}

/// Sequences the plan pipeline: quota-gated collection, precedence merge,
/// scoring, clustering, bounded competitor analysis, artifact emission.
/// Connector failures degrade to warnings; the run continues with the
/// sources that answered.
pub struct PlanOrchestrator {
    config: AdpilotConfig,
    product: ProductConfig,
    connectors: Vec<Arc<dyn KeywordConnector>>,
    serp: Option<Arc<dyn SerpConnector>>,
    cache: SqliteCacheStore,
    clock: Arc<dyn Clock>,
}

impl PlanOrchestrator {
    pub fn new(
        config: AdpilotConfig,
        product: ProductConfig,
        cache: SqliteCacheStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            product,
            connectors: Vec::new(),
            serp: None,
            cache,
            clock,
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn KeywordConnector>) -> Self {
        self.connectors.push(connector);
        self
    }

    pub fn with_serp(mut self, serp: Arc<dyn SerpConnector>) -> Self {
        self.serp = Some(serp);
        self
    }

    pub async fn run(&self, options: &PlanOptions) -> PlanResult<PlanRunOutcome> {
        let started = self.clock.now();
        let date = started.format("%Y-%m-%d").to_string();
        let mut warnings: Vec<String> = Vec::new();

        info!(
            target: "plan",
            product = %self.product.name,
            connectors = self.connectors.len(),
            "starting plan run"
        );

        let (collected, collection_warnings) = self.collect(started, options).await?;
        warnings.extend(collection_warnings);

        let merge = precedence_merge(collected);
        let mut records = merge.records;

        let scorer = KeywordScorer::new(self.config.scoring.clone());
        scorer.score_all(&mut records);

        let engine = ClusterEngine::new(self.config.clustering.clone(), self.product.clone());
        let clustering = engine.cluster(&mut records);

        let mut competitors = CompetitorReport::default();
        if let Some(serp) = &self.serp {
            self.analyze_competitors(
                serp.as_ref(),
                &clustering.clusters,
                started,
                options.competitor_top_k,
                &mut competitors,
                &mut warnings,
            )?;
        }

        let ad_groups = self.build_ad_groups(&clustering.clusters, &records);

        let summary = PlanSummary {
            product: self.product.name.clone(),
            date: date.clone(),
            markets: self.product.markets.clone(),
            total_keywords: records.len(),
            total_ad_groups: ad_groups.len(),
            serp_calls_used: self.cache.usage("serp_calls", started)?.used,
            cache_hit_rate: round_rate(self.cache.stats_for_day(started)?.hit_rate()),
            data_source_counts: merge.source_counts,
            top_opportunities: top_opportunities(&records),
            generation_time_ms: (self.clock.now() - started).num_milliseconds().max(0) as u64,
            warnings: warnings.clone(),
        };

        let directory = if options.dry_run {
            None
        } else {
            let writer = ArtifactWriter::new(&self.config.paths.plans_dir);
            let artifacts = writer.emit(
                &self.product,
                &date,
                &records,
                &clustering.clusters,
                &ad_groups,
                &competitors,
                &self.product.pre_seeded_negatives,
                &summary,
            )?;
            Some(artifacts.directory)
        };

        info!(
            target: "plan",
            keywords = summary.total_keywords,
            ad_groups = summary.total_ad_groups,
            warnings = summary.warnings.len(),
            "plan run finished"
        );
        Ok(PlanRunOutcome { summary, directory })
    }

    /// Fans out one blocking task per connector; each is bounded by the
    /// configured deadline and degrades to a warning on error or timeout.
    async fn collect(
        &self,
        now: DateTime<Utc>,
        options: &PlanOptions,
    ) -> PlanResult<(Vec<KeywordRecord>, Vec<String>)> {
        let deadline = StdDuration::from_secs(options.connector_timeout_secs.max(1));
        let mut join_set: JoinSet<(usize, CollectResult)> = JoinSet::new();

        for (index, connector) in self.connectors.iter().enumerate() {
            let connector = Arc::clone(connector);
            let cache = self.cache.clone();
            let queries = self.product.seed_queries.clone();
            let markets = self.product.markets.clone();
            let endpoint = connector.endpoint().to_string();
            join_set.spawn(async move {
                let worker = tokio::task::spawn_blocking(move || {
                    collect_from_connector(connector.as_ref(), &cache, &queries, &markets, now)
                });
                let result = match tokio::time::timeout(deadline, worker).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_err)) => CollectResult {
                        records: Vec::new(),
                        warnings: vec![format!("connector {endpoint} panicked: {join_err}")],
                    },
                    Err(_) => CollectResult {
                        records: Vec::new(),
                        warnings: vec![format!(
                            "connector {endpoint} exceeded {}s deadline",
                            deadline.as_secs()
                        )],
                    },
                };
                (index, result)
            });
        }

        let mut slots: Vec<Option<CollectResult>> =
            (0..self.connectors.len()).map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            let (index, result) = joined?;
            slots[index] = Some(result);
        }

        let mut records = Vec::new();
        let mut warnings = Vec::new();
        for slot in slots.into_iter().flatten() {
            records.extend(slot.records);
            warnings.extend(slot.warnings);
        }
        Ok((records, warnings))
    }

    /// Top-K clusters, capped so K x |markets| never exceeds the day's
    /// remaining SERP budget.
    fn analyze_competitors(
        &self,
        serp: &dyn SerpConnector,
        clusters: &[Cluster],
        now: DateTime<Utc>,
        top_k: usize,
        report: &mut CompetitorReport,
        warnings: &mut Vec<String>,
    ) -> PlanResult<()> {
        let markets = self.product.markets.len().max(1) as u64;
        let remaining = self.cache.usage("serp_calls", now)?.remaining();
        let bounded_k = top_k.min((remaining / markets) as usize);
        if bounded_k < top_k {
            warnings.push(format!(
                "competitor analysis reduced to top {bounded_k} clusters by serp quota"
            ));
        }

        for cluster in clusters.iter().take(bounded_k) {
            let Some(keyword) = cluster.primary_keywords.first() else {
                continue;
            };
            for market in &self.product.markets {
                let params = BTreeMap::from([
                    ("keyword".to_string(), keyword.clone()),
                    ("market".to_string(), market.clone()),
                ]);
                let snapshot = match self.cache.lookup_or_miss(serp.endpoint(), &params, now) {
                    CacheLookup::Hit(payload) => match serde_json::from_str::<SerpSnapshot>(&payload)
                    {
                        Ok(snapshot) => snapshot,
                        Err(err) => {
                            warn!(target: "plan", error = %err, "discarding corrupt serp cache entry");
                            self.fetch_serp(serp, keyword, market, &params, now, warnings)?
                        }
                    },
                    CacheLookup::Miss => {
                        if !self.cache.can_call("serp_calls", now)? {
                            warnings.push(format!(
                                "serp quota exhausted before cluster {}",
                                cluster.name
                            ));
                            return Ok(());
                        }
                        self.fetch_serp(serp, keyword, market, &params, now, warnings)?
                    }
                };
                for domain in &snapshot.competitors {
                    report.record(domain, &cluster.name, market);
                }
                report.serp_calls += 1;
            }
        }
        Ok(())
    }

    fn fetch_serp(
        &self,
        serp: &dyn SerpConnector,
        keyword: &str,
        market: &str,
        params: &BTreeMap<String, String>,
        now: DateTime<Utc>,
        warnings: &mut Vec<String>,
    ) -> PlanResult<SerpSnapshot> {
        match serp.fetch(keyword, market) {
            Ok(snapshot) => {
                // Ledger write failure is fatal: an uncounted call would
                // leak budget.
                self.cache.record_call("serp_calls", now)?;
                let payload = serde_json::to_string(&snapshot)?;
                if let Err(err) = self.cache.put(serp.endpoint(), params, &payload, now) {
                    warn!(target: "plan", error = %err, "failed to cache serp snapshot");
                }
                Ok(snapshot)
            }
            Err(err) => {
                warnings.push(format!("serp fetch failed for '{keyword}' ({market}): {err}"));
                Ok(SerpSnapshot::default())
            }
        }
    }

    fn build_ad_groups(&self, clusters: &[Cluster], records: &[KeywordRecord]) -> Vec<AdGroupPlan> {
        let by_keyword: BTreeMap<&str, &KeywordRecord> = records
            .iter()
            .map(|record| (record.keyword.as_str(), record))
            .collect();

        clusters
            .iter()
            .map(|cluster| {
                let keywords = cluster
                    .keywords
                    .iter()
                    .filter_map(|keyword| by_keyword.get(keyword.as_str()))
                    .map(|record| AdGroupKeyword {
                        keyword: record.keyword.clone(),
                        match_type: record.recommended_match_type,
                        score: round_score(record.final_score),
                        volume: record.volume.unwrap_or(0),
                        cpc: record.cpc.map(super::artifacts::round_money),
                    })
                    .collect();

                let mut headlines = vec![self.product.anchor_headline.clone()];
                for proposition in self.product.value_propositions.iter().take(2) {
                    headlines.push(proposition.clone());
                }
                headlines.push(format!("Try {} Today", self.product.name));

                let mut descriptions: Vec<String> = self
                    .product
                    .value_propositions
                    .iter()
                    .take(2)
                    .cloned()
                    .collect();
                if descriptions.len() < 2 {
                    descriptions.push(format!(
                        "{} handles {} in one click.",
                        self.product.name, cluster.use_case
                    ));
                }

                AdGroupPlan {
                    name: cluster.name.clone(),
                    use_case: cluster.use_case.clone(),
                    landing_page: cluster.landing_page.clone(),
                    total_volume: cluster.total_volume,
                    keywords,
                    headlines,
                    descriptions,
                }
            })
            .collect()
    }
}

fn collect_from_connector(
    connector: &dyn KeywordConnector,
    cache: &SqliteCacheStore,
    queries: &[String],
    markets: &[String],
    now: DateTime<Utc>,
) -> CollectResult {
    let mut records = Vec::new();
    let mut warnings = Vec::new();
    let endpoint = connector.endpoint();

    'outer: for query in queries {
        for market in markets {
            let params = BTreeMap::from([
                ("query".to_string(), query.clone()),
                ("market".to_string(), market.clone()),
            ]);
            if let CacheLookup::Hit(payload) = cache.lookup_or_miss(endpoint, &params, now) {
                match serde_json::from_str::<Vec<KeywordRecord>>(&payload) {
                    Ok(cached) => {
                        records.extend(cached);
                        continue;
                    }
                    Err(err) => {
                        warn!(target: "plan", endpoint, error = %err, "ignoring corrupt cache entry");
                    }
                }
            }

            match cache.can_call(connector.api(), now) {
                Ok(true) => {}
                Ok(false) => {
                    warnings.push(format!(
                        "quota exhausted for {} while querying '{query}'",
                        connector.api()
                    ));
                    break 'outer;
                }
                Err(err) => {
                    warnings.push(format!("quota check failed for {endpoint}: {err}"));
                    break 'outer;
                }
            }

            match connector.fetch(query, market) {
                Ok(fetched) => {
                    if let Err(err) = cache.record_call(connector.api(), now) {
                        warnings.push(format!(
                            "ledger write failed for {endpoint}, dropping fetch: {err}"
                        ));
                        break 'outer;
                    }
                    match serde_json::to_string(&fetched) {
                        Ok(payload) => {
                            if let Err(err) = cache.put(endpoint, &params, &payload, now) {
                                warn!(target: "plan", endpoint, error = %err, "failed to cache response");
                            }
                        }
                        Err(err) => {
                            warn!(target: "plan", endpoint, error = %err, "failed to serialize response");
                        }
                    }
                    records.extend(fetched);
                }
                Err(err) => {
                    warnings.push(format!(
                        "connector {endpoint} failed for '{query}' ({market}): {err}"
                    ));
                }
            }
        }
    }

    CollectResult { records, warnings }
}

fn top_opportunities(records: &[KeywordRecord]) -> Vec<TopOpportunity> {
    records
        .iter()
        .take(10)
        .map(|record| TopOpportunity {
            keyword: record.keyword.clone(),
            market: record.primary_market().to_string(),
            score: round_score(record.final_score),
            volume: record.volume.unwrap_or(0),
            cluster: record.cluster.clone().unwrap_or_default(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetPage;
    use crate::keyword::DataSource;
    use crate::plan::connectors::{EstimatedConnector, SyntheticSerpConnector};
    use crate::plan::PlanError;
    use crate::runtime::FixedClock;
    use chrono::TimeZone;
    use std::fs;

    struct FailingConnector;

    impl KeywordConnector for FailingConnector {
        fn api(&self) -> &str {
            "keyword_calls"
        }

        fn endpoint(&self) -> &str {
            "kwp-live"
        }

        fn source(&self) -> DataSource {
            DataSource::Kwp
        }

        fn fetch(&self, _query: &str, _market: &str) -> PlanResult<Vec<KeywordRecord>> {
            Err(PlanError::Connector {
                name: "kwp-live".to_string(),
                message: "upstream unavailable".to_string(),
            })
        }
    }

    fn product() -> ProductConfig {
        ProductConfig {
            name: "webp-shift".to_string(),
            markets: vec!["US".to_string()],
            seed_queries: vec!["webp to png".to_string()],
            target_pages: vec![TargetPage {
                url: "https://example.com/webp-to-png".to_string(),
                purpose: "conversion".to_string(),
                use_case: Some("webp-png".to_string()),
            }],
            value_propositions: vec!["Converts locally, no upload".to_string()],
            pre_seeded_negatives: vec!["crack".to_string()],
            brand_terms: vec![],
            anchor_headline: "WebP Shift".to_string(),
        }
    }

    fn orchestrator(dir: &std::path::Path) -> PlanOrchestrator {
        let mut config = AdpilotConfig::default();
        config.paths.plans_dir = dir.join("plans").to_string_lossy().into_owned();
        let cache = SqliteCacheStore::builder()
            .path(dir.join("cache.sqlite"))
            .ceiling("serp_calls", 50)
            .ceiling("keyword_calls", 50)
            .build()
            .unwrap();
        cache.initialize().unwrap();
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 6, 2, 8, 0, 0).unwrap(),
        ));
        PlanOrchestrator::new(config, product(), cache, clock)
            .with_connector(Arc::new(EstimatedConnector::new()))
            .with_serp(Arc::new(SyntheticSerpConnector::new()))
    }

    #[tokio::test]
    async fn run_emits_artifacts_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = orchestrator(dir.path())
            .run(&PlanOptions::default())
            .await
            .unwrap();
        assert!(outcome.summary.total_keywords > 0);
        assert!(outcome.summary.total_ad_groups > 0);
        let directory = outcome.directory.unwrap();
        assert!(directory.join("summary.json").exists());
        assert!(directory.join("keywords.csv").exists());
        let raw = fs::read_to_string(directory.join("summary.json")).unwrap();
        let parsed: PlanSummary = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, outcome.summary);
    }

    #[tokio::test]
    async fn dry_run_skips_emission() {
        let dir = tempfile::tempdir().unwrap();
        let options = PlanOptions {
            dry_run: true,
            ..PlanOptions::default()
        };
        let outcome = orchestrator(dir.path()).run(&options).await.unwrap();
        assert!(outcome.directory.is_none());
        assert!(!dir.path().join("plans").exists());
    }

    #[tokio::test]
    async fn failing_connector_degrades_to_warning() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = orchestrator(dir.path())
            .with_connector(Arc::new(FailingConnector))
            .run(&PlanOptions::default())
            .await
            .unwrap();
        assert!(outcome
            .summary
            .warnings
            .iter()
            .any(|warning| warning.contains("kwp-live")));
        assert!(outcome.summary.total_keywords > 0);
    }

    #[tokio::test]
    async fn identical_runs_produce_identical_artifacts() {
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
        for name in [
            "keywords.csv",
            "ads.json",
            "seo_pages.md",
            "competitors.md",
            "negatives.txt",
            "google-ads-script.js",
            "claims-validation.json",
            "summary.json",
        ] {
            assert_eq!(
                fs::read(dir_a.join(name)).unwrap(),
                fs::read(dir_b.join(name)).unwrap(),
                "{name} differs between identical runs"
            );
        }
    }

    #[tokio::test]
    async fn serp_quota_bounds_competitor_analysis() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AdpilotConfig::default();
        config.paths.plans_dir = dir.path().join("plans").to_string_lossy().into_owned();
        let cache = SqliteCacheStore::builder()
            .path(dir.path().join("cache.sqlite"))
            .ceiling("serp_calls", 0)
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
        assert_eq!(outcome.summary.serp_calls_used, 0);
        assert!(outcome
            .summary
            .warnings
            .iter()
            .any(|warning| warning.contains("serp quota") || warning.contains("top 0")));
    }
}
