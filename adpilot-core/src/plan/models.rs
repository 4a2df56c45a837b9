use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::anomaly::TimeSeriesPoint;
use crate::keyword::MatchType;

/// Run-level summary persisted as `summary.json`. Derived once per run
/// and immutable afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanSummary {
    pub product: String,
    pub date: String,
    pub markets: Vec<String>,
    pub total_keywords: usize,
    pub total_ad_groups: usize,
    pub serp_calls_used: u64,
    pub cache_hit_rate: f64,
    pub data_source_counts: BTreeMap<String, usize>,
    pub top_opportunities: Vec<TopOpportunity>,
    pub generation_time_ms: u64,
    pub warnings: Vec<String>,
}

impl PlanSummary {
    /// Baseline series for the anomaly detector: run-level aggregates
    /// plus one volume series per top-opportunity cluster. Feeding these
    /// after each plan run gives the monitors a history to compare
    /// against.
    pub fn baseline_points(&self, timestamp: DateTime<Utc>) -> Vec<TimeSeriesPoint> {
        let metadata = BTreeMap::from([("product".to_string(), self.product.clone())]);
        let point = |metric_key: &str, value: f64| TimeSeriesPoint {
            metric_key: metric_key.to_string(),
            timestamp,
            value,
            metadata: metadata.clone(),
        };

        let mut points = vec![
            point("keywords.total", self.total_keywords as f64),
            point("cache.hit_rate", self.cache_hit_rate),
            point("serp.calls_used", self.serp_calls_used as f64),
        ];
        let mut cluster_volumes: BTreeMap<&str, u64> = BTreeMap::new();
        for opportunity in &self.top_opportunities {
            if opportunity.cluster.is_empty() {
                continue;
            }
            *cluster_volumes.entry(opportunity.cluster.as_str()).or_insert(0) +=
                opportunity.volume;
        }
        for (cluster, volume) in cluster_volumes {
            points.push(point(&format!("volume.{cluster}"), volume as f64));
        }
        points
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopOpportunity {
    pub keyword: String,
    pub market: String,
    pub score: f64,
    pub volume: u64,
    pub cluster: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdGroupPlan {
    pub name: String,
    pub use_case: String,
    pub landing_page: Option<String>,
    pub total_volume: u64,
    pub keywords: Vec<AdGroupKeyword>,
    pub headlines: Vec<String>,
    pub descriptions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdGroupKeyword {
    pub keyword: String,
    pub match_type: MatchType,
    pub score: f64,
    pub volume: u64,
    pub cpc: Option<f64>,
}

/// Competitor domains observed across the bounded SERP analysis, keyed by
/// domain with the clusters they appeared for.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CompetitorReport {
    pub domains: BTreeMap<String, CompetitorEntry>,
    pub serp_calls: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct CompetitorEntry {
    pub appearances: u64,
    pub clusters: Vec<String>,
    pub markets: Vec<String>,
}

impl CompetitorReport {
    pub fn record(&mut self, domain: &str, cluster: &str, market: &str) {
        let entry = self.domains.entry(domain.to_string()).or_default();
        entry.appearances += 1;
        if !entry.clusters.contains(&cluster.to_string()) {
            entry.clusters.push(cluster.to_string());
        }
        if !entry.markets.contains(&market.to_string()) {
            entry.markets.push(market.to_string());
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanRunOutcome {
    pub summary: PlanSummary,
    pub directory: Option<PathBuf>,
}
