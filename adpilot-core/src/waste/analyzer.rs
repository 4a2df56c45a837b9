use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::WasteSection;
use crate::keyword::{normalize_keyword, MatchType};

use super::WasteResult;

/// Terms that reliably signal zero purchase intent for a paid product.
const WASTE_INDICATORS: &[&str] = &[
    "crack", "torrent", "virus", "keygen", "warez", "pirated", "serial key", "nulled",
];

const BROAD_INDICATOR_MIN_COST: f64 = 10.0;
const NGRAM_MIN_COUNT: usize = 3;
const NGRAM_MIN_COST: f64 = 20.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchTermRow {
    pub term: String,
    pub ad_group: String,
    pub campaign: String,
    pub impressions: u64,
    pub clicks: u64,
    pub cost: f64,
    pub conversions: u64,
}

impl SearchTermRow {
    pub fn ctr(&self) -> f64 {
        if self.impressions == 0 {
            0.0
        } else {
            self.clicks as f64 / self.impressions as f64
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WasteCategory {
    HighCostNoConvert,
    LowCtrHighImpr,
    PoorQuality,
}

impl WasteCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            WasteCategory::HighCostNoConvert => "high_cost_no_convert",
            WasteCategory::LowCtrHighImpr => "low_ctr_high_impr",
            WasteCategory::PoorQuality => "poor_quality",
        }
    }
}

impl fmt::Display for WasteCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct CategorizedTerm {
    pub term: String,
    pub campaign: String,
    pub ad_group: String,
    pub category: WasteCategory,
    pub cost: f64,
    pub clicks: u64,
    pub impressions: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NegativeLevel {
    Campaign,
    AdGroup,
}

impl NegativeLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            NegativeLevel::Campaign => "campaign",
            NegativeLevel::AdGroup => "ad_group",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NegativeRecommendation {
    pub term: String,
    pub match_type: MatchType,
    pub level: NegativeLevel,
    pub campaign: String,
    pub ad_group: Option<String>,
    pub estimated_savings: f64,
    pub confidence: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct WasteReport {
    pub total_terms: usize,
    pub total_cost: f64,
    pub total_wasted_cost: f64,
    pub high_cost_no_convert: Vec<CategorizedTerm>,
    pub low_ctr_high_impr: Vec<CategorizedTerm>,
    pub poor_quality: Vec<CategorizedTerm>,
    pub recommendations: Vec<NegativeRecommendation>,
}

/// Search-term waste analyzer: categorizes wasted spend and synthesizes
/// exact, phrase and broad negative keywords from the report.
#[derive(Debug, Clone)]
pub struct WasteAnalyzer {
    config: WasteSection,
}

impl WasteAnalyzer {
    pub fn new(config: WasteSection) -> Self {
        Self { config }
    }

    pub fn read_report(path: impl AsRef<Path>) -> WasteResult<Vec<SearchTermRow>> {
        let mut reader = csv::Reader::from_path(path)?;
        let mut rows = Vec::new();
        for row in reader.deserialize() {
            rows.push(row?);
        }
        Ok(rows)
    }

    pub fn write_negatives_csv(
        path: impl AsRef<Path>,
        recommendations: &[NegativeRecommendation],
    ) -> WasteResult<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record([
            "term",
            "match_type",
            "level",
            "campaign",
            "estimated_savings",
            "confidence",
            "reason",
        ])?;
        for rec in recommendations {
            writer.write_record([
                rec.term.as_str(),
                rec.match_type.as_str(),
                rec.level.as_str(),
                rec.campaign.as_str(),
                &format!("{:.2}", rec.estimated_savings),
                &format!("{:.2}", rec.confidence),
                rec.reason.as_str(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn analyze(&self, rows: &[SearchTermRow]) -> WasteReport {
        let mut report = WasteReport {
            total_terms: rows.len(),
            ..WasteReport::default()
        };

        for row in rows {
            report.total_cost += row.cost;
            let mut wasted = false;
            if row.cost >= self.config.min_cost && row.conversions == 0 {
                report
                    .high_cost_no_convert
                    .push(categorize(row, WasteCategory::HighCostNoConvert));
                wasted = true;
            }
            if row.impressions >= self.config.min_impressions && row.ctr() < self.config.low_ctr {
                report
                    .low_ctr_high_impr
                    .push(categorize(row, WasteCategory::LowCtrHighImpr));
            }
            if row.clicks >= 10 && row.conversions == 0 && row.cost >= 5.0 {
                report
                    .poor_quality
                    .push(categorize(row, WasteCategory::PoorQuality));
                wasted = true;
            }
            if wasted {
                report.total_wasted_cost += row.cost;
            }
        }

        let mut recommendations = self.direct_exact_negatives(&report.high_cost_no_convert);
        let exact_terms: BTreeSet<String> = recommendations
            .iter()
            .map(|rec| rec.term.clone())
            .collect();
        recommendations.extend(self.ngram_negatives(rows, &exact_terms));
        recommendations.extend(self.indicator_negatives(rows));

        recommendations.sort_by(|a, b| {
            b.estimated_savings
                .partial_cmp(&a.estimated_savings)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.term.cmp(&b.term))
        });
        report.recommendations = recommendations;
        report.total_cost = round2(report.total_cost);
        report.total_wasted_cost = round2(report.total_wasted_cost);
        report
    }

    /// One exact negative per high-cost zero-conversion term, kept only
    /// when the evidence clears the confidence threshold.
    fn direct_exact_negatives(
        &self,
        terms: &[CategorizedTerm],
    ) -> Vec<NegativeRecommendation> {
        let mut recommendations = Vec::new();
        for term in terms {
            let cost_factor = (term.cost / (2.0 * self.config.min_cost)).min(1.0);
            let click_factor = (term.clicks as f64 / 20.0).min(1.0);
            let confidence = 0.6 + 0.2 * cost_factor + 0.15 * click_factor;
            if confidence < self.config.exact_confidence_threshold {
                continue;
            }
            recommendations.push(NegativeRecommendation {
                term: normalize_keyword(&term.term),
                match_type: MatchType::Exact,
                level: NegativeLevel::AdGroup,
                campaign: term.campaign.clone(),
                ad_group: Some(term.ad_group.clone()),
                estimated_savings: round2(term.cost),
                confidence: round2(confidence.min(0.95)),
                reason: format!(
                    "spent ${:.2} over {} clicks with zero conversions",
                    term.cost, term.clicks
                ),
            });
        }
        recommendations
    }

    /// Mines uni/bi/trigrams over all zero-conversion terms; an n-gram
    /// seen in at least three terms that together wasted $20+ becomes a
    /// phrase negative at campaign level.
    fn ngram_negatives(
        &self,
        rows: &[SearchTermRow],
        already_exact: &BTreeSet<String>,
    ) -> Vec<NegativeRecommendation> {
        #[derive(Default)]
        struct NgramStats {
            count: usize,
            cost: f64,
            campaigns: BTreeSet<String>,
        }

        let mut stats: BTreeMap<String, NgramStats> = BTreeMap::new();
        for row in rows.iter().filter(|row| row.conversions == 0) {
            let normalized = normalize_keyword(&row.term);
            let words: Vec<&str> = normalized.split(' ').collect();
            let mut seen_in_row = BTreeSet::new();
            for size in 1..=3usize {
                if words.len() < size {
                    continue;
                }
                for window in words.windows(size) {
                    let ngram = window.join(" ");
                    if size == 1 && ngram.len() < 3 {
                        continue;
                    }
                    if !seen_in_row.insert(ngram.clone()) {
                        continue;
                    }
                    let entry = stats.entry(ngram).or_default();
                    entry.count += 1;
                    entry.cost += row.cost;
                    entry.campaigns.insert(row.campaign.clone());
                }
            }
        }

        let mut recommendations = Vec::new();
        for (ngram, entry) in stats {
            if entry.count < NGRAM_MIN_COUNT || entry.cost < NGRAM_MIN_COST {
                continue;
            }
            if already_exact.contains(&ngram) {
                continue;
            }
            let campaign = entry
                .campaigns
                .iter()
                .next()
                .cloned()
                .unwrap_or_default();
            let confidence = (0.65 + 0.05 * entry.count.min(5) as f64).min(0.9);
            recommendations.push(NegativeRecommendation {
                term: ngram.clone(),
                match_type: MatchType::Phrase,
                level: NegativeLevel::Campaign,
                campaign,
                ad_group: None,
                estimated_savings: round2(entry.cost),
                confidence: round2(confidence),
                reason: format!(
                    "appears in {} wasted terms costing ${:.2} total",
                    entry.count, entry.cost
                ),
            });
        }
        recommendations
    }

    /// Broad negatives from the static waste-indicator list once an
    /// indicator has burned $10 of spend.
    fn indicator_negatives(&self, rows: &[SearchTermRow]) -> Vec<NegativeRecommendation> {
        let mut recommendations = Vec::new();
        for indicator in WASTE_INDICATORS {
            let mut cost = 0.0;
            let mut campaigns = BTreeSet::new();
            for row in rows {
                if normalize_keyword(&row.term).contains(indicator) {
                    cost += row.cost;
                    campaigns.insert(row.campaign.clone());
                }
            }
            if cost < BROAD_INDICATOR_MIN_COST {
                continue;
            }
            let campaign = campaigns.iter().next().cloned().unwrap_or_default();
            recommendations.push(NegativeRecommendation {
                term: (*indicator).to_string(),
                match_type: MatchType::Broad,
                level: NegativeLevel::Campaign,
                campaign,
                ad_group: None,
                estimated_savings: round2(cost),
                confidence: 0.95,
                reason: format!("piracy/malware indicator burned ${cost:.2}"),
            });
        }
        recommendations
    }
}

fn categorize(row: &SearchTermRow, category: WasteCategory) -> CategorizedTerm {
    CategorizedTerm {
        term: row.term.clone(),
        campaign: row.campaign.clone(),
        ad_group: row.ad_group.clone(),
        category,
        cost: row.cost,
        clicks: row.clicks,
        impressions: row.impressions,
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
