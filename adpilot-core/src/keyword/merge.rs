use std::collections::BTreeMap;

use serde::Serialize;

use super::models::{DataSource, KeywordRecord};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MergeDiagnostic {
    pub keyword: String,
    pub market: String,
    pub kept: DataSource,
    pub dropped: DataSource,
    pub filled_fields: Vec<&'static str>,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct MergeOutcome {
    pub records: Vec<KeywordRecord>,
    pub source_counts: BTreeMap<String, usize>,
    pub duplicates_resolved: usize,
    pub diagnostics: Vec<MergeDiagnostic>,
}

/// Merges keyword records from all sources under the fixed precedence
/// KWP > GSC > ESTIMATED. For records sharing `(keyword, primary market)`
/// the higher-precedence record wins; quantitative fields the winner lacks
/// are filled from the best lower-precedence source that has them.
///
/// Idempotent: merging an already merged set changes nothing.
pub fn precedence_merge(records: Vec<KeywordRecord>) -> MergeOutcome {
    let mut source_counts: BTreeMap<String, usize> = BTreeMap::new();
    for record in &records {
        *source_counts
            .entry(record.data_source.as_str().to_string())
            .or_insert(0) += 1;
    }

    let mut groups: BTreeMap<(String, String), Vec<KeywordRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(record.dedup_key()).or_default().push(record);
    }

    let mut merged = Vec::with_capacity(groups.len());
    let mut diagnostics = Vec::new();
    let mut duplicates_resolved = 0;

    for ((keyword, market), mut group) in groups {
        group.sort_by(|a, b| b.data_source.precedence().cmp(&a.data_source.precedence()));
        let mut winner = group.remove(0);

        for loser in group {
            duplicates_resolved += 1;
            let mut filled = Vec::new();
            if winner.volume.is_none() && loser.volume.is_some() {
                winner.volume = loser.volume;
                filled.push("volume");
            }
            if winner.cpc.is_none() && loser.cpc.is_some() {
                winner.cpc = loser.cpc;
                filled.push("cpc");
            }
            if winner.competition.is_none() && loser.competition.is_some() {
                winner.competition = loser.competition;
                filled.push("competition");
            }
            if winner.serp_features.is_empty() && !loser.serp_features.is_empty() {
                winner.serp_features = loser.serp_features.clone();
                filled.push("serp_features");
            }
            for extra in &loser.markets {
                if !winner.markets.contains(extra) {
                    winner.markets.push(extra.clone());
                }
            }
            diagnostics.push(MergeDiagnostic {
                keyword: keyword.clone(),
                market: market.clone(),
                kept: winner.data_source,
                dropped: loser.data_source,
                filled_fields: filled,
            });
        }

        merged.push(winner);
    }

    MergeOutcome {
        records: merged,
        source_counts,
        duplicates_resolved,
        diagnostics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kwp(keyword: &str) -> KeywordRecord {
        KeywordRecord::new(keyword, DataSource::Kwp, "US")
    }

    fn estimated(keyword: &str) -> KeywordRecord {
        KeywordRecord::new(keyword, DataSource::Estimated, "US")
    }

    #[test]
    fn higher_precedence_wins_and_fills_gaps() {
        let mut primary = kwp("color picker");
        primary.volume = Some(1200);
        primary.cpc = Some(0.80);

        let mut secondary = estimated("color picker");
        secondary.volume = Some(2000);
        secondary.competition = Some(0.4);

        let outcome = precedence_merge(vec![secondary, primary]);
        assert_eq!(outcome.records.len(), 1);
        let merged = &outcome.records[0];
        assert_eq!(merged.data_source, DataSource::Kwp);
        assert_eq!(merged.volume, Some(1200));
        assert_eq!(merged.cpc, Some(0.80));
        assert_eq!(merged.competition, Some(0.4));
        assert_eq!(outcome.duplicates_resolved, 1);
        assert_eq!(outcome.diagnostics[0].filled_fields, vec!["competition"]);
    }

    #[test]
    fn distinct_markets_stay_separate() {
        let us = kwp("color picker");
        let mut au = kwp("color picker");
        au.markets = vec!["AU".to_string()];
        let outcome = precedence_merge(vec![us, au]);
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.duplicates_resolved, 0);
    }

    #[test]
    fn merge_is_idempotent() {
        let mut a = kwp("webp to png");
        a.volume = Some(900);
        let mut b = estimated("webp to png");
        b.competition = Some(0.2);
        let first = precedence_merge(vec![a, b]);
        let second = precedence_merge(first.records.clone());
        assert_eq!(first.records, second.records);
        assert_eq!(second.duplicates_resolved, 0);
    }

    #[test]
    fn source_counts_reflect_inputs() {
        let outcome = precedence_merge(vec![
            kwp("one"),
            kwp("two"),
            estimated("one"),
        ]);
        assert_eq!(outcome.source_counts.get("KWP"), Some(&2));
        assert_eq!(outcome.source_counts.get("ESTIMATED"), Some(&1));
    }
}
