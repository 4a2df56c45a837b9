use std::cmp::Ordering;

use serde::Serialize;

use crate::config::ScoringSection;

use super::models::{significant_word_count, DataSource, KeywordRecord, MatchType};

/// Per-term contributions behind a final score, kept for diagnostics and
/// the opportunity narratives in the plan artifacts.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScoreBreakdown {
    pub volume_term: f64,
    pub intent_multiplier: f64,
    pub long_tail_term: f64,
    pub competition_term: f64,
    pub serp_term: f64,
    pub source_penalty: f64,
    pub final_score: f64,
}

/// Weighted multi-factor keyword scorer. Identical inputs and weights
/// yield identical output, including ordering.
#[derive(Debug, Clone)]
pub struct KeywordScorer {
    section: ScoringSection,
}

impl KeywordScorer {
    pub fn new(section: ScoringSection) -> Self {
        Self { section }
    }

    pub fn score_record(&self, record: &mut KeywordRecord) -> ScoreBreakdown {
        let volume_term = volume_term(record.volume);
        let intent_multiplier = self.intent_multiplier(&record.keyword);
        let words = significant_word_count(&record.keyword);
        let long_tail_term = long_tail_term(words);
        let competition_term = record.competition.unwrap_or(0.0);
        let serp_term = self.serp_blocker_term(record);
        let source_penalty = self.source_penalty(record.data_source);

        let weights = &self.section.weights;
        let raw = weights.volume * volume_term
            + weights.intent * intent_multiplier
            + weights.long_tail * long_tail_term
            - weights.competition * competition_term
            - weights.serp_blockers * serp_term
            - weights.source_penalty * source_penalty;
        let final_score = raw.clamp(0.0, 1.0);

        record.intent_score = intent_multiplier;
        record.final_score = final_score;
        record.recommended_match_type =
            recommend_match_type(intent_multiplier, words, record.competition);

        ScoreBreakdown {
            volume_term,
            intent_multiplier,
            long_tail_term,
            competition_term,
            serp_term,
            source_penalty,
            final_score,
        }
    }

    /// Scores every record and applies the canonical ordering: score desc,
    /// keyword asc, primary market asc.
    pub fn score_all(&self, records: &mut Vec<KeywordRecord>) {
        for record in records.iter_mut() {
            self.score_record(record);
        }
        records.sort_by(|a, b| {
            b.final_score
                .partial_cmp(&a.final_score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.keyword.cmp(&b.keyword))
                .then_with(|| a.primary_market().cmp(b.primary_market()))
        });
    }

    /// Longest phrase match across the ranked dictionaries decides the
    /// multiplier; length ties resolve toward the higher tier.
    fn intent_multiplier(&self, keyword: &str) -> f64 {
        let dictionaries = &self.section.intent;
        let tiers: [(&[String], f64); 4] = [
            (&dictionaries.extension, 2.3),
            (&dictionaries.transactional, 2.0),
            (&dictionaries.commercial, 1.5),
            (&dictionaries.informational, 1.0),
        ];
        let mut best_len = 0usize;
        let mut best_multiplier = 1.0;
        for (phrases, multiplier) in tiers {
            for phrase in phrases {
                if keyword.contains(phrase.as_str()) && phrase.len() > best_len {
                    best_len = phrase.len();
                    best_multiplier = multiplier;
                }
            }
        }
        best_multiplier
    }

    /// Diminishing-returns accumulation `s <- s + f * (1 - 0.5 * s)` over
    /// the record's SERP features, capped at 1. Features are folded in
    /// weight-descending order (name as tiebreak) so the sum is stable.
    fn serp_blocker_term(&self, record: &KeywordRecord) -> f64 {
        let mut weighted: Vec<(&str, f64)> = record
            .serp_features
            .iter()
            .filter_map(|feature| {
                self.section
                    .serp_feature_weights
                    .get(feature)
                    .map(|weight| (feature.as_str(), *weight))
            })
            .collect();
        weighted.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(b.0))
        });
        let mut sum = 0.0_f64;
        for (_, weight) in weighted {
            sum += weight * (1.0 - 0.5 * sum);
        }
        sum.min(1.0)
    }

    fn source_penalty(&self, source: DataSource) -> f64 {
        let penalties = &self.section.source_penalties;
        match source {
            DataSource::Kwp => penalties.kwp,
            DataSource::Gsc => penalties.gsc,
            DataSource::Estimated => penalties.estimated,
        }
    }
}

fn volume_term(volume: Option<u64>) -> f64 {
    let volume = volume.unwrap_or(0).max(1) as f64;
    (volume.log10() / 10.0).clamp(0.0, 1.0)
}

fn long_tail_term(significant_words: usize) -> f64 {
    match significant_words {
        0..=2 => 0.0,
        3 => 0.2,
        4 => 0.3,
        _ => 0.4,
    }
}

fn recommend_match_type(intent: f64, words: usize, competition: Option<f64>) -> MatchType {
    if intent >= 2.0 && words >= 3 {
        MatchType::Exact
    } else if intent >= 1.5 || words >= 2 {
        MatchType::Phrase
    } else if competition.unwrap_or(0.0) <= 0.4 {
        MatchType::Broad
    } else {
        MatchType::Phrase
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scorer() -> KeywordScorer {
        KeywordScorer::new(ScoringSection::default())
    }

    #[test]
    fn high_intent_long_tail_keyword_scores_exactly() {
        let mut record = KeywordRecord::new("webp to png chrome extension", DataSource::Kwp, "US");
        record.volume = Some(1000);
        record.competition = Some(0.2);
        record.serp_features.insert("featured_snippet".to_string());

        let breakdown = scorer().score_record(&mut record);
        assert!((breakdown.volume_term - 0.3).abs() < 1e-9);
        assert!((breakdown.intent_multiplier - 2.3).abs() < 1e-9);
        assert!((breakdown.long_tail_term - 0.3).abs() < 1e-9);
        assert!((breakdown.serp_term - 0.3).abs() < 1e-9);
        assert!((breakdown.source_penalty - 0.0).abs() < 1e-9);
        assert!((record.final_score - 0.665).abs() < 1e-9);
        assert_eq!(record.recommended_match_type, MatchType::Exact);
    }

    #[test]
    fn volume_term_boundaries() {
        assert!((volume_term(Some(0)) - 0.0).abs() < 1e-9);
        assert!((volume_term(None) - 0.0).abs() < 1e-9);
        assert!((volume_term(Some(10_000_000_000)) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn score_stays_in_unit_interval() {
        let mut record = KeywordRecord::new("virus", DataSource::Estimated, "US");
        record.competition = Some(1.0);
        for feature in [
            "ai_overview",
            "featured_snippet",
            "local_pack",
            "shopping_results",
        ] {
            record.serp_features.insert(feature.to_string());
        }
        scorer().score_record(&mut record);
        assert!((0.0..=1.0).contains(&record.final_score));

        let mut strong = KeywordRecord::new("best webp converter chrome extension download", DataSource::Kwp, "US");
        strong.volume = Some(10_000_000_000);
        scorer().score_record(&mut strong);
        assert!((0.0..=1.0).contains(&strong.final_score));
    }

    #[test]
    fn serp_sum_never_exceeds_one() {
        let mut record = KeywordRecord::new("everything blocked", DataSource::Kwp, "US");
        for feature in [
            "ai_overview",
            "featured_snippet",
            "local_pack",
            "shopping_results",
            "people_also_ask",
            "video_results",
            "knowledge_panel",
        ] {
            record.serp_features.insert(feature.to_string());
        }
        let scorer = scorer();
        let term = scorer.serp_blocker_term(&record);
        assert!(term <= 1.0);
        assert!(term > 0.6);
    }

    #[test]
    fn match_type_tiers() {
        assert_eq!(recommend_match_type(2.3, 4, Some(0.2)), MatchType::Exact);
        assert_eq!(recommend_match_type(2.3, 1, Some(0.2)), MatchType::Phrase);
        assert_eq!(recommend_match_type(1.0, 2, Some(0.9)), MatchType::Phrase);
        assert_eq!(recommend_match_type(1.0, 1, Some(0.2)), MatchType::Broad);
        assert_eq!(recommend_match_type(1.0, 1, Some(0.9)), MatchType::Phrase);
        assert_eq!(recommend_match_type(1.0, 1, None), MatchType::Broad);
    }

    #[test]
    fn ordering_is_deterministic() {
        let mut records = vec![
            KeywordRecord::new("beta keyword", DataSource::Kwp, "US"),
            KeywordRecord::new("alpha keyword", DataSource::Kwp, "US"),
        ];
        for record in &mut records {
            record.volume = Some(500);
        }
        let scorer = scorer();
        scorer.score_all(&mut records);
        assert_eq!(records[0].keyword, "alpha keyword");

        let mut shuffled = vec![records[1].clone(), records[0].clone()];
        scorer.score_all(&mut shuffled);
        assert_eq!(records, shuffled);
    }
}
