use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::{ClusteringSection, ProductConfig};

use super::models::KeywordRecord;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cluster {
    pub name: String,
    pub use_case: String,
    /// Highest-scoring keywords of the cluster, score-descending.
    pub primary_keywords: Vec<String>,
    pub keywords: Vec<String>,
    pub total_volume: u64,
    pub landing_page: Option<String>,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq)]
pub struct ClusterOutcome {
    pub clusters: Vec<Cluster>,
    pub absorbed: usize,
    pub misc_keywords: usize,
}

const MISC_CLUSTER: &str = "misc";

/// Groups scored keywords into use-case clusters and assigns landing
/// pages from the product configuration.
#[derive(Debug, Clone)]
pub struct ClusterEngine {
    section: ClusteringSection,
    product: ProductConfig,
}

impl ClusterEngine {
    pub fn new(section: ClusteringSection, product: ProductConfig) -> Self {
        Self { section, product }
    }

    /// Assigns every keyword to exactly one cluster. Records must already
    /// be scored; cluster keyword order follows record order.
    pub fn cluster(&self, records: &mut [KeywordRecord]) -> ClusterOutcome {
        let mut buckets: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (index, record) in records.iter().enumerate() {
            let use_case = self.derive_use_case(&record.keyword);
            buckets.entry(use_case).or_default().push(index);
        }

        let (buckets, absorbed) = self.enforce_min_size(buckets);

        let mut clusters = Vec::new();
        let mut misc_keywords = 0;
        for (use_case, indexes) in &buckets {
            let mut member_keywords = Vec::with_capacity(indexes.len());
            let mut total_volume: u64 = 0;
            for &index in indexes {
                let record = &mut records[index];
                record.cluster = Some(use_case.clone());
                member_keywords.push((record.final_score, record.keyword.clone()));
                total_volume += record.volume.unwrap_or(0);
            }
            member_keywords.sort_by(|a, b| {
                b.0.partial_cmp(&a.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.1.cmp(&b.1))
            });
            let keywords: Vec<String> =
                member_keywords.into_iter().map(|(_, keyword)| keyword).collect();
            let primary_keywords = keywords
                .iter()
                .take(self.section.primary_keyword_count)
                .cloned()
                .collect();
            if use_case == MISC_CLUSTER {
                misc_keywords = keywords.len();
            }
            clusters.push(Cluster {
                name: use_case.clone(),
                use_case: use_case.clone(),
                landing_page: self.assign_landing_page(use_case),
                primary_keywords,
                keywords,
                total_volume,
            });
        }

        clusters.sort_by(|a, b| {
            b.total_volume
                .cmp(&a.total_volume)
                .then_with(|| a.name.cmp(&b.name))
        });

        ClusterOutcome {
            clusters,
            absorbed,
            misc_keywords,
        }
    }

    /// Use-case token for one keyword: best word-overlap against the
    /// configured target-page use cases, falling back to a lexical token
    /// built from the keyword's leading significant words.
    fn derive_use_case(&self, keyword: &str) -> String {
        let keyword_words: Vec<&str> = keyword.split_whitespace().collect();
        let mut best: Option<(usize, &str)> = None;
        for page in &self.product.target_pages {
            let Some(use_case) = page.use_case.as_deref() else {
                continue;
            };
            let overlap = use_case
                .split(['-', ' '])
                .filter(|token| keyword_words.contains(token))
                .count();
            if overlap == 0 {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_overlap, best_name)) => {
                    overlap > best_overlap || (overlap == best_overlap && use_case < best_name)
                }
            };
            if better {
                best = Some((overlap, use_case));
            }
        }
        if let Some((_, use_case)) = best {
            return use_case.to_string();
        }

        let mut significant: Vec<&str> = keyword_words
            .into_iter()
            .filter(|word| word.len() > 2)
            .take(2)
            .collect();
        if significant.is_empty() {
            significant.push(MISC_CLUSTER);
        }
        significant.join("-")
    }

    /// Clusters under the minimum size are absorbed into the neighbor
    /// sharing the most name tokens, or dropped into `misc` when nothing
    /// overlaps. Deterministic: buckets are visited in name order.
    fn enforce_min_size(
        &self,
        buckets: BTreeMap<String, Vec<usize>>,
    ) -> (BTreeMap<String, Vec<usize>>, usize) {
        let min_size = self.section.min_cluster_size.max(1);
        let survivors: Vec<String> = buckets
            .iter()
            .filter(|(_, members)| members.len() >= min_size)
            .map(|(name, _)| name.clone())
            .collect();

        let mut result: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        let mut absorbed = 0;
        for (name, members) in buckets {
            if members.len() >= min_size {
                result.entry(name).or_default().extend(members);
                continue;
            }
            absorbed += 1;
            let target = nearest_neighbor(&name, &survivors)
                .unwrap_or_else(|| MISC_CLUSTER.to_string());
            result.entry(target).or_default().extend(members);
        }
        (result, absorbed)
    }

    /// Exact use-case match first, then the page whose use case is the
    /// longest prefix of the cluster token.
    fn assign_landing_page(&self, use_case: &str) -> Option<String> {
        for page in &self.product.target_pages {
            if page.use_case.as_deref() == Some(use_case) {
                return Some(page.url.clone());
            }
        }
        let mut best: Option<(usize, &str)> = None;
        for page in &self.product.target_pages {
            let Some(page_use_case) = page.use_case.as_deref() else {
                continue;
            };
            if !use_case.starts_with(page_use_case) {
                continue;
            }
            let better = match best {
                None => true,
                Some((best_len, best_url)) => {
                    page_use_case.len() > best_len
                        || (page_use_case.len() == best_len && page.url.as_str() < best_url)
                }
            };
            if better {
                best = Some((page_use_case.len(), page.url.as_str()));
            }
        }
        best.map(|(_, url)| url.to_string())
    }
}

fn nearest_neighbor(name: &str, survivors: &[String]) -> Option<String> {
    let tokens: Vec<&str> = name.split(['-', ' ']).collect();
    let mut best: Option<(usize, &str)> = None;
    for survivor in survivors {
        let overlap = survivor
            .split(['-', ' '])
            .filter(|token| tokens.contains(token))
            .count();
        if overlap == 0 {
            continue;
        }
        let better = match best {
            None => true,
            Some((best_overlap, best_name)) => {
                overlap > best_overlap
                    || (overlap == best_overlap && survivor.as_str() < best_name)
            }
        };
        if better {
            best = Some((overlap, survivor.as_str()));
        }
    }
    best.map(|(_, name)| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetPage;
    use crate::keyword::models::DataSource;

    fn product() -> ProductConfig {
        ProductConfig {
            name: "webp-shift".to_string(),
            markets: vec!["US".to_string()],
            seed_queries: vec!["webp to png".to_string()],
            target_pages: vec![
                TargetPage {
                    url: "https://example.com/webp-to-png".to_string(),
                    purpose: "conversion".to_string(),
                    use_case: Some("webp-png".to_string()),
                },
                TargetPage {
                    url: "https://example.com/bulk".to_string(),
                    purpose: "batch conversion".to_string(),
                    use_case: Some("bulk-convert".to_string()),
                },
            ],
            value_propositions: vec![],
            pre_seeded_negatives: vec![],
            brand_terms: vec![],
            anchor_headline: "WebP Shift".to_string(),
        }
    }

    fn engine() -> ClusterEngine {
        ClusterEngine::new(ClusteringSection::default(), product())
    }

    fn record(keyword: &str, volume: u64, score: f64) -> KeywordRecord {
        let mut record = KeywordRecord::new(keyword, DataSource::Kwp, "US");
        record.volume = Some(volume);
        record.final_score = score;
        record
    }

    #[test]
    fn keywords_map_to_target_page_use_cases() {
        let mut records = vec![
            record("webp to png converter", 1000, 0.7),
            record("convert webp to png", 800, 0.6),
        ];
        let outcome = engine().cluster(&mut records);
        assert_eq!(outcome.clusters.len(), 1);
        let cluster = &outcome.clusters[0];
        assert_eq!(cluster.use_case, "webp-png");
        assert_eq!(
            cluster.landing_page.as_deref(),
            Some("https://example.com/webp-to-png")
        );
        assert_eq!(cluster.total_volume, 1800);
        assert!(records.iter().all(|r| r.cluster.as_deref() == Some("webp-png")));
    }

    #[test]
    fn primary_keywords_are_score_ordered() {
        let mut records = vec![
            record("webp to png converter", 500, 0.5),
            record("webp png chrome", 900, 0.9),
            record("png webp batch", 100, 0.2),
        ];
        let outcome = engine().cluster(&mut records);
        let cluster = &outcome.clusters[0];
        assert_eq!(cluster.primary_keywords[0], "webp png chrome");
        assert_eq!(cluster.keywords.len(), 3);
    }

    #[test]
    fn undersized_clusters_fall_into_misc() {
        let mut records = vec![
            record("webp to png one", 10, 0.5),
            record("webp to png two", 10, 0.5),
            record("unrelated singleton", 10, 0.1),
        ];
        let outcome = engine().cluster(&mut records);
        assert_eq!(outcome.absorbed, 1);
        assert!(outcome
            .clusters
            .iter()
            .any(|cluster| cluster.name == MISC_CLUSTER));
        assert_eq!(outcome.misc_keywords, 1);
    }

    #[test]
    fn clustering_is_stable_across_runs() {
        let build = || {
            let mut records = vec![
                record("webp to png alpha", 100, 0.3),
                record("webp to png beta", 200, 0.4),
                record("bulk convert images", 50, 0.2),
                record("bulk convert files", 60, 0.25),
            ];
            engine().cluster(&mut records)
        };
        assert_eq!(build(), build());
    }
}
