use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::models::{Variant, VariantPayload};
use super::{ExperimentError, ExperimentResult};

/// Creative rewrite angles. Each strategy produces one candidate variant
/// from the base creative; candidates too close to control are rewritten
/// once and then discarded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VariantStrategy {
    BenefitLed,
    ProofLed,
    Diverse,
    ConversionFocused,
}

impl VariantStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            VariantStrategy::BenefitLed => "benefit_led",
            VariantStrategy::ProofLed => "proof_led",
            VariantStrategy::Diverse => "diverse",
            VariantStrategy::ConversionFocused => "conversion_focused",
        }
    }
}

impl fmt::Display for VariantStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VariantStrategy {
    type Err = ExperimentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "benefit_led" => Ok(VariantStrategy::BenefitLed),
            "proof_led" => Ok(VariantStrategy::ProofLed),
            "diverse" => Ok(VariantStrategy::Diverse),
            "conversion_focused" => Ok(VariantStrategy::ConversionFocused),
            other => Err(ExperimentError::Validation(format!(
                "unknown variant strategy: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RsaCreative {
    pub headlines: Vec<String>,
    pub descriptions: Vec<String>,
    pub final_urls: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LandingPageCreative {
    pub headline: String,
    pub subheadline: String,
    pub cta: String,
    pub content_path: String,
}

fn normalize_entry(entry: &str) -> String {
    entry.trim().to_lowercase()
}

/// RSA similarity: fraction of identical normalized entries across the
/// union of headlines and descriptions (Jaccard over entry sets).
pub fn rsa_similarity(a: &RsaCreative, b: &RsaCreative) -> f64 {
    let entries = |creative: &RsaCreative| -> BTreeSet<String> {
        creative
            .headlines
            .iter()
            .chain(creative.descriptions.iter())
            .map(|entry| normalize_entry(entry))
            .collect()
    };
    let set_a = entries(a);
    let set_b = entries(b);
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count() as f64;
    let union = set_a.union(&set_b).count() as f64;
    intersection / union
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];
    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

fn field_similarity(a: &str, b: &str) -> f64 {
    let a = normalize_entry(a);
    let b = normalize_entry(b);
    let longest = a.chars().count().max(b.chars().count());
    if longest == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&a, &b) as f64 / longest as f64
}

/// Landing-page similarity: normalized edit-distance aggregate over the
/// headline, subheadline and call-to-action fields.
pub fn page_similarity(a: &LandingPageCreative, b: &LandingPageCreative) -> f64 {
    (field_similarity(&a.headline, &b.headline)
        + field_similarity(&a.subheadline, &b.subheadline)
        + field_similarity(&a.cta, &b.cta))
        / 3.0
}

const STOCK_HEADLINES: &[&str] = &[
    "Works Offline in Your Browser",
    "Free to Install",
    "No Account Needed",
];

const STOCK_DESCRIPTIONS: &[&str] = &[
    "Runs entirely in your browser, nothing is uploaded.",
    "Install once and convert files whenever you need.",
];

fn rewrite_headline(strategy: VariantStrategy, attempt: usize, headline: &str) -> String {
    let templates: &[&str] = match strategy {
        VariantStrategy::BenefitLed => &["Save Time: {}", "One Click: {}"],
        VariantStrategy::ProofLed => &["{} - Rated 4.8/5", "{} - 10,000+ Users"],
        VariantStrategy::Diverse => &["{} Online", "Your {}"],
        VariantStrategy::ConversionFocused => &["Install {} Free", "Get {} Now"],
    };
    templates[attempt % templates.len()].replace("{}", headline)
}

fn rewrite_description(strategy: VariantStrategy, attempt: usize, description: &str) -> String {
    let suffixes: &[&str] = match strategy {
        VariantStrategy::BenefitLed => &["No signup required.", "Done in seconds."],
        VariantStrategy::ProofLed => &["Loved by power users.", "Backed by weekly updates."],
        VariantStrategy::Diverse => &["Works on any site.", "Light on memory."],
        VariantStrategy::ConversionFocused => &["Install free today.", "Start converting now."],
    };
    format!("{} {}", description, suffixes[attempt % suffixes.len()])
}

fn ensure_rsa_shape(headlines: &mut Vec<String>, descriptions: &mut Vec<String>) {
    let mut stock = STOCK_HEADLINES.iter();
    while headlines.len() < 3 {
        match stock.next() {
            Some(line) => headlines.push((*line).to_string()),
            None => break,
        }
    }
    let mut stock = STOCK_DESCRIPTIONS.iter();
    while descriptions.len() < 2 {
        match stock.next() {
            Some(line) => descriptions.push((*line).to_string()),
            None => break,
        }
    }
    headlines.truncate(15);
    descriptions.truncate(4);
}

fn rsa_payload(creative: &RsaCreative, labels: Vec<String>) -> VariantPayload {
    VariantPayload::Rsa {
        headlines: creative.headlines.clone(),
        descriptions: creative.descriptions.clone(),
        final_urls: creative.final_urls.clone(),
        labels,
    }
}

fn build_rsa_candidate(
    base: &RsaCreative,
    anchor: &str,
    strategy: VariantStrategy,
    attempt: usize,
) -> RsaCreative {
    // First headline stays pinned to the product anchor.
    let mut headlines = vec![anchor.to_string()];
    for headline in base.headlines.iter().filter(|headline| headline.as_str() != anchor) {
        headlines.push(rewrite_headline(strategy, attempt + headlines.len(), headline));
    }
    let mut descriptions: Vec<String> = base
        .descriptions
        .iter()
        .enumerate()
        .map(|(index, description)| rewrite_description(strategy, attempt + index, description))
        .collect();
    ensure_rsa_shape(&mut headlines, &mut descriptions);
    RsaCreative {
        headlines,
        descriptions,
        final_urls: base.final_urls.clone(),
    }
}

/// Generates the control plus one RSA variant per strategy. Every variant
/// keeps the anchor pinned as its first headline, carries at least three
/// headlines and two descriptions, and stays under the similarity
/// threshold against control; a candidate that misses the threshold is
/// rewritten once and discarded if it still fails.
pub fn generate_rsa_variants(
    base: &RsaCreative,
    anchor: &str,
    strategies: &[VariantStrategy],
    max_similarity: f64,
) -> ExperimentResult<Vec<Variant>> {
    if anchor.trim().is_empty() {
        return Err(ExperimentError::Validation(
            "anchor headline must not be empty".to_string(),
        ));
    }

    let mut control_creative = base.clone();
    if control_creative.headlines.first().map(String::as_str) != Some(anchor) {
        control_creative
            .headlines
            .retain(|headline| headline != anchor);
        control_creative.headlines.insert(0, anchor.to_string());
    }
    ensure_rsa_shape(&mut control_creative.headlines, &mut control_creative.descriptions);

    let mut variants = vec![Variant {
        id: "control".to_string(),
        name: "control".to_string(),
        is_control: true,
        weight: 0.0,
        similarity_to_control: 1.0,
        payload: rsa_payload(&control_creative, vec!["control".to_string()]),
    }];

    for strategy in strategies {
        let mut accepted = None;
        for attempt in 0..2 {
            let candidate = build_rsa_candidate(&control_creative, anchor, *strategy, attempt);
            let similarity = rsa_similarity(&candidate, &control_creative);
            if similarity <= max_similarity {
                accepted = Some((candidate, similarity));
                break;
            }
        }
        let Some((candidate, similarity)) = accepted else {
            continue;
        };
        variants.push(Variant {
            id: strategy.as_str().to_string(),
            name: strategy.as_str().to_string(),
            is_control: false,
            weight: 0.0,
            similarity_to_control: similarity,
            payload: rsa_payload(&candidate, vec![strategy.as_str().to_string()]),
        });
    }

    let weight = 1.0 / variants.len() as f64;
    for variant in &mut variants {
        variant.weight = weight;
    }
    Ok(variants)
}

fn build_page_candidate(
    base: &LandingPageCreative,
    strategy: VariantStrategy,
    attempt: usize,
) -> LandingPageCreative {
    LandingPageCreative {
        headline: rewrite_headline(strategy, attempt, &base.headline),
        subheadline: rewrite_description(strategy, attempt, &base.subheadline),
        cta: match strategy {
            VariantStrategy::ConversionFocused => "Install Free Now".to_string(),
            VariantStrategy::ProofLed => "Join 10,000+ Users".to_string(),
            VariantStrategy::BenefitLed => "Start Saving Time".to_string(),
            VariantStrategy::Diverse => format!("{} Today", base.cta),
        },
        content_path: format!("{}-{}", base.content_path, strategy.as_str()),
    }
}

/// Landing-page counterpart of [`generate_rsa_variants`]; similarity uses
/// the edit-distance aggregate over headline, subheadline and CTA.
pub fn generate_landing_page_variants(
    base: &LandingPageCreative,
    strategies: &[VariantStrategy],
    max_similarity: f64,
) -> ExperimentResult<Vec<Variant>> {
    let mut variants = vec![Variant {
        id: "control".to_string(),
        name: "control".to_string(),
        is_control: true,
        weight: 0.0,
        similarity_to_control: 1.0,
        payload: VariantPayload::LandingPage {
            content_path: base.content_path.clone(),
            routing_rules: vec!["default".to_string()],
        },
    }];

    for strategy in strategies {
        let mut accepted = None;
        for attempt in 0..2 {
            let candidate = build_page_candidate(base, *strategy, attempt);
            let similarity = page_similarity(&candidate, base);
            if similarity <= max_similarity {
                accepted = Some((candidate, similarity));
                break;
            }
        }
        let Some((candidate, similarity)) = accepted else {
            continue;
        };
        variants.push(Variant {
            id: strategy.as_str().to_string(),
            name: strategy.as_str().to_string(),
            is_control: false,
            weight: 0.0,
            similarity_to_control: similarity,
            payload: VariantPayload::LandingPage {
                content_path: candidate.content_path.clone(),
                routing_rules: vec![format!("split:{}", strategy.as_str())],
            },
        });
    }

    let weight = 1.0 / variants.len() as f64;
    for variant in &mut variants {
        variant.weight = weight;
    }
    Ok(variants)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> RsaCreative {
        RsaCreative {
            headlines: vec![
                "WebP Shift".to_string(),
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

    #[test]
    fn levenshtein_basics() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn identical_rsas_have_similarity_one() {
        let creative = base();
        assert_eq!(rsa_similarity(&creative, &creative), 1.0);
    }

    #[test]
    fn disjoint_rsas_have_similarity_zero() {
        let other = RsaCreative {
            headlines: vec!["Totally Different".to_string()],
            descriptions: vec!["Nothing shared.".to_string()],
            final_urls: vec![],
        };
        assert_eq!(rsa_similarity(&base(), &other), 0.0);
    }

    #[test]
    fn generated_variants_respect_shape_and_anchor() {
        let strategies = [
            VariantStrategy::BenefitLed,
            VariantStrategy::ProofLed,
            VariantStrategy::ConversionFocused,
        ];
        let variants =
            generate_rsa_variants(&base(), "WebP Shift", &strategies, 0.9).unwrap();
        assert_eq!(variants.len(), 4);
        assert!(variants[0].is_control);
        for variant in &variants {
            let VariantPayload::Rsa {
                headlines,
                descriptions,
                ..
            } = &variant.payload
            else {
                panic!("expected rsa payload");
            };
            assert!(headlines.len() >= 3);
            assert!(descriptions.len() >= 2);
            assert_eq!(headlines[0], "WebP Shift");
        }
    }

    #[test]
    fn variant_similarity_stays_under_threshold() {
        let strategies = [VariantStrategy::BenefitLed, VariantStrategy::Diverse];
        let variants = generate_rsa_variants(&base(), "WebP Shift", &strategies, 0.9).unwrap();
        for variant in variants.iter().filter(|variant| !variant.is_control) {
            assert!(variant.similarity_to_control <= 0.9);
        }
    }

    #[test]
    fn weights_split_evenly() {
        let variants =
            generate_rsa_variants(&base(), "WebP Shift", &[VariantStrategy::BenefitLed], 0.9)
                .unwrap();
        let total: f64 = variants.iter().map(|variant| variant.weight).sum();
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn generation_is_deterministic() {
        let strategies = [VariantStrategy::ProofLed, VariantStrategy::Diverse];
        let a = generate_rsa_variants(&base(), "WebP Shift", &strategies, 0.9).unwrap();
        let b = generate_rsa_variants(&base(), "WebP Shift", &strategies, 0.9).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn near_duplicate_threshold_discards_candidates() {
        // Threshold of zero rejects everything that shares the anchor.
        let variants =
            generate_rsa_variants(&base(), "WebP Shift", &[VariantStrategy::Diverse], 0.0)
                .unwrap();
        assert_eq!(variants.len(), 1);
        assert!(variants[0].is_control);
    }

    #[test]
    fn landing_page_variants_route_by_strategy() {
        let base = LandingPageCreative {
            headline: "Convert WebP Fast".to_string(),
            subheadline: "Local conversion, private by default".to_string(),
            cta: "Add to Chrome".to_string(),
            content_path: "pages/webp-to-png".to_string(),
        };
        let variants = generate_landing_page_variants(
            &base,
            &[VariantStrategy::ConversionFocused],
            0.9,
        )
        .unwrap();
        assert_eq!(variants.len(), 2);
        let VariantPayload::LandingPage {
            content_path,
            routing_rules,
        } = &variants[1].payload
        else {
            panic!("expected landing page payload");
        };
        assert_eq!(content_path, "pages/webp-to-png-conversion_focused");
        assert_eq!(routing_rules[0], "split:conversion_focused");
    }
}
