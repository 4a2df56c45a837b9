use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use uuid::Uuid;

use crate::config::ProductConfig;
use crate::keyword::{Cluster, KeywordRecord};

use super::models::{AdGroupPlan, CompetitorReport, PlanSummary};
use super::PlanResult;

pub fn round_score(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

pub fn round_money(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn round_rate(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlanArtifacts {
    pub directory: PathBuf,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Serialize)]
struct KeywordCsvRow<'a> {
    keyword: &'a str,
    market: &'a str,
    source: &'a str,
    volume: u64,
    cpc: f64,
    competition: f64,
    intent: f64,
    score: f64,
    match_type: &'a str,
    cluster: &'a str,
    serp_features: String,
}

#[derive(Debug, Serialize)]
struct AdsDocument<'a> {
    product: &'a str,
    date: &'a str,
    ad_groups: &'a [AdGroupPlan],
}

/// Emits the plan artifact set for one run. Files are assembled in a
/// temporary sibling directory and renamed into place in one step, so a
/// failed or cancelled run leaves no partial output behind.
#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    root: PathBuf,
}

impl ArtifactWriter {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn emit(
        &self,
        product: &ProductConfig,
        date: &str,
        records: &[KeywordRecord],
        clusters: &[Cluster],
        ad_groups: &[AdGroupPlan],
        competitors: &CompetitorReport,
        negatives: &[String],
        summary: &PlanSummary,
    ) -> PlanResult<PlanArtifacts> {
        let final_dir = self.root.join(&product.name).join(date);
        let staging = self
            .root
            .join(format!(".tmp-{}", Uuid::new_v4().simple()));
        fs::create_dir_all(&staging)?;

        let result = self.emit_into(
            &staging,
            product,
            date,
            records,
            clusters,
            ad_groups,
            competitors,
            negatives,
            summary,
        );
        let files = match result {
            Ok(files) => files,
            Err(err) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(err);
            }
        };

        if let Some(parent) = final_dir.parent() {
            fs::create_dir_all(parent)?;
        }
        if final_dir.exists() {
            fs::remove_dir_all(&final_dir)?;
        }
        fs::rename(&staging, &final_dir)?;

        let files = files
            .into_iter()
            .map(|name| final_dir.join(name))
            .collect();
        Ok(PlanArtifacts {
            directory: final_dir,
            files,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_into(
        &self,
        dir: &Path,
        product: &ProductConfig,
        date: &str,
        records: &[KeywordRecord],
        clusters: &[Cluster],
        ad_groups: &[AdGroupPlan],
        competitors: &CompetitorReport,
        negatives: &[String],
        summary: &PlanSummary,
    ) -> PlanResult<Vec<&'static str>> {
        self.write_keywords_csv(&dir.join("keywords.csv"), records)?;
        self.write_ads_json(&dir.join("ads.json"), product, date, ad_groups)?;
        self.write_seo_pages(&dir.join("seo_pages.md"), product, clusters)?;
        self.write_competitors(&dir.join("competitors.md"), product, competitors)?;
        self.write_negatives(&dir.join("negatives.txt"), negatives)?;
        self.write_ads_script(&dir.join("google-ads-script.js"), product, date, ad_groups)?;
        self.write_claims_validation(
            &dir.join("claims-validation.json"),
            product,
            date,
        )?;
        self.write_summary(&dir.join("summary.json"), summary)?;

        let mut files = vec![
            "keywords.csv",
            "ads.json",
            "seo_pages.md",
            "competitors.md",
            "negatives.txt",
            "google-ads-script.js",
            "claims-validation.json",
            "summary.json",
        ];
        if self.write_diff(&dir.join("diff.json"), product, date, records)? {
            files.push("diff.json");
        }
        Ok(files)
    }

    fn write_keywords_csv(&self, path: &Path, records: &[KeywordRecord]) -> PlanResult<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for record in records {
            let serp_features = record
                .serp_features
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(";");
            writer.serialize(KeywordCsvRow {
                keyword: &record.keyword,
                market: record.primary_market(),
                source: record.data_source.as_str(),
                volume: record.volume.unwrap_or(0),
                cpc: round_money(record.cpc.unwrap_or(0.0)),
                competition: round_rate(record.competition.unwrap_or(0.0)),
                intent: round_score(record.intent_score),
                score: round_score(record.final_score),
                match_type: record.recommended_match_type.as_str(),
                cluster: record.cluster.as_deref().unwrap_or(""),
                serp_features,
            })?;
        }
        writer.flush()?;
        Ok(())
    }

    fn write_ads_json(
        &self,
        path: &Path,
        product: &ProductConfig,
        date: &str,
        ad_groups: &[AdGroupPlan],
    ) -> PlanResult<()> {
        let document = AdsDocument {
            product: &product.name,
            date,
            ad_groups,
        };
        let mut payload = serde_json::to_string_pretty(&document)?;
        payload.push('\n');
        fs::write(path, payload)?;
        Ok(())
    }

    fn write_seo_pages(
        &self,
        path: &Path,
        product: &ProductConfig,
        clusters: &[Cluster],
    ) -> PlanResult<()> {
        let mut doc = String::new();
        doc.push_str(&format!("# Landing page briefs: {}\n", product.name));
        for cluster in clusters {
            doc.push_str(&format!("\n## {}\n\n", cluster.name));
            doc.push_str(&format!("- Use case: `{}`\n", cluster.use_case));
            match &cluster.landing_page {
                Some(url) => doc.push_str(&format!("- Target page: {url}\n")),
                None => doc.push_str("- Target page: (new page required)\n"),
            }
            doc.push_str(&format!("- Search volume: {}\n", cluster.total_volume));
            doc.push_str("- Primary keywords:\n");
            for keyword in &cluster.primary_keywords {
                doc.push_str(&format!("  - {keyword}\n"));
            }
            if let Some(proposition) = product.value_propositions.first() {
                doc.push_str(&format!("- Suggested angle: {proposition}\n"));
            }
        }
        fs::write(path, doc)?;
        Ok(())
    }

    fn write_competitors(
        &self,
        path: &Path,
        product: &ProductConfig,
        report: &CompetitorReport,
    ) -> PlanResult<()> {
        let mut doc = String::new();
        doc.push_str(&format!("# Competitor landscape: {}\n\n", product.name));
        doc.push_str(&format!("SERP snapshots analyzed: {}\n\n", report.serp_calls));
        doc.push_str("| Domain | Appearances | Clusters | Markets |\n");
        doc.push_str("|---|---|---|---|\n");
        for (domain, entry) in &report.domains {
            doc.push_str(&format!(
                "| {} | {} | {} | {} |\n",
                domain,
                entry.appearances,
                entry.clusters.join(", "),
                entry.markets.join(", ")
            ));
        }
        fs::write(path, doc)?;
        Ok(())
    }

    fn write_negatives(&self, path: &Path, negatives: &[String]) -> PlanResult<()> {
        let mut sorted: Vec<String> = negatives.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut doc = sorted.join("\n");
        if !doc.is_empty() {
            doc.push('\n');
        }
        fs::write(path, doc)?;
        Ok(())
    }

    fn write_ads_script(
        &self,
        path: &Path,
        product: &ProductConfig,
        date: &str,
        ad_groups: &[AdGroupPlan],
    ) -> PlanResult<()> {
        let payload = serde_json::to_string_pretty(ad_groups)?;
        let script = format!(
            r#"// Campaign bootstrap for {product} - generated {date}
// Creates one ad group per use-case cluster with recommended match types.
var AD_GROUPS = {payload};

function main() {{
  var campaignIterator = AdsApp.campaigns()
    .withCondition("campaign.name = '{product}'")
    .get();
  if (!campaignIterator.hasNext()) {{
    Logger.log('Campaign {product} not found; create it first.');
    return;
  }}
  var campaign = campaignIterator.next();
  AD_GROUPS.forEach(function (group) {{
    var operation = campaign.newAdGroupBuilder()
      .withName(group.name)
      .build();
    if (!operation.isSuccessful()) {{
      Logger.log('Failed to create ad group ' + group.name);
      return;
    }}
    var adGroup = operation.getResult();
    group.keywords.forEach(function (entry) {{
      var text = entry.keyword;
      if (entry.match_type === 'exact') {{ text = '[' + text + ']'; }}
      if (entry.match_type === 'phrase') {{ text = '"' + text + '"'; }}
      adGroup.newKeywordBuilder().withText(text).build();
    }});
  }});
}}
"#,
            product = product.name,
            date = date,
            payload = payload,
        );
        fs::write(path, script)?;
        Ok(())
    }

    fn write_summary(&self, path: &Path, summary: &PlanSummary) -> PlanResult<()> {
        let mut payload = serde_json::to_string_pretty(summary)?;
        payload.push('\n');
        fs::write(path, payload)?;
        Ok(())
    }

    /// Claims worksheet for the compliance reviewer: every value
    /// proposition used in ad copy starts out pending validation.
    fn write_claims_validation(
        &self,
        path: &Path,
        product: &ProductConfig,
        date: &str,
    ) -> PlanResult<()> {
        let claims: Vec<ClaimEntry> = product
            .value_propositions
            .iter()
            .map(|claim| ClaimEntry {
                claim: claim.clone(),
                status: "pending_validation",
                evidence: None,
            })
            .collect();
        let document = ClaimsDocument {
            product: &product.name,
            date,
            claims,
        };
        let mut payload = serde_json::to_string_pretty(&document)?;
        payload.push('\n');
        fs::write(path, payload)?;
        Ok(())
    }

    /// Diff against the most recent earlier run of the same product.
    /// Returns false (and writes nothing) when this is the first run.
    fn write_diff(
        &self,
        path: &Path,
        product: &ProductConfig,
        date: &str,
        records: &[KeywordRecord],
    ) -> PlanResult<bool> {
        let Some(previous_dir) = self.latest_previous_run(&product.name, date)? else {
            return Ok(false);
        };
        let previous = read_keyword_scores(&previous_dir.join("keywords.csv"))?;
        let current: BTreeMap<(String, String), f64> = records
            .iter()
            .map(|record| {
                (
                    (record.keyword.clone(), record.primary_market().to_string()),
                    round_score(record.final_score),
                )
            })
            .collect();

        let mut added = Vec::new();
        let mut rescored = Vec::new();
        for ((keyword, market), score) in &current {
            match previous.get(&(keyword.clone(), market.clone())) {
                None => added.push(DiffKeyword {
                    keyword: keyword.clone(),
                    market: market.clone(),
                    score: *score,
                }),
                Some(old_score) if (old_score - score).abs() > 0.0005 => {
                    rescored.push(DiffRescore {
                        keyword: keyword.clone(),
                        market: market.clone(),
                        old_score: *old_score,
                        new_score: *score,
                    })
                }
                Some(_) => {}
            }
        }
        let removed: Vec<DiffKeyword> = previous
            .iter()
            .filter(|(key, _)| !current.contains_key(*key))
            .map(|((keyword, market), score)| DiffKeyword {
                keyword: keyword.clone(),
                market: market.clone(),
                score: *score,
            })
            .collect();

        let previous_date = previous_dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let document = DiffDocument {
            product: &product.name,
            date,
            previous_date,
            added,
            removed,
            rescored,
        };
        let mut payload = serde_json::to_string_pretty(&document)?;
        payload.push('\n');
        fs::write(path, payload)?;
        Ok(true)
    }

    fn latest_previous_run(&self, product: &str, date: &str) -> PlanResult<Option<PathBuf>> {
        let product_dir = self.root.join(product);
        if !product_dir.is_dir() {
            return Ok(None);
        }
        let mut runs: Vec<String> = Vec::new();
        for entry in fs::read_dir(&product_dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.as_str() < date && entry.path().join("keywords.csv").is_file() {
                runs.push(name);
            }
        }
        runs.sort();
        Ok(runs.pop().map(|name| product_dir.join(name)))
    }
}

#[derive(Debug, Serialize)]
struct ClaimsDocument<'a> {
    product: &'a str,
    date: &'a str,
    claims: Vec<ClaimEntry>,
}

#[derive(Debug, Serialize)]
struct ClaimEntry {
    claim: String,
    status: &'static str,
    evidence: Option<String>,
}

#[derive(Debug, Serialize)]
struct DiffDocument<'a> {
    product: &'a str,
    date: &'a str,
    previous_date: String,
    added: Vec<DiffKeyword>,
    removed: Vec<DiffKeyword>,
    rescored: Vec<DiffRescore>,
}

#[derive(Debug, Serialize)]
struct DiffKeyword {
    keyword: String,
    market: String,
    score: f64,
}

#[derive(Debug, Serialize)]
struct DiffRescore {
    keyword: String,
    market: String,
    old_score: f64,
    new_score: f64,
}

fn read_keyword_scores(path: &Path) -> PlanResult<BTreeMap<(String, String), f64>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut scores = BTreeMap::new();
    for row in reader.deserialize::<KeywordCsvOwnedRow>() {
        let row = row?;
        scores.insert((row.keyword, row.market), row.score);
    }
    Ok(scores)
}

// Columns beyond these three are ignored by the header-driven reader.
#[derive(Debug, serde::Deserialize)]
struct KeywordCsvOwnedRow {
    keyword: String,
    market: String,
    score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetPage;
    use crate::keyword::DataSource;
    use std::collections::BTreeMap;

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

    fn summary() -> PlanSummary {
        PlanSummary {
            product: "webp-shift".to_string(),
            date: "2025-06-02".to_string(),
            markets: vec!["US".to_string()],
            total_keywords: 1,
            total_ad_groups: 1,
            serp_calls_used: 0,
            cache_hit_rate: 0.0,
            data_source_counts: BTreeMap::new(),
            top_opportunities: vec![],
            generation_time_ms: 12,
            warnings: vec![],
        }
    }

    fn emit_for_date(root: &Path, date: &str, keyword: &str, score: f64) -> PlanArtifacts {
        let mut record = KeywordRecord::new(keyword, DataSource::Kwp, "US");
        record.volume = Some(1000);
        record.final_score = score;
        record.cluster = Some("webp-png".to_string());
        let cluster = Cluster {
            name: "webp-png".to_string(),
            use_case: "webp-png".to_string(),
            primary_keywords: vec![keyword.to_string()],
            keywords: vec![keyword.to_string()],
            total_volume: 1000,
            landing_page: Some("https://example.com/webp-to-png".to_string()),
        };
        ArtifactWriter::new(root)
            .emit(
                &product(),
                date,
                &[record],
                &[cluster],
                &[],
                &CompetitorReport::default(),
                &["crack".to_string(), "torrent".to_string()],
                &summary(),
            )
            .unwrap()
    }

    fn emit_once(root: &Path) -> PlanArtifacts {
        emit_for_date(root, "2025-06-02", "webp to png", 0.665)
    }

    #[test]
    fn emits_full_artifact_set() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = emit_once(dir.path());
        assert_eq!(artifacts.files.len(), 8);
        for file in &artifacts.files {
            assert!(file.exists(), "missing artifact {file:?}");
        }
        assert!(artifacts.directory.ends_with("webp-shift/2025-06-02"));
        // No staging residue once the rename lands.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn artifacts_are_bytewise_stable() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let a = emit_once(dir_a.path());
        let b = emit_once(dir_b.path());
        for (left, right) in a.files.iter().zip(b.files.iter()) {
            assert_eq!(
                fs::read(left).unwrap(),
                fs::read(right).unwrap(),
                "artifact {left:?} differs between identical runs"
            );
        }
    }

    #[test]
    fn first_run_has_no_diff() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = emit_once(dir.path());
        assert!(!artifacts.directory.join("diff.json").exists());
    }

    #[test]
    fn later_runs_diff_against_the_previous_one() {
        let dir = tempfile::tempdir().unwrap();
        emit_once(dir.path());
        let artifacts = emit_for_date(dir.path(), "2025-06-03", "webp to png batch", 0.7);
        let raw = fs::read_to_string(artifacts.directory.join("diff.json")).unwrap();
        let diff: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(diff["previous_date"], "2025-06-02");
        assert_eq!(diff["added"][0]["keyword"], "webp to png batch");
        assert_eq!(diff["removed"][0]["keyword"], "webp to png");
        assert!(diff["rescored"].as_array().unwrap().is_empty());
    }

    #[test]
    fn claims_worksheet_lists_value_propositions() {
        let dir = tempfile::tempdir().unwrap();
        let artifacts = emit_once(dir.path());
        let raw =
            fs::read_to_string(artifacts.directory.join("claims-validation.json")).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["claims"][0]["status"], "pending_validation");
        assert_eq!(doc["claims"][0]["claim"], "Converts locally, no upload");
    }

    #[test]
    fn rounding_fixes_decimal_places() {
        assert_eq!(round_score(0.66549), 0.665);
        assert_eq!(round_money(0.808), 0.81);
        assert_eq!(round_rate(0.123456), 0.1235);
    }
}
