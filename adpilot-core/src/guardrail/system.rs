use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::config::GuardrailSection;
use crate::runtime::Clock;

use super::rules::{
    BudgetCapRule, ClaimsFreshnessRule, LandingPageHealthRule, MaxChangePctRule,
    MinQualityScoreRule,
};
use super::store::SqliteGuardrailStore;
use super::{
    GuardrailContext, GuardrailResult, GuardrailRule, PlannedChanges, ValidationOutcome,
    ViolationSeverity,
};

/// Runs every registered rule against a proposal, in registration order,
/// and appends exactly one audit row per validation. A proposal can be
/// overridden by an authorized operator only when no critical violation
/// is present.
pub struct GuardrailSystem {
    rules: Vec<Box<dyn GuardrailRule>>,
    store: SqliteGuardrailStore,
    constraints: GuardrailSection,
    clock: Arc<dyn Clock>,
}

impl GuardrailSystem {
    /// The standard five-rule configuration, in fixed order.
    pub fn new(
        store: SqliteGuardrailStore,
        constraints: GuardrailSection,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let rules: Vec<Box<dyn GuardrailRule>> = vec![
            Box::new(BudgetCapRule),
            Box::new(MaxChangePctRule),
            Box::new(MinQualityScoreRule),
            Box::new(LandingPageHealthRule),
            Box::new(ClaimsFreshnessRule),
        ];
        Self {
            rules,
            store,
            constraints,
            clock,
        }
    }

    /// Registers an additional rule after the built-in set.
    pub fn register(&mut self, rule: Box<dyn GuardrailRule>) {
        self.rules.push(rule);
    }

    pub fn rule_ids(&self) -> Vec<&'static str> {
        self.rules.iter().map(|rule| rule.id()).collect()
    }

    fn build_context(&self, proposal: &PlannedChanges) -> GuardrailResult<GuardrailContext> {
        let now = self.clock.now();
        let mut quality_scores = BTreeMap::new();
        let mut landing_page_health = BTreeMap::new();
        let mut claims_validated_at = BTreeMap::new();
        for mutation in &proposal.mutations {
            let campaign = mutation.campaign.clone();
            if !quality_scores.contains_key(&campaign) {
                if let Some(score) = self.store.quality_score_30d(&campaign, now)? {
                    quality_scores.insert(campaign.clone(), score);
                }
            }
            if !landing_page_health.contains_key(&campaign) {
                if let Some(health) = self.store.worst_landing_page_health(&campaign)? {
                    landing_page_health.insert(campaign.clone(), health);
                }
            }
            if !claims_validated_at.contains_key(&campaign) {
                if let Some(validated_at) = self.store.claims_validated_at(&campaign)? {
                    claims_validated_at.insert(campaign.clone(), validated_at);
                }
            }
        }
        Ok(GuardrailContext {
            constraints: self.constraints.clone(),
            quality_scores,
            landing_page_health,
            claims_validated_at,
            now,
        })
    }

    pub fn validate_proposal(
        &self,
        proposal: &PlannedChanges,
    ) -> GuardrailResult<ValidationOutcome> {
        let context = self.build_context(proposal)?;
        let proposal_hash = proposal.proposal_hash()?;

        let mut violations = Vec::new();
        for rule in &self.rules {
            let outcome = rule.validate(proposal, &context);
            violations.extend(outcome.violations);
        }

        let passed = violations.is_empty();
        let can_override = !violations
            .iter()
            .any(|violation| violation.severity == ViolationSeverity::Critical);

        self.store.append_validation(
            &proposal_hash,
            passed,
            violations.len(),
            can_override,
            &serde_json::to_string(&violations)?,
            &serde_json::to_string(proposal)?,
            context.now,
        )?;

        info!(
            target: "guardrail",
            hash = %proposal_hash,
            passed,
            violations = violations.len(),
            "proposal validated"
        );

        Ok(ValidationOutcome {
            proposal_hash,
            passed,
            violations,
            can_override,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardrail::{Mutation, MutationType, RuleOutcome, Violation};
    use crate::runtime::FixedClock;
    use chrono::{TimeZone, Utc};
    use rusqlite::{params, Connection};

    fn system(dir: &tempfile::TempDir) -> GuardrailSystem {
        let store = SqliteGuardrailStore::builder()
            .path(dir.path().join("guardrails.sqlite"))
            .build()
            .unwrap();
        store.initialize().unwrap();
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap(),
        ));
        GuardrailSystem::new(store, GuardrailSection::default(), clock)
    }

    fn raw_connection(dir: &tempfile::TempDir) -> Connection {
        Connection::open(dir.path().join("guardrails.sqlite")).unwrap()
    }

    fn budget_proposal(campaign: &str, current: f64, proposed: f64) -> PlannedChanges {
        PlannedChanges {
            product: "webp-shift".to_string(),
            customer_id: None,
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

    fn seed_claims(dir: &tempfile::TempDir, campaign: &str) {
        raw_connection(dir)
            .execute(
                "INSERT INTO claims_validations (campaign, validated_at, validated_by)
                 VALUES (?1, '2025-05-25 00:00:00', 'compliance')",
                params![campaign],
            )
            .unwrap();
    }

    #[test]
    fn over_cap_proposal_cannot_be_overridden() {
        let dir = tempfile::tempdir().unwrap();
        let system = system(&dir);
        let outcome = system
            .validate_proposal(&budget_proposal("A", 40.0, 70.0))
            .unwrap();
        assert!(!outcome.passed);
        assert!(!outcome.can_override);
        assert!(outcome
            .violations
            .iter()
            .any(|violation| violation.rule == "budget_cap"
                && violation.severity == ViolationSeverity::Critical));
    }

    #[test]
    fn every_validation_writes_exactly_one_audit_row() {
        let dir = tempfile::tempdir().unwrap();
        let system = system(&dir);
        seed_claims(&dir, "A");
        system
            .validate_proposal(&budget_proposal("A", 40.0, 45.0))
            .unwrap();
        system
            .validate_proposal(&budget_proposal("A", 40.0, 70.0))
            .unwrap();
        assert_eq!(system.store.validation_count().unwrap(), 2);

        let rows = system.store.validations(10).unwrap();
        assert_eq!(rows.len(), 2);
        // Most recent first; the failing proposal carries its violations.
        assert!(!rows[0].passed);
        assert!(rows[1].passed);
        assert!(rows[0].violations_json.contains("budget_cap"));
        assert!(!rows[0].proposal_hash.is_empty());
    }

    #[test]
    fn passing_proposal_with_fresh_claims() {
        let dir = tempfile::tempdir().unwrap();
        let system = system(&dir);
        seed_claims(&dir, "A");
        let outcome = system
            .validate_proposal(&budget_proposal("A", 40.0, 45.0))
            .unwrap();
        assert!(outcome.passed, "violations: {:?}", outcome.violations);
        assert!(outcome.can_override);
    }

    #[test]
    fn high_only_violations_may_be_overridden() {
        let dir = tempfile::tempdir().unwrap();
        let system = system(&dir);
        seed_claims(&dir, "A");
        // 50% jump breaks max_change_pct (high) but stays under the cap.
        let outcome = system
            .validate_proposal(&budget_proposal("A", 20.0, 30.0))
            .unwrap();
        assert!(!outcome.passed);
        assert!(outcome.can_override);
        assert!(outcome
            .violations
            .iter()
            .all(|violation| violation.severity != ViolationSeverity::Critical));
    }

    #[test]
    fn weighted_quality_score_blocks_increase() {
        let dir = tempfile::tempdir().unwrap();
        let system = system(&dir);
        seed_claims(&dir, "A");
        let conn = raw_connection(&dir);
        // Heavy traffic at QS 2, a trickle at QS 9: weighted score ~2.3.
        conn.execute(
            "INSERT INTO keyword_quality_daily (campaign, day, quality_score, impressions)
             VALUES ('A', '2025-05-28', 2.0, 9000), ('A', '2025-05-29', 9.0, 500)",
            [],
        )
        .unwrap();
        let outcome = system
            .validate_proposal(&budget_proposal("A", 40.0, 45.0))
            .unwrap();
        assert!(!outcome.passed);
        assert!(outcome
            .violations
            .iter()
            .any(|violation| violation.rule == "min_quality_score"));
    }

    #[test]
    fn custom_rules_plug_in_behind_the_contract() {
        struct DenyAll;
        impl GuardrailRule for DenyAll {
            fn id(&self) -> &'static str {
                "deny_all"
            }
            fn validate(
                &self,
                _proposal: &PlannedChanges,
                _context: &GuardrailContext,
            ) -> RuleOutcome {
                RuleOutcome::fail(vec![Violation {
                    rule: "deny_all".to_string(),
                    severity: ViolationSeverity::Low,
                    message: "always blocks".to_string(),
                    campaign: None,
                }])
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let mut system = system(&dir);
        seed_claims(&dir, "A");
        system.register(Box::new(DenyAll));
        assert_eq!(system.rule_ids().len(), 6);
        let outcome = system
            .validate_proposal(&budget_proposal("A", 40.0, 41.0))
            .unwrap();
        assert!(!outcome.passed);
        assert!(outcome.can_override);
    }
}
