use std::collections::BTreeMap;

use chrono::Duration;

use super::{
    GuardrailContext, GuardrailRule, Mutation, MutationType, PlannedChanges, RuleOutcome,
    Violation, ViolationSeverity,
};

const DEFAULT_CURRENCY: &str = "AUD";

fn budget_updates(proposal: &PlannedChanges) -> impl Iterator<Item = &Mutation> {
    proposal
        .mutations
        .iter()
        .filter(|mutation| mutation.mutation_type == MutationType::UpdateBudget)
}

/// Sum of proposed daily budgets per currency must stay under that
/// currency's cap.
#[derive(Debug, Default)]
pub struct BudgetCapRule;

impl GuardrailRule for BudgetCapRule {
    fn id(&self) -> &'static str {
        "budget_cap"
    }

    fn validate(&self, proposal: &PlannedChanges, context: &GuardrailContext) -> RuleOutcome {
        let mut totals: BTreeMap<&str, f64> = BTreeMap::new();
        for mutation in budget_updates(proposal) {
            let currency = mutation.currency.as_deref().unwrap_or(DEFAULT_CURRENCY);
            *totals.entry(currency).or_insert(0.0) += mutation.proposed_value.unwrap_or(0.0);
        }

        let mut violations = Vec::new();
        for (currency, total) in totals {
            let cap = match currency {
                "AUD" => context.constraints.daily_cap_aud,
                "USD" => context.constraints.daily_cap_usd,
                "GBP" => context.constraints.daily_cap_gbp,
                _ => continue,
            };
            if total > cap {
                violations.push(Violation {
                    rule: self.id().to_string(),
                    severity: ViolationSeverity::Critical,
                    message: format!(
                        "proposed {currency} budgets total {total:.2}, daily cap is {cap:.2}"
                    ),
                    campaign: None,
                });
            }
        }
        if violations.is_empty() {
            RuleOutcome::pass()
        } else {
            RuleOutcome::fail(violations)
        }
    }
}

/// Per-campaign relative budget change must stay inside the configured
/// percentage.
#[derive(Debug, Default)]
pub struct MaxChangePctRule;

impl GuardrailRule for MaxChangePctRule {
    fn id(&self) -> &'static str {
        "max_change_pct"
    }

    fn validate(&self, proposal: &PlannedChanges, context: &GuardrailContext) -> RuleOutcome {
        let limit = context.constraints.max_change_pct;
        let mut violations = Vec::new();
        for mutation in budget_updates(proposal) {
            let Some(current) = mutation.current_value else {
                continue;
            };
            if current <= 0.0 {
                continue;
            }
            let proposed = mutation.proposed_value.unwrap_or(0.0);
            let change_pct = ((proposed - current) / current).abs() * 100.0;
            if change_pct > limit {
                violations.push(Violation {
                    rule: self.id().to_string(),
                    severity: ViolationSeverity::High,
                    message: format!(
                        "campaign {} changes budget by {change_pct:.1}%, limit is {limit:.1}%",
                        mutation.campaign
                    ),
                    campaign: Some(mutation.campaign.clone()),
                });
            }
        }
        if violations.is_empty() {
            RuleOutcome::pass()
        } else {
            RuleOutcome::fail(violations)
        }
    }
}

/// Budget increases are blocked while the campaign's 30-day
/// impression-weighted quality score sits at or below the floor.
#[derive(Debug, Default)]
pub struct MinQualityScoreRule;

impl GuardrailRule for MinQualityScoreRule {
    fn id(&self) -> &'static str {
        "min_quality_score"
    }

    fn validate(&self, proposal: &PlannedChanges, context: &GuardrailContext) -> RuleOutcome {
        let floor = context.constraints.min_quality_score;
        let mut violations = Vec::new();
        for mutation in budget_updates(proposal).filter(|mutation| mutation.is_budget_increase()) {
            let Some(score) = context.quality_scores.get(&mutation.campaign) else {
                continue;
            };
            if *score <= floor {
                violations.push(Violation {
                    rule: self.id().to_string(),
                    severity: ViolationSeverity::Critical,
                    message: format!(
                        "campaign {} quality score {score:.1} is at or below {floor:.1}",
                        mutation.campaign
                    ),
                    campaign: Some(mutation.campaign.clone()),
                });
            }
        }
        if violations.is_empty() {
            RuleOutcome::pass()
        } else {
            RuleOutcome::fail(violations)
        }
    }
}

/// Budget increases are blocked while the campaign's worst landing page
/// scores below the health floor.
#[derive(Debug, Default)]
pub struct LandingPageHealthRule;

impl GuardrailRule for LandingPageHealthRule {
    fn id(&self) -> &'static str {
        "landing_page_health"
    }

    fn validate(&self, proposal: &PlannedChanges, context: &GuardrailContext) -> RuleOutcome {
        let floor = context.constraints.min_landing_page_health;
        let mut violations = Vec::new();
        for mutation in budget_updates(proposal).filter(|mutation| mutation.is_budget_increase()) {
            let Some(health) = context.landing_page_health.get(&mutation.campaign) else {
                continue;
            };
            if *health < floor {
                violations.push(Violation {
                    rule: self.id().to_string(),
                    severity: ViolationSeverity::Critical,
                    message: format!(
                        "campaign {} worst landing page health {health:.2} is below {floor:.2}",
                        mutation.campaign
                    ),
                    campaign: Some(mutation.campaign.clone()),
                });
            }
        }
        if violations.is_empty() {
            RuleOutcome::pass()
        } else {
            RuleOutcome::fail(violations)
        }
    }
}

/// Budget increases require a claims-validation record fresher than the
/// configured age.
#[derive(Debug, Default)]
pub struct ClaimsFreshnessRule;

impl GuardrailRule for ClaimsFreshnessRule {
    fn id(&self) -> &'static str {
        "claims_validation"
    }

    fn validate(&self, proposal: &PlannedChanges, context: &GuardrailContext) -> RuleOutcome {
        let max_age = Duration::days(context.constraints.claims_max_age_days);
        let mut violations = Vec::new();
        for mutation in budget_updates(proposal).filter(|mutation| mutation.is_budget_increase()) {
            let stale = match context.claims_validated_at.get(&mutation.campaign) {
                Some(validated_at) => context.now - *validated_at > max_age,
                None => true,
            };
            if stale {
                violations.push(Violation {
                    rule: self.id().to_string(),
                    severity: ViolationSeverity::Critical,
                    message: format!(
                        "campaign {} lacks a claims validation within {} days",
                        mutation.campaign, context.constraints.claims_max_age_days
                    ),
                    campaign: Some(mutation.campaign.clone()),
                });
            }
        }
        if violations.is_empty() {
            RuleOutcome::pass()
        } else {
            RuleOutcome::fail(violations)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuardrailSection;
    use chrono::{TimeZone, Utc};

    fn context() -> GuardrailContext {
        GuardrailContext {
            constraints: GuardrailSection::default(),
            quality_scores: BTreeMap::new(),
            landing_page_health: BTreeMap::new(),
            claims_validated_at: BTreeMap::new(),
            now: Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap(),
        }
    }

    fn budget_mutation(campaign: &str, current: f64, proposed: f64) -> Mutation {
        Mutation {
            mutation_type: MutationType::UpdateBudget,
            campaign: campaign.to_string(),
            current_value: Some(current),
            proposed_value: Some(proposed),
            currency: None,
            metadata: BTreeMap::new(),
        }
    }

    fn proposal(mutations: Vec<Mutation>) -> PlannedChanges {
        PlannedChanges {
            product: "webp-shift".to_string(),
            customer_id: None,
            mutations,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn over_cap_budget_is_a_critical_violation() {
        let proposal = proposal(vec![budget_mutation("A", 40.0, 70.0)]);
        let outcome = BudgetCapRule.validate(&proposal, &context());
        assert!(!outcome.passed);
        assert_eq!(outcome.violations[0].rule, "budget_cap");
        assert_eq!(outcome.violations[0].severity, ViolationSeverity::Critical);
    }

    #[test]
    fn budget_cap_is_per_currency() {
        let mut usd = budget_mutation("B", 10.0, 35.0);
        usd.currency = Some("USD".to_string());
        let proposal = proposal(vec![budget_mutation("A", 10.0, 12.0), usd]);
        // AUD total 12 under 50, USD total 35 under 40.
        assert!(BudgetCapRule.validate(&proposal, &context()).passed);
    }

    #[test]
    fn change_pct_limit() {
        let fine = proposal(vec![budget_mutation("A", 40.0, 48.0)]);
        assert!(MaxChangePctRule.validate(&fine, &context()).passed);

        let too_big = proposal(vec![budget_mutation("A", 40.0, 10.0)]);
        let outcome = MaxChangePctRule.validate(&too_big, &context());
        assert!(!outcome.passed);
        assert_eq!(outcome.violations[0].severity, ViolationSeverity::High);
    }

    #[test]
    fn quality_score_blocks_increase_only() {
        let mut ctx = context();
        ctx.quality_scores.insert("A".to_string(), 2.5);

        let increase = proposal(vec![budget_mutation("A", 20.0, 30.0)]);
        assert!(!MinQualityScoreRule.validate(&increase, &ctx).passed);

        let decrease = proposal(vec![budget_mutation("A", 30.0, 20.0)]);
        assert!(MinQualityScoreRule.validate(&decrease, &ctx).passed);

        // No quality data: the rule stays silent.
        let unknown = proposal(vec![budget_mutation("B", 20.0, 30.0)]);
        assert!(MinQualityScoreRule.validate(&unknown, &ctx).passed);
    }

    #[test]
    fn landing_page_health_floor() {
        let mut ctx = context();
        ctx.landing_page_health.insert("A".to_string(), 0.4);
        let increase = proposal(vec![budget_mutation("A", 20.0, 30.0)]);
        let outcome = LandingPageHealthRule.validate(&increase, &ctx);
        assert!(!outcome.passed);
        assert_eq!(outcome.violations[0].severity, ViolationSeverity::Critical);
    }

    #[test]
    fn claims_must_be_fresh() {
        let mut ctx = context();
        let increase = proposal(vec![budget_mutation("A", 20.0, 30.0)]);
        // Missing record fails.
        assert!(!ClaimsFreshnessRule.validate(&increase, &ctx).passed);

        // Recent record passes.
        ctx.claims_validated_at.insert(
            "A".to_string(),
            Utc.with_ymd_and_hms(2025, 5, 20, 0, 0, 0).unwrap(),
        );
        assert!(ClaimsFreshnessRule.validate(&increase, &ctx).passed);

        // Stale record fails again.
        ctx.claims_validated_at.insert(
            "A".to_string(),
            Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap(),
        );
        assert!(!ClaimsFreshnessRule.validate(&increase, &ctx).passed);
    }
}
