use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use crate::runtime::{Clock, Prng};

use super::models::{
    Experiment, ExperimentStatus, ExperimentType, GuardConfig, MetricPoint, TargetMetric, Variant,
};
use super::stats::{
    bayesian_compare, bonferroni_adjust, sequential_decision, thompson_allocation,
    two_proportion_z_test, BayesianComparison, Counts, SequentialDecision, SequentialOutcome,
    StatsConfig, ZTestResult,
};
use super::store::{AuditRow, ConversionSummary, SqliteExperimentStore, VariantTotals};
use super::{ExperimentError, ExperimentResult};

#[derive(Debug, Clone)]
pub struct CreateExperiment {
    pub experiment_type: ExperimentType,
    pub product: String,
    pub target_id: String,
    pub target_metric: TargetMetric,
    pub variants: Vec<Variant>,
    pub min_sample_size: u64,
    pub confidence_level: f64,
    pub guards: GuardConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GuardCheck {
    pub name: String,
    pub passed: bool,
    pub critical: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct GuardReport {
    pub checks: Vec<GuardCheck>,
}

impl GuardReport {
    pub fn first_critical_failure(&self) -> Option<&GuardCheck> {
        self.checks
            .iter()
            .find(|check| check.critical && !check.passed)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VariantAnalysis {
    pub variant_id: String,
    pub counts: Counts,
    pub rate: f64,
    pub z_test: ZTestResult,
    pub adjusted_p_value: f64,
    pub bayesian: BayesianComparison,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AnalysisReport {
    pub experiment_id: String,
    pub target_metric: TargetMetric,
    pub control_variant_id: String,
    pub control_counts: Counts,
    pub variants: Vec<VariantAnalysis>,
    /// 1-based position in the peek schedule; each stored analysis of
    /// this experiment consumes one look.
    pub peek: u32,
    pub total_peeks: u32,
    /// Sequential check for the leading variant, present once the
    /// sample floor is met.
    pub sequential: Option<SequentialOutcome>,
    pub decision: SequentialDecision,
    pub note: String,
    pub analyzed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentExport {
    pub experiment: Experiment,
    pub metrics: Vec<MetricPoint>,
    pub conversions: Vec<ConversionSummary>,
    pub latest_analysis: Option<serde_json::Value>,
    pub audit: Vec<AuditRow>,
}

/// Experiment lifecycle engine. All mutation of one experiment is
/// serialized through an experiment-scoped lock; different experiments
/// proceed independently.
pub struct ExperimentEngine {
    store: SqliteExperimentStore,
    clock: Arc<dyn Clock>,
    stats: StatsConfig,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ExperimentEngine {
    pub fn new(store: SqliteExperimentStore, clock: Arc<dyn Clock>, stats: StatsConfig) -> Self {
        Self {
            store,
            clock,
            stats,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, experiment_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(experiment_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn create(&self, spec: CreateExperiment) -> ExperimentResult<Experiment> {
        let now = self.clock.now();
        let experiment = Experiment {
            id: format!("exp-{}", Uuid::new_v4().simple()),
            experiment_type: spec.experiment_type,
            product: spec.product,
            target_id: spec.target_id,
            status: ExperimentStatus::Draft,
            target_metric: spec.target_metric,
            variants: spec.variants,
            min_sample_size: spec.min_sample_size,
            confidence_level: spec.confidence_level,
            guards: spec.guards,
            start_at: None,
            end_at: None,
            winner_variant_id: None,
            created_at: now,
            updated_at: now,
        };
        experiment.validate_draft()?;
        self.store.insert_experiment(&experiment)?;
        info!(target: "experiment", id = %experiment.id, "experiment created");
        Ok(experiment)
    }

    /// Evaluates the configured guards against a draft about to go live.
    pub fn check_guards(&self, experiment: &Experiment) -> GuardReport {
        let guards = &experiment.guards;
        let mut checks = Vec::new();

        checks.push(GuardCheck {
            name: "sample_budget".to_string(),
            passed: experiment.min_sample_size >= guards.min_sample_size,
            critical: true,
            message: format!(
                "experiment plans {} samples, floor is {}",
                experiment.min_sample_size, guards.min_sample_size
            ),
        });

        checks.push(GuardCheck {
            name: "duration".to_string(),
            passed: guards.min_duration_days >= 1,
            critical: true,
            message: format!("minimum duration {} day(s)", guards.min_duration_days),
        });

        let worst_similarity = experiment
            .variants
            .iter()
            .filter(|variant| !variant.is_control)
            .map(|variant| variant.similarity_to_control)
            .fold(0.0_f64, f64::max);
        checks.push(GuardCheck {
            name: "similarity".to_string(),
            passed: worst_similarity <= guards.max_similarity,
            critical: true,
            message: format!(
                "worst variant similarity {:.3}, ceiling {:.3}",
                worst_similarity, guards.max_similarity
            ),
        });

        checks.push(GuardCheck {
            name: "spend_ceiling".to_string(),
            passed: guards.daily_spend_ceiling > 0.0,
            critical: true,
            message: format!("daily spend ceiling {:.2}", guards.daily_spend_ceiling),
        });

        GuardReport { checks }
    }

    pub fn start(&self, experiment_id: &str) -> ExperimentResult<Experiment> {
        let lock = self.lock_for(experiment_id);
        let _guard = lock.lock().unwrap();

        let experiment = self.store.require(experiment_id)?;
        // Only drafts start; a paused experiment resumes instead.
        if experiment.status != ExperimentStatus::Draft {
            return Err(ExperimentError::InvalidTransition {
                from: experiment.status.to_string(),
                to: ExperimentStatus::Active.to_string(),
            });
        }
        experiment.validate_for_activation()?;

        let report = self.check_guards(&experiment);
        if let Some(failed) = report.first_critical_failure() {
            return Err(ExperimentError::GuardFailed {
                name: failed.name.clone(),
                message: failed.message.clone(),
            });
        }

        self.store.persist_transition(
            experiment_id,
            ExperimentStatus::Draft,
            ExperimentStatus::Active,
            "started",
            None,
            self.clock.now(),
        )?;
        info!(target: "experiment", id = experiment_id, "experiment started");
        self.store.require(experiment_id)
    }

    pub fn pause(&self, experiment_id: &str) -> ExperimentResult<Experiment> {
        self.transition(experiment_id, ExperimentStatus::Paused, "paused", None)
    }

    pub fn resume(&self, experiment_id: &str) -> ExperimentResult<Experiment> {
        self.transition(experiment_id, ExperimentStatus::Active, "resumed", None)
    }

    pub fn abort(&self, experiment_id: &str, reason: &str) -> ExperimentResult<Experiment> {
        self.transition(
            experiment_id,
            ExperimentStatus::Aborted,
            "aborted",
            Some(reason),
        )
    }

    /// `winner` may name a variant id, a variant name, or the reserved
    /// string `control`.
    pub fn complete(&self, experiment_id: &str, winner: &str) -> ExperimentResult<Experiment> {
        let lock = self.lock_for(experiment_id);
        let _guard = lock.lock().unwrap();

        let experiment = self.store.require(experiment_id)?;
        self.ensure_transition(&experiment, ExperimentStatus::Completed)?;

        let winner_id = if winner == "control" {
            experiment
                .control()
                .map(|variant| variant.id.clone())
                .ok_or_else(|| ExperimentError::UnknownWinner(winner.to_string()))?
        } else {
            experiment
                .variant(winner)
                .map(|variant| variant.id.clone())
                .ok_or_else(|| ExperimentError::UnknownWinner(winner.to_string()))?
        };

        self.store.set_winner(experiment_id, &winner_id)?;
        self.store.persist_transition(
            experiment_id,
            experiment.status,
            ExperimentStatus::Completed,
            "completed",
            Some(&winner_id),
            self.clock.now(),
        )?;
        info!(target: "experiment", id = experiment_id, winner = %winner_id, "experiment completed");
        self.store.require(experiment_id)
    }

    /// Idempotent per `(experiment, variant, date)`.
    pub fn record_metrics(&self, point: &MetricPoint) -> ExperimentResult<()> {
        let lock = self.lock_for(&point.experiment_id);
        let _guard = lock.lock().unwrap();

        let experiment = self.store.require(&point.experiment_id)?;
        if experiment.variant(&point.variant_id).is_none() {
            return Err(ExperimentError::Validation(format!(
                "variant {} does not belong to experiment {}",
                point.variant_id, point.experiment_id
            )));
        }
        self.store.upsert_metrics(point)
    }

    /// Sticky, weight-proportional assignment of a traffic unit to a
    /// variant. Hash-based, so replays of the same unit land on the same
    /// variant without consuming the PRNG.
    pub fn assign(&self, experiment_id: &str, unit_id: &str) -> ExperimentResult<String> {
        let lock = self.lock_for(experiment_id);
        let _guard = lock.lock().unwrap();

        let experiment = self.store.require(experiment_id)?;
        if experiment.status != ExperimentStatus::Active {
            return Err(ExperimentError::Validation(format!(
                "assignment requires an active experiment, {} is {}",
                experiment_id, experiment.status
            )));
        }
        if let Some(existing) = self.store.fetch_assignment(experiment_id, unit_id)? {
            return Ok(existing);
        }

        let digest = Sha256::digest(format!("{experiment_id}|{unit_id}").as_bytes());
        let numerator = u64::from_be_bytes([
            digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6],
            digest[7],
        ]);
        let fraction = numerator as f64 / u64::MAX as f64;

        let total: f64 = experiment.variants.iter().map(|variant| variant.weight).sum();
        let mut cumulative = 0.0;
        let mut chosen = experiment
            .variants
            .last()
            .map(|variant| variant.id.clone())
            .ok_or_else(|| {
                ExperimentError::Validation("experiment has no variants".to_string())
            })?;
        for variant in &experiment.variants {
            cumulative += variant.weight / total;
            if fraction < cumulative {
                chosen = variant.id.clone();
                break;
            }
        }

        self.store
            .insert_assignment(experiment_id, unit_id, &chosen, self.clock.now())
    }

    /// Records one conversion event for a previously assigned unit.
    pub fn record_conversion(
        &self,
        experiment_id: &str,
        unit_id: &str,
        value: f64,
    ) -> ExperimentResult<String> {
        let lock = self.lock_for(experiment_id);
        let _guard = lock.lock().unwrap();

        let Some(variant_id) = self.store.fetch_assignment(experiment_id, unit_id)? else {
            return Err(ExperimentError::Validation(format!(
                "unit {unit_id} has no assignment in {experiment_id}"
            )));
        };
        self.store.record_conversion(
            experiment_id,
            unit_id,
            &variant_id,
            value,
            self.clock.now(),
        )?;
        Ok(variant_id)
    }

    pub fn analyze(
        &self,
        experiment_id: &str,
        rng: &mut Prng,
    ) -> ExperimentResult<AnalysisReport> {
        let lock = self.lock_for(experiment_id);
        let _guard = lock.lock().unwrap();

        let experiment = self.store.require(experiment_id)?;
        let control = experiment
            .control()
            .ok_or_else(|| ExperimentError::Validation("experiment has no control".to_string()))?;
        let totals = self.store.variant_totals(experiment_id)?;
        let totals_by_id: HashMap<&str, &VariantTotals> = totals
            .iter()
            .map(|total| (total.variant_id.as_str(), total))
            .collect();

        let control_counts = counts_for(
            experiment.target_metric,
            totals_by_id.get(control.id.as_str()).copied(),
        );

        let mut analyses = Vec::new();
        let mut p_values = Vec::new();
        for variant in experiment
            .variants
            .iter()
            .filter(|variant| !variant.is_control)
        {
            let counts = counts_for(
                experiment.target_metric,
                totals_by_id.get(variant.id.as_str()).copied(),
            );
            let z_test = two_proportion_z_test(
                control_counts,
                counts,
                experiment.confidence_level,
                false,
            )?;
            let bayesian = bayesian_compare(
                control_counts,
                counts,
                self.stats.monte_carlo_samples,
                rng,
            )?;
            p_values.push(z_test.p_value);
            analyses.push(VariantAnalysis {
                variant_id: variant.id.clone(),
                counts,
                rate: counts.rate(),
                z_test,
                adjusted_p_value: 1.0,
                bayesian,
            });
        }

        let adjusted = bonferroni_adjust(&p_values);
        for (analysis, adjusted_p) in analyses.iter_mut().zip(adjusted.iter()) {
            analysis.adjusted_p_value = *adjusted_p;
        }

        let total_samples: u64 = control_counts.trials
            + analyses.iter().map(|analysis| analysis.counts.trials).sum::<u64>();
        let alpha = 1.0 - experiment.confidence_level;

        let total_peeks = self.stats.sequential_peeks.max(1);
        let peek = (self.store.result_count(experiment_id)? + 1).min(total_peeks);
        let leading = analyses.iter().max_by(|a, b| {
            a.z_test
                .lift
                .partial_cmp(&b.z_test.lift)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let sequential = match leading {
            Some(leader) if total_samples >= experiment.min_sample_size => {
                Some(sequential_decision(
                    control_counts,
                    leader.counts,
                    peek,
                    total_peeks,
                    experiment.confidence_level,
                    self.stats.futility_floor,
                )?)
            }
            _ => None,
        };

        let (decision, note) = if total_samples < experiment.min_sample_size {
            (
                SequentialDecision::Continue,
                format!(
                    "insufficient data: {total_samples}/{} samples",
                    experiment.min_sample_size
                ),
            )
        } else if let Some(winner) = analyses
            .iter()
            .filter(|analysis| analysis.adjusted_p_value < alpha && analysis.z_test.lift > 0.0)
            .max_by(|a, b| {
                a.z_test
                    .lift
                    .partial_cmp(&b.z_test.lift)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        {
            (
                SequentialDecision::StopSuccess,
                format!("variant {} beats control", winner.variant_id),
            )
        } else if matches!(
            sequential.as_ref().map(|outcome| outcome.decision),
            Some(SequentialDecision::StopFutility)
        ) {
            (
                SequentialDecision::StopFutility,
                format!(
                    "futility at peek {peek}/{total_peeks}: the leading variant is unlikely to reach significance"
                ),
            )
        } else if !analyses.is_empty()
            && analyses
                .iter()
                .all(|analysis| analysis.bayesian.prob_variant_beats_control < 0.05)
        {
            (
                SequentialDecision::StopFutility,
                "no variant retains a credible chance against control".to_string(),
            )
        } else {
            (
                SequentialDecision::Continue,
                "no significant difference yet".to_string(),
            )
        };

        let report = AnalysisReport {
            experiment_id: experiment_id.to_string(),
            target_metric: experiment.target_metric,
            control_variant_id: control.id.clone(),
            control_counts,
            variants: analyses,
            peek,
            total_peeks,
            sequential,
            decision,
            note,
            analyzed_at: self.clock.now(),
        };
        self.store.store_result(
            experiment_id,
            experiment.target_metric,
            &serde_json::to_string(&report)?,
            report.analyzed_at,
        )?;
        Ok(report)
    }

    /// Thompson reallocation: resamples the posterior of every variant
    /// (control included) and rewrites the weights as the empirical win
    /// frequencies. The weight-sum invariant is preserved exactly.
    pub fn reallocate(
        &self,
        experiment_id: &str,
        rng: &mut Prng,
    ) -> ExperimentResult<Vec<(String, f64)>> {
        let lock = self.lock_for(experiment_id);
        let _guard = lock.lock().unwrap();

        let mut experiment = self.store.require(experiment_id)?;
        if experiment.status != ExperimentStatus::Active {
            return Err(ExperimentError::Validation(format!(
                "reallocation requires an active experiment, {} is {}",
                experiment_id, experiment.status
            )));
        }

        let totals = self.store.variant_totals(experiment_id)?;
        let totals_by_id: HashMap<&str, &VariantTotals> = totals
            .iter()
            .map(|total| (total.variant_id.as_str(), total))
            .collect();
        let arms: Vec<Counts> = experiment
            .variants
            .iter()
            .map(|variant| {
                counts_for(
                    experiment.target_metric,
                    totals_by_id.get(variant.id.as_str()).copied(),
                )
            })
            .collect();

        let allocation =
            thompson_allocation(&arms, self.stats.monte_carlo_samples, rng)?;
        for (variant, weight) in experiment.variants.iter_mut().zip(allocation.iter()) {
            variant.weight = *weight;
        }
        self.store
            .replace_variants(experiment_id, &experiment.variants)?;

        let pairs: Vec<(String, f64)> = experiment
            .variants
            .iter()
            .map(|variant| (variant.id.clone(), variant.weight))
            .collect();
        self.store.append_event(
            experiment_id,
            "reallocated",
            Some(&serde_json::to_string(&pairs)?),
            self.clock.now(),
        )?;
        info!(target: "experiment", id = experiment_id, "weights reallocated");
        Ok(pairs)
    }

    pub fn export(&self, experiment_id: &str) -> ExperimentResult<ExperimentExport> {
        let experiment = self.store.require(experiment_id)?;
        let metrics = self.store.metrics_for(experiment_id)?;
        let conversions = self.store.conversion_counts(experiment_id)?;
        let latest_analysis = self
            .store
            .latest_result(experiment_id)?
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?;
        let audit = self.store.audit_log(experiment_id)?;
        Ok(ExperimentExport {
            experiment,
            metrics,
            conversions,
            latest_analysis,
            audit,
        })
    }

    pub fn list(
        &self,
        status: Option<ExperimentStatus>,
        limit: usize,
    ) -> ExperimentResult<Vec<Experiment>> {
        self.store.list(status, limit)
    }

    pub fn fetch(&self, experiment_id: &str) -> ExperimentResult<Experiment> {
        self.store.require(experiment_id)
    }

    fn ensure_transition(
        &self,
        experiment: &Experiment,
        next: ExperimentStatus,
    ) -> ExperimentResult<()> {
        if !experiment.status.can_transition_to(next) {
            return Err(ExperimentError::InvalidTransition {
                from: experiment.status.to_string(),
                to: next.to_string(),
            });
        }
        Ok(())
    }

    fn transition(
        &self,
        experiment_id: &str,
        next: ExperimentStatus,
        event: &str,
        note: Option<&str>,
    ) -> ExperimentResult<Experiment> {
        let lock = self.lock_for(experiment_id);
        let _guard = lock.lock().unwrap();

        let experiment = self.store.require(experiment_id)?;
        self.ensure_transition(&experiment, next)?;
        self.store.persist_transition(
            experiment_id,
            experiment.status,
            next,
            event,
            note,
            self.clock.now(),
        )?;
        self.store.require(experiment_id)
    }
}

fn counts_for(metric: TargetMetric, totals: Option<&VariantTotals>) -> Counts {
    let Some(totals) = totals else {
        return Counts::new(0, 0);
    };
    match metric {
        TargetMetric::Ctr | TargetMetric::CwsClickRate => {
            Counts::new(totals.clicks, totals.impressions)
        }
        TargetMetric::Cvr => Counts::new(totals.conversions, totals.clicks),
    }
}
