use rand::distributions::Distribution;
use serde::{Deserialize, Serialize};
use statrs::distribution::{Beta, ContinuousCDF, Normal};

use crate::runtime::Prng;

use super::{ExperimentError, ExperimentResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Counts {
    pub successes: u64,
    pub trials: u64,
}

impl Counts {
    pub fn new(successes: u64, trials: u64) -> Self {
        Self { successes, trials }
    }

    pub fn rate(&self) -> f64 {
        if self.trials == 0 {
            0.0
        } else {
            self.successes as f64 / self.trials as f64
        }
    }

    pub fn failures(&self) -> u64 {
        self.trials.saturating_sub(self.successes)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StatsConfig {
    pub monte_carlo_samples: u32,
    pub sequential_peeks: u32,
    pub futility_floor: f64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            monte_carlo_samples: 10_000,
            sequential_peeks: 5,
            futility_floor: 0.05,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZTestResult {
    pub z: f64,
    pub p_value: f64,
    pub significant: bool,
    pub confidence_level: f64,
    pub lift: f64,
    pub ci_low: f64,
    pub ci_high: f64,
}

fn standard_normal() -> ExperimentResult<Normal> {
    Normal::new(0.0, 1.0).map_err(|err| ExperimentError::Stats(err.to_string()))
}

/// Two-proportion z-test on pooled variance. The optional continuity
/// correction shifts each count half a unit away from the other arm on
/// the count scale; the confidence interval is centered on the corrected
/// difference.
///
/// Degenerate inputs (no trials, or zero successes in both arms) return
/// `p = 1` and are never significant.
pub fn two_proportion_z_test(
    control: Counts,
    variant: Counts,
    confidence_level: f64,
    continuity_correction: bool,
) -> ExperimentResult<ZTestResult> {
    if !(0.0 < confidence_level && confidence_level < 1.0) {
        return Err(ExperimentError::Stats(format!(
            "confidence level {confidence_level} outside (0, 1)"
        )));
    }
    let normal = standard_normal()?;
    let alpha = 1.0 - confidence_level;
    let z_crit = normal.inverse_cdf(1.0 - alpha / 2.0);

    let n1 = control.trials as f64;
    let n2 = variant.trials as f64;
    let pooled_successes = control.successes + variant.successes;
    if control.trials == 0 || variant.trials == 0 || pooled_successes == 0 {
        return Ok(ZTestResult {
            z: 0.0,
            p_value: 1.0,
            significant: false,
            confidence_level,
            lift: 0.0,
            ci_low: 0.0,
            ci_high: 0.0,
        });
    }

    let p1 = control.rate();
    let p2 = variant.rate();
    let pooled = pooled_successes as f64 / (n1 + n2);
    let pooled_se = (pooled * (1.0 - pooled) * (1.0 / n1 + 1.0 / n2)).sqrt();

    let diff = p2 - p1;
    let correction = if continuity_correction {
        0.5 * (1.0 / n1 + 1.0 / n2)
    } else {
        0.0
    };
    let adjusted = diff + correction * diff.signum();

    let (z, p_value) = if pooled_se == 0.0 {
        (0.0, 1.0)
    } else {
        let z = adjusted / pooled_se;
        (z, 2.0 * (1.0 - normal.cdf(z.abs())))
    };

    let unpooled_se =
        (p1 * (1.0 - p1) / n1 + p2 * (1.0 - p2) / n2).sqrt();
    let ci_low = adjusted - z_crit * unpooled_se;
    let ci_high = adjusted + z_crit * unpooled_se;

    Ok(ZTestResult {
        z,
        p_value,
        significant: p_value < alpha,
        confidence_level,
        lift: adjusted,
        ci_low,
        ci_high,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BayesianComparison {
    pub prob_variant_beats_control: f64,
    pub expected_lift: f64,
    pub ci_low: f64,
    pub ci_high: f64,
    pub samples: u32,
}

/// Beta(1 + s, 1 + f) posterior comparison via Monte-Carlo over the
/// injected PRNG. The credible interval covers the central 95% of the
/// sampled lift distribution.
pub fn bayesian_compare(
    control: Counts,
    variant: Counts,
    samples: u32,
    rng: &mut Prng,
) -> ExperimentResult<BayesianComparison> {
    if samples == 0 {
        return Err(ExperimentError::Stats(
            "monte carlo sample count must be positive".to_string(),
        ));
    }
    let control_posterior = Beta::new(
        1.0 + control.successes as f64,
        1.0 + control.failures() as f64,
    )
    .map_err(|err| ExperimentError::Stats(err.to_string()))?;
    let variant_posterior = Beta::new(
        1.0 + variant.successes as f64,
        1.0 + variant.failures() as f64,
    )
    .map_err(|err| ExperimentError::Stats(err.to_string()))?;

    let mut wins = 0u32;
    let mut lifts = Vec::with_capacity(samples as usize);
    for _ in 0..samples {
        let c = control_posterior.sample(rng);
        let v = variant_posterior.sample(rng);
        if v > c {
            wins += 1;
        }
        lifts.push(v - c);
    }
    lifts.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let expected_lift = lifts.iter().sum::<f64>() / samples as f64;
    let lower_index = ((samples as f64) * 0.025).floor() as usize;
    let upper_index = (((samples as f64) * 0.975).ceil() as usize).min(lifts.len() - 1);

    Ok(BayesianComparison {
        prob_variant_beats_control: wins as f64 / samples as f64,
        expected_lift,
        ci_low: lifts[lower_index],
        ci_high: lifts[upper_index],
        samples,
    })
}

/// Normal-approximation sample size per arm for detecting an absolute
/// rate difference `minimum_detectable_diff` from `baseline_rate`.
pub fn required_sample_size(
    baseline_rate: f64,
    minimum_detectable_diff: f64,
    confidence_level: f64,
    power: f64,
) -> ExperimentResult<u64> {
    if minimum_detectable_diff <= 0.0 {
        return Err(ExperimentError::Stats(
            "minimum detectable difference must be positive".to_string(),
        ));
    }
    if !(0.0..=1.0).contains(&baseline_rate) {
        return Err(ExperimentError::Stats(
            "baseline rate must be inside [0, 1]".to_string(),
        ));
    }
    let normal = standard_normal()?;
    let alpha = 1.0 - confidence_level;
    let z_alpha = normal.inverse_cdf(1.0 - alpha / 2.0);
    let z_beta = normal.inverse_cdf(power);

    let p1 = baseline_rate;
    let p2 = (baseline_rate + minimum_detectable_diff).min(1.0);
    let variance = p1 * (1.0 - p1) + p2 * (1.0 - p2);
    let n = (z_alpha + z_beta).powi(2) * variance / minimum_detectable_diff.powi(2);
    Ok(n.ceil() as u64)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SequentialDecision {
    Continue,
    StopSuccess,
    StopFutility,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SequentialOutcome {
    pub decision: SequentialDecision,
    pub peek: u32,
    pub total_peeks: u32,
    pub boundary_z: f64,
    pub observed_z: f64,
    pub conditional_power: f64,
}

/// O'Brien-Fleming-family sequential check at peek `peek` of
/// `total_peeks`. The efficacy boundary is `z_crit * sqrt(K / k)`, so
/// early looks demand overwhelming evidence. Futility stops when the
/// conditional power under the current trend falls below the floor.
pub fn sequential_decision(
    control: Counts,
    variant: Counts,
    peek: u32,
    total_peeks: u32,
    confidence_level: f64,
    futility_floor: f64,
) -> ExperimentResult<SequentialOutcome> {
    if peek == 0 || total_peeks == 0 || peek > total_peeks {
        return Err(ExperimentError::Stats(format!(
            "invalid peek schedule: {peek}/{total_peeks}"
        )));
    }
    let normal = standard_normal()?;
    let alpha = 1.0 - confidence_level;
    let z_crit = normal.inverse_cdf(1.0 - alpha / 2.0);

    let boundary_z = z_crit * ((total_peeks as f64) / (peek as f64)).sqrt();
    let observed = two_proportion_z_test(control, variant, confidence_level, false)?;
    let observed_z = observed.z;

    let t = peek as f64 / total_peeks as f64;
    let conditional_power = if t >= 1.0 {
        if observed_z >= z_crit {
            1.0
        } else {
            0.0
        }
    } else {
        // Current-trend projection through the B-value at information
        // fraction t.
        let b = observed_z * t.sqrt();
        let projected = b / t;
        1.0 - normal.cdf((z_crit - projected) / (1.0 - t).sqrt())
    };

    // Efficacy is one-sided toward the variant; a strongly negative z is
    // a futility signal, not a win.
    let decision = if observed_z >= boundary_z {
        SequentialDecision::StopSuccess
    } else if conditional_power < futility_floor {
        SequentialDecision::StopFutility
    } else {
        SequentialDecision::Continue
    };

    Ok(SequentialOutcome {
        decision,
        peek,
        total_peeks,
        boundary_z,
        observed_z,
        conditional_power,
    })
}

/// Thompson allocation: posterior Beta sampling per arm, allocation
/// probabilities equal each arm's empirical win frequency.
pub fn thompson_allocation(
    arms: &[Counts],
    rounds: u32,
    rng: &mut Prng,
) -> ExperimentResult<Vec<f64>> {
    if arms.is_empty() {
        return Err(ExperimentError::Stats(
            "thompson allocation needs at least one arm".to_string(),
        ));
    }
    if rounds == 0 {
        return Err(ExperimentError::Stats(
            "thompson allocation needs at least one round".to_string(),
        ));
    }
    let posteriors: Vec<Beta> = arms
        .iter()
        .map(|arm| {
            Beta::new(1.0 + arm.successes as f64, 1.0 + arm.failures() as f64)
                .map_err(|err| ExperimentError::Stats(err.to_string()))
        })
        .collect::<ExperimentResult<_>>()?;

    let mut wins = vec![0u32; arms.len()];
    for _ in 0..rounds {
        let mut best_index = 0;
        let mut best_draw = f64::MIN;
        for (index, posterior) in posteriors.iter().enumerate() {
            let draw = posterior.sample(rng);
            if draw > best_draw {
                best_draw = draw;
                best_index = index;
            }
        }
        wins[best_index] += 1;
    }
    Ok(wins
        .into_iter()
        .map(|count| count as f64 / rounds as f64)
        .collect())
}

/// Bonferroni adjustment: each p-value is multiplied by the family size
/// and capped at 1.
pub fn bonferroni_adjust(p_values: &[f64]) -> Vec<f64> {
    let m = p_values.len() as f64;
    p_values
        .iter()
        .map(|p| (p * m).min(1.0))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrected_z_test_detects_two_point_lift() {
        let result = two_proportion_z_test(
            Counts::new(50, 1000),
            Counts::new(70, 1000),
            0.95,
            true,
        )
        .unwrap();
        assert!((result.z - 1.977).abs() < 0.01, "z was {}", result.z);
        assert!((result.p_value - 0.048).abs() < 0.005, "p was {}", result.p_value);
        assert!(result.significant);
        assert!(result.ci_low > 0.0, "ci_low was {}", result.ci_low);
        assert!(result.ci_high > result.ci_low);
    }

    #[test]
    fn z_test_without_correction_is_weaker() {
        let plain = two_proportion_z_test(
            Counts::new(50, 1000),
            Counts::new(70, 1000),
            0.95,
            false,
        )
        .unwrap();
        assert!((plain.z - 1.883).abs() < 0.01);
        assert!(!plain.significant);
    }

    #[test]
    fn zero_successes_in_both_arms_is_never_significant() {
        let result = two_proportion_z_test(
            Counts::new(0, 500),
            Counts::new(0, 500),
            0.95,
            false,
        )
        .unwrap();
        assert_eq!(result.p_value, 1.0);
        assert!(!result.significant);
        assert_eq!(result.z, 0.0);
    }

    #[test]
    fn zero_trials_short_circuits() {
        let result =
            two_proportion_z_test(Counts::new(0, 0), Counts::new(5, 100), 0.95, false).unwrap();
        assert_eq!(result.p_value, 1.0);
        assert!(!result.significant);
    }

    #[test]
    fn sample_size_matches_normal_approximation() {
        let n = required_sample_size(0.05, 0.02, 0.95, 0.8).unwrap();
        assert!((2150..=2270).contains(&n), "n was {n}");
    }

    #[test]
    fn bayesian_comparison_is_deterministic_per_seed() {
        let control = Counts::new(50, 1000);
        let variant = Counts::new(90, 1000);
        let mut rng_a = Prng::from_seed(11);
        let mut rng_b = Prng::from_seed(11);
        let a = bayesian_compare(control, variant, 10_000, &mut rng_a).unwrap();
        let b = bayesian_compare(control, variant, 10_000, &mut rng_b).unwrap();
        assert_eq!(a, b);
        assert!(a.prob_variant_beats_control > 0.95);
        assert!(a.expected_lift > 0.0);
        assert!(a.ci_low < a.ci_high);
    }

    #[test]
    fn equal_arms_sit_near_half() {
        let counts = Counts::new(100, 1000);
        let mut rng = Prng::from_seed(3);
        let result = bayesian_compare(counts, counts, 10_000, &mut rng).unwrap();
        assert!((result.prob_variant_beats_control - 0.5).abs() < 0.05);
    }

    #[test]
    fn obf_boundary_shrinks_with_later_peeks() {
        let control = Counts::new(50, 1000);
        let variant = Counts::new(70, 1000);
        let early = sequential_decision(control, variant, 1, 5, 0.95, 0.05).unwrap();
        let late = sequential_decision(control, variant, 5, 5, 0.95, 0.05).unwrap();
        assert!(early.boundary_z > late.boundary_z);
        assert!((early.boundary_z - 1.96 * 5.0_f64.sqrt()).abs() < 0.02);
        assert_eq!(early.decision, SequentialDecision::Continue);
    }

    #[test]
    fn hopeless_experiment_stops_for_futility() {
        // Variant clearly behind at the fourth of five looks.
        let outcome = sequential_decision(
            Counts::new(120, 1000),
            Counts::new(60, 1000),
            4,
            5,
            0.95,
            0.05,
        )
        .unwrap();
        assert_eq!(outcome.decision, SequentialDecision::StopFutility);
    }

    #[test]
    fn overwhelming_evidence_stops_early() {
        let outcome = sequential_decision(
            Counts::new(50, 1000),
            Counts::new(200, 1000),
            2,
            5,
            0.95,
            0.05,
        )
        .unwrap();
        assert_eq!(outcome.decision, SequentialDecision::StopSuccess);
    }

    #[test]
    fn thompson_allocations_sum_to_one() {
        let arms = [
            Counts::new(10, 100),
            Counts::new(30, 100),
            Counts::new(20, 100),
        ];
        let mut rng = Prng::from_seed(17);
        let allocation = thompson_allocation(&arms, 5000, &mut rng).unwrap();
        let total: f64 = allocation.iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
        // The strongest arm should draw the biggest share.
        assert!(allocation[1] > allocation[0]);
        assert!(allocation[1] > allocation[2]);
    }

    #[test]
    fn bonferroni_caps_at_one() {
        let adjusted = bonferroni_adjust(&[0.01, 0.04, 0.5]);
        assert!((adjusted[0] - 0.03).abs() < 1e-12);
        assert!((adjusted[1] - 0.12).abs() < 1e-12);
        assert_eq!(adjusted[2], 1.0);
    }
}
