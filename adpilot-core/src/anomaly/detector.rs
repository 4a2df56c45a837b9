use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;
use uuid::Uuid;

use super::{Anomaly, AnomalyRule, AnomalyType, RuleKind, Severity, TimeSeriesPoint};

/// Streaming detector over per-metric rings. Writers share the detector
/// across orchestrations; the critical sections are per-call and short.
pub struct AnomalyDetector {
    rules: Vec<AnomalyRule>,
    capacity: usize,
    cooldown: Duration,
    series: Mutex<HashMap<String, VecDeque<TimeSeriesPoint>>>,
    recent: Mutex<HashMap<(String, String, Severity), DateTime<Utc>>>,
}

impl AnomalyDetector {
    pub fn new(rules: Vec<AnomalyRule>, capacity: usize, cooldown_minutes: i64) -> Self {
        Self {
            rules,
            capacity: capacity.max(1),
            cooldown: Duration::minutes(cooldown_minutes.max(0)),
            series: Mutex::new(HashMap::new()),
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// The stock rule set used when no overrides are configured.
    pub fn with_default_rules(capacity: usize, cooldown_minutes: i64) -> Self {
        let rules = vec![
            AnomalyRule {
                id: "cost-spike".to_string(),
                metric: "cost*".to_string(),
                anomaly_type: AnomalyType::Budget,
                kind: RuleKind::Threshold {
                    baseline_period: 7,
                    multiplier: 2.0,
                },
                enabled: true,
            },
            AnomalyRule {
                id: "traffic-outlier".to_string(),
                metric: "impressions*".to_string(),
                anomaly_type: AnomalyType::Traffic,
                kind: RuleKind::Statistical {
                    window_size: 30,
                    minimum_points: 10,
                    z_threshold: 3.0,
                },
                enabled: true,
            },
            AnomalyRule {
                id: "ctr-decline".to_string(),
                metric: "ctr*".to_string(),
                anomaly_type: AnomalyType::Performance,
                kind: RuleKind::Trend {
                    trend_period: 14,
                    inflation_threshold: 50.0,
                    minimum_decline: -30.0,
                },
                enabled: true,
            },
            AnomalyRule {
                id: "conversion-seasonal".to_string(),
                metric: "conversions*".to_string(),
                anomaly_type: AnomalyType::Conversion,
                kind: RuleKind::Seasonal {
                    period: 168,
                    cycles: 3,
                    threshold: 0.5,
                },
                enabled: true,
            },
        ];
        Self::new(rules, capacity, cooldown_minutes)
    }

    pub fn rules(&self) -> &[AnomalyRule] {
        &self.rules
    }

    /// Appends one point and evaluates every enabled matching rule.
    /// Returns the freshly raised anomalies, already deduplicated by the
    /// `(metric, rule, severity)` cooldown.
    pub fn record(&self, point: TimeSeriesPoint) -> Vec<Anomaly> {
        let history = {
            let mut series = self.series.lock().unwrap();
            let ring = series.entry(point.metric_key.clone()).or_default();
            let history: Vec<f64> = ring.iter().map(|entry| entry.value).collect();
            ring.push_back(point.clone());
            while ring.len() > self.capacity {
                ring.pop_front();
            }
            history
        };

        let mut anomalies = Vec::new();
        for rule in self.rules.iter().filter(|rule| rule.enabled) {
            if !rule.matches(&point.metric_key) {
                continue;
            }
            let Some(candidate) = evaluate_rule(rule, &history, &point) else {
                continue;
            };
            if self.in_cooldown(&candidate, point.timestamp) {
                debug!(
                    target: "anomaly",
                    metric = %point.metric_key,
                    rule = %rule.id,
                    "suppressing duplicate anomaly inside cooldown"
                );
                continue;
            }
            anomalies.push(candidate);
        }
        anomalies
    }

    fn in_cooldown(&self, anomaly: &Anomaly, now: DateTime<Utc>) -> bool {
        let key = (
            anomaly.metric_key.clone(),
            anomaly.rule_id.clone(),
            anomaly.severity,
        );
        let mut recent = self.recent.lock().unwrap();
        if let Some(last) = recent.get(&key) {
            if now - *last < self.cooldown {
                return true;
            }
        }
        recent.insert(key, now);
        false
    }

    pub fn series_len(&self, metric_key: &str) -> usize {
        self.series
            .lock()
            .unwrap()
            .get(metric_key)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}

fn evaluate_rule(
    rule: &AnomalyRule,
    history: &[f64],
    point: &TimeSeriesPoint,
) -> Option<Anomaly> {
    match &rule.kind {
        RuleKind::Threshold {
            baseline_period,
            multiplier,
        } => evaluate_threshold(rule, history, point, *baseline_period, *multiplier),
        RuleKind::Statistical {
            window_size,
            minimum_points,
            z_threshold,
        } => evaluate_statistical(
            rule,
            history,
            point,
            *window_size,
            *minimum_points,
            *z_threshold,
        ),
        RuleKind::Trend {
            trend_period,
            inflation_threshold,
            minimum_decline,
        } => evaluate_trend(
            rule,
            history,
            point,
            *trend_period,
            *inflation_threshold,
            *minimum_decline,
        ),
        RuleKind::Seasonal {
            period,
            cycles,
            threshold,
        } => evaluate_seasonal(rule, history, point, *period, *cycles, *threshold),
    }
}

fn build_anomaly(
    rule: &AnomalyRule,
    point: &TimeSeriesPoint,
    expected: f64,
    threshold: f64,
    deviation_pct: f64,
    confidence: f64,
) -> Anomaly {
    let severity = Severity::from_deviation(deviation_pct);
    let (possible_causes, recommendations) = knowledge_for(&point.metric_key, rule.anomaly_type);
    Anomaly {
        id: format!("anom-{}", Uuid::new_v4().simple()),
        metric_key: point.metric_key.clone(),
        rule_id: rule.id.clone(),
        anomaly_type: rule.anomaly_type,
        severity,
        observed: point.value,
        expected,
        threshold,
        deviation_pct,
        confidence: confidence.clamp(0.0, 0.95),
        possible_causes,
        recommendations,
        detected_at: point.timestamp,
    }
}

fn evaluate_threshold(
    rule: &AnomalyRule,
    history: &[f64],
    point: &TimeSeriesPoint,
    baseline_period: usize,
    multiplier: f64,
) -> Option<Anomaly> {
    if baseline_period == 0 || history.len() < baseline_period {
        return None;
    }
    let window = &history[history.len() - baseline_period..];
    let baseline = window.iter().sum::<f64>() / window.len() as f64;
    if baseline <= 0.0 {
        return None;
    }
    let threshold = baseline * multiplier;
    if point.value <= threshold {
        return None;
    }
    let deviation_pct = (point.value - baseline) / baseline * 100.0;
    let confidence = 0.5 + deviation_pct / 400.0;
    Some(build_anomaly(
        rule,
        point,
        baseline,
        threshold,
        deviation_pct,
        confidence,
    ))
}

fn evaluate_statistical(
    rule: &AnomalyRule,
    history: &[f64],
    point: &TimeSeriesPoint,
    window_size: usize,
    minimum_points: usize,
    z_threshold: f64,
) -> Option<Anomaly> {
    let minimum = minimum_points.max(2);
    if history.len() < minimum {
        return None;
    }
    let start = history.len().saturating_sub(window_size);
    let window = &history[start..];
    let mean = window.iter().sum::<f64>() / window.len() as f64;
    let variance =
        window.iter().map(|value| (value - mean).powi(2)).sum::<f64>() / window.len() as f64;
    let stddev = variance.sqrt();
    if stddev == 0.0 {
        return None;
    }
    let z = (point.value - mean) / stddev;
    if z.abs() < z_threshold {
        return None;
    }
    let deviation_pct = if mean.abs() > f64::EPSILON {
        (point.value - mean) / mean.abs() * 100.0
    } else {
        z.abs() * 100.0
    };
    let threshold = mean + z_threshold * stddev * z.signum();
    // Confidence grows with the z-score but never reaches certainty.
    let confidence = (0.5 + z.abs() / 10.0).clamp(0.0, 0.95);
    Some(build_anomaly(
        rule,
        point,
        mean,
        threshold,
        deviation_pct,
        confidence,
    ))
}

fn evaluate_trend(
    rule: &AnomalyRule,
    history: &[f64],
    point: &TimeSeriesPoint,
    trend_period: usize,
    inflation_threshold: f64,
    minimum_decline: f64,
) -> Option<Anomaly> {
    if trend_period < 3 || history.len() + 1 < trend_period {
        return None;
    }
    let mut window: Vec<f64> = history[history.len() + 1 - trend_period..].to_vec();
    window.push(point.value);

    let n = window.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = window.iter().sum::<f64>() / n;
    let mut covariance = 0.0;
    let mut variance_x = 0.0;
    for (index, value) in window.iter().enumerate() {
        let dx = index as f64 - mean_x;
        covariance += dx * (value - mean_y);
        variance_x += dx * dx;
    }
    if variance_x == 0.0 {
        return None;
    }
    let slope = covariance / variance_x;
    let fitted_start = mean_y - slope * mean_x;
    let fitted_end = fitted_start + slope * (n - 1.0);
    if fitted_start.abs() < f64::EPSILON {
        return None;
    }
    let change_pct = (fitted_end - fitted_start) / fitted_start.abs() * 100.0;

    let breached = change_pct >= inflation_threshold || change_pct <= minimum_decline;
    if !breached {
        return None;
    }
    let confidence = (0.5 + change_pct.abs() / 200.0).clamp(0.0, 0.95);
    Some(build_anomaly(
        rule,
        point,
        fitted_start,
        if change_pct > 0.0 {
            inflation_threshold
        } else {
            minimum_decline
        },
        change_pct,
        confidence,
    ))
}

fn evaluate_seasonal(
    rule: &AnomalyRule,
    history: &[f64],
    point: &TimeSeriesPoint,
    period: usize,
    cycles: usize,
    threshold: f64,
) -> Option<Anomaly> {
    if period == 0 || cycles == 0 {
        return None;
    }
    // Same-phase samples sit exactly `period` steps apart, walking back
    // from the current position.
    let mut phase_values = Vec::new();
    let mut index = history.len();
    for _ in 0..cycles {
        if index < period {
            break;
        }
        index -= period;
        phase_values.push(history[index]);
    }
    if phase_values.is_empty() {
        return None;
    }
    let phase_mean = phase_values.iter().sum::<f64>() / phase_values.len() as f64;
    if phase_mean.abs() < f64::EPSILON {
        return None;
    }
    let relative = (point.value - phase_mean) / phase_mean.abs();
    if relative.abs() <= threshold {
        return None;
    }
    let deviation_pct = relative * 100.0;
    let confidence = (0.5 + (relative.abs() - threshold) / 2.0).clamp(0.0, 0.95);
    Some(build_anomaly(
        rule,
        point,
        phase_mean,
        phase_mean * (1.0 + threshold),
        deviation_pct,
        confidence,
    ))
}

/// Static cause/recommendation lookup keyed by the metric family.
fn knowledge_for(metric_key: &str, anomaly_type: AnomalyType) -> (Vec<String>, Vec<String>) {
    let family = metric_key.split(['.', ':']).next().unwrap_or(metric_key);
    let (causes, recommendations): (&[&str], &[&str]) = match family {
        "cost" | "spend" => (
            &[
                "bid or budget change applied recently",
                "broad match expansion pulling in new queries",
                "competitor entered the auction",
            ],
            &[
                "review recent change history for this campaign",
                "inspect the search-term report for new queries",
                "consider tightening match types or adding negatives",
            ],
        ),
        "ctr" => (
            &[
                "ad fatigue on long-running creatives",
                "SERP layout shift demoting the ad slot",
                "query mix drifting away from the ad copy",
            ],
            &[
                "rotate in fresh creative variants",
                "check impression share and average position",
            ],
        ),
        "impressions" => (
            &[
                "tracking outage or reporting delay",
                "budget exhausted earlier in the day",
                "seasonal demand swing",
            ],
            &[
                "verify conversion tracking is reporting",
                "compare against the same weekday last week",
            ],
        ),
        "conversions" | "cvr" => (
            &[
                "landing page regression or outage",
                "checkout or install flow broken",
                "attribution window shift",
            ],
            &[
                "smoke-test the landing page and install flow",
                "confirm analytics tags still fire",
            ],
        ),
        "quality_score" => (
            &[
                "landing page relevance dropped",
                "expected CTR degraded against peers",
            ],
            &["review ad-to-page message match"],
        ),
        _ => (
            &["unexpected shift in the underlying metric"],
            &["inspect the raw series and recent account changes"],
        ),
    };
    let mut causes: Vec<String> = causes.iter().map(|s| (*s).to_string()).collect();
    if anomaly_type == AnomalyType::Security {
        causes.push("possible click fraud or bot traffic".to_string());
    }
    (
        causes,
        recommendations.iter().map(|s| (*s).to_string()).collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn point(metric: &str, minute: u32, value: f64) -> TimeSeriesPoint {
        TimeSeriesPoint {
            metric_key: metric.to_string(),
            timestamp: Utc
                .with_ymd_and_hms(2025, 6, 2, 10 + minute / 60, minute % 60, 0)
                .unwrap(),
            value,
            metadata: BTreeMap::new(),
        }
    }

    fn threshold_detector(cooldown_minutes: i64) -> AnomalyDetector {
        AnomalyDetector::new(
            vec![AnomalyRule {
                id: "cost-spike".to_string(),
                metric: "cost*".to_string(),
                anomaly_type: AnomalyType::Budget,
                kind: RuleKind::Threshold {
                    baseline_period: 7,
                    multiplier: 2.0,
                },
                enabled: true,
            }],
            1000,
            cooldown_minutes,
        )
    }

    #[test]
    fn threshold_rule_flags_cost_spike_against_baseline() {
        let detector = threshold_detector(0);
        for minute in 0..7 {
            assert!(detector
                .record(point("cost.campaign-a", minute, 100.0))
                .is_empty());
        }
        let anomalies = detector.record(point("cost.campaign-a", 7, 260.0));
        assert_eq!(anomalies.len(), 1);
        let anomaly = &anomalies[0];
        assert_eq!(anomaly.expected, 100.0);
        assert_eq!(anomaly.threshold, 200.0);
        assert!((anomaly.deviation_pct - 160.0).abs() < 1e-9);
        assert_eq!(anomaly.severity, Severity::Critical);
        assert_eq!(anomaly.anomaly_type, AnomalyType::Budget);
        assert!(!anomaly.possible_causes.is_empty());
        assert!(!anomaly.recommendations.is_empty());
    }

    #[test]
    fn threshold_needs_full_baseline() {
        let detector = threshold_detector(0);
        for minute in 0..5 {
            detector.record(point("cost.campaign-a", minute, 100.0));
        }
        assert!(detector.record(point("cost.campaign-a", 6, 400.0)).is_empty());
    }

    #[test]
    fn cooldown_suppresses_duplicates() {
        let detector = threshold_detector(30);
        for minute in 0..7 {
            detector.record(point("cost.campaign-a", minute, 100.0));
        }
        assert_eq!(detector.record(point("cost.campaign-a", 7, 260.0)).len(), 1);
        // Ten minutes later, same severity: suppressed.
        assert!(detector.record(point("cost.campaign-a", 17, 265.0)).is_empty());
        // Past the cooldown it fires again.
        assert_eq!(detector.record(point("cost.campaign-a", 48, 270.0)).len(), 1);
    }

    #[test]
    fn statistical_rule_flags_outliers_with_confidence() {
        let detector = AnomalyDetector::new(
            vec![AnomalyRule {
                id: "traffic-outlier".to_string(),
                metric: "impressions".to_string(),
                anomaly_type: AnomalyType::Traffic,
                kind: RuleKind::Statistical {
                    window_size: 20,
                    minimum_points: 10,
                    z_threshold: 3.0,
                },
                enabled: true,
            }],
            1000,
            0,
        );
        // Alternating series keeps a nonzero spread.
        for minute in 0..12 {
            let value = if minute % 2 == 0 { 95.0 } else { 105.0 };
            assert!(detector.record(point("impressions", minute, value)).is_empty());
        }
        let anomalies = detector.record(point("impressions", 13, 200.0));
        assert_eq!(anomalies.len(), 1);
        let anomaly = &anomalies[0];
        assert!(anomaly.confidence <= 0.95);
        assert!(anomaly.confidence > 0.5);
        assert_eq!(anomaly.anomaly_type, AnomalyType::Traffic);
    }

    #[test]
    fn trend_rule_catches_sustained_decline() {
        let detector = AnomalyDetector::new(
            vec![AnomalyRule {
                id: "ctr-decline".to_string(),
                metric: "ctr*".to_string(),
                anomaly_type: AnomalyType::Performance,
                kind: RuleKind::Trend {
                    trend_period: 8,
                    inflation_threshold: 50.0,
                    minimum_decline: -30.0,
                },
                enabled: true,
            }],
            1000,
            0,
        );
        let values = [5.0, 4.8, 4.5, 4.2, 3.8, 3.4, 3.0, 2.6];
        let mut raised = Vec::new();
        for (minute, value) in values.iter().enumerate() {
            raised = detector.record(point("ctr.ad-group-1", minute as u32, *value));
        }
        assert_eq!(raised.len(), 1);
        assert!(raised[0].deviation_pct < -30.0);
    }

    #[test]
    fn seasonal_rule_compares_same_phase() {
        let detector = AnomalyDetector::new(
            vec![AnomalyRule {
                id: "conversion-seasonal".to_string(),
                metric: "conversions".to_string(),
                anomaly_type: AnomalyType::Conversion,
                kind: RuleKind::Seasonal {
                    period: 4,
                    cycles: 2,
                    threshold: 0.5,
                },
                enabled: true,
            }],
            1000,
            0,
        );
        // Two full cycles where phase 0 always sits at 100.
        let pattern = [100.0, 10.0, 10.0, 10.0];
        for cycle in 0..2 {
            for (phase, value) in pattern.iter().enumerate() {
                detector.record(point("conversions", (cycle * 4 + phase) as u32, *value));
            }
        }
        // Phase 0 of the third cycle collapses.
        let anomalies = detector.record(point("conversions", 8, 20.0));
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].expected, 100.0);
        assert!(anomalies[0].deviation_pct < -50.0);
    }

    #[test]
    fn ring_is_bounded() {
        let detector = AnomalyDetector::new(Vec::new(), 10, 0);
        for minute in 0..50 {
            detector.record(point("cost", minute, 1.0));
        }
        assert_eq!(detector.series_len("cost"), 10);
    }

    #[test]
    fn disabled_rules_never_fire() {
        let mut detector = threshold_detector(0);
        detector.rules[0].enabled = false;
        for minute in 0..7 {
            detector.record(point("cost", minute, 100.0));
        }
        assert!(detector.record(point("cost", 7, 500.0)).is_empty());
    }
}
