//! Scoring and statistics.
//!
//! Trial-level metric vectors are turned into point estimates with bootstrap
//! confidence intervals:
//! - point estimate: mean of the per-trial aggregates
//! - interval: percentile bootstrap over the pooled per-example scores,
//!   recomputing the aggregate metric for every resample. Each resample has
//!   the size of one trial, so repeating a trial does not narrow the interval.
//!
//! Welch's t-test with Bonferroni correction compares models on a dataset.

use crate::task_metrics::{ExampleScore, MetricType};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, StudentsT};
use std::collections::BTreeMap;

/// Per-example scores of one trial, keyed by metric
pub type TrialScores = BTreeMap<MetricType, Vec<ExampleScore>>;

/// Compute mean of samples
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn compute_mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// Compute standard deviation of samples
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn compute_std(samples: &[f64]) -> f64 {
    if samples.len() < 2 {
        return 0.0;
    }
    let mean = compute_mean(samples);
    let variance =
        samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (samples.len() - 1) as f64;
    variance.sqrt()
}

/// Statistical configuration for evaluation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatConfig {
    /// Number of bootstrap resamples
    #[serde(default = "default_bootstrap_n")]
    pub bootstrap_n: usize,
    /// Confidence level (e.g., 0.95)
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Significance threshold
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Random seed for reproducibility
    #[serde(default = "default_seed")]
    pub seed: u64,
}

const fn default_bootstrap_n() -> usize {
    1000
}
const fn default_confidence() -> f64 {
    0.95
}
const fn default_alpha() -> f64 {
    0.05
}
const fn default_seed() -> u64 {
    42
}

impl Default for StatConfig {
    fn default() -> Self {
        Self {
            bootstrap_n: default_bootstrap_n(),
            confidence: default_confidence(),
            alpha: default_alpha(),
            seed: default_seed(),
        }
    }
}

/// Percentile bootstrap of `statistic` over resamples of `resample_len`
/// items drawn from `pool`
///
/// Returns `None` when fewer than two items are pooled, the resample length
/// is zero or no resamples are configured.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation
)]
pub fn bootstrap_interval<T: Copy>(
    pool: &[T],
    resample_len: usize,
    config: &StatConfig,
    statistic: impl Fn(&[T]) -> f64,
) -> Option<(f64, f64)> {
    if pool.len() < 2 || resample_len == 0 || config.bootstrap_n == 0 {
        return None;
    }

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut resample = Vec::with_capacity(resample_len);
    let mut statistics = Vec::with_capacity(config.bootstrap_n);

    // Resample with replacement
    for _ in 0..config.bootstrap_n {
        resample.clear();
        resample.extend((0..resample_len).map(|_| {
            let idx = rng.next_u64() as usize % pool.len();
            pool[idx]
        }));
        statistics.push(statistic(&resample));
    }

    statistics.sort_by(|a: &f64, b: &f64| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    // Compute percentile indices
    let alpha = 1.0 - config.confidence;
    let lower_idx = (config.bootstrap_n as f64 * (alpha / 2.0)).floor() as usize;
    let upper_idx = (config.bootstrap_n as f64 * (1.0 - alpha / 2.0)).ceil() as usize;

    let last = statistics.len() - 1;
    Some((
        statistics[lower_idx.min(last)],
        statistics[upper_idx.min(last)],
    ))
}

/// Bootstrap confidence interval of the mean
#[must_use]
pub fn bootstrap_ci(samples: &[f64], config: &StatConfig) -> (f64, f64) {
    bootstrap_interval(samples, samples.len(), config, compute_mean).unwrap_or_else(|| {
        let mean = compute_mean(samples);
        (mean, mean)
    })
}

/// Point estimate and confidence bounds for one metric
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricEstimate {
    pub point: f64,
    pub lower: f64,
    pub upper: f64,
    /// Per-trial aggregate values, in seed order
    pub trial_values: Vec<f64>,
    /// Number of pooled per-example scores
    pub examples: usize,
}

impl MetricEstimate {
    #[must_use]
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    #[must_use]
    pub fn std(&self) -> f64 {
        compute_std(&self.trial_values)
    }
}

/// Aggregate successful trials into one estimate per metric.
///
/// A metric missing from some trials is estimated from the trials that
/// report it. Resamples are drawn from the pool of all trials with the mean
/// trial size. With at most one pooled example the interval collapses to the
/// point estimate.
#[must_use]
pub fn aggregate(trials: &[TrialScores], config: &StatConfig) -> BTreeMap<MetricType, MetricEstimate> {
    let mut pooled: BTreeMap<MetricType, Vec<ExampleScore>> = BTreeMap::new();
    let mut trial_values: BTreeMap<MetricType, Vec<f64>> = BTreeMap::new();

    for trial in trials {
        for (&metric, scores) in trial {
            trial_values
                .entry(metric)
                .or_default()
                .push(metric.aggregate(scores));
            pooled.entry(metric).or_default().extend_from_slice(scores);
        }
    }

    trial_values
        .into_iter()
        .map(|(metric, values)| {
            let pool = pooled.remove(&metric).unwrap_or_default();
            let point = compute_mean(&values);
            let trial_len = (pool.len() + values.len() / 2) / values.len();
            let (lower, upper) =
                bootstrap_interval(&pool, trial_len, config, |s| metric.aggregate(s))
                    .map_or((point, point), |(lo, hi)| (lo.min(point), hi.max(point)));
            (
                metric,
                MetricEstimate {
                    point,
                    lower,
                    upper,
                    trial_values: values,
                    examples: pool.len(),
                },
            )
        })
        .collect()
}

/// Result of a significance test
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignificanceResult {
    /// t-statistic
    pub t_statistic: f64,
    /// p-value
    pub p_value: f64,
    /// Degrees of freedom
    pub degrees_of_freedom: f64,
    /// Is result significant at the given alpha?
    pub is_significant: bool,
    /// Cohen's d effect size
    pub cohens_d: f64,
    /// Effect size interpretation
    pub effect_interpretation: String,
}

/// Independent samples t-test (Welch's t-test)
///
/// Returns `None` if samples are too small or have no variance.
#[must_use]
#[allow(clippy::cast_precision_loss, clippy::suboptimal_flops)]
pub fn welch_t_test(
    samples_a: &[f64],
    samples_b: &[f64],
    alpha: f64,
) -> Option<SignificanceResult> {
    if samples_a.len() < 2 || samples_b.len() < 2 {
        return None;
    }

    let n_a = samples_a.len() as f64;
    let n_b = samples_b.len() as f64;
    let mean_a = compute_mean(samples_a);
    let mean_b = compute_mean(samples_b);
    let var_a = compute_std(samples_a).powi(2);
    let var_b = compute_std(samples_b).powi(2);

    if var_a < f64::EPSILON && var_b < f64::EPSILON {
        return None;
    }

    let se = ((var_a / n_a) + (var_b / n_b)).sqrt();
    if se < f64::EPSILON {
        return None;
    }

    let t_statistic = (mean_a - mean_b) / se;

    // Welch-Satterthwaite degrees of freedom
    let df_num = ((var_a / n_a) + (var_b / n_b)).powi(2);
    let df_denom = ((var_a / n_a).powi(2) / (n_a - 1.0)) + ((var_b / n_b).powi(2) / (n_b - 1.0));
    let df = if df_denom > f64::EPSILON {
        df_num / df_denom
    } else {
        (n_a + n_b - 2.0).max(1.0)
    };

    let t_dist = StudentsT::new(0.0, 1.0, df).ok()?;
    let p_value = 2.0 * (1.0 - t_dist.cdf(t_statistic.abs()));

    // Pooled Cohen's d
    let pooled_std = (((n_a - 1.0) * var_a + (n_b - 1.0) * var_b) / (n_a + n_b - 2.0)).sqrt();
    let cohens_d = if pooled_std > f64::EPSILON {
        (mean_a - mean_b) / pooled_std
    } else {
        0.0
    };
    let effect_interpretation = interpret_cohens_d(cohens_d);

    Some(SignificanceResult {
        t_statistic,
        p_value,
        degrees_of_freedom: df,
        is_significant: p_value < alpha,
        cohens_d,
        effect_interpretation,
    })
}

/// Apply Bonferroni correction for multiple comparisons
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn bonferroni_correction(alpha: f64, num_comparisons: usize) -> f64 {
    if num_comparisons == 0 {
        return alpha;
    }
    alpha / num_comparisons as f64
}

fn interpret_cohens_d(d: f64) -> String {
    let abs_d = d.abs();
    if abs_d < 0.2 {
        "negligible".to_string()
    } else if abs_d < 0.5 {
        "small".to_string()
    } else if abs_d < 0.8 {
        "medium".to_string()
    } else {
        "large".to_string()
    }
}

#[cfg(test)]
#[allow(
    clippy::float_cmp,
    clippy::cast_precision_loss,
    clippy::unwrap_used
)]
mod tests {
    use super::*;

    fn accuracy_trial(correct: &[u8]) -> TrialScores {
        let scores = correct
            .iter()
            .map(|&c| ExampleScore::Value(f64::from(c)))
            .collect();
        BTreeMap::from([(MetricType::Accuracy, scores)])
    }

    #[test]
    fn test_compute_std() {
        let samples = vec![2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let std = compute_std(&samples);
        // Sample std for this data is ~2.138
        assert!(std > 2.0 && std < 2.2, "std = {std}");
        assert!(compute_std(&[5.0]).abs() < f64::EPSILON);
        assert!(compute_std(&[]).abs() < f64::EPSILON);
    }

    #[test]
    fn test_bootstrap_ci_reasonable_width() {
        let samples: Vec<f64> = (0..1000).map(|i| 0.9 + (i as f64 * 0.0001)).collect();
        let config = StatConfig::default();

        let (lower, upper) = bootstrap_ci(&samples, &config);
        let mean = compute_mean(&samples);

        assert!(lower <= mean);
        assert!(upper >= mean);
        assert!(upper - lower < 0.05);
    }

    #[test]
    fn test_bootstrap_ci_single_sample() {
        let (lower, upper) = bootstrap_ci(&[0.95], &StatConfig::default());
        assert!((lower - 0.95).abs() < f64::EPSILON);
        assert!((upper - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn test_aggregate_pools_examples_across_trials() {
        let trials = vec![accuracy_trial(&[1, 0, 1]), accuracy_trial(&[1, 1, 1])];
        let estimates = aggregate(&trials, &StatConfig::default());
        let accuracy = &estimates[&MetricType::Accuracy];

        assert!((accuracy.point - 5.0 / 6.0).abs() < 1e-12);
        assert_eq!(accuracy.examples, 6);
        assert_eq!(accuracy.trial_values.len(), 2);
        assert!(accuracy.lower <= accuracy.point);
        assert!(accuracy.point <= accuracy.upper);
        assert!(accuracy.width() > 0.0);
    }

    #[test]
    fn test_aggregate_is_deterministic() {
        let trials = vec![accuracy_trial(&[1, 0, 1, 0, 1]), accuracy_trial(&[0, 1, 1, 1, 0])];
        let config = StatConfig::default();
        assert_eq!(aggregate(&trials, &config), aggregate(&trials, &config));
    }

    #[test]
    fn test_aggregate_repeated_trials_keep_interval_width() {
        let trial = accuracy_trial(&[1, 0, 1, 1, 0, 1, 0, 1]);
        let config = StatConfig::default();
        let once = &aggregate(&[trial.clone()], &config)[&MetricType::Accuracy];
        let repeated = &aggregate(&vec![trial; 5], &config)[&MetricType::Accuracy];

        assert_eq!(repeated.examples, 40);
        assert_eq!(repeated.point, once.point);
        assert_eq!((repeated.lower, repeated.upper), (once.lower, once.upper));
        assert!(once.width() > 0.0);
    }

    #[test]
    fn test_aggregate_degenerate_cases() {
        let single = aggregate(&[accuracy_trial(&[1])], &StatConfig::default());
        let estimate = &single[&MetricType::Accuracy];
        assert_eq!((estimate.lower, estimate.point, estimate.upper), (1.0, 1.0, 1.0));

        assert!(aggregate(&[], &StatConfig::default()).is_empty());
    }

    #[test]
    fn test_aggregate_recomputes_macro_f1_per_resample() {
        let scores = vec![
            ExampleScore::Label { gold: 0, predicted: Some(0) },
            ExampleScore::Label { gold: 1, predicted: Some(1) },
            ExampleScore::Label { gold: 1, predicted: Some(0) },
            ExampleScore::Label { gold: 0, predicted: None },
        ];
        let trial = BTreeMap::from([(MetricType::MacroF1, scores.clone())]);
        let estimates = aggregate(&[trial], &StatConfig::default());
        let f1 = &estimates[&MetricType::MacroF1];

        assert_eq!(f1.point, MetricType::MacroF1.aggregate(&scores));
        assert!(f1.lower <= f1.point && f1.point <= f1.upper);
        assert!(f1.lower >= 0.0 && f1.upper <= 1.0);
    }

    #[test]
    fn test_welch_t_test_detects_difference() {
        let a = [0.91, 0.90, 0.92, 0.93, 0.89];
        let b = [0.71, 0.70, 0.74, 0.69, 0.72];
        let result = welch_t_test(&a, &b, 0.05).unwrap();
        assert!(result.is_significant);
        assert!(result.t_statistic > 0.0);
        assert_eq!(result.effect_interpretation, "large");

        assert!(welch_t_test(&[0.5], &b, 0.05).is_none());
        assert!(welch_t_test(&[0.5, 0.5], &[0.5, 0.5], 0.05).is_none());
    }

    #[test]
    fn test_bonferroni_correction() {
        assert!((bonferroni_correction(0.05, 5) - 0.01).abs() < f64::EPSILON);
        assert_eq!(bonferroni_correction(0.05, 0), 0.05);
    }

    #[test]
    fn test_interpret_cohens_d() {
        assert_eq!(interpret_cohens_d(0.1), "negligible");
        assert_eq!(interpret_cohens_d(-0.3), "small");
        assert_eq!(interpret_cohens_d(0.6), "medium");
        assert_eq!(interpret_cohens_d(1.2), "large");
    }
}
