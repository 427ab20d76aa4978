//! Leaderboard reports over benchmark records.
//!
//! Generates reports showing:
//! - per-dataset scores with confidence intervals
//! - failed pairs, with capability mismatches listed apart from other failures
//! - pairwise significance between models on the same dataset

use crate::error::FailureKind;
use crate::ledger::{BenchmarkRecord, PairStatus};
use crate::metrics::{bonferroni_correction, welch_t_test, SignificanceResult, StatConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as FmtWrite;
use tabled::{Table, Tabled};

/// Full leaderboard with all analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leaderboard {
    pub metadata: ReportMetadata,
    /// Completed pairs, grouped by dataset then ordered by primary metric
    pub entries: Vec<LeaderboardEntry>,
    pub failures: Vec<FailureEntry>,
    pub statistical_tests: Vec<StatisticalComparison>,
}

/// Report metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub title: String,
    pub generated_at: DateTime<Utc>,
    pub framework_version: String,
    pub stat_config: StatConfigSummary,
}

/// Statistical configuration summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatConfigSummary {
    /// Bootstrap resamples
    pub bootstrap_n: usize,
    /// Confidence level
    pub confidence: f64,
    /// Significance threshold before correction
    pub alpha: f64,
}

impl From<&StatConfig> for StatConfigSummary {
    fn from(config: &StatConfig) -> Self {
        Self {
            bootstrap_n: config.bootstrap_n,
            confidence: config.confidence,
            alpha: config.alpha,
        }
    }
}

/// Metric value with confidence interval
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricWithCI {
    pub value: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
}

/// One completed (model, dataset) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub model: String,
    pub dataset: String,
    pub backend: Option<String>,
    pub metrics: BTreeMap<String, MetricWithCI>,
    pub trials_succeeded: usize,
    pub trials_requested: usize,
    pub retries: u32,
}

impl LeaderboardEntry {
    /// First metric in name order, used for ranking
    #[must_use]
    pub fn primary(&self) -> Option<(&str, &MetricWithCI)> {
        self.metrics.iter().next().map(|(k, v)| (k.as_str(), v))
    }
}

/// One failed pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureEntry {
    pub model: String,
    pub dataset: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Welch comparison of two models on one dataset and metric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticalComparison {
    pub dataset: String,
    pub model_a: String,
    pub model_b: String,
    pub metric: String,
    pub significance: SignificanceResult,
    /// Significant at the Bonferroni-corrected threshold
    pub significant_corrected: bool,
}

/// Report builder over ledger records
pub struct ReportBuilder {
    title: String,
    stat_config: StatConfig,
    records: Vec<BenchmarkRecord>,
}

impl ReportBuilder {
    #[must_use]
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            stat_config: StatConfig::default(),
            records: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_stat_config(mut self, config: StatConfig) -> Self {
        self.stat_config = config;
        self
    }

    pub fn add_records(&mut self, records: impl IntoIterator<Item = BenchmarkRecord>) {
        self.records.extend(records);
    }

    /// Build the leaderboard
    #[must_use]
    pub fn build(self) -> Leaderboard {
        let mut entries = Vec::new();
        let mut failures = Vec::new();
        let mut trial_values: BTreeMap<(String, String), BTreeMap<String, Vec<f64>>> =
            BTreeMap::new();

        for record in &self.records {
            match &record.status {
                PairStatus::Done { metrics } => {
                    entries.push(LeaderboardEntry {
                        model: record.key.model.clone(),
                        dataset: record.key.dataset.clone(),
                        backend: record.backend.map(|b| b.to_string()),
                        metrics: metrics
                            .iter()
                            .map(|(name, e)| {
                                (
                                    name.clone(),
                                    MetricWithCI {
                                        value: e.point,
                                        ci_lower: e.lower,
                                        ci_upper: e.upper,
                                    },
                                )
                            })
                            .collect(),
                        trials_succeeded: record.trials.iter().filter(|t| t.succeeded()).count(),
                        trials_requested: record.trials_requested,
                        retries: record.total_retries(),
                    });
                    trial_values.insert(
                        (record.key.dataset.clone(), record.key.model.clone()),
                        metrics
                            .iter()
                            .map(|(name, e)| (name.clone(), e.trial_values.clone()))
                            .collect(),
                    );
                }
                PairStatus::Failed { kind, message } => failures.push(FailureEntry {
                    model: record.key.model.clone(),
                    dataset: record.key.dataset.clone(),
                    kind: *kind,
                    message: message.clone(),
                }),
            }
        }

        entries.sort_by(|a, b| {
            a.dataset.cmp(&b.dataset).then_with(|| {
                let score = |e: &LeaderboardEntry| e.primary().map_or(f64::NEG_INFINITY, |(_, m)| m.value);
                score(b)
                    .partial_cmp(&score(a))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
        });
        // capability mismatches first, they are configuration problems
        failures.sort_by_key(|f| (f.kind != FailureKind::CapabilityMismatch, f.dataset.clone()));

        let statistical_tests = build_statistical_tests(&trial_values, self.stat_config.alpha);

        Leaderboard {
            metadata: ReportMetadata {
                title: self.title,
                generated_at: Utc::now(),
                framework_version: env!("CARGO_PKG_VERSION").to_string(),
                stat_config: StatConfigSummary::from(&self.stat_config),
            },
            entries,
            failures,
            statistical_tests,
        }
    }
}

fn build_statistical_tests(
    trial_values: &BTreeMap<(String, String), BTreeMap<String, Vec<f64>>>,
    alpha: f64,
) -> Vec<StatisticalComparison> {
    let mut comparisons = Vec::new();
    let keys: Vec<&(String, String)> = trial_values.keys().collect();

    for (i, (dataset, model_a)) in keys.iter().map(|k| (&k.0, &k.1)).enumerate() {
        for (other_dataset, model_b) in keys[i + 1..].iter().map(|k| (&k.0, &k.1)) {
            if other_dataset != dataset {
                continue;
            }
            let a = &trial_values[&(dataset.clone(), model_a.clone())];
            let b = &trial_values[&(dataset.clone(), model_b.clone())];
            for (metric, values_a) in a {
                let Some(values_b) = b.get(metric) else {
                    continue;
                };
                if let Some(significance) = welch_t_test(values_a, values_b, alpha) {
                    comparisons.push(StatisticalComparison {
                        dataset: dataset.clone(),
                        model_a: model_a.clone(),
                        model_b: model_b.clone(),
                        metric: metric.clone(),
                        significance,
                        significant_corrected: false,
                    });
                }
            }
        }
    }

    let corrected = bonferroni_correction(alpha, comparisons.len());
    for comparison in &mut comparisons {
        comparison.significant_corrected = comparison.significance.p_value < corrected;
    }
    comparisons
}

/// Table row for text/markdown output
#[derive(Tabled)]
struct LeaderboardRow {
    #[tabled(rename = "Dataset")]
    dataset: String,
    #[tabled(rename = "Model")]
    model: String,
    #[tabled(rename = "Backend")]
    backend: String,
    #[tabled(rename = "Metrics")]
    metrics: String,
    #[tabled(rename = "Trials")]
    trials: String,
}

#[derive(Tabled)]
struct FailureRow {
    #[tabled(rename = "Dataset")]
    dataset: String,
    #[tabled(rename = "Model")]
    model: String,
    #[tabled(rename = "Failure")]
    kind: String,
    #[tabled(rename = "Message")]
    message: String,
}

fn format_metric(name: &str, m: &MetricWithCI) -> String {
    format!(
        "{name} {:.2} [{:.2}, {:.2}]",
        m.value * 100.0,
        m.ci_lower * 100.0,
        m.ci_upper * 100.0
    )
}

impl Leaderboard {
    /// Render report as JSON
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    fn leaderboard_rows(&self) -> Vec<LeaderboardRow> {
        self.entries
            .iter()
            .map(|e| LeaderboardRow {
                dataset: e.dataset.clone(),
                model: e.model.clone(),
                backend: e.backend.clone().unwrap_or_else(|| "-".to_string()),
                metrics: e
                    .metrics
                    .iter()
                    .map(|(name, m)| {
                        if name == "throughput" {
                            format!("{name} {:.1}/s [{:.1}, {:.1}]", m.value, m.ci_lower, m.ci_upper)
                        } else {
                            format_metric(name, m)
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("; "),
                trials: if e.retries > 0 {
                    format!("{}/{} ({} retries)", e.trials_succeeded, e.trials_requested, e.retries)
                } else {
                    format!("{}/{}", e.trials_succeeded, e.trials_requested)
                },
            })
            .collect()
    }

    fn failure_rows(&self) -> Vec<FailureRow> {
        self.failures
            .iter()
            .map(|f| FailureRow {
                dataset: f.dataset.clone(),
                model: f.model.clone(),
                kind: serde_json::to_value(f.kind)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default(),
                message: f.message.clone(),
            })
            .collect()
    }

    /// Render report as markdown
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut output = String::new();

        writeln!(output, "# {}", self.metadata.title).ok();
        writeln!(output).ok();
        writeln!(
            output,
            "**Generated:** {}",
            self.metadata.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
        .ok();
        writeln!(
            output,
            "**Bootstrap:** {} resamples, {:.0}% confidence",
            self.metadata.stat_config.bootstrap_n,
            self.metadata.stat_config.confidence * 100.0
        )
        .ok();
        writeln!(output).ok();

        writeln!(output, "## Leaderboard").ok();
        writeln!(output).ok();
        if self.entries.is_empty() {
            writeln!(output, "No completed pairs.").ok();
        } else {
            writeln!(output, "{}", Table::new(self.leaderboard_rows())).ok();
        }
        writeln!(output).ok();

        if !self.failures.is_empty() {
            writeln!(output, "## Failures").ok();
            writeln!(output).ok();
            writeln!(output, "{}", Table::new(self.failure_rows())).ok();
            writeln!(output).ok();
        }

        if !self.statistical_tests.is_empty() {
            writeln!(output, "## Statistical Significance").ok();
            writeln!(output).ok();
            writeln!(output, "| Dataset | Comparison | Metric | p-value | Effect | Significant |").ok();
            writeln!(output, "|---------|------------|--------|---------|--------|-------------|").ok();
            for test in &self.statistical_tests {
                writeln!(
                    output,
                    "| {} | {} vs {} | {} | {:.4} | {} | {} |",
                    test.dataset,
                    test.model_a,
                    test.model_b,
                    test.metric,
                    test.significance.p_value,
                    test.significance.effect_interpretation,
                    if test.significant_corrected { "Yes" } else { "No" }
                )
                .ok();
            }
        }

        output
    }

    /// Render report as plain text
    #[must_use]
    pub fn to_text(&self) -> String {
        let mut output = String::new();

        writeln!(output, "{}", self.metadata.title).ok();
        writeln!(output, "{}", "=".repeat(self.metadata.title.len())).ok();
        writeln!(output).ok();
        writeln!(output, "{}", Table::new(self.leaderboard_rows())).ok();

        if !self.failures.is_empty() {
            writeln!(output).ok();
            writeln!(output, "Failures").ok();
            writeln!(output, "{}", Table::new(self.failure_rows())).ok();
        }

        let significant: Vec<_> = self
            .statistical_tests
            .iter()
            .filter(|t| t.significant_corrected)
            .collect();
        if !significant.is_empty() {
            writeln!(output).ok();
            writeln!(output, "Significant differences (Bonferroni-corrected):").ok();
            for test in significant {
                writeln!(
                    output,
                    "  {} {}: {} vs {} (p={:.4}, d={:.2})",
                    test.dataset,
                    test.metric,
                    test.model_a,
                    test.model_b,
                    test.significance.p_value,
                    test.significance.cohens_d
                )
                .ok();
            }
        }

        output
    }
}
