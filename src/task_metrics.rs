//! Per-example metric contributions and their aggregation rules.
//!
//! Every pipeline scores an example into one [`ExampleScore`] per metric. A
//! metric's aggregate is recomputed from any multiset of those scores, which
//! is what lets the bootstrap resample at example granularity even for
//! non-decomposable metrics such as macro-F1.

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Supported evaluation metrics
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    /// Fraction of correct predictions
    Accuracy,
    /// Macro-averaged F1 over the label set
    MacroF1,
    /// Entity-level micro F1 with exact span and type match
    EntityF1,
    /// Normalized exact match, max over gold variants
    ExactMatch,
    /// Token-overlap F1, max over gold variants
    TokenF1,
    /// ROUGE-L F-measure (longest common subsequence)
    RougeL,
    /// Examples per second
    Throughput,
}

impl MetricType {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Accuracy => "accuracy",
            Self::MacroF1 => "macro_f1",
            Self::EntityF1 => "entity_f1",
            Self::ExactMatch => "exact_match",
            Self::TokenF1 => "token_f1",
            Self::RougeL => "rouge_l",
            Self::Throughput => "throughput",
        }
    }

    /// Recompute the metric from a multiset of per-example scores
    #[must_use]
    pub fn aggregate(self, scores: &[ExampleScore]) -> f64 {
        match self {
            Self::MacroF1 => macro_f1(scores.iter().filter_map(|s| match *s {
                ExampleScore::Label { gold, predicted } => Some((gold, predicted)),
                _ => None,
            })),
            Self::EntityF1 => {
                let (tp, fp, fn_) = scores.iter().fold((0, 0, 0), |acc, s| match *s {
                    ExampleScore::Counts { tp, fp, fn_ } => (acc.0 + tp, acc.1 + fp, acc.2 + fn_),
                    _ => acc,
                });
                micro_f1(tp, fp, fn_)
            }
            _ => {
                let values: Vec<f64> = scores
                    .iter()
                    .filter_map(|s| match *s {
                        ExampleScore::Value(v) => Some(v),
                        _ => None,
                    })
                    .collect();
                crate::metrics::compute_mean(&values)
            }
        }
    }
}

impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for MetricType {
    type Err = ConfigError;

    /// Parse metric type from string
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidMetric` if the string doesn't match a known metric.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "accuracy" | "acc" => Ok(Self::Accuracy),
            "f1" | "macro_f1" | "macro-f1" => Ok(Self::MacroF1),
            "entity_f1" | "micro_f1" | "ner_f1" => Ok(Self::EntityF1),
            "exact_match" | "exactmatch" | "em" => Ok(Self::ExactMatch),
            "token_f1" | "qa_f1" => Ok(Self::TokenF1),
            "rouge_l" | "rougel" | "rouge-l" => Ok(Self::RougeL),
            "throughput" | "speed" => Ok(Self::Throughput),
            _ => Err(ConfigError::InvalidMetric(s.to_string())),
        }
    }
}

/// One example's contribution to one metric
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExampleScore {
    /// Averaged directly (accuracy, exact match, token F1, ROUGE-L, throughput)
    Value(f64),
    /// Gold and predicted label indices for macro-F1; `None` is a failed prediction
    Label { gold: usize, predicted: Option<usize> },
    /// Entity counts for micro F1
    Counts { tp: usize, fp: usize, fn_: usize },
}

/// Macro-averaged F1 over every label seen in gold or predictions
#[allow(clippy::cast_precision_loss)]
pub fn macro_f1(pairs: impl Iterator<Item = (usize, Option<usize>)>) -> f64 {
    // label -> (tp, fp, fn)
    let mut counts: BTreeMap<usize, (usize, usize, usize)> = BTreeMap::new();

    for (gold, predicted) in pairs {
        if predicted == Some(gold) {
            counts.entry(gold).or_default().0 += 1;
        } else {
            counts.entry(gold).or_default().2 += 1;
            if let Some(p) = predicted {
                counts.entry(p).or_default().1 += 1;
            }
        }
    }

    if counts.is_empty() {
        return 0.0;
    }

    let total: f64 = counts
        .values()
        .map(|&(tp, fp, fn_)| micro_f1(tp, fp, fn_))
        .sum();
    total / counts.len() as f64
}

/// F1 from true positive, false positive and false negative counts
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn micro_f1(tp: usize, fp: usize, fn_: usize) -> f64 {
    let denom = 2 * tp + fp + fn_;
    if denom == 0 {
        return 0.0;
    }
    (2 * tp) as f64 / denom as f64
}

/// An entity span `[start, end)` over word positions with its type
pub type Entity = (usize, usize, String);

/// Extract entities from BIO tags.
///
/// `I-X` continues an open `X` entity; an `I-X` after `O` or after a different
/// type opens a new entity (CoNLL convention).
#[must_use]
pub fn extract_entities(tags: &[String]) -> BTreeSet<Entity> {
    let mut entities = BTreeSet::new();
    let mut open: Option<(usize, String)> = None;

    for (idx, tag) in tags.iter().enumerate() {
        let upper = tag.to_uppercase();
        let (prefix, kind) = match upper.split_once('-') {
            Some((p, k)) if p == "B" || p == "I" => (p, k.to_string()),
            _ => ("O", String::new()),
        };

        let continues = prefix == "I" && open.as_ref().is_some_and(|(_, k)| *k == kind);
        if continues {
            continue;
        }

        if let Some((start, k)) = open.take() {
            entities.insert((start, idx, k));
        }
        if prefix != "O" {
            open = Some((idx, kind));
        }
    }

    if let Some((start, k)) = open {
        entities.insert((start, tags.len(), k));
    }

    entities
}

/// Entity-level (tp, fp, fn) between gold and predicted tag sequences
#[must_use]
pub fn entity_counts(gold: &[String], predicted: &[String]) -> (usize, usize, usize) {
    let gold = extract_entities(gold);
    let predicted = extract_entities(predicted);
    let tp = gold.intersection(&predicted).count();
    (tp, predicted.len() - tp, gold.len() - tp)
}

/// Lowercase, strip punctuation and collapse whitespace
#[must_use]
pub fn normalize_answer(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Exact match against the best gold variant. An empty gold list means the
/// question is unanswerable and only an abstention (`None`) matches.
#[must_use]
pub fn exact_match(predicted: Option<&str>, golds: &[String]) -> f64 {
    if golds.is_empty() {
        return if predicted.map_or(true, |p| normalize_answer(p).is_empty()) {
            1.0
        } else {
            0.0
        };
    }
    let Some(predicted) = predicted else {
        return 0.0;
    };
    let predicted = normalize_answer(predicted);
    if golds.iter().any(|g| normalize_answer(g) == predicted) {
        1.0
    } else {
        0.0
    }
}

/// Token-overlap F1 against the best gold variant
#[must_use]
pub fn token_f1(predicted: Option<&str>, golds: &[String]) -> f64 {
    if golds.is_empty() {
        return exact_match(predicted, golds);
    }
    let Some(predicted) = predicted else {
        return 0.0;
    };
    let predicted = normalize_answer(predicted);
    golds
        .iter()
        .map(|g| overlap_f1(&predicted, &normalize_answer(g)))
        .fold(0.0, f64::max)
}

#[allow(clippy::cast_precision_loss)]
fn overlap_f1(predicted: &str, gold: &str) -> f64 {
    let pred_tokens: Vec<&str> = predicted.split_whitespace().collect();
    let gold_tokens: Vec<&str> = gold.split_whitespace().collect();
    if pred_tokens.is_empty() || gold_tokens.is_empty() {
        return if pred_tokens == gold_tokens { 1.0 } else { 0.0 };
    }

    let mut gold_counts: BTreeMap<&str, usize> = BTreeMap::new();
    for t in &gold_tokens {
        *gold_counts.entry(t).or_default() += 1;
    }
    let mut common = 0;
    for t in &pred_tokens {
        if let Some(c) = gold_counts.get_mut(t) {
            if *c > 0 {
                *c -= 1;
                common += 1;
            }
        }
    }
    if common == 0 {
        return 0.0;
    }

    let precision = common as f64 / pred_tokens.len() as f64;
    let recall = common as f64 / gold_tokens.len() as f64;
    2.0 * precision * recall / (precision + recall)
}

/// Length of the longest common subsequence of two sequences
pub fn lcs_len<T: PartialEq>(a: &[T], b: &[T]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for x in a {
        for (j, y) in b.iter().enumerate() {
            curr[j + 1] = if x == y {
                prev[j] + 1
            } else {
                curr[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

/// ROUGE-L F-measure over normalized whitespace tokens
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn rouge_l(candidate: &str, reference: &str) -> f64 {
    let candidate = normalize_answer(candidate);
    let reference = normalize_answer(reference);
    let c: Vec<&str> = candidate.split_whitespace().collect();
    let r: Vec<&str> = reference.split_whitespace().collect();
    let lcs = lcs_len(&c, &r);
    if lcs == 0 {
        return 0.0;
    }
    let precision = lcs as f64 / c.len() as f64;
    let recall = lcs as f64 / r.len() as f64;
    2.0 * precision * recall / (precision + recall)
}

/// Character-level similarity in `[0, 1]` used for nearest-label matching
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn char_similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    2.0 * lcs_len(&a, &b) as f64 / (a.len() + b.len()) as f64
}
