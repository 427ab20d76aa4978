//! Benchmark run configuration.
//!
//! Every section is optional in YAML; missing fields fall back to defaults.

use crate::metrics::StatConfig;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML configuration: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid metric type: {0}")]
    InvalidMetric(String),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("No models to benchmark")]
    EmptyModelSet,

    #[error("No datasets to benchmark")]
    EmptyDatasetSet,

    #[error("Trial count must be at least 1")]
    ZeroTrials,
}

/// Top-level benchmark configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BenchmarkConfig {
    /// Trials per (model, dataset) pair
    #[serde(default = "default_trials")]
    pub trials: usize,
    /// Trial `i` runs with seed `base_seed + i`
    #[serde(default = "default_base_seed")]
    pub base_seed: u64,
    /// Skip pairs already completed in the ledger
    #[serde(default = "default_true")]
    pub resume: bool,
    /// Re-run pairs even when the ledger holds a completed record
    #[serde(default)]
    pub force: bool,
    /// Truncate every test split to this many examples
    #[serde(default)]
    pub max_test_examples: Option<usize>,
    /// Draw each trial's test split with replacement, seeded by the trial seed
    #[serde(default = "default_true")]
    pub resample_test: bool,
    #[serde(default)]
    pub stats: StatConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub trainer: TrainerConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub speed: SpeedConfig,
    /// JSONL file backing the run ledger
    #[serde(default)]
    pub ledger_path: Option<PathBuf>,
}

const fn default_trials() -> usize {
    10
}
const fn default_base_seed() -> u64 {
    4242
}
const fn default_true() -> bool {
    true
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            trials: default_trials(),
            base_seed: default_base_seed(),
            resume: true,
            force: false,
            max_test_examples: None,
            resample_test: true,
            stats: StatConfig::default(),
            retry: RetryConfig::default(),
            trainer: TrainerConfig::default(),
            inference: InferenceConfig::default(),
            generation: GenerationConfig::default(),
            speed: SpeedConfig::default(),
            ledger_path: None,
        }
    }
}

/// Centralized retry policy for retryable trial failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first attempt of a trial
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

const fn default_max_retries() -> u32 {
    3
}
const fn default_base_delay_ms() -> u64 {
    1000
}
const fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Fine-tuning loop settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainerConfig {
    #[serde(default = "default_max_epochs")]
    pub max_epochs: usize,
    /// Epochs without validation improvement before stopping
    #[serde(default = "default_patience")]
    pub patience: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Batch-size halvings allowed before out-of-memory becomes fatal
    #[serde(default = "default_max_halvings")]
    pub max_halvings: u32,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    /// Minimum validation loss decrease counted as improvement
    #[serde(default)]
    pub min_delta: f64,
}

const fn default_max_epochs() -> usize {
    10
}
const fn default_patience() -> usize {
    2
}
const fn default_batch_size() -> usize {
    32
}
const fn default_max_halvings() -> u32 {
    4
}
const fn default_learning_rate() -> f64 {
    2e-5
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            max_epochs: default_max_epochs(),
            patience: default_patience(),
            batch_size: default_batch_size(),
            max_halvings: default_max_halvings(),
            learning_rate: default_learning_rate(),
            min_delta: 0.0,
        }
    }
}

/// What to do with inputs longer than the model accepts
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OversizePolicy {
    #[default]
    Truncate,
    Reject,
}

/// How a word split into several model units gets a single tag
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AlignmentRule {
    /// The first unit's tag wins
    #[default]
    FirstUnit,
    /// Most frequent tag among the units, ties to the earliest unit
    Majority,
}

/// Inference and input-shaping settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InferenceConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Upper bound on input length; the model's own limit applies if lower
    #[serde(default = "default_max_sequence_length")]
    pub max_sequence_length: usize,
    #[serde(default)]
    pub oversize_policy: OversizePolicy,
    #[serde(default)]
    pub alignment: AlignmentRule,
    /// Overlap between consecutive question-answering windows
    #[serde(default = "default_doc_stride")]
    pub doc_stride: usize,
    #[serde(default = "default_max_answer_tokens")]
    pub max_answer_tokens: usize,
    /// Abstain when the no-answer score beats the best span by more than this
    #[serde(default)]
    pub no_answer_threshold: f64,
}

const fn default_max_sequence_length() -> usize {
    512
}
const fn default_doc_stride() -> usize {
    128
}
const fn default_max_answer_tokens() -> usize {
    30
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_sequence_length: default_max_sequence_length(),
            oversize_policy: OversizePolicy::default(),
            alignment: AlignmentRule::default(),
            doc_stride: default_doc_stride(),
            max_answer_tokens: default_max_answer_tokens(),
            no_answer_threshold: 0.0,
        }
    }
}

/// Decoding policy for generative backends
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Decoding {
    #[default]
    Greedy,
    Sampling { temperature: f64, top_p: f64 },
}

/// Generation settings shared by local and remote generative backends
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationConfig {
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: usize,
    #[serde(default)]
    pub decoding: Decoding,
    #[serde(default = "default_stop_sequences")]
    pub stop_sequences: Vec<String>,
    /// Per-call timeout for remote backends
    #[serde(default = "default_remote_timeout_ms")]
    pub remote_timeout_ms: u64,
}

const fn default_max_new_tokens() -> usize {
    32
}
fn default_stop_sequences() -> Vec<String> {
    vec!["\n\n".to_string()]
}
const fn default_remote_timeout_ms() -> u64 {
    60_000
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: default_max_new_tokens(),
            decoding: Decoding::default(),
            stop_sequences: default_stop_sequences(),
            remote_timeout_ms: default_remote_timeout_ms(),
        }
    }
}

/// Latency probe settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpeedConfig {
    #[serde(default = "default_warmup_iterations")]
    pub warmup_iterations: usize,
    #[serde(default = "default_measured_iterations")]
    pub measured_iterations: usize,
    #[serde(default = "default_speed_batch_size")]
    pub batch_size: usize,
    /// Words per synthetic document
    #[serde(default = "default_synthetic_words")]
    pub synthetic_words: usize,
}

const fn default_warmup_iterations() -> usize {
    3
}
const fn default_measured_iterations() -> usize {
    10
}
const fn default_speed_batch_size() -> usize {
    8
}
const fn default_synthetic_words() -> usize {
    128
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            warmup_iterations: default_warmup_iterations(),
            measured_iterations: default_measured_iterations(),
            batch_size: default_speed_batch_size(),
            synthetic_words: default_synthetic_words(),
        }
    }
}

/// Fields that change benchmark results; `resume`, `force`, retry timing and
/// the ledger location are deliberately absent.
#[derive(Serialize)]
struct Fingerprinted<'a> {
    trials: usize,
    base_seed: u64,
    max_test_examples: Option<usize>,
    resample_test: bool,
    stats: &'a StatConfig,
    trainer: &'a TrainerConfig,
    inference: &'a InferenceConfig,
    generation: &'a GenerationConfig,
    speed: &'a SpeedConfig,
}

impl BenchmarkConfig {
    /// Load configuration from YAML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Load configuration from YAML string
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML cannot be parsed or a value is out of range.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, reason: &str| ConfigError::InvalidValue {
            field,
            reason: reason.to_string(),
        };

        if !(self.stats.confidence > 0.0 && self.stats.confidence < 1.0) {
            return Err(invalid("stats.confidence", "must be in (0, 1)"));
        }
        if self.stats.bootstrap_n == 0 {
            return Err(invalid("stats.bootstrap_n", "must be positive"));
        }
        if self.trainer.batch_size == 0 || self.inference.batch_size == 0 {
            return Err(invalid("batch_size", "must be positive"));
        }
        if self.inference.max_sequence_length == 0 {
            return Err(invalid("inference.max_sequence_length", "must be positive"));
        }
        if self.inference.doc_stride == 0 {
            return Err(invalid("inference.doc_stride", "must be positive"));
        }
        if self.speed.measured_iterations == 0 || self.speed.batch_size == 0 {
            return Err(invalid("speed", "measured iterations and batch size must be positive"));
        }
        if let Decoding::Sampling { temperature, top_p } = self.generation.decoding {
            if temperature <= 0.0 || !(top_p > 0.0 && top_p <= 1.0) {
                return Err(invalid(
                    "generation.decoding",
                    "temperature must be positive and top_p in (0, 1]",
                ));
            }
        }
        Ok(())
    }

    /// SHA-256 over the result-affecting settings for a run of `trials` trials
    #[must_use]
    pub fn fingerprint(&self, trials: usize) -> String {
        let view = Fingerprinted {
            trials,
            base_seed: self.base_seed,
            max_test_examples: self.max_test_examples,
            resample_test: self.resample_test,
            stats: &self.stats,
            trainer: &self.trainer,
            inference: &self.inference,
            generation: &self.generation,
            speed: &self.speed,
        };
        let canonical = serde_json::to_vec(&view).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        format!("{:x}", hasher.finalize())
    }

    /// Seeds for `trials` trials, in consumption order
    #[must_use]
    pub fn trial_seeds(&self, trials: usize) -> Vec<u64> {
        (0..trials as u64)
            .map(|i| self.base_seed.wrapping_add(i))
            .collect()
    }
}
