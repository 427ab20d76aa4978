//! Dataset definitions and the dataset provider collaborator.

use crate::config::ConfigError;
use crate::task_metrics::MetricType;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised by dataset providers
#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("Dataset not found: {0}")]
    NotFound(String),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Task family a dataset belongs to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskFamily {
    SequenceClassification,
    SequenceTagging,
    QuestionAnswering,
    TextToText,
    Speed,
}

impl TaskFamily {
    /// Metrics reported when the dataset lists none
    #[must_use]
    pub fn default_metrics(self) -> Vec<MetricType> {
        match self {
            Self::SequenceClassification => vec![MetricType::MacroF1, MetricType::Accuracy],
            Self::SequenceTagging => vec![MetricType::EntityF1],
            Self::QuestionAnswering => vec![MetricType::ExactMatch, MetricType::TokenF1],
            Self::TextToText => vec![MetricType::RougeL],
            Self::Speed => vec![MetricType::Throughput],
        }
    }

    /// Whether the family's pipeline reports `metric`
    #[must_use]
    pub fn supports(self, metric: MetricType) -> bool {
        self.default_metrics().contains(&metric)
    }
}

impl std::fmt::Display for TaskFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::SequenceClassification => "sequence-classification",
            Self::SequenceTagging => "sequence-tagging",
            Self::QuestionAnswering => "question-answering",
            Self::TextToText => "text-to-text",
            Self::Speed => "speed",
        };
        f.write_str(name)
    }
}

/// Closed label set plus the strings generative prompts use for each label
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LabelSchema {
    #[serde(default)]
    pub labels: Vec<String>,
    /// Canonical label -> prompt label; unmapped labels are prompted verbatim
    #[serde(default)]
    pub prompt_labels: BTreeMap<String, String>,
}

impl LabelSchema {
    #[must_use]
    pub fn new(labels: &[&str]) -> Self {
        Self {
            labels: labels.iter().map(|l| (*l).to_string()).collect(),
            prompt_labels: BTreeMap::new(),
        }
    }

    /// Case-insensitive label lookup
    #[must_use]
    pub fn index_of(&self, label: &str) -> Option<usize> {
        self.labels
            .iter()
            .position(|l| l.eq_ignore_ascii_case(label.trim()))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// String used for label `index` inside prompts
    #[must_use]
    pub fn prompt_label(&self, index: usize) -> Option<&str> {
        let label = self.labels.get(index)?;
        Some(
            self.prompt_labels
                .get(label)
                .map_or(label.as_str(), String::as_str),
        )
    }

    /// Map a prompt label back to its label index, case-insensitively
    #[must_use]
    pub fn from_prompt_label(&self, text: &str) -> Option<usize> {
        let text = text.trim();
        (0..self.labels.len()).find(|&i| {
            self.prompt_label(i)
                .is_some_and(|p| p.eq_ignore_ascii_case(text))
        })
    }
}

/// Declared split sizes; splits longer than declared are truncated
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SplitSizes {
    #[serde(default)]
    pub train: Option<usize>,
    #[serde(default)]
    pub val: Option<usize>,
    #[serde(default)]
    pub test: Option<usize>,
}

/// Prompt layout for generative evaluation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptTemplate {
    /// Instruction placed before the exemplars
    #[serde(default)]
    pub prefix: String,
    /// Per-example layout with `{input}` and `{output}` placeholders
    #[serde(default = "default_template")]
    pub template: String,
}

fn default_template() -> String {
    "{input}\n{output}".to_string()
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            template: default_template(),
        }
    }
}

/// One benchmark dataset
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatasetSpec {
    pub id: String,
    #[serde(default)]
    pub pretty_name: String,
    pub family: TaskFamily,
    #[serde(flatten)]
    pub schema: LabelSchema,
    /// Language filter, part of the dataset identity
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub splits: SplitSizes,
    /// Exemplars prepended to prompts for generative backends
    #[serde(default)]
    pub num_few_shot: usize,
    #[serde(default)]
    pub metrics: Vec<MetricType>,
    #[serde(default)]
    pub prompt: PromptTemplate,
}

impl DatasetSpec {
    #[must_use]
    pub fn new(id: impl Into<String>, family: TaskFamily) -> Self {
        Self {
            id: id.into(),
            pretty_name: String::new(),
            family,
            schema: LabelSchema::default(),
            languages: Vec::new(),
            splits: SplitSizes::default(),
            num_few_shot: 0,
            metrics: Vec::new(),
            prompt: PromptTemplate::default(),
        }
    }

    #[must_use]
    pub fn with_labels(mut self, labels: &[&str]) -> Self {
        self.schema = LabelSchema::new(labels);
        self
    }

    #[must_use]
    pub fn with_languages(mut self, languages: &[&str]) -> Self {
        self.languages = languages.iter().map(|l| (*l).to_string()).collect();
        self
    }

    #[must_use]
    pub const fn with_few_shot(mut self, n: usize) -> Self {
        self.num_few_shot = n;
        self
    }

    /// `id` or `id[lang+lang]` when a language filter is set
    #[must_use]
    pub fn identity(&self) -> String {
        if self.languages.is_empty() {
            self.id.clone()
        } else {
            format!("{}[{}]", self.id, self.languages.join("+"))
        }
    }

    /// Listed metrics, or the family's defaults when none are listed
    #[must_use]
    pub fn effective_metrics(&self) -> Vec<MetricType> {
        if self.metrics.is_empty() {
            self.family.default_metrics()
        } else {
            self.metrics.clone()
        }
    }

    /// Load a dataset definition from a YAML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// # Errors
    ///
    /// Returns an error if the YAML cannot be parsed or the definition is
    /// invalid.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let spec: Self = serde_yaml::from_str(yaml)?;
        spec.validate()?;
        Ok(spec)
    }

    /// # Errors
    ///
    /// Returns `MissingField` for an empty id and `InvalidMetric` for a
    /// metric the dataset's family does not report.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::MissingField("id".to_string()));
        }
        if let Some(metric) = self.metrics.iter().find(|m| !self.family.supports(**m)) {
            return Err(ConfigError::InvalidMetric(format!(
                "{}: {} is not reported for {} datasets",
                self.id,
                metric.name(),
                self.family
            )));
        }
        Ok(())
    }
}

/// Loads dataset definitions from glob patterns (e.g. `datasets/*.yaml`)
#[derive(Debug, Default)]
pub struct DatasetLoader {
    datasets: Vec<DatasetSpec>,
}

impl DatasetLoader {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            datasets: Vec::new(),
        }
    }

    /// # Errors
    ///
    /// Returns an error if the glob pattern is invalid or files cannot be loaded.
    pub fn load_glob(pattern: &str) -> Result<Self, ConfigError> {
        let mut loader = Self::new();

        let paths = glob::glob(pattern)
            .map_err(|e| ConfigError::MissingField(format!("Invalid glob pattern: {e}")))?;

        for entry in paths {
            let path = entry.map_err(|e| {
                ConfigError::IoError(std::io::Error::other(format!("Glob error: {e}")))
            })?;
            loader.datasets.push(DatasetSpec::load(&path)?);
        }

        Ok(loader)
    }

    #[must_use]
    pub fn datasets(&self) -> &[DatasetSpec] {
        &self.datasets
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }
}

impl IntoIterator for DatasetLoader {
    type Item = DatasetSpec;
    type IntoIter = std::vec::IntoIter<DatasetSpec>;

    fn into_iter(self) -> Self::IntoIter {
        self.datasets.into_iter()
    }
}

/// One structured record, indexed by its position in the split
#[derive(Debug, Clone, PartialEq)]
pub struct RawExample {
    pub index: usize,
    pub record: serde_json::Value,
}

impl RawExample {
    #[must_use]
    pub const fn new(index: usize, record: serde_json::Value) -> Self {
        Self { index, record }
    }
}

/// Ordered examples for every split of one dataset
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetSplits {
    pub train: Vec<RawExample>,
    pub val: Vec<RawExample>,
    pub test: Vec<RawExample>,
}

impl DatasetSplits {
    /// Truncate splits to declared sizes and an optional test cap
    #[must_use]
    pub fn limited(mut self, sizes: &SplitSizes, max_test: Option<usize>) -> Self {
        if let Some(n) = sizes.train {
            self.train.truncate(n);
        }
        if let Some(n) = sizes.val {
            self.val.truncate(n);
        }
        if let Some(n) = sizes.test {
            self.test.truncate(n);
        }
        if let Some(n) = max_test {
            self.test.truncate(n);
        }
        self
    }

    /// Test split drawn with replacement, same size as the original
    #[must_use]
    pub fn resampled_test(&self, seed: u64) -> Vec<RawExample> {
        let n = self.test.len();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n)
            .map(|_| self.test[rng.gen_range(0..n)].clone())
            .collect()
    }
}

/// Yields the splits of a dataset; every call restarts from the beginning
pub trait DatasetProvider: Send + Sync {
    /// # Errors
    ///
    /// Returns `DatasetError::NotFound` for unknown datasets.
    fn load(&self, dataset: &DatasetSpec) -> Result<DatasetSplits, DatasetError>;
}

/// Reads `<root>/<id>/{train,val,test}.jsonl`; missing train/val files are
/// empty splits, a missing test file means the dataset does not exist.
#[derive(Debug, Clone)]
pub struct JsonlDatasetProvider {
    root: PathBuf,
}

impl JsonlDatasetProvider {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read_split(path: &Path) -> Result<Vec<RawExample>, DatasetError> {
        let io_err = |source| DatasetError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = std::fs::File::open(path).map_err(io_err)?;
        let mut examples = Vec::new();

        for line in BufReader::new(file).lines() {
            let line = line.map_err(io_err)?;
            if line.trim().is_empty() {
                continue;
            }
            // Unparseable lines stay in place as null records so that the
            // pipeline skips and counts them.
            let record = serde_json::from_str(&line).unwrap_or_else(|e| {
                tracing::debug!(path = %path.display(), error = %e, "Unparseable record");
                serde_json::Value::Null
            });
            examples.push(RawExample::new(examples.len(), record));
        }

        Ok(examples)
    }
}

impl DatasetProvider for JsonlDatasetProvider {
    fn load(&self, dataset: &DatasetSpec) -> Result<DatasetSplits, DatasetError> {
        let dir = self.root.join(&dataset.id);
        let test_path = dir.join("test.jsonl");
        if !test_path.is_file() {
            return Err(DatasetError::NotFound(dataset.identity()));
        }

        let optional = |name: &str| {
            let path = dir.join(name);
            if path.is_file() {
                Self::read_split(&path)
            } else {
                Ok(Vec::new())
            }
        };

        Ok(DatasetSplits {
            train: optional("train.jsonl")?,
            val: optional("val.jsonl")?,
            test: Self::read_split(&test_path)?,
        })
    }
}

/// In-memory provider keyed by dataset id
#[derive(Debug, Clone, Default)]
pub struct MemoryDatasetProvider {
    datasets: BTreeMap<String, DatasetSplits>,
}

impl MemoryDatasetProvider {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_dataset(mut self, id: impl Into<String>, splits: DatasetSplits) -> Self {
        self.datasets.insert(id.into(), splits);
        self
    }
}

impl DatasetProvider for MemoryDatasetProvider {
    fn load(&self, dataset: &DatasetSpec) -> Result<DatasetSplits, DatasetError> {
        self.datasets
            .get(&dataset.id)
            .cloned()
            .ok_or_else(|| DatasetError::NotFound(dataset.identity()))
    }
}
