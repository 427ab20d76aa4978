//! Task pipeline contract and the values flowing through it.
//!
//! A pipeline turns a raw record into one or more model inputs, turns the
//! backend's raw outputs back into a task prediction, and scores that
//! prediction against the gold data. Preparation failures skip the example;
//! postprocessing failures score as incorrect predictions.

use crate::capability::{Capability, CapabilityRequirement};
use crate::config::{GenerationConfig, InferenceConfig};
use crate::dataset::{DatasetSpec, RawExample, TaskFamily};
use crate::error::DataIntegrityError;
use crate::fewshot::{render_prompt, Exemplar};
use crate::task_metrics::{ExampleScore, MetricType};
use crate::tokenize::Tokenizer;
use serde::Deserialize;

/// Model-ready input
#[derive(Debug, Clone, PartialEq)]
pub enum ModelInput {
    /// Text with an optional second segment
    Text { text: String, pair: Option<String> },
    /// Pre-split model units; `word_ids[i]` is the source word of unit `i`
    Units {
        units: Vec<String>,
        word_ids: Vec<usize>,
    },
    /// One question-answering window over context units starting at `offset`
    Span {
        question: String,
        context: Vec<String>,
        offset: usize,
    },
    /// Rendered prompt for generative backends
    Prompt(String),
}

/// Supervision attached to a model input, used for fine-tuning
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Label(usize),
    /// Tag index per unit
    UnitTags(Vec<usize>),
    /// Answer span in window units, `None` when the window holds no answer
    Span(Option<(usize, usize)>),
    Text(String),
}

/// Raw backend output for one model input
#[derive(Debug, Clone, PartialEq)]
pub enum RawOutput {
    /// Scores over the label set
    Logits(Vec<f64>),
    /// Scores over the label set for every unit
    UnitLogits(Vec<Vec<f64>>),
    /// Start and end scores per window unit plus the no-answer score
    SpanLogits {
        start: Vec<f64>,
        end: Vec<f64>,
        null_score: f64,
    },
    Text(String),
}

/// Gold data kept for scoring
#[derive(Debug, Clone, PartialEq)]
pub enum Gold {
    Label(usize),
    Tags(Vec<String>),
    /// Accepted answers; empty for unanswerable questions
    Answers(Vec<String>),
    Text(String),
}

/// Task-level prediction
#[derive(Debug, Clone, PartialEq)]
pub enum Prediction {
    /// `None` when generated text matched no label
    Label(Option<usize>),
    Tags(Vec<String>),
    /// `None` is an abstention
    Answer(Option<String>),
    Text(String),
}

/// A raw example after preparation
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedExample {
    pub index: usize,
    pub inputs: Vec<ModelInput>,
    /// Parallel to `inputs`
    pub targets: Vec<Target>,
    pub gold: Gold,
}

/// Everything a pipeline needs besides the example itself
#[derive(Clone, Copy)]
pub struct PipelineContext<'a> {
    pub dataset: &'a DatasetSpec,
    pub tokenizer: &'a dyn Tokenizer,
    pub inference: &'a InferenceConfig,
    pub generation: &'a GenerationConfig,
    /// Effective maximum input length in model units
    pub max_length: usize,
    /// Capability the backend is driven through
    pub mode: Capability,
    pub exemplars: &'a [Exemplar],
}

impl PipelineContext<'_> {
    #[must_use]
    pub fn is_generative(&self) -> bool {
        self.mode == Capability::Generate
    }

    /// Few-shot prompt ending with `input` and an empty output slot
    #[must_use]
    pub fn prompt(&self, input: &str) -> String {
        render_prompt(&self.dataset.prompt, self.exemplars, input)
    }
}

/// Contract shared by the scoring task families
pub trait TaskPipeline: Send + Sync {
    fn family(&self) -> TaskFamily;

    /// Convert a raw record into model inputs
    ///
    /// # Errors
    ///
    /// Returns `DataIntegrityError` for malformed or empty records.
    fn prepare(
        &self,
        raw: &RawExample,
        ctx: &PipelineContext<'_>,
    ) -> Result<PreparedExample, DataIntegrityError>;

    /// Convert raw outputs (one per model input) into a prediction
    ///
    /// # Errors
    ///
    /// Returns `DataIntegrityError` when the outputs cannot be interpreted.
    fn postprocess(
        &self,
        raw: &RawExample,
        prepared: &PreparedExample,
        outputs: &[RawOutput],
        ctx: &PipelineContext<'_>,
    ) -> Result<Prediction, DataIntegrityError>;

    /// Per-example contribution to each metric; `None` is a failed prediction
    fn score(
        &self,
        prediction: Option<&Prediction>,
        gold: &Gold,
        metrics: &[MetricType],
    ) -> Vec<(MetricType, ExampleScore)>;

    /// Turn a training record into a few-shot exemplar
    fn exemplar(&self, raw: &RawExample, dataset: &DatasetSpec) -> Option<Exemplar>;
}

/// Capabilities a family can run with, in order of preference
#[must_use]
pub fn requirement_for(family: TaskFamily) -> CapabilityRequirement {
    match family {
        TaskFamily::SequenceClassification => {
            CapabilityRequirement::any_of(&[Capability::Classify, Capability::Generate])
        }
        TaskFamily::SequenceTagging => CapabilityRequirement::any_of(&[Capability::TagSequence]),
        TaskFamily::QuestionAnswering => CapabilityRequirement::any_of(&[Capability::ExtractSpan]),
        TaskFamily::TextToText => CapabilityRequirement::any_of(&[Capability::Generate]),
        TaskFamily::Speed => CapabilityRequirement::any_of(&[Capability::MeasureLatency]),
    }
}

/// Scoring pipeline for a family; the speed family has none
#[must_use]
pub fn pipeline_for(family: TaskFamily) -> Option<Box<dyn TaskPipeline>> {
    match family {
        TaskFamily::SequenceClassification => {
            Some(Box::new(crate::classification::ClassificationPipeline))
        }
        TaskFamily::SequenceTagging => Some(Box::new(crate::tagging::TaggingPipeline)),
        TaskFamily::QuestionAnswering => Some(Box::new(crate::qa::QuestionAnsweringPipeline)),
        TaskFamily::TextToText => Some(Box::new(crate::text2text::TextToTextPipeline)),
        TaskFamily::Speed => None,
    }
}

/// Deserialize a record into a family-specific shape
///
/// # Errors
///
/// Returns `DataIntegrityError` if the record does not match `T`.
pub fn parse_record<T: for<'de> Deserialize<'de>>(
    raw: &RawExample,
) -> Result<T, DataIntegrityError> {
    T::deserialize(&raw.record).map_err(|e| DataIntegrityError::new(raw.index, e.to_string()))
}

/// Remove an echoed prompt and cut the generation at the earliest stop
/// sequence
#[must_use]
pub fn clean_generation(generated: &str, prompt: Option<&str>, stop_sequences: &[String]) -> String {
    let mut text = generated;
    if let Some(rest) = prompt.and_then(|p| text.strip_prefix(p)) {
        text = rest;
    }
    // leading whitespace would otherwise match a "\n\n" stop immediately
    let text = text.trim_start();
    let cut = stop_sequences
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min()
        .unwrap_or(text.len());
    text[..cut].trim().to_string()
}

/// Index of the largest finite score
#[must_use]
pub fn argmax(scores: &[f64]) -> Option<usize> {
    scores
        .iter()
        .enumerate()
        .filter(|(_, s)| s.is_finite())
        .fold(None, |best: Option<(usize, f64)>, (i, &s)| match best {
            Some((_, b)) if b >= s => best,
            _ => Some((i, s)),
        })
        .map(|(i, _)| i)
}
