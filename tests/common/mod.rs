//! Deterministic fake runtimes and hub shared by the integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use nlbench::remote::CompletionRequest;
use nlbench::{
    BackendError, Capability, Checkpoint, DatasetSplits, EncoderRuntime, GenerationConfig,
    GeneratorRuntime, LabelSchema, LoadedRuntime, ModelHub, ModelInput, ModelMetadata, ModelSpec,
    RawExample, RawOutput, RemoteClient, RemoteError, ResolutionError, TaskFamily, Tokenizer,
    TrainingExample, WhitespaceTokenizer,
};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Encoder
// ============================================================================

/// Call counts shared between a fake encoder and the test that built it
#[derive(Debug, Default)]
pub struct EncoderCounters {
    pub forward: AtomicUsize,
    pub train_steps: AtomicUsize,
    pub resets: AtomicUsize,
    /// Longest text input seen by `train_step` or `eval_loss`, in units
    pub max_train_units: AtomicUsize,
}

impl EncoderCounters {
    pub fn forward(&self) -> usize {
        self.forward.load(Ordering::SeqCst)
    }

    pub fn train_steps(&self) -> usize {
        self.train_steps.load(Ordering::SeqCst)
    }

    pub fn max_train_units(&self) -> usize {
        self.max_train_units.load(Ordering::SeqCst)
    }

    fn record_training(&self, batch: &[TrainingExample]) {
        let longest = batch
            .iter()
            .map(|ex| match &ex.input {
                ModelInput::Text { text, pair } => {
                    WhitespaceTokenizer.count(text)
                        + pair.as_deref().map_or(0, |p| WhitespaceTokenizer.count(p))
                }
                _ => 0,
            })
            .max()
            .unwrap_or(0);
        self.max_train_units.fetch_max(longest, Ordering::SeqCst);
    }
}

/// Encoder whose "weights" are a step counter.
///
/// Classification scores a label 1.0 when the text mentions it; tagging marks
/// capitalised units `B-PER`; span extraction picks the first numeric unit.
/// Validation loss falls with every training step.
pub struct FakeEncoder {
    counters: Arc<EncoderCounters>,
    /// Remaining train steps that fail with out-of-memory; `usize::MAX` never recovers
    oom_steps: Arc<AtomicUsize>,
    labels: Vec<String>,
    steps: usize,
}

impl FakeEncoder {
    pub fn new(counters: Arc<EncoderCounters>) -> Self {
        Self {
            counters,
            oom_steps: Arc::new(AtomicUsize::new(0)),
            labels: Vec::new(),
            steps: 0,
        }
    }

    pub fn with_oom_steps(mut self, oom_steps: Arc<AtomicUsize>) -> Self {
        self.oom_steps = oom_steps;
        self
    }

    fn one_hot(&self, label: &str) -> Vec<f64> {
        self.labels
            .iter()
            .map(|l| if l == label { 1.0 } else { 0.0 })
            .collect()
    }

    fn respond(&self, input: &ModelInput, capability: Capability) -> RawOutput {
        match (capability, input) {
            (Capability::Classify, ModelInput::Text { text, pair }) => {
                let text = format!("{text} {}", pair.as_deref().unwrap_or_default()).to_lowercase();
                RawOutput::Logits(
                    self.labels
                        .iter()
                        .map(|l| if text.contains(&l.to_lowercase()) { 1.0 } else { 0.0 })
                        .collect(),
                )
            }
            (Capability::TagSequence, ModelInput::Units { units, .. }) => RawOutput::UnitLogits(
                units
                    .iter()
                    .map(|u| {
                        let capitalised = u.chars().next().is_some_and(char::is_uppercase);
                        self.one_hot(if capitalised { "B-PER" } else { "O" })
                    })
                    .collect(),
            ),
            (Capability::ExtractSpan, ModelInput::Span { context, .. }) => {
                let hit = context
                    .iter()
                    .position(|u| u.chars().all(|c| c.is_ascii_digit()));
                let mut start = vec![0.0; context.len()];
                let mut end = vec![0.0; context.len()];
                let null_score = match hit {
                    Some(i) => {
                        start[i] = 5.0;
                        end[i] = 5.0;
                        0.0
                    }
                    None => 100.0,
                };
                RawOutput::SpanLogits {
                    start,
                    end,
                    null_score,
                }
            }
            _ => RawOutput::Logits(Vec::new()),
        }
    }
}

impl EncoderRuntime for FakeEncoder {
    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            num_parameters: Some(110_000_000),
            max_sequence_length: Some(512),
            vocabulary_size: Some(30_000),
        }
    }

    fn tokenizer(&self) -> &dyn Tokenizer {
        &WhitespaceTokenizer
    }

    fn reset(&mut self, _seed: u64) -> Result<(), BackendError> {
        self.steps = 0;
        self.counters.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn attach_head(
        &mut self,
        family: TaskFamily,
        schema: &LabelSchema,
    ) -> Result<(), BackendError> {
        if family == TaskFamily::TextToText {
            return Err(BackendError::Unsupported(Capability::Generate));
        }
        self.labels = schema.labels.clone();
        Ok(())
    }

    fn forward(
        &mut self,
        batch: &[ModelInput],
        capability: Capability,
    ) -> Result<Vec<RawOutput>, BackendError> {
        self.counters.forward.fetch_add(1, Ordering::SeqCst);
        Ok(batch.iter().map(|i| self.respond(i, capability)).collect())
    }

    fn train_step(
        &mut self,
        batch: &[TrainingExample],
        _learning_rate: f64,
    ) -> Result<f64, BackendError> {
        self.counters.record_training(batch);
        let remaining = self.oom_steps.load(Ordering::SeqCst);
        if remaining == usize::MAX {
            return Err(BackendError::OutOfMemory);
        }
        if remaining > 0 {
            self.oom_steps.store(remaining - 1, Ordering::SeqCst);
            return Err(BackendError::OutOfMemory);
        }
        self.steps += 1;
        self.counters.train_steps.fetch_add(1, Ordering::SeqCst);
        Ok(1.0 / (self.steps as f64 + 1.0))
    }

    fn eval_loss(&mut self, batch: &[TrainingExample]) -> Result<f64, BackendError> {
        self.counters.record_training(batch);
        Ok(1.0 / (self.steps as f64 + 1.0))
    }

    fn checkpoint(&self) -> Result<Checkpoint, BackendError> {
        Ok(Checkpoint::new(self.steps))
    }

    fn restore(&mut self, checkpoint: &Checkpoint) -> Result<(), BackendError> {
        self.steps = *checkpoint
            .downcast_ref::<usize>()
            .ok_or_else(|| BackendError::Runtime("foreign checkpoint".to_string()))?;
        Ok(())
    }
}

// ============================================================================
// Generator
// ============================================================================

type Responder = Box<dyn Fn(&str) -> Result<String, BackendError> + Send>;

/// Local generator answering each prompt through a closure, recording prompts
pub struct FakeGenerator {
    respond: Responder,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl FakeGenerator {
    pub fn new(
        prompts: Arc<Mutex<Vec<String>>>,
        respond: impl Fn(&str) -> Result<String, BackendError> + Send + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            prompts,
        }
    }
}

impl GeneratorRuntime for FakeGenerator {
    fn metadata(&self) -> ModelMetadata {
        ModelMetadata {
            num_parameters: Some(1_000_000_000),
            max_sequence_length: Some(2048),
            vocabulary_size: None,
        }
    }

    fn tokenizer(&self) -> &dyn Tokenizer {
        &WhitespaceTokenizer
    }

    fn generate(
        &mut self,
        prompts: &[String],
        _config: &GenerationConfig,
        _seed: u64,
    ) -> Result<Vec<String>, BackendError> {
        self.prompts.lock().unwrap().extend(prompts.iter().cloned());
        prompts.iter().map(|p| (self.respond)(p)).collect()
    }
}

/// Last blank-line separated section of a prompt, i.e. the example itself
pub fn last_section(prompt: &str) -> String {
    prompt.rsplit("\n\n").next().unwrap_or(prompt).trim().to_string()
}

// ============================================================================
// Remote
// ============================================================================

/// Remote client replaying scripted results, then answering `fallback`
pub struct ScriptedRemote {
    script: Mutex<VecDeque<Result<String, RemoteError>>>,
    fallback: Result<String, RemoteError>,
    calls: AtomicUsize,
}

impl ScriptedRemote {
    pub fn new(
        script: Vec<Result<String, RemoteError>>,
        fallback: Result<String, RemoteError>,
    ) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RemoteClient for ScriptedRemote {
    fn name(&self) -> &str {
        "scripted"
    }

    fn complete(
        &self,
        _request: &CompletionRequest<'_>,
        _timeout: Duration,
    ) -> Result<String, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

// ============================================================================
// Hub
// ============================================================================

type Factory = Box<dyn Fn() -> LoadedRuntime + Send + Sync>;

/// Hub serving runtimes from per-model factories and counting loads
#[derive(Default)]
pub struct FakeHub {
    factories: HashMap<String, Factory>,
    loads: AtomicUsize,
}

impl FakeHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(
        mut self,
        id: &str,
        factory: impl Fn() -> LoadedRuntime + Send + Sync + 'static,
    ) -> Self {
        self.factories.insert(id.to_string(), Box::new(factory));
        self
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModelHub for FakeHub {
    fn load(&self, spec: &ModelSpec) -> Result<LoadedRuntime, ResolutionError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.factories
            .get(&spec.id)
            .map(|factory| factory())
            .ok_or_else(|| ResolutionError::ModelNotFound(spec.id.clone()))
    }
}

/// Hub with a fine-tunable encoder `bert`, sharing `counters`
pub fn encoder_hub(counters: &Arc<EncoderCounters>) -> FakeHub {
    let counters = Arc::clone(counters);
    FakeHub::new().with_model("bert", move || {
        LoadedRuntime::Encoder(Box::new(FakeEncoder::new(Arc::clone(&counters))))
    })
}

/// Hub with a remote model `api` backed by `client`
pub fn remote_hub(client: &Arc<ScriptedRemote>) -> FakeHub {
    let client = Arc::clone(client);
    FakeHub::new().with_model("api", move || {
        LoadedRuntime::Remote(Arc::clone(&client) as Arc<dyn RemoteClient>)
    })
}

// ============================================================================
// Data
// ============================================================================

pub fn examples(records: Vec<Value>) -> Vec<RawExample> {
    records
        .into_iter()
        .enumerate()
        .map(|(i, r)| RawExample::new(i, r))
        .collect()
}

pub fn splits(train: Vec<Value>, val: Vec<Value>, test: Vec<Value>) -> DatasetSplits {
    DatasetSplits {
        train: examples(train),
        val: examples(val),
        test: examples(test),
    }
}

/// Sentiment records whose text names the label
pub fn sentiment(n: usize) -> Vec<Value> {
    (0..n)
        .map(|i| {
            let label = if i % 2 == 0 { "positive" } else { "negative" };
            serde_json::json!({ "text": format!("a {label} review number {i}"), "label": label })
        })
        .collect()
}

/// Person-tagged sentences
pub fn people(n: usize) -> Vec<Value> {
    (0..n)
        .map(|i| {
            serde_json::json!({
                "tokens": ["Ada", "met", "Grace", "on", format!("day{i}")],
                "labels": ["B-PER", "O", "B-PER", "O", "O"],
            })
        })
        .collect()
}

/// Questions whose answer is the only number in the context
pub fn founding_questions(n: usize) -> Vec<Value> {
    (0..n)
        .map(|i| {
            let year = 1850 + i;
            serde_json::json!({
                "question": "When was the company founded?",
                "context": format!("The company was founded in {year} by Ada ."),
                "answers": [year.to_string()],
            })
        })
        .collect()
}

/// Text pairs whose target equals the source
pub fn copies(n: usize) -> Vec<Value> {
    (0..n)
        .map(|i| serde_json::json!({ "text": format!("copy sentence {i}"), "target_text": format!("copy sentence {i}") }))
        .collect()
}
