//! Model adapters.
//!
//! A [`ModelHub`] turns a [`ModelSpec`] into a runtime. [`resolve`] wraps the
//! runtime in an [`AdapterHandle`], whose [`Backend`] variant fixes the
//! capability set, the inference path and the failure classification used
//! by the orchestrator's retry policy.

use crate::capability::{Capability, CapabilitySet};
use crate::config::{GenerationConfig, InferenceConfig, OversizePolicy};
use crate::dataset::{LabelSchema, TaskFamily};
use crate::error::{BackendError, DataIntegrityError, FailureClass, ResolutionError};
use crate::model::{BackendKind, ModelMetadata, ModelSpec};
use crate::pipeline::{ModelInput, RawOutput};
use crate::remote::{CompletionRequest, RemoteClient};
use crate::tokenize::{Tokenizer, WhitespaceTokenizer};
use crate::trainer::{Trainable, TrainingExample};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// Opaque snapshot of trainable weights
#[derive(Clone)]
pub struct Checkpoint(Arc<dyn Any + Send + Sync>);

impl Checkpoint {
    pub fn new<T: Any + Send + Sync>(state: T) -> Self {
        Self(Arc::new(state))
    }

    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

impl std::fmt::Debug for Checkpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Checkpoint(..)")
    }
}

/// Locally hosted encoder; pretrained, or randomly initialised for the
/// fresh baseline
pub trait EncoderRuntime: Send {
    fn metadata(&self) -> ModelMetadata;

    fn tokenizer(&self) -> &dyn Tokenizer;

    /// Task heads the runtime can attach (classify, tag, extract)
    fn heads(&self) -> CapabilitySet {
        CapabilitySet::of(&[
            Capability::Classify,
            Capability::TagSequence,
            Capability::ExtractSpan,
        ])
    }

    /// Restore the starting weights for a new trial; fresh runtimes draw
    /// them from `seed`
    ///
    /// # Errors
    ///
    /// Returns a `BackendError` if the weights cannot be reloaded.
    fn reset(&mut self, seed: u64) -> Result<(), BackendError>;

    /// # Errors
    ///
    /// Returns a `BackendError` if the head cannot be built.
    fn attach_head(&mut self, family: TaskFamily, schema: &LabelSchema)
        -> Result<(), BackendError>;

    /// Forward pass; `MeasureLatency` runs the encoder without a head
    ///
    /// # Errors
    ///
    /// Returns `BackendError::OutOfMemory` when the batch does not fit.
    fn forward(
        &mut self,
        batch: &[ModelInput],
        capability: Capability,
    ) -> Result<Vec<RawOutput>, BackendError>;

    /// One optimisation step, returning the batch loss
    ///
    /// # Errors
    ///
    /// Returns `BackendError::OutOfMemory` when the batch does not fit.
    fn train_step(
        &mut self,
        batch: &[TrainingExample],
        learning_rate: f64,
    ) -> Result<f64, BackendError>;

    /// # Errors
    ///
    /// Returns `BackendError::OutOfMemory` when the batch does not fit.
    fn eval_loss(&mut self, batch: &[TrainingExample]) -> Result<f64, BackendError>;

    /// # Errors
    ///
    /// Returns a `BackendError` if the weights cannot be copied.
    fn checkpoint(&self) -> Result<Checkpoint, BackendError>;

    /// # Errors
    ///
    /// Returns a `BackendError` if the checkpoint does not belong to this runtime.
    fn restore(&mut self, checkpoint: &Checkpoint) -> Result<(), BackendError>;
}

/// Locally hosted frozen generative model
pub trait GeneratorRuntime: Send {
    fn metadata(&self) -> ModelMetadata;

    fn tokenizer(&self) -> &dyn Tokenizer;

    /// # Errors
    ///
    /// Returns `BackendError::OutOfMemory` when the batch does not fit.
    fn generate(
        &mut self,
        prompts: &[String],
        config: &GenerationConfig,
        seed: u64,
    ) -> Result<Vec<String>, BackendError>;
}

/// What a hub hands back for a model
pub enum LoadedRuntime {
    Encoder(Box<dyn EncoderRuntime>),
    Generator(Box<dyn GeneratorRuntime>),
    Remote(Arc<dyn RemoteClient>),
}

impl LoadedRuntime {
    const fn describe(&self) -> &'static str {
        match self {
            Self::Encoder(_) => "encoder",
            Self::Generator(_) => "generator",
            Self::Remote(_) => "remote",
        }
    }
}

/// Model hub/runtime collaborator
pub trait ModelHub: Send + Sync {
    /// Load (downloading or caching as needed) the runtime for `spec`
    ///
    /// # Errors
    ///
    /// Returns `ModelNotFound`/`RevisionNotFound` when the model cannot be found.
    fn load(&self, spec: &ModelSpec) -> Result<LoadedRuntime, ResolutionError>;
}

/// Backend variants behind the adapter contract
pub enum Backend {
    LocalFinetunable(Box<dyn EncoderRuntime>),
    LocalGenerative(Box<dyn GeneratorRuntime>),
    Remote {
        client: Arc<dyn RemoteClient>,
        timeout: Duration,
    },
    Fresh(Box<dyn EncoderRuntime>),
}

/// A resolved model
pub struct AdapterHandle {
    spec: ModelSpec,
    backend: Backend,
    metadata: ModelMetadata,
}

/// Resolve a model spec through the hub
///
/// # Errors
///
/// Returns the hub's `ResolutionError`, or `BackendMismatch` when the hub
/// returns a runtime that cannot serve the declared backend kind.
pub fn resolve(
    hub: &dyn ModelHub,
    spec: &ModelSpec,
    generation: &GenerationConfig,
) -> Result<AdapterHandle, ResolutionError> {
    let runtime = hub.load(spec)?;
    let actual = runtime.describe();

    let backend = match (spec.backend, runtime) {
        (BackendKind::LocalFinetunable, LoadedRuntime::Encoder(r)) => Backend::LocalFinetunable(r),
        (BackendKind::Fresh, LoadedRuntime::Encoder(r)) => Backend::Fresh(r),
        (BackendKind::LocalGenerative, LoadedRuntime::Generator(r)) => Backend::LocalGenerative(r),
        (BackendKind::Remote, LoadedRuntime::Remote(client)) => Backend::Remote {
            client,
            timeout: Duration::from_millis(generation.remote_timeout_ms),
        },
        (declared, _) => {
            return Err(ResolutionError::BackendMismatch {
                model: spec.id.clone(),
                declared,
                actual: actual.to_string(),
            })
        }
    };

    Ok(AdapterHandle::new(spec.clone(), backend))
}

impl AdapterHandle {
    #[must_use]
    pub fn new(spec: ModelSpec, backend: Backend) -> Self {
        let metadata = match &backend {
            Backend::LocalFinetunable(r) | Backend::Fresh(r) => r.metadata(),
            Backend::LocalGenerative(r) => r.metadata(),
            Backend::Remote { .. } => ModelMetadata::default(),
        };
        Self {
            spec,
            backend,
            metadata,
        }
    }

    #[must_use]
    pub const fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    #[must_use]
    pub const fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    #[must_use]
    pub const fn kind(&self) -> BackendKind {
        match self.backend {
            Backend::LocalFinetunable(_) => BackendKind::LocalFinetunable,
            Backend::LocalGenerative(_) => BackendKind::LocalGenerative,
            Backend::Remote { .. } => BackendKind::Remote,
            Backend::Fresh(_) => BackendKind::Fresh,
        }
    }

    /// Operations this backend supports
    #[must_use]
    pub fn capabilities(&self) -> CapabilitySet {
        match &self.backend {
            Backend::LocalFinetunable(r) | Backend::Fresh(r) => r
                .heads()
                .with(Capability::MeasureLatency)
                .with(Capability::Finetunable),
            Backend::LocalGenerative(_) => {
                CapabilitySet::of(&[Capability::Generate, Capability::MeasureLatency])
            }
            Backend::Remote { .. } => CapabilitySet::of(&[Capability::Generate]),
        }
    }

    #[must_use]
    pub fn is_finetunable(&self) -> bool {
        self.capabilities().contains(Capability::Finetunable)
    }

    /// Tokenizer used to measure and split inputs
    #[must_use]
    pub fn tokenizer(&self) -> &dyn Tokenizer {
        match &self.backend {
            Backend::LocalFinetunable(r) | Backend::Fresh(r) => r.tokenizer(),
            Backend::LocalGenerative(r) => r.tokenizer(),
            Backend::Remote { .. } => &WhitespaceTokenizer,
        }
    }

    /// Input length limit: the configured maximum, capped by the model's own
    #[must_use]
    pub fn max_length(&self, inference: &InferenceConfig) -> usize {
        self.metadata
            .max_sequence_length
            .map_or(inference.max_sequence_length, |m| {
                m.min(inference.max_sequence_length)
            })
    }

    /// Prepare the starting state of a trial
    ///
    /// # Errors
    ///
    /// Returns a `BackendError` if the weights cannot be restored.
    pub fn reset(&mut self, seed: u64) -> Result<(), BackendError> {
        match &mut self.backend {
            Backend::LocalFinetunable(r) | Backend::Fresh(r) => r.reset(seed),
            Backend::LocalGenerative(_) | Backend::Remote { .. } => Ok(()),
        }
    }

    /// Truncate or reject an input that exceeds `max_length` units.
    ///
    /// Text inputs are cut at the end (second segment first when it is the
    /// longer one); prompts are cut at the start so the target example stays.
    ///
    /// # Errors
    ///
    /// Returns `DataIntegrityError` for oversized inputs under the reject policy.
    pub fn fit_input(
        &self,
        index: usize,
        input: ModelInput,
        max_length: usize,
        policy: OversizePolicy,
    ) -> Result<ModelInput, DataIntegrityError> {
        if max_length == 0 {
            return Err(DataIntegrityError::new(index, "maximum input length is zero"));
        }
        let tokenizer = self.tokenizer();
        let reject = |units: usize| {
            DataIntegrityError::new(
                index,
                format!("{units} units exceed the limit of {max_length}"),
            )
        };

        match input {
            ModelInput::Text { text, pair } => {
                let text_units = tokenizer.count(&text);
                let pair_units = pair.as_deref().map_or(0, |p| tokenizer.count(p));
                let total = text_units + pair_units;
                if total <= max_length {
                    return Ok(ModelInput::Text { text, pair });
                }
                if policy == OversizePolicy::Reject {
                    return Err(reject(total));
                }
                let mut excess = total - max_length;
                let pair = pair.map(|p| {
                    if pair_units > text_units {
                        let cut = excess.min(pair_units - text_units);
                        excess -= cut;
                        keep_head(tokenizer, &p, pair_units - cut)
                    } else {
                        p
                    }
                });
                let text = keep_head(tokenizer, &text, text_units.saturating_sub(excess));
                Ok(ModelInput::Text { text, pair })
            }
            ModelInput::Prompt(prompt) => {
                let tokens = tokenizer.tokenize(&prompt);
                if tokens.len() <= max_length {
                    return Ok(ModelInput::Prompt(prompt));
                }
                if policy == OversizePolicy::Reject {
                    return Err(reject(tokens.len()));
                }
                let start = tokens[tokens.len() - max_length].start;
                Ok(ModelInput::Prompt(prompt[start..].to_string()))
            }
            other => Ok(other),
        }
    }

    /// Run a batch through the backend in chunks of the configured batch size
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` for capabilities the backend lacks, otherwise the
    /// backend's failure for the first chunk that fails.
    pub fn infer(
        &mut self,
        inputs: &[ModelInput],
        capability: Capability,
        seed: u64,
        inference: &InferenceConfig,
        generation: &GenerationConfig,
    ) -> Result<Vec<RawOutput>, BackendError> {
        if !self.capabilities().contains(capability) {
            return Err(BackendError::Unsupported(capability));
        }

        let mut outputs = Vec::with_capacity(inputs.len());
        for chunk in inputs.chunks(inference.batch_size.max(1)) {
            let batch = match &mut self.backend {
                Backend::LocalFinetunable(r) | Backend::Fresh(r) => r.forward(chunk, capability)?,
                Backend::LocalGenerative(r) => {
                    let prompts = prompts_of(chunk)?;
                    r.generate(&prompts, generation, seed)?
                        .into_iter()
                        .map(RawOutput::Text)
                        .collect()
                }
                Backend::Remote { client, timeout } => {
                    let mut texts = Vec::with_capacity(chunk.len());
                    for prompt in prompts_of(chunk)? {
                        let request = CompletionRequest {
                            prompt: &prompt,
                            max_new_tokens: generation.max_new_tokens,
                            decoding: generation.decoding,
                            stop_sequences: &generation.stop_sequences,
                            seed,
                        };
                        texts.push(RawOutput::Text(client.complete(&request, *timeout)?));
                    }
                    texts
                }
            };

            if batch.len() != chunk.len() {
                return Err(BackendError::Runtime(format!(
                    "backend returned {} outputs for {} inputs",
                    batch.len(),
                    chunk.len()
                )));
            }
            outputs.extend(batch);
        }

        Ok(outputs)
    }

    /// Attach a task head and expose the model to the trainer
    ///
    /// # Errors
    ///
    /// Returns `Unsupported(Finetunable)` for frozen or remote backends.
    pub fn attach_trainable_head(
        &mut self,
        family: TaskFamily,
        schema: &LabelSchema,
    ) -> Result<TrainableHandle<'_>, BackendError> {
        match &mut self.backend {
            Backend::LocalFinetunable(r) | Backend::Fresh(r) => {
                r.attach_head(family, schema)?;
                Ok(TrainableHandle {
                    runtime: r.as_mut(),
                })
            }
            Backend::LocalGenerative(_) | Backend::Remote { .. } => {
                Err(BackendError::Unsupported(Capability::Finetunable))
            }
        }
    }

    /// How the orchestrator should treat a failure from this backend
    #[must_use]
    pub fn classify_failure(&self, err: &BackendError) -> FailureClass {
        match (err, &self.backend) {
            (BackendError::Remote { kind, .. }, _) if kind.is_retryable() => FailureClass::Retryable,
            (BackendError::Remote { .. } | BackendError::Unsupported(_), _) => FailureClass::Terminal,
            (BackendError::OutOfMemory, Backend::Remote { .. }) => FailureClass::TrialFailure,
            (BackendError::OutOfMemory, _) => FailureClass::Retryable,
            (BackendError::InvalidInput(_) | BackendError::Runtime(_), _) => {
                FailureClass::TrialFailure
            }
        }
    }
}

fn prompts_of(chunk: &[ModelInput]) -> Result<Vec<String>, BackendError> {
    chunk
        .iter()
        .map(|input| match input {
            ModelInput::Prompt(p) => Ok(p.clone()),
            ModelInput::Text { text, pair: None } => Ok(text.clone()),
            ModelInput::Text {
                text,
                pair: Some(pair),
            } => Ok(format!("{text}\n{pair}")),
            _ => Err(BackendError::InvalidInput(
                "generative backends take prompts".to_string(),
            )),
        })
        .collect()
}

/// First `units` tokens of `text`
fn keep_head(tokenizer: &dyn Tokenizer, text: &str, units: usize) -> String {
    if units == 0 {
        return String::new();
    }
    let tokens = tokenizer.tokenize(text);
    match tokens.get(units - 1) {
        Some(last) if units < tokens.len() => text[..last.end].to_string(),
        _ => text.to_string(),
    }
}

/// Fine-tunable view of an adapter with a task head attached
pub struct TrainableHandle<'a> {
    runtime: &'a mut dyn EncoderRuntime,
}

impl Trainable for TrainableHandle<'_> {
    fn train_step(
        &mut self,
        batch: &[TrainingExample],
        learning_rate: f64,
    ) -> Result<f64, BackendError> {
        self.runtime.train_step(batch, learning_rate)
    }

    fn eval_loss(&mut self, batch: &[TrainingExample]) -> Result<f64, BackendError> {
        self.runtime.eval_loss(batch)
    }

    fn checkpoint(&self) -> Result<Checkpoint, BackendError> {
        self.runtime.checkpoint()
    }

    fn restore(&mut self, checkpoint: &Checkpoint) -> Result<(), BackendError> {
        self.runtime.restore(checkpoint)
    }
}
