//! # nlbench
//!
//! Benchmark orchestration and statistical evaluation engine for language
//! models.
//!
//! ## Architecture
//!
//! ```text
//! Model specs + dataset specs
//!        ↓
//! Orchestrator (pair state machine, retries, resume via run ledger)
//!        ↓
//! Model adapter (local fine-tunable | local generative | remote | fresh)
//!        ↓
//! Task pipeline (classification | tagging | QA | text-to-text | speed)
//!        ↓                      ↘ Trainer (early stopping, OOM halving)
//! Per-example scores, one vector per trial
//!        ↓
//! Pooled bootstrap aggregation (point estimate + 95% CI)
//!        ↓
//! Benchmark record → run ledger → leaderboard report
//! ```
//!
//! Model runtimes, tokenizers and datasets come from collaborators behind
//! the [`adapter::ModelHub`], [`tokenize::Tokenizer`] and
//! [`dataset::DatasetProvider`] traits.

pub mod adapter;
pub mod capability;
pub mod classification;
pub mod config;
pub mod dataset;
pub mod error;
pub mod fewshot;
pub mod ledger;
pub mod metrics;
pub mod model;
pub mod pipeline;
pub mod qa;
pub mod remote;
pub mod report;
pub mod runner;
pub mod speed;
pub mod tagging;
pub mod task_metrics;
pub mod text2text;
pub mod tokenize;
pub mod trainer;
pub mod trial;

pub use adapter::{
    resolve, AdapterHandle, Backend, Checkpoint, EncoderRuntime, GeneratorRuntime, LoadedRuntime,
    ModelHub, TrainableHandle,
};
pub use capability::{Capability, CapabilityRequirement, CapabilitySet};
pub use config::{
    AlignmentRule, BenchmarkConfig, ConfigError, Decoding, GenerationConfig, InferenceConfig,
    OversizePolicy, RetryConfig, SpeedConfig, TrainerConfig,
};
pub use dataset::{
    DatasetError, DatasetLoader, DatasetProvider, DatasetSpec, DatasetSplits,
    JsonlDatasetProvider, LabelSchema, MemoryDatasetProvider, RawExample, TaskFamily,
};
pub use error::{
    BackendError, BenchError, CapabilityMismatchError, DataIntegrityError, FailureClass,
    FailureKind, ResolutionError,
};
pub use fewshot::{Exemplar, ExemplarSelector, StratifiedSelector};
pub use ledger::{
    BenchmarkRecord, JsonlLedgerStore, LedgerError, LedgerStore, MemoryLedgerStore, PairKey,
    PairStatus, RunLedger, TrialOutcome, TrialSummary,
};
pub use metrics::{
    aggregate, bonferroni_correction, bootstrap_ci, welch_t_test, MetricEstimate,
    SignificanceResult, StatConfig, TrialScores,
};
pub use model::{BackendKind, ModelMetadata, ModelSpec};
pub use pipeline::{
    pipeline_for, requirement_for, Gold, ModelInput, Prediction, PreparedExample, RawOutput,
    Target, TaskPipeline,
};
pub use remote::{CliModelHub, CliRemoteClient, RemoteClient, RemoteError, RemoteFailureKind};
pub use report::{Leaderboard, ReportBuilder};
pub use runner::{BenchmarkRunner, CancellationToken, PairState, RetryPolicy, RunnerError};
pub use task_metrics::{ExampleScore, MetricType};
pub use tokenize::{ChunkTokenizer, Token, Tokenizer, WhitespaceTokenizer};
pub use trainer::{FitOutcome, Trainable, TrainError, Trainer, TrainingExample};
