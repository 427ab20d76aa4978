//! Benchmark orchestrator.
//!
//! Drives every (model, dataset) pair through
//! `Pending -> ResolvingModel -> RunningTrials -> Aggregating -> Done`,
//! with `Failed` reachable from any state before `Done`. Retries of
//! retryable trial failures happen here and nowhere else. Each finished pair
//! appends one record to the [`RunLedger`]; resumed runs return the stored
//! record without touching the model.

use crate::adapter::{resolve, AdapterHandle, ModelHub};
use crate::capability::Capability;
use crate::config::{BenchmarkConfig, ConfigError, RetryConfig};
use crate::dataset::{DatasetError, DatasetProvider, DatasetSpec, DatasetSplits, TaskFamily};
use crate::error::{
    BenchError, CapabilityMismatchError, FailureClass, FailureKind, ResolutionError,
};
use crate::fewshot::{Exemplar, ExemplarSelector, StratifiedSelector};
use crate::ledger::{
    BenchmarkRecord, PairKey, PairStatus, RunLedger, TrialOutcome, TrialSummary,
};
use crate::metrics::{aggregate, TrialScores};
use crate::model::{BackendKind, ModelMetadata, ModelSpec};
use crate::pipeline::{pipeline_for, requirement_for};
use crate::trainer::{TrainError, Trainer};
use crate::trial::{run_trial, TrialContext};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors that abort a whole run
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Lifecycle of one (model, dataset) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    Pending,
    ResolvingModel,
    RunningTrials,
    Aggregating,
    Done,
    Failed,
}

/// Exponential backoff for retryable trial failures: `base * 2^attempt`,
/// capped at the maximum delay
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    sleeper: Arc<dyn Fn(Duration) + Send + Sync>,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            sleeper: Arc::new(std::thread::sleep),
        }
    }

    /// Replace the blocking sleep, e.g. to record delays in tests
    #[must_use]
    pub fn with_sleeper(mut self, sleeper: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    #[must_use]
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before retry number `attempt` (zero-based)
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    fn wait(&self, attempt: u32) {
        (self.sleeper)(self.delay(attempt));
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .finish_non_exhaustive()
    }
}

/// User-initiated abort, honoured between trials
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of driving one pair
enum PairRun {
    Finished(BenchmarkRecord),
    Cancelled,
}

/// Identity and backend facts shared by the records of one pair
struct PairFacts<'a> {
    key: PairKey,
    backend: Option<BackendKind>,
    metadata: ModelMetadata,
    seeds: &'a [u64],
}

impl PairFacts<'_> {
    fn record(&self, status: PairStatus, trials: Vec<TrialSummary>) -> BenchmarkRecord {
        BenchmarkRecord {
            key: self.key.clone(),
            backend: self.backend,
            status,
            trials_requested: self.seeds.len(),
            seeds: self.seeds.to_vec(),
            trials,
            metadata: self.metadata.clone(),
            recorded_at: Utc::now(),
        }
    }

    fn failed(&self, kind: FailureKind, message: String, trials: Vec<TrialSummary>) -> BenchmarkRecord {
        error!(pair = %self.key, ?kind, state = ?PairState::Failed, "{message}");
        self.record(PairStatus::Failed { kind, message }, trials)
    }
}

/// Orchestrator over a model hub and a dataset provider
pub struct BenchmarkRunner {
    config: BenchmarkConfig,
    hub: Arc<dyn ModelHub>,
    provider: Arc<dyn DatasetProvider>,
    selector: Box<dyn ExemplarSelector>,
    trainer: Trainer,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl BenchmarkRunner {
    #[must_use]
    pub fn new(
        config: BenchmarkConfig,
        hub: Arc<dyn ModelHub>,
        provider: Arc<dyn DatasetProvider>,
    ) -> Self {
        Self {
            trainer: Trainer::new(config.trainer.clone()),
            retry: RetryPolicy::from_config(&config.retry),
            config,
            hub,
            provider,
            selector: Box::new(StratifiedSelector),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_selector(mut self, selector: Box<dyn ExemplarSelector>) -> Self {
        self.selector = selector;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &BenchmarkConfig {
        &self.config
    }

    /// Run every (model, dataset) pair with `trials` trials each.
    ///
    /// Models are processed one after another and resolved at most once,
    /// on their first pair that is not already completed. Returns the record
    /// of every pair that reached `Done` or `Failed` in this invocation,
    /// including records reused from the ledger.
    ///
    /// # Errors
    ///
    /// Returns `RunnerError::Config` for an empty model or dataset set, zero
    /// trials, an invalid configuration or a dataset listing metrics its
    /// family does not report. Nothing is run in those cases.
    pub fn run(
        &self,
        models: &[ModelSpec],
        datasets: &[DatasetSpec],
        trials: usize,
        resume: bool,
        ledger: &RunLedger,
    ) -> Result<Vec<BenchmarkRecord>, RunnerError> {
        if models.is_empty() {
            return Err(ConfigError::EmptyModelSet.into());
        }
        if datasets.is_empty() {
            return Err(ConfigError::EmptyDatasetSet.into());
        }
        if trials == 0 {
            return Err(ConfigError::ZeroTrials.into());
        }
        self.config.validate()?;
        for dataset in datasets {
            dataset.validate()?;
        }

        let models = unique_by(models, ModelSpec::identity);
        let datasets = unique_by(datasets, DatasetSpec::identity);
        let fingerprint = self.config.fingerprint(trials);
        let seeds = self.config.trial_seeds(trials);
        let skip_completed = resume && !self.config.force;

        info!(
            models = models.len(),
            datasets = datasets.len(),
            trials,
            "Starting benchmark run"
        );

        let mut records = Vec::new();
        'models: for model in models {
            let mut adapter: Option<Result<AdapterHandle, ResolutionError>> = None;

            for dataset in &datasets {
                if self.cancel.is_cancelled() {
                    info!("Run cancelled, remaining pairs stay pending");
                    break 'models;
                }

                let key = PairKey {
                    model: model.identity(),
                    dataset: dataset.identity(),
                    fingerprint: fingerprint.clone(),
                };
                debug!(pair = %key, state = ?PairState::Pending);

                if skip_completed {
                    if let Some(record) = ledger.completed(&key) {
                        info!(pair = %key, state = ?PairState::Done, "Already benchmarked, skipping");
                        records.push(record);
                        continue;
                    }
                }

                debug!(pair = %key, state = ?PairState::ResolvingModel);
                let resolved = adapter.get_or_insert_with(|| {
                    let resolved = resolve(self.hub.as_ref(), model, &self.config.generation);
                    if let Ok(handle) = &resolved {
                        let meta = handle.metadata();
                        info!(
                            model = %model,
                            backend = %handle.kind(),
                            parameters = ?meta.num_parameters,
                            vocabulary = ?meta.vocabulary_size,
                            max_length = ?meta.max_sequence_length,
                            "Model resolved"
                        );
                    }
                    resolved
                });

                let record = match resolved {
                    Ok(handle) => {
                        let facts = PairFacts {
                            key,
                            backend: Some(handle.kind()),
                            metadata: handle.metadata().clone(),
                            seeds: &seeds,
                        };
                        match self.run_pair(handle, dataset, &facts) {
                            PairRun::Finished(record) => record,
                            PairRun::Cancelled => {
                                info!(pair = %facts.key, "Run cancelled mid-pair, no record written");
                                break 'models;
                            }
                        }
                    }
                    Err(e) => {
                        let facts = PairFacts {
                            key,
                            backend: None,
                            metadata: ModelMetadata::default(),
                            seeds: &seeds,
                        };
                        facts.failed(FailureKind::Resolution, e.to_string(), Vec::new())
                    }
                };

                if let Err(e) = ledger.append(record.clone()) {
                    error!(pair = %record.key, "Failed to persist record: {e}");
                }
                records.push(record);
            }
        }

        Ok(records)
    }

    fn run_pair(
        &self,
        adapter: &mut AdapterHandle,
        dataset: &DatasetSpec,
        facts: &PairFacts<'_>,
    ) -> PairRun {
        let available = adapter.capabilities();
        let requirement = requirement_for(dataset.family);
        let Some(mode) = requirement.select(available) else {
            let mismatch = CapabilityMismatchError {
                dataset: dataset.identity(),
                backend: adapter.kind(),
                required: requirement,
                available,
            };
            return PairRun::Finished(facts.failed(
                FailureKind::CapabilityMismatch,
                mismatch.to_string(),
                Vec::new(),
            ));
        };

        let mut splits = match self.load_splits(dataset) {
            Ok(splits) => splits,
            Err(e) => {
                let kind = match e {
                    DatasetError::NotFound(_) => FailureKind::Resolution,
                    DatasetError::Io { .. } => FailureKind::DataIntegrity,
                };
                return PairRun::Finished(facts.failed(kind, e.to_string(), Vec::new()));
            }
        };
        let exemplars = self.exemplars(dataset, &splits, mode);
        let full_test = DatasetSplits {
            test: if self.config.resample_test {
                splits.test.clone()
            } else {
                Vec::new()
            },
            ..DatasetSplits::default()
        };

        info!(
            pair = %facts.key,
            state = ?PairState::RunningTrials,
            mode = %mode,
            test_examples = splits.test.len(),
            "Running trials"
        );

        let mut successes: Vec<TrialScores> = Vec::new();
        let mut summaries = Vec::with_capacity(facts.seeds.len());

        for (trial, &seed) in facts.seeds.iter().enumerate() {
            if trial > 0 && self.cancel.is_cancelled() {
                return PairRun::Cancelled;
            }
            if self.config.resample_test {
                splits.test = full_test.resampled_test(seed);
            }
            let ctx = TrialContext {
                dataset,
                splits: &splits,
                exemplars: &exemplars,
                mode,
                config: &self.config,
                trainer: &self.trainer,
            };

            let mut retries = 0;
            loop {
                let err = match run_trial(adapter, &ctx, seed) {
                    Ok(result) => {
                        debug!(pair = %facts.key, trial, seed, "Trial succeeded");
                        summaries.push(TrialSummary {
                            seed,
                            outcome: TrialOutcome::Succeeded,
                            retries,
                            skipped_examples: result.skipped_examples,
                            prediction_errors: result.prediction_errors,
                            converged: result.fit.map(|f| f.converged),
                        });
                        successes.push(result.scores);
                        break;
                    }
                    Err(err) => err,
                };

                let class = classify(adapter, &err);
                match class {
                    FailureClass::Retryable if retries < self.retry.max_retries() => {
                        warn!(
                            pair = %facts.key,
                            trial,
                            attempt = retries + 1,
                            delay_ms = self.retry.delay(retries).as_millis(),
                            "Retryable failure: {err}"
                        );
                        self.retry.wait(retries);
                        retries += 1;
                        if self.cancel.is_cancelled() {
                            return PairRun::Cancelled;
                        }
                    }
                    FailureClass::Terminal => {
                        summaries.push(failed_trial(seed, FailureClass::Terminal, &err, retries));
                        return PairRun::Finished(facts.failed(
                            err.kind(),
                            err.to_string(),
                            summaries,
                        ));
                    }
                    FailureClass::Retryable | FailureClass::TrialFailure => {
                        warn!(pair = %facts.key, trial, retries, "Trial failed: {err}");
                        summaries.push(failed_trial(seed, FailureClass::TrialFailure, &err, retries));
                        break;
                    }
                }
            }
        }

        debug!(pair = %facts.key, state = ?PairState::Aggregating);
        if successes.is_empty() {
            let message = format!("all {} trials failed", facts.seeds.len());
            return PairRun::Finished(facts.failed(
                FailureKind::AllTrialsFailed,
                message,
                summaries,
            ));
        }

        let metrics = aggregate(&successes, &self.config.stats)
            .into_iter()
            .map(|(metric, estimate)| (metric.name().to_string(), estimate))
            .collect();

        info!(
            pair = %facts.key,
            state = ?PairState::Done,
            succeeded = successes.len(),
            "Pair finished"
        );
        PairRun::Finished(facts.record(PairStatus::Done { metrics }, summaries))
    }

    fn load_splits(&self, dataset: &DatasetSpec) -> Result<DatasetSplits, DatasetError> {
        if dataset.family == TaskFamily::Speed {
            return Ok(DatasetSplits::default());
        }
        Ok(self
            .provider
            .load(dataset)?
            .limited(&dataset.splits, self.config.max_test_examples))
    }

    fn exemplars(
        &self,
        dataset: &DatasetSpec,
        splits: &DatasetSplits,
        mode: Capability,
    ) -> Vec<Exemplar> {
        if mode != Capability::Generate || dataset.num_few_shot == 0 {
            return Vec::new();
        }
        let Some(pipeline) = pipeline_for(dataset.family) else {
            return Vec::new();
        };
        let candidates = splits
            .train
            .iter()
            .filter_map(|raw| pipeline.exemplar(raw, dataset))
            .collect();
        let exemplars = self.selector.select(dataset, candidates);
        if exemplars.len() < dataset.num_few_shot {
            warn!(
                dataset = %dataset.identity(),
                wanted = dataset.num_few_shot,
                found = exemplars.len(),
                "Fewer few-shot exemplars than requested"
            );
        }
        exemplars
    }
}

/// Map a trial error onto the retry policy
fn classify(adapter: &AdapterHandle, err: &BenchError) -> FailureClass {
    match err {
        BenchError::Backend(e) | BenchError::Train(TrainError::Backend(e)) => {
            adapter.classify_failure(e)
        }
        BenchError::Train(TrainError::OutOfMemory { .. }) => FailureClass::Retryable,
        BenchError::Resolution(_) | BenchError::CapabilityMismatch(_) | BenchError::DataIntegrity(_) => {
            FailureClass::Terminal
        }
    }
}

fn failed_trial(seed: u64, class: FailureClass, err: &BenchError, retries: u32) -> TrialSummary {
    TrialSummary {
        seed,
        outcome: TrialOutcome::Failed {
            class,
            message: err.to_string(),
        },
        retries,
        skipped_examples: 0,
        prediction_errors: 0,
        converged: None,
    }
}

fn unique_by<T, K: Eq + std::hash::Hash>(items: &[T], key: impl Fn(&T) -> K) -> Vec<&T> {
    let mut seen = HashSet::new();
    items.iter().filter(|item| seen.insert(key(item))).collect()
}
