//! End-to-end orchestrator tests over fake runtimes.
//!
//! These tests drive `BenchmarkRunner::run` through:
//! - resume from the run ledger without touching the model
//! - centralized retry with backoff for retryable remote failures
//! - capability mismatch and resolution failures
//! - out-of-memory recovery during fine-tuning
//! - cancellation between retries
//! - per-trial resampling of the test split
//! - persistence failures that must not stop the run

#![allow(clippy::unwrap_used)]
#![allow(clippy::float_cmp)]

mod common;

use common::{
    copies, encoder_hub, founding_questions, last_section, people, remote_hub, sentiment, splits,
    EncoderCounters, FakeEncoder, FakeGenerator, FakeHub, ScriptedRemote,
};
use nlbench::{
    BackendError, BackendKind, BenchmarkConfig, BenchmarkRecord, BenchmarkRunner,
    CancellationToken, DatasetSpec, FailureClass, FailureKind, LedgerError, LedgerStore,
    LoadedRuntime, MemoryDatasetProvider, ModelSpec, PairStatus, RemoteError, RemoteFailureKind,
    RetryConfig, RetryPolicy, RunLedger, SpeedConfig, TaskFamily, TrainerConfig, TrialOutcome,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fixed test splits, so per-example expectations hold for every trial
fn config() -> BenchmarkConfig {
    BenchmarkConfig {
        resample_test: false,
        trainer: TrainerConfig {
            max_epochs: 2,
            ..TrainerConfig::default()
        },
        speed: SpeedConfig {
            warmup_iterations: 1,
            measured_iterations: 3,
            batch_size: 2,
            synthetic_words: 8,
        },
        ..BenchmarkConfig::default()
    }
}

fn sentiment_dataset() -> DatasetSpec {
    DatasetSpec::new("sentiment", TaskFamily::SequenceClassification)
        .with_labels(&["positive", "negative"])
}

fn sentiment_provider() -> MemoryDatasetProvider {
    MemoryDatasetProvider::new().with_dataset(
        "sentiment",
        splits(sentiment(4), sentiment(2), sentiment(6)),
    )
}

fn bert() -> ModelSpec {
    ModelSpec::new("bert", BackendKind::LocalFinetunable)
}

fn api() -> ModelSpec {
    ModelSpec::new("api", BackendKind::Remote)
}

fn rate_limited() -> RemoteError {
    RemoteError::new(RemoteFailureKind::RateLimited, "429 Too Many Requests")
}

/// Retry policy that records requested delays instead of sleeping
fn recording_retry(config: &RetryConfig) -> (RetryPolicy, Arc<Mutex<Vec<Duration>>>) {
    let sleeps = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&sleeps);
    let policy =
        RetryPolicy::from_config(config).with_sleeper(move |d| sink.lock().unwrap().push(d));
    (policy, sleeps)
}

fn failure_kind(status: &PairStatus) -> Option<FailureKind> {
    match status {
        PairStatus::Failed { kind, .. } => Some(*kind),
        PairStatus::Done { .. } => None,
    }
}

// ============================================================================
// Resume
// ============================================================================

#[test]
fn test_resume_returns_stored_record_without_loading_model() {
    let counters = Arc::new(EncoderCounters::default());
    let hub = Arc::new(encoder_hub(&counters));
    let runner = BenchmarkRunner::new(config(), hub.clone(), Arc::new(sentiment_provider()));
    let ledger = RunLedger::in_memory();
    let models = [bert()];
    let datasets = [sentiment_dataset()];

    let first = runner.run(&models, &datasets, 3, true, &ledger).unwrap();
    assert_eq!(first.len(), 1);
    let record = &first[0];
    assert!(record.is_done());
    assert_eq!(record.seeds, vec![4242, 4243, 4244]);
    assert_eq!(record.backend, Some(BackendKind::LocalFinetunable));
    assert_eq!(record.metric("accuracy").unwrap().point, 1.0);
    assert_eq!(record.metric("macro_f1").unwrap().point, 1.0);
    assert!(record.trials.iter().all(|t| t.converged == Some(true)));
    assert_eq!(hub.loads(), 1);

    let forward_calls = counters.forward();
    let train_steps = counters.train_steps();
    assert!(forward_calls > 0);
    assert!(train_steps > 0);

    let second = runner.run(&models, &datasets, 3, true, &ledger).unwrap();
    assert_eq!(second, first);
    assert_eq!(hub.loads(), 1);
    assert_eq!(counters.forward(), forward_calls);
    assert_eq!(counters.train_steps(), train_steps);
    assert_eq!(ledger.records().len(), 1);
}

#[test]
fn test_resume_is_keyed_by_fingerprint() {
    let counters = Arc::new(EncoderCounters::default());
    let hub = Arc::new(encoder_hub(&counters));
    let runner = BenchmarkRunner::new(config(), hub.clone(), Arc::new(sentiment_provider()));
    let ledger = RunLedger::in_memory();
    let models = [bert()];
    let datasets = [sentiment_dataset()];

    runner.run(&models, &datasets, 2, true, &ledger).unwrap();
    // a different trial count is a different configuration
    runner.run(&models, &datasets, 3, true, &ledger).unwrap();
    assert_eq!(hub.loads(), 2);
    assert_eq!(ledger.records().len(), 2);

    let keys: Vec<_> = ledger.records().iter().map(|r| r.key.clone()).collect();
    assert_ne!(keys[0].fingerprint, keys[1].fingerprint);
}

#[test]
fn test_no_resume_and_force_rerun_completed_pairs() {
    let counters = Arc::new(EncoderCounters::default());
    let hub = Arc::new(encoder_hub(&counters));
    let ledger = RunLedger::in_memory();
    let models = [bert()];
    let datasets = [sentiment_dataset()];

    let runner = BenchmarkRunner::new(config(), hub.clone(), Arc::new(sentiment_provider()));
    runner.run(&models, &datasets, 1, true, &ledger).unwrap();
    runner.run(&models, &datasets, 1, false, &ledger).unwrap();
    assert_eq!(hub.loads(), 2);

    let forced = BenchmarkRunner::new(
        BenchmarkConfig {
            force: true,
            ..config()
        },
        hub.clone(),
        Arc::new(sentiment_provider()),
    );
    forced.run(&models, &datasets, 1, true, &ledger).unwrap();
    assert_eq!(hub.loads(), 3);
    assert_eq!(ledger.records().len(), 3);
}

#[test]
fn test_failed_pair_is_retried_on_resume() {
    let counters = Arc::new(EncoderCounters::default());
    let hub = Arc::new(encoder_hub(&counters));
    let ledger = RunLedger::in_memory();
    let models = [bert()];
    let datasets = [sentiment_dataset()];

    let missing_data = BenchmarkRunner::new(
        config(),
        hub.clone(),
        Arc::new(MemoryDatasetProvider::new()),
    );
    let records = missing_data.run(&models, &datasets, 1, true, &ledger).unwrap();
    assert_eq!(failure_kind(&records[0].status), Some(FailureKind::Resolution));

    let runner = BenchmarkRunner::new(config(), hub.clone(), Arc::new(sentiment_provider()));
    let records = runner.run(&models, &datasets, 1, true, &ledger).unwrap();
    assert!(records[0].is_done());
    assert_eq!(ledger.records().len(), 2);
    assert!(ledger.latest()[0].is_done());
}

// ============================================================================
// Retry policy
// ============================================================================

#[test]
fn test_rate_limited_trial_is_retried_with_backoff() {
    let remote = Arc::new(ScriptedRemote::new(
        vec![Err(rate_limited()), Err(rate_limited())],
        Ok("positive".to_string()),
    ));
    let config = config();
    let (retry, sleeps) = recording_retry(&config.retry);
    let provider = MemoryDatasetProvider::new().with_dataset(
        "sentiment",
        splits(sentiment(4), Vec::new(), sentiment(2)),
    );
    let runner = BenchmarkRunner::new(config, Arc::new(remote_hub(&remote)), Arc::new(provider))
        .with_retry_policy(retry);
    let ledger = RunLedger::in_memory();

    let records = runner
        .run(&[api()], &[sentiment_dataset()], 1, true, &ledger)
        .unwrap();

    let record = &records[0];
    assert!(record.is_done(), "{:?}", record.status);
    assert_eq!(record.trials.len(), 1);
    assert_eq!(record.trials[0].retries, 2);
    assert!(record.trials[0].succeeded());
    assert_eq!(
        *sleeps.lock().unwrap(),
        vec![Duration::from_secs(1), Duration::from_secs(2)]
    );
    // two rejected calls, then one call per test example
    assert_eq!(remote.calls(), 4);
    assert_eq!(record.metric("accuracy").unwrap().point, 0.5);
}

#[test]
fn test_terminal_remote_failure_fails_pair_without_retry() {
    let remote = Arc::new(ScriptedRemote::new(
        Vec::new(),
        Err(RemoteError::new(
            RemoteFailureKind::ModelDeprecated,
            "model retired",
        )),
    ));
    let config = config();
    let (retry, sleeps) = recording_retry(&config.retry);
    let runner = BenchmarkRunner::new(
        config,
        Arc::new(remote_hub(&remote)),
        Arc::new(sentiment_provider()),
    )
    .with_retry_policy(retry);
    let ledger = RunLedger::in_memory();

    let records = runner
        .run(&[api()], &[sentiment_dataset()], 3, true, &ledger)
        .unwrap();

    assert_eq!(failure_kind(&records[0].status), Some(FailureKind::Backend));
    assert_eq!(records[0].trials.len(), 1);
    assert!(sleeps.lock().unwrap().is_empty());
    assert_eq!(remote.calls(), 1);
}

#[test]
fn test_cancellation_during_backoff_leaves_pair_unrecorded() {
    let remote = Arc::new(ScriptedRemote::new(Vec::new(), Err(rate_limited())));
    let config = config();
    let token = CancellationToken::new();
    let canceller = token.clone();
    let retry = RetryPolicy::from_config(&config.retry).with_sleeper(move |_| canceller.cancel());
    let provider = sentiment_provider().with_dataset(
        "reviews",
        splits(Vec::new(), Vec::new(), sentiment(2)),
    );
    let runner = BenchmarkRunner::new(config, Arc::new(remote_hub(&remote)), Arc::new(provider))
        .with_retry_policy(retry)
        .with_cancellation(token.clone());
    let ledger = RunLedger::in_memory();
    let reviews = DatasetSpec::new("reviews", TaskFamily::SequenceClassification)
        .with_labels(&["positive", "negative"]);

    let records = runner
        .run(&[api()], &[sentiment_dataset(), reviews], 2, true, &ledger)
        .unwrap();

    assert!(token.is_cancelled());
    assert!(records.is_empty());
    assert!(ledger.records().is_empty());
    assert_eq!(remote.calls(), 1);
}

// ============================================================================
// Failure classification
// ============================================================================

#[test]
fn test_capability_mismatch_fails_before_any_trial() {
    let remote = Arc::new(ScriptedRemote::new(Vec::new(), Ok("O".to_string())));
    let provider = MemoryDatasetProvider::new()
        .with_dataset("ner", splits(people(2), Vec::new(), people(2)));
    let runner = BenchmarkRunner::new(config(), Arc::new(remote_hub(&remote)), Arc::new(provider));
    let ledger = RunLedger::in_memory();
    let ner = DatasetSpec::new("ner", TaskFamily::SequenceTagging)
        .with_labels(&["O", "B-PER", "I-PER"]);

    let squad = DatasetSpec::new("squad", TaskFamily::QuestionAnswering);

    let records = runner.run(&[api()], &[ner, squad], 3, true, &ledger).unwrap();

    assert_eq!(records.len(), 2);
    for record in &records {
        assert_eq!(
            failure_kind(&record.status),
            Some(FailureKind::CapabilityMismatch)
        );
        assert_eq!(record.backend, Some(BackendKind::Remote));
        assert!(record.trials.is_empty());
    }
    assert_eq!(remote.calls(), 0);
    let PairStatus::Failed { message, .. } = &records[1].status else {
        unreachable!()
    };
    assert!(message.contains("extract_span"), "{message}");
}

#[test]
fn test_unresolvable_model_fails_all_its_pairs_with_one_lookup() {
    let counters = Arc::new(EncoderCounters::default());
    let hub = Arc::new(encoder_hub(&counters));
    let provider = sentiment_provider().with_dataset(
        "reviews",
        splits(sentiment(4), Vec::new(), sentiment(2)),
    );
    let runner = BenchmarkRunner::new(config(), hub.clone(), Arc::new(provider));
    let ledger = RunLedger::in_memory();
    let reviews = DatasetSpec::new("reviews", TaskFamily::SequenceClassification)
        .with_labels(&["positive", "negative"]);
    let ghost = ModelSpec::new("ghost", BackendKind::LocalFinetunable);

    let records = runner
        .run(&[ghost, bert()], &[sentiment_dataset(), reviews], 1, true, &ledger)
        .unwrap();

    assert_eq!(records.len(), 4);
    for record in &records[..2] {
        assert_eq!(failure_kind(&record.status), Some(FailureKind::Resolution));
        assert_eq!(record.backend, None);
        assert!(record.key.model.starts_with("ghost"));
    }
    assert!(records[2..].iter().all(|r| r.is_done()));
    // one failed lookup for ghost, one load for bert
    assert_eq!(hub.loads(), 2);
    assert_eq!(ledger.records().len(), 4);
}

#[test]
fn test_backend_declared_wrong_is_resolution_failure() {
    let counters = Arc::new(EncoderCounters::default());
    let hub = Arc::new(encoder_hub(&counters));
    let runner = BenchmarkRunner::new(config(), hub, Arc::new(sentiment_provider()));
    let ledger = RunLedger::in_memory();

    let records = runner
        .run(
            &[ModelSpec::new("bert", BackendKind::LocalGenerative)],
            &[sentiment_dataset()],
            1,
            true,
            &ledger,
        )
        .unwrap();
    assert_eq!(failure_kind(&records[0].status), Some(FailureKind::Resolution));
}

#[test]
fn test_every_trial_failing_marks_pair_failed() {
    let prompts = Arc::new(Mutex::new(Vec::new()));
    let hub = {
        let prompts = Arc::clone(&prompts);
        FakeHub::new().with_model("llm", move || {
            LoadedRuntime::Generator(Box::new(FakeGenerator::new(Arc::clone(&prompts), |_| {
                Err(BackendError::Runtime("decoder crashed".to_string()))
            })))
        })
    };
    let provider = MemoryDatasetProvider::new()
        .with_dataset("copy", splits(copies(3), Vec::new(), copies(3)));
    let runner = BenchmarkRunner::new(config(), Arc::new(hub), Arc::new(provider));
    let ledger = RunLedger::in_memory();

    let records = runner
        .run(
            &[ModelSpec::new("llm", BackendKind::LocalGenerative)],
            &[DatasetSpec::new("copy", TaskFamily::TextToText)],
            3,
            true,
            &ledger,
        )
        .unwrap();

    let record = &records[0];
    assert_eq!(
        failure_kind(&record.status),
        Some(FailureKind::AllTrialsFailed)
    );
    assert_eq!(record.trials.len(), 3);
    assert!(record.trials.iter().all(|t| !t.succeeded()));
    assert_eq!(record.total_retries(), 0);
    assert!(record.trials.iter().all(|t| matches!(
        t.outcome,
        TrialOutcome::Failed {
            class: FailureClass::TrialFailure,
            ..
        }
    )));
}

// ============================================================================
// Fine-tuning
// ============================================================================

fn oom_hub(counters: &Arc<EncoderCounters>, oom_steps: &Arc<AtomicUsize>) -> FakeHub {
    let counters = Arc::clone(counters);
    let oom_steps = Arc::clone(oom_steps);
    FakeHub::new().with_model("bert", move || {
        LoadedRuntime::Encoder(Box::new(
            FakeEncoder::new(Arc::clone(&counters)).with_oom_steps(Arc::clone(&oom_steps)),
        ))
    })
}

#[test]
fn test_training_recovers_from_out_of_memory_by_halving() {
    let counters = Arc::new(EncoderCounters::default());
    let oom_steps = Arc::new(AtomicUsize::new(1));
    let runner = BenchmarkRunner::new(
        config(),
        Arc::new(oom_hub(&counters, &oom_steps)),
        Arc::new(sentiment_provider()),
    );
    let ledger = RunLedger::in_memory();

    let records = runner
        .run(&[bert()], &[sentiment_dataset()], 2, true, &ledger)
        .unwrap();

    let record = &records[0];
    assert!(record.is_done(), "{:?}", record.status);
    assert_eq!(record.total_retries(), 0);
    assert!(record.trials.iter().all(|t| t.succeeded()));
    assert_eq!(oom_steps.load(Ordering::SeqCst), 0);
}

#[test]
fn test_persistent_out_of_memory_exhausts_retries() {
    let counters = Arc::new(EncoderCounters::default());
    let oom_steps = Arc::new(AtomicUsize::new(usize::MAX));
    let (retry, sleeps) = recording_retry(&RetryConfig {
        max_retries: 1,
        ..RetryConfig::default()
    });
    let runner = BenchmarkRunner::new(
        config(),
        Arc::new(oom_hub(&counters, &oom_steps)),
        Arc::new(sentiment_provider()),
    )
    .with_retry_policy(retry);
    let ledger = RunLedger::in_memory();

    let records = runner
        .run(&[bert()], &[sentiment_dataset()], 2, true, &ledger)
        .unwrap();

    let record = &records[0];
    assert_eq!(
        failure_kind(&record.status),
        Some(FailureKind::AllTrialsFailed)
    );
    assert_eq!(record.trials.len(), 2);
    assert!(record.trials.iter().all(|t| t.retries == 1));
    assert_eq!(sleeps.lock().unwrap().len(), 2);
    assert_eq!(counters.train_steps(), 0);
}

// ============================================================================
// Task families
// ============================================================================

#[test]
fn test_speed_pair_measures_throughput() {
    let counters = Arc::new(EncoderCounters::default());
    let runner = BenchmarkRunner::new(
        config(),
        Arc::new(encoder_hub(&counters)),
        Arc::new(MemoryDatasetProvider::new()),
    );
    let ledger = RunLedger::in_memory();

    let records = runner
        .run(
            &[bert()],
            &[DatasetSpec::new("speed", TaskFamily::Speed)],
            2,
            true,
            &ledger,
        )
        .unwrap();

    let record = &records[0];
    assert!(record.is_done(), "{:?}", record.status);
    let throughput = record.metric("throughput").unwrap();
    assert!(throughput.point > 0.0);
    assert!(throughput.lower <= throughput.point && throughput.point <= throughput.upper);
    assert_eq!(throughput.trial_values.len(), 2);
    assert_eq!(throughput.examples, 6);
    // one warmup and three measured batches per trial
    assert_eq!(counters.forward(), 8);
    assert_eq!(counters.train_steps(), 0);
}

#[test]
fn test_generative_text_to_text_uses_few_shot_prompts() {
    let prompts = Arc::new(Mutex::new(Vec::new()));
    let hub = {
        let prompts = Arc::clone(&prompts);
        FakeHub::new().with_model("llm", move || {
            LoadedRuntime::Generator(Box::new(FakeGenerator::new(Arc::clone(&prompts), |p| {
                Ok(last_section(p))
            })))
        })
    };
    let provider = MemoryDatasetProvider::new()
        .with_dataset("copy", splits(copies(5), Vec::new(), copies(3)));
    let runner = BenchmarkRunner::new(config(), Arc::new(hub), Arc::new(provider));
    let ledger = RunLedger::in_memory();

    let records = runner
        .run(
            &[ModelSpec::new("llm", BackendKind::LocalGenerative)],
            &[DatasetSpec::new("copy", TaskFamily::TextToText).with_few_shot(2)],
            2,
            true,
            &ledger,
        )
        .unwrap();

    let record = &records[0];
    assert!(record.is_done(), "{:?}", record.status);
    assert_eq!(record.metric("rouge_l").unwrap().point, 1.0);

    let prompts = prompts.lock().unwrap();
    assert_eq!(prompts.len(), 6);
    // two exemplars and the example, separated by blank lines
    assert!(prompts.iter().all(|p| p.matches("\n\n").count() == 2));
    // exemplars are fixed across trials
    assert_eq!(prompts[0], prompts[3]);
}

#[test]
fn test_tagging_and_qa_pairs_on_encoder() {
    let counters = Arc::new(EncoderCounters::default());
    let provider = MemoryDatasetProvider::new()
        .with_dataset("ner", splits(people(3), people(1), people(4)))
        .with_dataset(
            "squad",
            splits(founding_questions(3), Vec::new(), founding_questions(4)),
        );
    let hub = Arc::new(encoder_hub(&counters));
    let runner = BenchmarkRunner::new(config(), hub.clone(), Arc::new(provider));
    let ledger = RunLedger::in_memory();
    let datasets = [
        DatasetSpec::new("ner", TaskFamily::SequenceTagging).with_labels(&["O", "B-PER", "I-PER"]),
        DatasetSpec::new("squad", TaskFamily::QuestionAnswering),
    ];

    let records = runner.run(&[bert()], &datasets, 2, true, &ledger).unwrap();

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].metric("entity_f1").unwrap().point, 1.0);
    assert_eq!(records[1].metric("exact_match").unwrap().point, 1.0);
    assert_eq!(records[1].metric("token_f1").unwrap().point, 1.0);
    // resolved once for both datasets
    assert_eq!(hub.loads(), 1);
    assert_eq!(ledger.records().len(), 2);
}

#[test]
fn test_malformed_examples_are_skipped_and_counted() {
    let counters = Arc::new(EncoderCounters::default());
    let mut test = sentiment(4);
    test.push(json!({ "text": "", "label": "positive" }));
    test.push(json!({ "text": "unlabelled", "label": "neutral" }));
    test.push(json!({ "body": "wrong shape" }));
    let provider = MemoryDatasetProvider::new()
        .with_dataset("sentiment", splits(sentiment(4), sentiment(2), test));
    let runner = BenchmarkRunner::new(
        config(),
        Arc::new(encoder_hub(&counters)),
        Arc::new(provider),
    );
    let ledger = RunLedger::in_memory();

    let records = runner
        .run(&[bert()], &[sentiment_dataset()], 1, true, &ledger)
        .unwrap();

    let record = &records[0];
    assert!(record.is_done());
    assert_eq!(record.trials[0].skipped_examples, 3);
    let accuracy = record.metric("accuracy").unwrap();
    assert_eq!(accuracy.point, 1.0);
    assert_eq!(accuracy.examples, 4);
}

#[test]
fn test_all_test_examples_malformed_is_data_integrity_failure() {
    let counters = Arc::new(EncoderCounters::default());
    let provider = MemoryDatasetProvider::new().with_dataset(
        "sentiment",
        splits(sentiment(4), Vec::new(), vec![json!({ "body": "wrong shape" })]),
    );
    let runner = BenchmarkRunner::new(
        config(),
        Arc::new(encoder_hub(&counters)),
        Arc::new(provider),
    );
    let ledger = RunLedger::in_memory();

    let records = runner
        .run(&[bert()], &[sentiment_dataset()], 3, true, &ledger)
        .unwrap();

    assert_eq!(
        failure_kind(&records[0].status),
        Some(FailureKind::DataIntegrity)
    );
    assert_eq!(records[0].trials.len(), 1);
}

// ============================================================================
// Test split resampling
// ============================================================================

fn always_positive_hub() -> FakeHub {
    FakeHub::new().with_model("llm", || {
        LoadedRuntime::Generator(Box::new(FakeGenerator::new(
            Arc::new(Mutex::new(Vec::new())),
            |_| Ok("positive".to_string()),
        )))
    })
}

fn run_always_positive(resample_test: bool) -> Vec<f64> {
    let provider = MemoryDatasetProvider::new()
        .with_dataset("sentiment", splits(Vec::new(), Vec::new(), sentiment(12)));
    let runner = BenchmarkRunner::new(
        BenchmarkConfig {
            resample_test,
            ..config()
        },
        Arc::new(always_positive_hub()),
        Arc::new(provider),
    );
    let records = runner
        .run(
            &[ModelSpec::new("llm", BackendKind::LocalGenerative)],
            &[sentiment_dataset()],
            6,
            true,
            &RunLedger::in_memory(),
        )
        .unwrap();
    assert!(records[0].is_done(), "{:?}", records[0].status);
    records[0].metric("accuracy").unwrap().trial_values.clone()
}

#[test]
fn test_greedy_trials_differ_when_test_split_is_resampled() {
    let fixed = run_always_positive(false);
    assert!(fixed.iter().all(|&v| v == 0.5));

    let resampled = run_always_positive(true);
    assert_eq!(resampled.len(), 6);
    assert!(resampled.iter().any(|&v| v != resampled[0]), "{resampled:?}");
    assert_eq!(resampled, run_always_positive(true));
}

// ============================================================================
// Persistence failures
// ============================================================================

struct ReadOnlyStore;

impl LedgerStore for ReadOnlyStore {
    fn load(&self) -> Result<Vec<BenchmarkRecord>, LedgerError> {
        Ok(Vec::new())
    }

    fn append(&mut self, _record: &BenchmarkRecord) -> Result<(), LedgerError> {
        Err(LedgerError::Io {
            path: "ledger.jsonl".into(),
            source: std::io::Error::other("read-only file system"),
        })
    }
}

#[test]
fn test_ledger_write_failure_does_not_stop_the_run() {
    let counters = Arc::new(EncoderCounters::default());
    let hub = Arc::new(encoder_hub(&counters));
    let provider = sentiment_provider().with_dataset(
        "reviews",
        splits(sentiment(4), Vec::new(), sentiment(4)),
    );
    let runner = BenchmarkRunner::new(config(), hub.clone(), Arc::new(provider));
    let ledger = RunLedger::open(Box::new(ReadOnlyStore)).unwrap();
    let datasets = [
        sentiment_dataset(),
        DatasetSpec::new("reviews", TaskFamily::SequenceClassification)
            .with_labels(&["positive", "negative"]),
    ];

    let records = runner.run(&[bert()], &datasets, 1, true, &ledger).unwrap();

    assert_eq!(records.len(), 2);
    assert!(records.iter().all(BenchmarkRecord::is_done));
    assert_eq!(hub.loads(), 1);
    assert!(ledger.records().is_empty());
}
