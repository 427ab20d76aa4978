//! Durable ledger tests: resume across restarts, torn writes, reports.

#![allow(clippy::unwrap_used)]
#![allow(clippy::float_cmp)]

mod common;

use common::{encoder_hub, sentiment, splits, EncoderCounters, FakeEncoder, FakeHub};
use nlbench::{
    BackendKind, BenchmarkConfig, BenchmarkRunner, DatasetSpec, FailureKind, LoadedRuntime,
    MemoryDatasetProvider, ModelSpec, ReportBuilder, RunLedger, TaskFamily, TrainerConfig,
};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

fn config() -> BenchmarkConfig {
    BenchmarkConfig {
        trainer: TrainerConfig {
            max_epochs: 2,
            ..TrainerConfig::default()
        },
        ..BenchmarkConfig::default()
    }
}

fn provider() -> MemoryDatasetProvider {
    MemoryDatasetProvider::new()
        .with_dataset("sentiment", splits(sentiment(4), sentiment(2), sentiment(6)))
        .with_dataset("reviews", splits(sentiment(4), Vec::new(), sentiment(4)))
}

fn dataset(id: &str) -> DatasetSpec {
    DatasetSpec::new(id, TaskFamily::SequenceClassification).with_labels(&["positive", "negative"])
}

fn line_count(path: &Path) -> usize {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter(|l| !l.trim().is_empty())
        .count()
}

#[test]
fn test_resume_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results").join("ledger.jsonl");
    let counters = Arc::new(EncoderCounters::default());
    let hub = Arc::new(encoder_hub(&counters));
    let runner = BenchmarkRunner::new(config(), hub.clone(), Arc::new(provider()));
    let models = [ModelSpec::new("bert", BackendKind::LocalFinetunable)];
    let datasets = [dataset("sentiment")];

    {
        let ledger = RunLedger::jsonl(&path).unwrap();
        let records = runner.run(&models, &datasets, 2, true, &ledger).unwrap();
        assert!(records[0].is_done());
    }
    assert_eq!(line_count(&path), 1);

    let ledger = RunLedger::jsonl(&path).unwrap();
    assert_eq!(ledger.records().len(), 1);
    let records = runner.run(&models, &datasets, 2, true, &ledger).unwrap();

    assert_eq!(hub.loads(), 1);
    assert!(records[0].is_done());
    assert_eq!(records[0].metric("accuracy").unwrap().point, 1.0);
    assert_eq!(records[0].seeds, vec![4242, 4243]);
    assert_eq!(line_count(&path), 1);
}

#[test]
fn test_torn_line_is_skipped_and_next_append_is_readable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.jsonl");
    let counters = Arc::new(EncoderCounters::default());
    let hub = Arc::new(encoder_hub(&counters));
    let runner = BenchmarkRunner::new(config(), hub.clone(), Arc::new(provider()));
    let models = [ModelSpec::new("bert", BackendKind::LocalFinetunable)];

    {
        let ledger = RunLedger::jsonl(&path).unwrap();
        runner
            .run(&models, &[dataset("sentiment")], 1, true, &ledger)
            .unwrap();
    }

    // simulate a crash in the middle of writing the next record
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .unwrap();
    file.write_all(br#"{"key":{"model":"bert@main","dataset":"rev"#)
        .unwrap();
    drop(file);

    let ledger = RunLedger::jsonl(&path).unwrap();
    assert_eq!(ledger.records().len(), 1);

    let records = runner
        .run(
            &models,
            &[dataset("sentiment"), dataset("reviews")],
            1,
            true,
            &ledger,
        )
        .unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.is_done()));

    let reopened = RunLedger::jsonl(&path).unwrap();
    let datasets: Vec<String> = reopened
        .records()
        .iter()
        .map(|r| r.key.dataset.clone())
        .collect();
    assert_eq!(datasets, vec!["sentiment", "reviews"]);
}

#[test]
fn test_report_from_ledger_lists_entries_and_failures() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.jsonl");
    let counters = Arc::new(EncoderCounters::default());
    let hub = {
        let bert = Arc::clone(&counters);
        let tiny = Arc::clone(&counters);
        FakeHub::new()
            .with_model("bert", move || {
                LoadedRuntime::Encoder(Box::new(FakeEncoder::new(Arc::clone(&bert))))
            })
            .with_model("tiny", move || {
                LoadedRuntime::Encoder(Box::new(FakeEncoder::new(Arc::clone(&tiny))))
            })
    };
    let runner = BenchmarkRunner::new(config(), Arc::new(hub), Arc::new(provider()));
    let models = [
        ModelSpec::new("bert", BackendKind::LocalFinetunable),
        ModelSpec::new("tiny", BackendKind::Fresh),
        ModelSpec::new("ghost", BackendKind::Remote),
    ];
    let ledger = RunLedger::jsonl(&path).unwrap();
    runner
        .run(&models, &[dataset("sentiment")], 2, true, &ledger)
        .unwrap();

    let reopened = RunLedger::jsonl(&path).unwrap();
    let mut builder = ReportBuilder::new("Nordic sentiment");
    builder.add_records(reopened.latest());
    let board = builder.build();

    assert_eq!(board.entries.len(), 2);
    assert_eq!(board.failures.len(), 1);
    assert_eq!(board.failures[0].kind, FailureKind::Resolution);
    assert!(board.entries.iter().all(|e| e.trials_succeeded == 2));

    let markdown = board.to_markdown();
    assert!(markdown.starts_with("# Nordic sentiment"));
    assert!(markdown.contains("## Failures"));
    assert!(markdown.contains("ghost"));

    let json: serde_json::Value = serde_json::from_str(&board.to_json().unwrap()).unwrap();
    assert_eq!(json["entries"].as_array().unwrap().len(), 2);
    assert!(board.to_text().contains("tiny"));
}
