//! Run ledger: durable, append-only log of finished (model, dataset) pairs.
//!
//! Every pair reaching `DONE` or `FAILED` appends exactly one
//! [`BenchmarkRecord`]. On resume the latest `DONE` record for a key
//! short-circuits the pair; `FAILED` pairs are run again.

use crate::error::{FailureClass, FailureKind};
use crate::metrics::MetricEstimate;
use crate::model::{BackendKind, ModelMetadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Identity of a benchmark record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PairKey {
    /// `id@revision`
    pub model: String,
    /// Dataset id with its language filter
    pub dataset: String,
    /// Digest of the result-affecting configuration
    pub fingerprint: String,
}

impl std::fmt::Display for PairKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} / {}", self.model, self.dataset)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PairStatus {
    Done {
        metrics: BTreeMap<String, MetricEstimate>,
    },
    Failed {
        kind: FailureKind,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TrialOutcome {
    Succeeded,
    Failed { class: FailureClass, message: String },
}

/// What happened in one trial
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialSummary {
    pub seed: u64,
    #[serde(flatten)]
    pub outcome: TrialOutcome,
    /// Retryable failures absorbed before the final attempt
    pub retries: u32,
    /// Test examples dropped during preparation
    pub skipped_examples: usize,
    /// Predictions that could not be postprocessed
    pub prediction_errors: usize,
    /// Fine-tuning improved on the initial weights
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub converged: Option<bool>,
}

impl TrialSummary {
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        matches!(self.outcome, TrialOutcome::Succeeded)
    }
}

/// Aggregate of all trials for one pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkRecord {
    pub key: PairKey,
    /// `None` when the model never resolved
    pub backend: Option<BackendKind>,
    #[serde(flatten)]
    pub status: PairStatus,
    pub trials_requested: usize,
    pub seeds: Vec<u64>,
    #[serde(default)]
    pub trials: Vec<TrialSummary>,
    #[serde(default)]
    pub metadata: ModelMetadata,
    pub recorded_at: DateTime<Utc>,
}

impl BenchmarkRecord {
    #[must_use]
    pub const fn is_done(&self) -> bool {
        matches!(self.status, PairStatus::Done { .. })
    }

    #[must_use]
    pub fn metric(&self, name: &str) -> Option<&MetricEstimate> {
        match &self.status {
            PairStatus::Done { metrics } => metrics.get(name),
            PairStatus::Failed { .. } => None,
        }
    }

    #[must_use]
    pub fn total_retries(&self) -> u32 {
        self.trials.iter().map(|t| t.retries).sum()
    }
}

/// Durable storage behind the ledger
pub trait LedgerStore: Send {
    /// All records in append order
    ///
    /// # Errors
    ///
    /// Returns `LedgerError` if the backing storage cannot be read.
    fn load(&self) -> Result<Vec<BenchmarkRecord>, LedgerError>;

    /// Durably append one record
    ///
    /// # Errors
    ///
    /// Returns `LedgerError` if the record cannot be written.
    fn append(&mut self, record: &BenchmarkRecord) -> Result<(), LedgerError>;
}

/// One JSON record per line
#[derive(Debug, Clone)]
pub struct JsonlLedgerStore {
    path: PathBuf,
}

impl JsonlLedgerStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> LedgerError {
        LedgerError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl LedgerStore for JsonlLedgerStore {
    fn load(&self) -> Result<Vec<BenchmarkRecord>, LedgerError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };

        let mut records = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| self.io_error(e))?;
            if line.trim().is_empty() {
                continue;
            }
            // a torn final line from an interrupted write is skipped
            match serde_json::from_str(&line) {
                Ok(record) => records.push(record),
                Err(e) => warn!(
                    path = %self.path.display(),
                    line = lineno + 1,
                    "Skipping unreadable ledger line: {e}"
                ),
            }
        }
        Ok(records)
    }

    fn append(&mut self, record: &BenchmarkRecord) -> Result<(), LedgerError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;
        if ends_torn(&mut file).map_err(|e| self.io_error(e))? {
            line.insert(0, '\n');
        }
        file.write_all(line.as_bytes())
            .and_then(|()| file.sync_data())
            .map_err(|e| self.io_error(e))
    }
}

/// The file is non-empty and its last line lacks a newline
fn ends_torn(file: &mut File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(false);
    }
    let mut last = [0u8; 1];
    file.seek(SeekFrom::End(-1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// In-memory store for tests and ephemeral runs
#[derive(Debug, Clone, Default)]
pub struct MemoryLedgerStore {
    records: Vec<BenchmarkRecord>,
}

impl LedgerStore for MemoryLedgerStore {
    fn load(&self) -> Result<Vec<BenchmarkRecord>, LedgerError> {
        Ok(self.records.clone())
    }

    fn append(&mut self, record: &BenchmarkRecord) -> Result<(), LedgerError> {
        self.records.push(record.clone());
        Ok(())
    }
}

struct LedgerState {
    store: Box<dyn LedgerStore>,
    records: Vec<BenchmarkRecord>,
}

/// Records of the current and previous invocations, shared by reference
/// with the orchestrator
pub struct RunLedger {
    state: Mutex<LedgerState>,
}

impl RunLedger {
    /// Open a ledger over `store`, loading its existing records
    ///
    /// # Errors
    ///
    /// Returns `LedgerError` if the store cannot be read.
    pub fn open(store: Box<dyn LedgerStore>) -> Result<Self, LedgerError> {
        let records = store.load()?;
        Ok(Self {
            state: Mutex::new(LedgerState { store, records }),
        })
    }

    /// # Errors
    ///
    /// Returns `LedgerError` if an existing file cannot be read.
    pub fn jsonl(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        Self::open(Box::new(JsonlLedgerStore::new(path)))
    }

    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(LedgerState {
                store: Box::new(MemoryLedgerStore::default()),
                records: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        // appends are all-or-nothing, so a poisoned state is still consistent
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Latest `DONE` record for `key`
    #[must_use]
    pub fn completed(&self, key: &PairKey) -> Option<BenchmarkRecord> {
        self.lock()
            .records
            .iter()
            .rev()
            .find(|r| &r.key == key)
            .filter(|r| r.is_done())
            .cloned()
    }

    /// Persist a record, then make it visible
    ///
    /// # Errors
    ///
    /// Returns `LedgerError` if the store rejects the write; the record is
    /// then not visible either.
    pub fn append(&self, record: BenchmarkRecord) -> Result<(), LedgerError> {
        let mut state = self.lock();
        state.store.append(&record)?;
        state.records.push(record);
        Ok(())
    }

    /// All records in append order
    #[must_use]
    pub fn records(&self) -> Vec<BenchmarkRecord> {
        self.lock().records.clone()
    }

    /// Latest record per key, in key order
    #[must_use]
    pub fn latest(&self) -> Vec<BenchmarkRecord> {
        let mut latest: BTreeMap<PairKey, BenchmarkRecord> = BTreeMap::new();
        for record in self.lock().records.iter() {
            latest.insert(record.key.clone(), record.clone());
        }
        latest.into_values().collect()
    }
}

impl std::fmt::Debug for RunLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunLedger")
            .field("records", &self.lock().records.len())
            .finish()
    }
}
