//! Error taxonomy shared by adapters, pipelines and the orchestrator.
//!
//! Errors are grouped by the scope they abort:
//! - example level: [`DataIntegrityError`] (example skipped, pair continues)
//! - trial level: [`BackendError`] classified through [`FailureClass`]
//! - pair level: [`CapabilityMismatchError`], terminal backend failures
//! - model level: [`ResolutionError`]

use crate::capability::{CapabilityRequirement, CapabilitySet};
use crate::model::BackendKind;
use crate::remote::RemoteFailureKind;
use crate::trainer::TrainError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Model, revision or dataset could not be resolved
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Revision {revision} not found for model {model}")]
    RevisionNotFound { model: String, revision: String },

    #[error("Dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("Invalid model identifier: {0:?}")]
    InvalidModelId(String),

    #[error("Model {model} was declared {declared} but the hub returned a {actual} runtime")]
    BackendMismatch {
        model: String,
        declared: BackendKind,
        actual: String,
    },

    #[error("Model hub unavailable: {0}")]
    HubUnavailable(String),
}

/// Dataset requires a capability the backend does not advertise
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Dataset {dataset} requires {required}, but {backend} backend only provides {available}")]
pub struct CapabilityMismatchError {
    pub dataset: String,
    pub backend: BackendKind,
    pub required: CapabilityRequirement,
    pub available: CapabilitySet,
}

/// A single example could not be prepared or scored
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Malformed example {index}: {reason}")]
pub struct DataIntegrityError {
    pub index: usize,
    pub reason: String,
}

impl DataIntegrityError {
    pub fn new(index: usize, reason: impl Into<String>) -> Self {
        Self {
            index,
            reason: reason.into(),
        }
    }
}

/// Failure reported by a model backend during inference or training
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Out of memory")]
    OutOfMemory,

    #[error("Remote backend failure ({kind}): {message}")]
    Remote {
        kind: RemoteFailureKind,
        message: String,
    },

    #[error("Backend does not support {0}")]
    Unsupported(crate::capability::Capability),

    #[error("Input rejected: {0}")]
    InvalidInput(String),

    #[error("Runtime failure: {0}")]
    Runtime(String),
}

/// How the orchestrator should react to a failed trial attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Rate limit, timeout, transient server error, recoverable OOM
    Retryable,
    /// The trial is lost but other trials may still succeed
    TrialFailure,
    /// The whole pair fails without further attempts
    Terminal,
}

/// Category stored in failure records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Resolution,
    CapabilityMismatch,
    DataIntegrity,
    Backend,
    AllTrialsFailed,
}

/// Pair- and trial-level error
#[derive(Error, Debug)]
pub enum BenchError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    CapabilityMismatch(#[from] CapabilityMismatchError),

    #[error("Dataset unusable: {0}")]
    DataIntegrity(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Train(#[from] TrainError),
}

impl BenchError {
    /// Category used when this error ends a pair
    #[must_use]
    pub const fn kind(&self) -> FailureKind {
        match self {
            Self::Resolution(_) => FailureKind::Resolution,
            Self::CapabilityMismatch(_) => FailureKind::CapabilityMismatch,
            Self::DataIntegrity(_) => FailureKind::DataIntegrity,
            Self::Backend(_) | Self::Train(_) => FailureKind::Backend,
        }
    }
}
