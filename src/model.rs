//! Model identities and metadata.

use crate::error::ResolutionError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Revision used when a model identifier carries no `@revision` suffix
pub const DEFAULT_REVISION: &str = "main";

/// Concrete way of running a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Locally hosted encoder that can be fine-tuned
    LocalFinetunable,
    /// Locally hosted frozen generative model
    LocalGenerative,
    /// Generative model behind a hosted inference API
    Remote,
    /// Randomly initialised lower-bound comparator
    Fresh,
}

impl BackendKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalFinetunable => "local_finetunable",
            Self::LocalGenerative => "local_generative",
            Self::Remote => "remote",
            Self::Fresh => "fresh",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = ResolutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "local_finetunable" | "local" | "finetunable" | "encoder" => Ok(Self::LocalFinetunable),
            "local_generative" | "generative" | "generator" => Ok(Self::LocalGenerative),
            "remote" | "api" => Ok(Self::Remote),
            "fresh" | "random" => Ok(Self::Fresh),
            _ => Err(ResolutionError::InvalidModelId(s.to_string())),
        }
    }
}

/// Identifies one model to benchmark
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Hub identifier or local path
    pub id: String,
    /// Branch, tag or commit pin
    #[serde(default = "default_revision")]
    pub revision: String,
    /// Backend used to run the model
    pub backend: BackendKind,
}

fn default_revision() -> String {
    DEFAULT_REVISION.to_string()
}

impl ModelSpec {
    /// Create a spec pinned to the default revision
    #[must_use]
    pub fn new(id: impl Into<String>, backend: BackendKind) -> Self {
        Self {
            id: id.into(),
            revision: default_revision(),
            backend,
        }
    }

    /// Pin a specific revision
    #[must_use]
    pub fn with_revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = revision.into();
        self
    }

    /// Parse `org/model` or `org/model@revision`
    ///
    /// # Errors
    ///
    /// Returns `InvalidModelId` if the identifier or revision is empty.
    pub fn parse(identifier: &str, backend: BackendKind) -> Result<Self, ResolutionError> {
        let identifier = identifier.trim();
        let (id, revision) = match identifier.split_once('@') {
            Some((id, revision)) => (id, revision),
            None => (identifier, DEFAULT_REVISION),
        };

        if id.is_empty() || revision.is_empty() || revision.contains('@') {
            return Err(ResolutionError::InvalidModelId(identifier.to_string()));
        }

        Ok(Self::new(id, backend).with_revision(revision))
    }

    /// Identity used in ledger keys: `id@revision`
    #[must_use]
    pub fn identity(&self) -> String {
        format!("{}@{}", self.id, self.revision)
    }
}

impl fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.revision == DEFAULT_REVISION {
            f.write_str(&self.id)
        } else {
            write!(f, "{}@{}", self.id, self.revision)
        }
    }
}

/// Metadata reported by a runtime at resolution time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Number of trainable parameters
    pub num_parameters: Option<u64>,
    /// Maximum input length in model units
    pub max_sequence_length: Option<usize>,
    /// Vocabulary size
    pub vocabulary_size: Option<usize>,
}
