//! Capability contract between model backends and task pipelines.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A named operation a backend can perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Classify,
    TagSequence,
    ExtractSpan,
    Generate,
    MeasureLatency,
    Finetunable,
}

impl Capability {
    /// All capabilities in declaration order
    pub const ALL: [Self; 6] = [
        Self::Classify,
        Self::TagSequence,
        Self::ExtractSpan,
        Self::Generate,
        Self::MeasureLatency,
        Self::Finetunable,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Classify => "classify",
            Self::TagSequence => "tag_sequence",
            Self::ExtractSpan => "extract_span",
            Self::Generate => "generate",
            Self::MeasureLatency => "measure_latency",
            Self::Finetunable => "is_finetunable",
        }
    }

    const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of capabilities advertised by a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub fn of(capabilities: &[Capability]) -> Self {
        capabilities
            .iter()
            .fold(Self::empty(), |set, &c| set.with(c))
    }

    #[must_use]
    pub const fn with(self, capability: Capability) -> Self {
        Self(self.0 | capability.bit())
    }

    #[must_use]
    pub const fn contains(self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Capability> {
        Capability::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(Capability::as_str).collect();
        write!(f, "{{{}}}", names.join(", "))
    }
}

/// Capabilities a task pipeline can work with, in order of preference.
///
/// The requirement is satisfied when the backend advertises at least one of
/// them; the first advertised one is the mode the pipeline runs in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityRequirement {
    any_of: Vec<Capability>,
}

impl CapabilityRequirement {
    #[must_use]
    pub fn any_of(preference: &[Capability]) -> Self {
        Self {
            any_of: preference.to_vec(),
        }
    }

    /// Pick the preferred capability the backend provides
    #[must_use]
    pub fn select(&self, available: CapabilitySet) -> Option<Capability> {
        self.any_of.iter().copied().find(|c| available.contains(*c))
    }

    #[must_use]
    pub fn is_satisfied_by(&self, available: CapabilitySet) -> bool {
        self.select(available).is_some()
    }
}

impl fmt::Display for CapabilityRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.any_of.iter().map(|c| c.as_str()).collect();
        if names.len() == 1 {
            f.write_str(names[0])
        } else {
            write!(f, "one of [{}]", names.join(", "))
        }
    }
}
