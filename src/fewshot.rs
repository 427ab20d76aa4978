//! Few-shot exemplar selection and prompt rendering.
//!
//! Selection depends on the dataset identity only, never on the trial seed,
//! so every trial and every model sees the same exemplars for a dataset.

use crate::dataset::{DatasetSpec, PromptTemplate};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A solved training example shown inside a prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exemplar {
    pub input: String,
    pub output: String,
    /// Group used for stratified selection (the label for classification)
    pub stratum: Option<String>,
}

/// Chooses the exemplars for a dataset
pub trait ExemplarSelector: Send + Sync {
    /// Pick up to `dataset.num_few_shot` exemplars from `candidates`
    fn select(&self, dataset: &DatasetSpec, candidates: Vec<Exemplar>) -> Vec<Exemplar>;
}

/// Seeded shuffle, then round-robin over strata (sorted by name) taking one
/// unused exemplar per stratum; unstratified candidates are taken in
/// shuffled order. The picked exemplars are shuffled again with the same
/// seed so labels do not appear in a fixed cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct StratifiedSelector;

/// Seed derived from a dataset identity
#[must_use]
pub fn dataset_seed(identity: &str) -> u64 {
    let digest = Sha256::digest(identity.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

impl ExemplarSelector for StratifiedSelector {
    fn select(&self, dataset: &DatasetSpec, mut candidates: Vec<Exemplar>) -> Vec<Exemplar> {
        let n = dataset.num_few_shot;
        if n == 0 || candidates.is_empty() {
            return Vec::new();
        }

        let seed = dataset_seed(&dataset.identity());
        candidates.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));

        let mut strata: BTreeMap<String, Vec<Exemplar>> = BTreeMap::new();
        let mut unstratified = Vec::new();
        for exemplar in candidates {
            match exemplar.stratum.clone() {
                Some(s) => strata.entry(s).or_default().push(exemplar),
                None => unstratified.push(exemplar),
            }
        }

        let mut selected = Vec::with_capacity(n);
        let mut queues: Vec<std::vec::IntoIter<Exemplar>> =
            strata.into_values().map(Vec::into_iter).collect();
        while selected.len() < n && !queues.is_empty() {
            queues.retain_mut(|queue| match queue.next() {
                Some(exemplar) if selected.len() < n => {
                    selected.push(exemplar);
                    true
                }
                Some(_) => true,
                None => false,
            });
        }
        selected.extend(unstratified.into_iter().take(n - selected.len()));

        selected.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));
        selected
    }
}

fn fill(template: &str, input: &str, output: &str) -> String {
    let mut rendered = String::with_capacity(template.len() + input.len() + output.len());
    let mut rest = template;
    while let Some(pos) = rest.find('{') {
        rendered.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if let Some(after) = tail.strip_prefix("{input}") {
            rendered.push_str(input);
            rest = after;
        } else if let Some(after) = tail.strip_prefix("{output}") {
            rendered.push_str(output);
            rest = after;
        } else {
            rendered.push('{');
            rest = &tail[1..];
        }
    }
    rendered.push_str(rest);
    rendered
}

/// Prefix, exemplars and the target example with an empty output slot,
/// separated by blank lines
#[must_use]
pub fn render_prompt(template: &PromptTemplate, exemplars: &[Exemplar], input: &str) -> String {
    let mut sections = Vec::with_capacity(exemplars.len() + 2);
    if !template.prefix.trim().is_empty() {
        sections.push(template.prefix.trim().to_string());
    }
    for exemplar in exemplars {
        sections.push(fill(&template.template, &exemplar.input, &exemplar.output));
    }
    sections.push(fill(&template.template, input, "").trim_end().to_string());
    sections.join("\n\n")
}
