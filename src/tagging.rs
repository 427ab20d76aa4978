//! Token-level sequence tagging (entity recognition).
//!
//! Words are split into model units by the backend's tokenizer. Every unit
//! of a word carries the word's tag during training; at prediction time the
//! unit tags of a word are resolved to one tag with the configured
//! [`AlignmentRule`]. Words whose units were truncated away get the outside
//! tag.

use crate::config::{AlignmentRule, OversizePolicy};
use crate::dataset::{DatasetSpec, LabelSchema, RawExample, TaskFamily};
use crate::error::DataIntegrityError;
use crate::fewshot::Exemplar;
use crate::pipeline::{
    argmax, parse_record, Gold, ModelInput, PipelineContext, PreparedExample, Prediction,
    RawOutput, Target, TaskPipeline,
};
use crate::task_metrics::{entity_counts, extract_entities, ExampleScore, MetricType};
use crate::tokenize::Tokenizer;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct TaggingRecord {
    #[serde(alias = "words")]
    tokens: Vec<String>,
    #[serde(alias = "ner_tags", alias = "tags")]
    labels: Vec<String>,
}

impl TaggingRecord {
    fn validate(&self, schema: &LabelSchema, index: usize) -> Result<Vec<usize>, DataIntegrityError> {
        if self.tokens.is_empty() {
            return Err(DataIntegrityError::new(index, "no tokens"));
        }
        if self.tokens.len() != self.labels.len() {
            return Err(DataIntegrityError::new(
                index,
                format!(
                    "{} tokens but {} labels",
                    self.tokens.len(),
                    self.labels.len()
                ),
            ));
        }
        self.labels
            .iter()
            .map(|tag| {
                schema
                    .index_of(tag)
                    .ok_or_else(|| DataIntegrityError::new(index, format!("unknown tag {tag}")))
            })
            .collect()
    }
}

/// Split words into model units, recording the source word of every unit
#[must_use]
pub fn split_words(words: &[String], tokenizer: &dyn Tokenizer) -> (Vec<String>, Vec<usize>) {
    let mut units = Vec::new();
    let mut word_ids = Vec::new();
    for (word_id, word) in words.iter().enumerate() {
        let pieces = tokenizer.tokenize(word);
        if pieces.is_empty() {
            units.push(word.clone());
            word_ids.push(word_id);
        } else {
            for piece in pieces {
                units.push(piece.text);
                word_ids.push(word_id);
            }
        }
    }
    (units, word_ids)
}

/// Resolve the unit tags of one word to a single tag
#[must_use]
pub fn resolve_word(unit_tags: &[usize], rule: AlignmentRule) -> Option<usize> {
    match rule {
        AlignmentRule::FirstUnit => unit_tags.first().copied(),
        AlignmentRule::Majority => {
            let mut best: Option<(usize, usize)> = None;
            for &tag in unit_tags {
                let count = unit_tags.iter().filter(|&&t| t == tag).count();
                if best.map_or(true, |(_, c)| count > c) {
                    best = Some((tag, count));
                }
            }
            best.map(|(tag, _)| tag)
        }
    }
}

/// Map per-unit tags back to `num_words` word tags
#[must_use]
pub fn align_to_words(
    unit_tags: &[usize],
    word_ids: &[usize],
    num_words: usize,
    rule: AlignmentRule,
    outside: usize,
) -> Vec<usize> {
    let mut per_word: Vec<Vec<usize>> = vec![Vec::new(); num_words];
    for (&tag, &word_id) in unit_tags.iter().zip(word_ids) {
        if let Some(slot) = per_word.get_mut(word_id) {
            slot.push(tag);
        }
    }
    per_word
        .iter()
        .map(|tags| resolve_word(tags, rule).unwrap_or(outside))
        .collect()
}

fn outside_tag(schema: &LabelSchema) -> usize {
    schema.index_of("O").unwrap_or(0)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TaggingPipeline;

impl TaskPipeline for TaggingPipeline {
    fn family(&self) -> TaskFamily {
        TaskFamily::SequenceTagging
    }

    fn prepare(
        &self,
        raw: &RawExample,
        ctx: &PipelineContext<'_>,
    ) -> Result<PreparedExample, DataIntegrityError> {
        let record: TaggingRecord = parse_record(raw)?;
        let schema = &ctx.dataset.schema;
        let word_tags = record.validate(schema, raw.index)?;

        let (mut units, mut word_ids) = split_words(&record.tokens, ctx.tokenizer);
        if units.len() > ctx.max_length {
            if ctx.inference.oversize_policy == OversizePolicy::Reject {
                return Err(DataIntegrityError::new(
                    raw.index,
                    format!("{} units exceed the limit of {}", units.len(), ctx.max_length),
                ));
            }
            units.truncate(ctx.max_length);
            word_ids.truncate(ctx.max_length);
        }

        let unit_tags = word_ids.iter().map(|&w| word_tags[w]).collect();
        let gold = word_tags
            .iter()
            .map(|&t| schema.labels[t].clone())
            .collect();

        Ok(PreparedExample {
            index: raw.index,
            inputs: vec![ModelInput::Units { units, word_ids }],
            targets: vec![Target::UnitTags(unit_tags)],
            gold: Gold::Tags(gold),
        })
    }

    fn postprocess(
        &self,
        raw: &RawExample,
        prepared: &PreparedExample,
        outputs: &[RawOutput],
        ctx: &PipelineContext<'_>,
    ) -> Result<Prediction, DataIntegrityError> {
        let schema = &ctx.dataset.schema;
        let (Some(ModelInput::Units { word_ids, .. }), Some(RawOutput::UnitLogits(rows))) =
            (prepared.inputs.first(), outputs.first())
        else {
            return Err(DataIntegrityError::new(raw.index, "unexpected output kind"));
        };
        if rows.len() != word_ids.len() {
            return Err(DataIntegrityError::new(
                raw.index,
                format!("expected {} unit scores, got {}", word_ids.len(), rows.len()),
            ));
        }

        let unit_tags = rows
            .iter()
            .map(|row| {
                argmax(row)
                    .filter(|&t| t < schema.len())
                    .ok_or_else(|| DataIntegrityError::new(raw.index, "invalid unit scores"))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let num_words = match &prepared.gold {
            Gold::Tags(tags) => tags.len(),
            _ => word_ids.last().map_or(0, |w| w + 1),
        };
        let words = align_to_words(
            &unit_tags,
            word_ids,
            num_words,
            ctx.inference.alignment,
            outside_tag(schema),
        );

        Ok(Prediction::Tags(
            words.into_iter().map(|t| schema.labels[t].clone()).collect(),
        ))
    }

    fn score(
        &self,
        prediction: Option<&Prediction>,
        gold: &Gold,
        metrics: &[MetricType],
    ) -> Vec<(MetricType, ExampleScore)> {
        let Gold::Tags(gold) = gold else {
            return Vec::new();
        };
        let (tp, fp, fn_) = match prediction {
            Some(Prediction::Tags(predicted)) => entity_counts(gold, predicted),
            _ => (0, 0, extract_entities(gold).len()),
        };

        metrics
            .iter()
            .filter(|m| **m == MetricType::EntityF1)
            .map(|&m| (m, ExampleScore::Counts { tp, fp, fn_ }))
            .collect()
    }

    fn exemplar(&self, _raw: &RawExample, _dataset: &DatasetSpec) -> Option<Exemplar> {
        None
    }
}
