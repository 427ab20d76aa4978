//! Sequence classification over a closed label set.

use crate::dataset::{DatasetSpec, LabelSchema, RawExample, TaskFamily};
use crate::error::DataIntegrityError;
use crate::fewshot::Exemplar;
use crate::pipeline::{
    argmax, clean_generation, parse_record, Gold, ModelInput, PipelineContext, PreparedExample,
    Prediction, RawOutput, Target, TaskPipeline,
};
use crate::task_metrics::{char_similarity, ExampleScore, MetricType};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LabelValue {
    Index(usize),
    Name(String),
}

#[derive(Debug, Deserialize)]
struct ClassificationRecord {
    text: String,
    #[serde(default, alias = "text_b")]
    text_pair: Option<String>,
    label: LabelValue,
}

impl ClassificationRecord {
    fn gold(&self, schema: &LabelSchema, index: usize) -> Result<usize, DataIntegrityError> {
        let gold = match &self.label {
            LabelValue::Index(i) if *i < schema.len() => Some(*i),
            LabelValue::Index(_) => None,
            LabelValue::Name(name) => schema.index_of(name),
        };
        gold.ok_or_else(|| DataIntegrityError::new(index, "label outside the label set"))
    }

    fn joined_text(&self) -> String {
        match &self.text_pair {
            Some(pair) if !pair.trim().is_empty() => format!("{}\n{}", self.text.trim(), pair.trim()),
            _ => self.text.trim().to_string(),
        }
    }
}

/// Map generated text to a label: exact prompt-label match on the first
/// line, otherwise the most similar prompt label
#[must_use]
pub fn label_from_text(text: &str, schema: &LabelSchema) -> Option<usize> {
    let answer = text.trim().lines().next().unwrap_or_default().trim();
    if answer.is_empty() {
        return None;
    }
    if let Some(index) = schema.from_prompt_label(answer) {
        return Some(index);
    }

    let answer = answer.to_lowercase();
    (0..schema.len())
        .filter_map(|i| {
            let label = schema.prompt_label(i)?.to_lowercase();
            Some((i, char_similarity(&answer, &label)))
        })
        .filter(|(_, sim)| *sim > 0.0)
        .fold(None, |best: Option<(usize, f64)>, (i, sim)| match best {
            Some((_, b)) if b >= sim => best,
            _ => Some((i, sim)),
        })
        .map(|(i, _)| i)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ClassificationPipeline;

impl TaskPipeline for ClassificationPipeline {
    fn family(&self) -> TaskFamily {
        TaskFamily::SequenceClassification
    }

    fn prepare(
        &self,
        raw: &RawExample,
        ctx: &PipelineContext<'_>,
    ) -> Result<PreparedExample, DataIntegrityError> {
        let record: ClassificationRecord = parse_record(raw)?;
        if record.text.trim().is_empty() {
            return Err(DataIntegrityError::new(raw.index, "empty text"));
        }
        let schema = &ctx.dataset.schema;
        let gold = record.gold(schema, raw.index)?;

        let (input, target) = if ctx.is_generative() {
            let label = schema.prompt_label(gold).unwrap_or_default().to_string();
            (
                ModelInput::Prompt(ctx.prompt(&record.joined_text())),
                Target::Text(label),
            )
        } else {
            (
                ModelInput::Text {
                    text: record.text,
                    pair: record.text_pair,
                },
                Target::Label(gold),
            )
        };

        Ok(PreparedExample {
            index: raw.index,
            inputs: vec![input],
            targets: vec![target],
            gold: Gold::Label(gold),
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
        match outputs.first() {
            Some(RawOutput::Logits(logits)) => {
                if logits.len() != schema.len() {
                    return Err(DataIntegrityError::new(
                        raw.index,
                        format!("expected {} logits, got {}", schema.len(), logits.len()),
                    ));
                }
                Ok(Prediction::Label(argmax(logits)))
            }
            Some(RawOutput::Text(text)) => {
                let prompt = match prepared.inputs.first() {
                    Some(ModelInput::Prompt(p)) => Some(p.as_str()),
                    _ => None,
                };
                let answer = clean_generation(text, prompt, &ctx.generation.stop_sequences);
                Ok(Prediction::Label(label_from_text(&answer, schema)))
            }
            _ => Err(DataIntegrityError::new(raw.index, "unexpected output kind")),
        }
    }

    fn score(
        &self,
        prediction: Option<&Prediction>,
        gold: &Gold,
        metrics: &[MetricType],
    ) -> Vec<(MetricType, ExampleScore)> {
        let Gold::Label(gold) = *gold else {
            return Vec::new();
        };
        let predicted = match prediction {
            Some(Prediction::Label(p)) => *p,
            _ => None,
        };

        metrics
            .iter()
            .filter_map(|&metric| match metric {
                MetricType::Accuracy => Some((
                    metric,
                    ExampleScore::Value(if predicted == Some(gold) { 1.0 } else { 0.0 }),
                )),
                MetricType::MacroF1 => Some((metric, ExampleScore::Label { gold, predicted })),
                _ => None,
            })
            .collect()
    }

    fn exemplar(&self, raw: &RawExample, dataset: &DatasetSpec) -> Option<Exemplar> {
        let record: ClassificationRecord = parse_record(raw).ok()?;
        if record.text.trim().is_empty() {
            return None;
        }
        let gold = record.gold(&dataset.schema, raw.index).ok()?;
        Some(Exemplar {
            input: record.joined_text(),
            output: dataset.schema.prompt_label(gold)?.to_string(),
            stratum: dataset.schema.labels.get(gold).cloned(),
        })
    }
}
