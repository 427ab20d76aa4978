//! Free-form text-to-text generation scored with ROUGE-L.

use crate::dataset::{DatasetSpec, RawExample, TaskFamily};
use crate::error::DataIntegrityError;
use crate::fewshot::Exemplar;
use crate::pipeline::{
    clean_generation, parse_record, Gold, ModelInput, PipelineContext, PreparedExample,
    Prediction, RawOutput, Target, TaskPipeline,
};
use crate::task_metrics::{rouge_l, ExampleScore, MetricType};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct TextToTextRecord {
    #[serde(alias = "source", alias = "document")]
    text: String,
    #[serde(alias = "target", alias = "summary")]
    target_text: String,
}

impl TextToTextRecord {
    fn parse(raw: &RawExample) -> Result<Self, DataIntegrityError> {
        let record: Self = parse_record(raw)?;
        if record.text.trim().is_empty() || record.target_text.trim().is_empty() {
            return Err(DataIntegrityError::new(raw.index, "empty source or target"));
        }
        Ok(record)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TextToTextPipeline;

impl TaskPipeline for TextToTextPipeline {
    fn family(&self) -> TaskFamily {
        TaskFamily::TextToText
    }

    fn prepare(
        &self,
        raw: &RawExample,
        ctx: &PipelineContext<'_>,
    ) -> Result<PreparedExample, DataIntegrityError> {
        let record = TextToTextRecord::parse(raw)?;
        let input = if ctx.is_generative() {
            ModelInput::Prompt(ctx.prompt(record.text.trim()))
        } else {
            ModelInput::Text {
                text: record.text,
                pair: None,
            }
        };

        Ok(PreparedExample {
            index: raw.index,
            inputs: vec![input],
            targets: vec![Target::Text(record.target_text.clone())],
            gold: Gold::Text(record.target_text),
        })
    }

    fn postprocess(
        &self,
        raw: &RawExample,
        prepared: &PreparedExample,
        outputs: &[RawOutput],
        ctx: &PipelineContext<'_>,
    ) -> Result<Prediction, DataIntegrityError> {
        let Some(RawOutput::Text(generated)) = outputs.first() else {
            return Err(DataIntegrityError::new(raw.index, "unexpected output kind"));
        };
        let prompt = match prepared.inputs.first() {
            Some(ModelInput::Prompt(p)) => Some(p.as_str()),
            _ => None,
        };
        Ok(Prediction::Text(clean_generation(
            generated,
            prompt,
            &ctx.generation.stop_sequences,
        )))
    }

    fn score(
        &self,
        prediction: Option<&Prediction>,
        gold: &Gold,
        metrics: &[MetricType],
    ) -> Vec<(MetricType, ExampleScore)> {
        let Gold::Text(reference) = gold else {
            return Vec::new();
        };
        let value = match prediction {
            Some(Prediction::Text(text)) => rouge_l(text, reference),
            _ => 0.0,
        };
        metrics
            .iter()
            .filter(|m| **m == MetricType::RougeL)
            .map(|&m| (m, ExampleScore::Value(value)))
            .collect()
    }

    fn exemplar(&self, raw: &RawExample, _dataset: &DatasetSpec) -> Option<Exemplar> {
        let record = TextToTextRecord::parse(raw).ok()?;
        Some(Exemplar {
            input: record.text.trim().to_string(),
            output: record.target_text.trim().to_string(),
            stratum: None,
        })
    }
}
