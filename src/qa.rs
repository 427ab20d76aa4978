//! Extractive question answering.

use crate::dataset::{DatasetSpec, RawExample, TaskFamily};
use crate::error::DataIntegrityError;
use crate::fewshot::Exemplar;
use crate::pipeline::{
    parse_record, Gold, ModelInput, PipelineContext, PreparedExample, Prediction, RawOutput,
    Target, TaskPipeline,
};
use crate::task_metrics::{exact_match, token_f1, ExampleScore, MetricType};
use crate::tokenize::Token;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AnswerValue {
    Text(String),
    Span {
        text: String,
        #[serde(default, alias = "start")]
        answer_start: Option<usize>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Answers {
    List(Vec<AnswerValue>),
    Columns {
        text: Vec<String>,
        #[serde(default)]
        answer_start: Vec<usize>,
    },
}

impl Answers {
    /// Non-empty answers with their optional character offsets
    fn normalized(self) -> Vec<(String, Option<usize>)> {
        let answers: Vec<(String, Option<usize>)> = match self {
            Self::List(list) => list
                .into_iter()
                .map(|a| match a {
                    AnswerValue::Text(text) => (text, None),
                    AnswerValue::Span { text, answer_start } => (text, answer_start),
                })
                .collect(),
            Self::Columns { text, answer_start } => text
                .into_iter()
                .enumerate()
                .map(|(i, t)| (t, answer_start.get(i).copied()))
                .collect(),
        };
        answers
            .into_iter()
            .filter(|(text, _)| !text.trim().is_empty())
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct QaRecord {
    question: String,
    context: String,
    #[serde(default = "no_answers")]
    answers: Answers,
}

fn no_answers() -> Answers {
    Answers::List(Vec::new())
}

/// Character range of an answer in the context, preferring the given offset
fn locate(context: &str, text: &str, start: Option<usize>) -> Option<(usize, usize)> {
    if let Some((start, end)) = start.and_then(|s| Some((s, s.checked_add(text.len())?))) {
        if context.get(start..end) == Some(text) {
            return Some((start, end));
        }
    }
    context.find(text).map(|s| (s, s + text.len()))
}

/// Token range `[first, last]` covering the character range
fn token_span(tokens: &[Token], (start, end): (usize, usize)) -> Option<(usize, usize)> {
    let first = tokens.iter().position(|t| t.end > start)?;
    let last = tokens.iter().rposition(|t| t.start < end)?;
    (first <= last).then_some((first, last))
}

/// Start offsets of overlapping windows of `window` units over `n` units
#[must_use]
pub fn window_starts(n: usize, window: usize, stride: usize) -> Vec<usize> {
    let step = window.saturating_sub(stride).max(1);
    let mut starts = vec![0];
    let mut start = 0;
    while start + window < n {
        start += step;
        starts.push(start);
    }
    starts
}

/// Best `(score, first, last)` span in one window, bounded by `max_len` units
#[must_use]
pub fn best_span(start: &[f64], end: &[f64], max_len: usize) -> Option<(f64, usize, usize)> {
    let mut best: Option<(f64, usize, usize)> = None;
    for (i, s) in start.iter().enumerate() {
        for (j, e) in end.iter().enumerate().skip(i).take(max_len.max(1)) {
            let score = s + e;
            if score.is_finite() && best.map_or(true, |(b, _, _)| score > b) {
                best = Some((score, i, j));
            }
        }
    }
    best
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QuestionAnsweringPipeline;

impl QuestionAnsweringPipeline {
    fn parse(raw: &RawExample) -> Result<QaRecord, DataIntegrityError> {
        let record: QaRecord = parse_record(raw)?;
        if record.question.trim().is_empty() || record.context.trim().is_empty() {
            return Err(DataIntegrityError::new(raw.index, "empty question or context"));
        }
        Ok(record)
    }
}

impl TaskPipeline for QuestionAnsweringPipeline {
    fn family(&self) -> TaskFamily {
        TaskFamily::QuestionAnswering
    }

    fn prepare(
        &self,
        raw: &RawExample,
        ctx: &PipelineContext<'_>,
    ) -> Result<PreparedExample, DataIntegrityError> {
        let record = Self::parse(raw)?;
        let tokens = ctx.tokenizer.tokenize(&record.context);
        let question_units = ctx.tokenizer.count(&record.question);
        let window = ctx.max_length.saturating_sub(question_units);
        if window == 0 || tokens.is_empty() {
            return Err(DataIntegrityError::new(
                raw.index,
                "question leaves no room for context",
            ));
        }

        let answers = record.answers.normalized();
        let answer_tokens = match answers.first() {
            Some((text, start)) => {
                let chars = locate(&record.context, text, *start).ok_or_else(|| {
                    DataIntegrityError::new(raw.index, "answer not found in context")
                })?;
                token_span(&tokens, chars)
            }
            None => None,
        };

        let mut inputs = Vec::new();
        let mut targets = Vec::new();
        for offset in window_starts(tokens.len(), window, ctx.inference.doc_stride) {
            let end = (offset + window).min(tokens.len());
            inputs.push(ModelInput::Span {
                question: record.question.clone(),
                context: tokens[offset..end].iter().map(|t| t.text.clone()).collect(),
                offset,
            });
            let span = answer_tokens
                .filter(|&(first, last)| first >= offset && last < end)
                .map(|(first, last)| (first - offset, last - offset));
            targets.push(Target::Span(span));
        }

        Ok(PreparedExample {
            index: raw.index,
            inputs,
            targets,
            gold: Gold::Answers(answers.into_iter().map(|(text, _)| text).collect()),
        })
    }

    fn postprocess(
        &self,
        raw: &RawExample,
        prepared: &PreparedExample,
        outputs: &[RawOutput],
        ctx: &PipelineContext<'_>,
    ) -> Result<Prediction, DataIntegrityError> {
        if outputs.len() != prepared.inputs.len() {
            return Err(DataIntegrityError::new(
                raw.index,
                format!("expected {} windows, got {}", prepared.inputs.len(), outputs.len()),
            ));
        }
        let record = Self::parse(raw)?;
        let tokens = ctx.tokenizer.tokenize(&record.context);

        let mut best: Option<(f64, usize, usize)> = None;
        let mut null = f64::INFINITY;
        for (input, output) in prepared.inputs.iter().zip(outputs) {
            let (
                ModelInput::Span {
                    context, offset, ..
                },
                RawOutput::SpanLogits {
                    start,
                    end,
                    null_score,
                },
            ) = (input, output)
            else {
                return Err(DataIntegrityError::new(raw.index, "unexpected output kind"));
            };
            if start.len() != context.len() || end.len() != context.len() {
                return Err(DataIntegrityError::new(raw.index, "span scores do not match window"));
            }

            null = null.min(*null_score);
            if let Some((score, i, j)) = best_span(start, end, ctx.inference.max_answer_tokens) {
                if best.map_or(true, |(b, _, _)| score > b) {
                    best = Some((score, offset + i, offset + j));
                }
            }
        }

        let Some((score, first, last)) = best else {
            return Ok(Prediction::Answer(None));
        };
        if null - score > ctx.inference.no_answer_threshold {
            return Ok(Prediction::Answer(None));
        }

        let (Some(first), Some(last)) = (tokens.get(first), tokens.get(last)) else {
            return Err(DataIntegrityError::new(raw.index, "span outside context"));
        };
        Ok(Prediction::Answer(Some(
            record.context[first.start..last.end].to_string(),
        )))
    }

    fn score(
        &self,
        prediction: Option<&Prediction>,
        gold: &Gold,
        metrics: &[MetricType],
    ) -> Vec<(MetricType, ExampleScore)> {
        let Gold::Answers(golds) = gold else {
            return Vec::new();
        };
        let answer = match prediction {
            Some(Prediction::Answer(answer)) => Some(answer.as_deref()),
            _ => None,
        };

        metrics
            .iter()
            .filter_map(|&metric| {
                let value = match (metric, answer) {
                    (MetricType::ExactMatch, Some(a)) => exact_match(a, golds),
                    (MetricType::TokenF1, Some(a)) => token_f1(a, golds),
                    (MetricType::ExactMatch | MetricType::TokenF1, None) => 0.0,
                    _ => return None,
                };
                Some((metric, ExampleScore::Value(value)))
            })
            .collect()
    }

    fn exemplar(&self, _raw: &RawExample, _dataset: &DatasetSpec) -> Option<Exemplar> {
        None
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;
    use crate::capability::Capability;
    use crate::config::{GenerationConfig, InferenceConfig};
    use crate::tokenize::WhitespaceTokenizer;
    use serde_json::json;

    fn with_ctx<T>(
        max_length: usize,
        doc_stride: usize,
        f: impl FnOnce(&PipelineContext<'_>) -> T,
    ) -> T {
        let dataset = DatasetSpec::new("scandiqa", TaskFamily::QuestionAnswering);
        let inference = InferenceConfig {
            doc_stride,
            ..InferenceConfig::default()
        };
        let generation = GenerationConfig::default();
        let ctx = PipelineContext {
            dataset: &dataset,
            tokenizer: &WhitespaceTokenizer,
            inference: &inference,
            generation: &generation,
            max_length,
            mode: Capability::ExtractSpan,
            exemplars: &[],
        };
        f(&ctx)
    }

    /// Scores that put the whole mass on the target span, or on no-answer
    fn oracle(prepared: &PreparedExample) -> Vec<RawOutput> {
        prepared
            .inputs
            .iter()
            .zip(&prepared.targets)
            .map(|(input, target)| {
                let ModelInput::Span { context, .. } = input else {
                    panic!("expected span input");
                };
                let Target::Span(span) = target else {
                    panic!("expected span target");
                };
                let mut start = vec![-10.0; context.len()];
                let mut end = vec![-10.0; context.len()];
                let null_score = if let Some((s, e)) = span {
                    start[*s] = 10.0;
                    end[*e] = 10.0;
                    -20.0
                } else {
                    0.0
                };
                RawOutput::SpanLogits {
                    start,
                    end,
                    null_score,
                }
            })
            .collect()
    }

    #[test]
    fn test_locate_prefers_offset_and_survives_bad_offsets() {
        let context = "Oslo og Oslo";
        assert_eq!(locate(context, "Oslo", Some(8)), Some((8, 12)));
        assert_eq!(locate(context, "Oslo", Some(3)), Some((0, 4)));
        assert_eq!(locate(context, "Oslo", Some(usize::MAX)), Some((0, 4)));
        assert_eq!(locate(context, "Bergen", Some(usize::MAX - 2)), None);
    }

    #[test]
    fn test_window_starts() {
        assert_eq!(window_starts(5, 10, 2), vec![0]);
        assert_eq!(window_starts(10, 4, 2), vec![0, 2, 4, 6]);
        assert_eq!(window_starts(10, 4, 8), vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_best_span_respects_max_length() {
        let start = [5.0, 0.0, 0.0];
        let end = [0.0, 0.0, 5.0];
        assert_eq!(best_span(&start, &end, 3), Some((10.0, 0, 2)));
        assert_eq!(best_span(&start, &end, 2).map(|(_, i, j)| (i, j)), Some((0, 0)));
        assert_eq!(best_span(&[], &[], 3), None);
    }

    #[test]
    fn test_answer_recovered_across_windows() {
        let raw = RawExample::new(
            0,
            json!({
                "question": "Hvor bor hun?",
                "context": "Hun hedder Anna og hun bor i det smukke Aarhus ved havet",
                "answers": [{"text": "Aarhus", "answer_start": 40}]
            }),
        );
        // question = 4 units ("?" isolated), windows of 4 context units
        with_ctx(8, 2, |ctx| {
            let prepared = QuestionAnsweringPipeline.prepare(&raw, ctx).unwrap();
            assert!(prepared.inputs.len() > 1);
            assert!(prepared
                .targets
                .iter()
                .any(|t| matches!(t, Target::Span(None))));

            let prediction = QuestionAnsweringPipeline
                .postprocess(&raw, &prepared, &oracle(&prepared), ctx)
                .unwrap();
            assert_eq!(prediction, Prediction::Answer(Some("Aarhus".to_string())));

            let scores = QuestionAnsweringPipeline.score(
                Some(&prediction),
                &prepared.gold,
                &[MetricType::ExactMatch, MetricType::TokenF1],
            );
            assert_eq!(scores[0], (MetricType::ExactMatch, ExampleScore::Value(1.0)));
            assert_eq!(scores[1], (MetricType::TokenF1, ExampleScore::Value(1.0)));
        });
    }

    #[test]
    fn test_abstains_on_unanswerable() {
        let raw = RawExample::new(
            0,
            json!({"question": "Hvem?", "context": "Ingen svar her", "answers": {"text": [], "answer_start": []}}),
        );
        with_ctx(64, 16, |ctx| {
            let prepared = QuestionAnsweringPipeline.prepare(&raw, ctx).unwrap();
            assert_eq!(prepared.gold, Gold::Answers(Vec::new()));
            let prediction = QuestionAnsweringPipeline
                .postprocess(&raw, &prepared, &oracle(&prepared), ctx)
                .unwrap();
            assert_eq!(prediction, Prediction::Answer(None));
            let scores =
                QuestionAnsweringPipeline.score(Some(&prediction), &prepared.gold, &[MetricType::ExactMatch]);
            assert_eq!(scores[0].1, ExampleScore::Value(1.0));
        });
    }

    #[test]
    fn test_malformed_records() {
        with_ctx(64, 16, |ctx| {
            let missing = RawExample::new(
                1,
                json!({"question": "Hvad?", "context": "Noget tekst", "answers": ["Aarhus"]}),
            );
            assert!(QuestionAnsweringPipeline.prepare(&missing, ctx).is_err());
            let empty = RawExample::new(2, json!({"question": "", "context": "x"}));
            assert!(QuestionAnsweringPipeline.prepare(&empty, ctx).is_err());
        });
    }

    #[test]
    fn test_failed_prediction_scores_zero() {
        let gold = Gold::Answers(vec!["Aarhus".to_string()]);
        let scores = QuestionAnsweringPipeline.score(None, &gold, &[MetricType::TokenF1]);
        assert_eq!(scores, vec![(MetricType::TokenF1, ExampleScore::Value(0.0))]);
    }
}
