//! One trial of one (model, dataset) pair.
//!
//! prepare -> (fine-tune) -> infer -> postprocess -> score, all under a
//! single seed. Examples that fail preparation are skipped and counted;
//! predictions that fail postprocessing are scored as incorrect.

use crate::adapter::AdapterHandle;
use crate::capability::Capability;
use crate::config::BenchmarkConfig;
use crate::dataset::{DatasetSpec, DatasetSplits, RawExample, TaskFamily};
use crate::error::BenchError;
use crate::fewshot::Exemplar;
use crate::metrics::TrialScores;
use crate::pipeline::{pipeline_for, PipelineContext, PreparedExample, TaskPipeline};
use crate::speed::measure_throughput;
use crate::task_metrics::MetricType;
use crate::tokenize::Tokenizer;
use crate::trainer::{FitOutcome, Trainer, TrainingExample};
use tracing::{debug, warn};

/// Per-pair inputs shared by all trials
#[derive(Clone, Copy)]
pub struct TrialContext<'a> {
    pub dataset: &'a DatasetSpec,
    pub splits: &'a DatasetSplits,
    /// Few-shot exemplars, used only in generative mode
    pub exemplars: &'a [Exemplar],
    /// Capability the backend is driven through
    pub mode: Capability,
    pub config: &'a BenchmarkConfig,
    pub trainer: &'a Trainer,
}

/// Scores and bookkeeping of a successful trial
#[derive(Debug, Clone, Default)]
pub struct TrialResult {
    pub scores: TrialScores,
    pub skipped_examples: usize,
    pub prediction_errors: usize,
    pub fit: Option<FitOutcome>,
}

fn pipeline_context<'a>(
    ctx: &TrialContext<'a>,
    tokenizer: &'a dyn Tokenizer,
    max_length: usize,
) -> PipelineContext<'a> {
    PipelineContext {
        dataset: ctx.dataset,
        tokenizer,
        inference: &ctx.config.inference,
        generation: &ctx.config.generation,
        max_length,
        mode: ctx.mode,
        exemplars: if ctx.mode == Capability::Generate {
            ctx.exemplars
        } else {
            &[]
        },
    }
}

/// Run one trial with `seed`
///
/// # Errors
///
/// Returns `BenchError::DataIntegrity` when no test (or, for fine-tuning,
/// training) example survives preparation or none of the dataset's metrics
/// produced a score, otherwise the backend or trainer failure that ended the
/// trial.
pub fn run_trial(
    adapter: &mut AdapterHandle,
    ctx: &TrialContext<'_>,
    seed: u64,
) -> Result<TrialResult, BenchError> {
    adapter.reset(seed)?;

    if ctx.dataset.family == TaskFamily::Speed {
        let values = measure_throughput(
            adapter,
            &ctx.config.speed,
            &ctx.config.inference,
            &ctx.config.generation,
            seed,
        )?;
        return Ok(TrialResult {
            scores: TrialScores::from([(MetricType::Throughput, values)]),
            ..TrialResult::default()
        });
    }

    let pipeline = pipeline_for(ctx.dataset.family).ok_or_else(|| {
        BenchError::DataIntegrity(format!("no pipeline for {}", ctx.dataset.family))
    })?;
    let max_length = adapter.max_length(&ctx.config.inference);

    let (test, skipped_examples) = prepare_test(adapter, &*pipeline, ctx, max_length);
    if skipped_examples > 0 {
        warn!(
            dataset = %ctx.dataset.identity(),
            seed,
            skipped = skipped_examples,
            "Skipped test examples that could not be prepared"
        );
    }
    if test.is_empty() {
        return Err(BenchError::DataIntegrity(format!(
            "{}: none of {} test examples could be prepared",
            ctx.dataset.identity(),
            ctx.splits.test.len()
        )));
    }

    let fit = if adapter.is_finetunable() && ctx.mode != Capability::Generate {
        let (train, val) = (
            training_examples(adapter, &*pipeline, &ctx.splits.train, ctx, max_length),
            training_examples(adapter, &*pipeline, &ctx.splits.val, ctx, max_length),
        );
        if train.is_empty() {
            return Err(BenchError::DataIntegrity(format!(
                "{}: no usable training examples",
                ctx.dataset.identity()
            )));
        }
        let mut trainable =
            adapter.attach_trainable_head(ctx.dataset.family, &ctx.dataset.schema)?;
        Some(ctx.trainer.fit(&mut trainable, &train, &val, seed)?)
    } else {
        None
    };

    let inputs: Vec<_> = test
        .iter()
        .flat_map(|(_, prepared)| prepared.inputs.iter().cloned())
        .collect();
    let outputs = adapter.infer(
        &inputs,
        ctx.mode,
        seed,
        &ctx.config.inference,
        &ctx.config.generation,
    )?;

    let pctx = pipeline_context(ctx, adapter.tokenizer(), max_length);
    let metrics = ctx.dataset.effective_metrics();
    let mut scores = TrialScores::new();
    let mut prediction_errors = 0;
    let mut offset = 0;

    for (raw, prepared) in &test {
        let slice = &outputs[offset..offset + prepared.inputs.len()];
        offset += prepared.inputs.len();

        let prediction = match pipeline.postprocess(raw, prepared, slice, &pctx) {
            Ok(prediction) => Some(prediction),
            Err(e) => {
                debug!(example = raw.index, "Prediction failed: {e}");
                prediction_errors += 1;
                None
            }
        };
        for (metric, score) in pipeline.score(prediction.as_ref(), &prepared.gold, &metrics) {
            scores.entry(metric).or_default().push(score);
        }
    }

    if scores.values().all(Vec::is_empty) {
        let names: Vec<_> = metrics.iter().map(|m| m.name()).collect();
        return Err(BenchError::DataIntegrity(format!(
            "{}: none of [{}] is reported for {} datasets",
            ctx.dataset.identity(),
            names.join(", "),
            ctx.dataset.family
        )));
    }

    Ok(TrialResult {
        scores,
        skipped_examples,
        prediction_errors,
        fit,
    })
}

/// Prepare and length-check the test split, counting skipped examples
fn prepare_test<'a>(
    adapter: &AdapterHandle,
    pipeline: &dyn TaskPipeline,
    ctx: &TrialContext<'a>,
    max_length: usize,
) -> (Vec<(&'a RawExample, PreparedExample)>, usize) {
    let pctx = pipeline_context(ctx, adapter.tokenizer(), max_length);
    let policy = ctx.config.inference.oversize_policy;
    let mut prepared = Vec::with_capacity(ctx.splits.test.len());
    let mut skipped = 0;

    for raw in &ctx.splits.test {
        let result = pipeline.prepare(raw, &pctx).and_then(|mut example| {
            example.inputs = example
                .inputs
                .into_iter()
                .map(|input| adapter.fit_input(raw.index, input, max_length, policy))
                .collect::<Result<_, _>>()?;
            Ok(example)
        });
        match result {
            Ok(example) => prepared.push((raw, example)),
            Err(e) => {
                debug!(example = raw.index, "Skipping test example: {e}");
                skipped += 1;
            }
        }
    }

    (prepared, skipped)
}

/// Prepare a training split under the same length policy as the test split.
/// Examples that fail preparation or are rejected as oversized are skipped.
fn training_examples(
    adapter: &AdapterHandle,
    pipeline: &dyn TaskPipeline,
    split: &[RawExample],
    ctx: &TrialContext<'_>,
    max_length: usize,
) -> Vec<TrainingExample> {
    let pctx = pipeline_context(ctx, adapter.tokenizer(), max_length);
    let policy = ctx.config.inference.oversize_policy;
    let mut examples = Vec::with_capacity(split.len());

    for raw in split {
        let result = pipeline.prepare(raw, &pctx).and_then(|prepared| {
            prepared
                .inputs
                .into_iter()
                .zip(prepared.targets)
                .map(|(input, target)| {
                    adapter
                        .fit_input(raw.index, input, max_length, policy)
                        .map(|input| TrainingExample { input, target })
                })
                .collect::<Result<Vec<_>, _>>()
        });
        match result {
            Ok(prepared) => examples.extend(prepared),
            Err(e) => debug!(example = raw.index, "Skipping training example: {e}"),
        }
    }

    examples
}
