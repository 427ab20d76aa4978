//! Latency probe: throughput over fixed-size synthetic batches.
//!
//! Warm-up iterations run untimed; each measured iteration contributes one
//! throughput value (documents per second).

use crate::adapter::AdapterHandle;
use crate::capability::Capability;
use crate::config::{GenerationConfig, InferenceConfig, OversizePolicy, SpeedConfig};
use crate::error::BackendError;
use crate::pipeline::ModelInput;
use crate::task_metrics::ExampleScore;
use std::time::Instant;
use tracing::debug;

const VOCABULARY: [&str; 16] = [
    "the", "model", "reads", "a", "long", "document", "about", "weather", "in", "the", "northern",
    "harbour", "and", "writes", "short", "notes",
];

/// Deterministic synthetic document `index` of `words` words
#[must_use]
pub fn synthetic_document(index: usize, words: usize) -> String {
    (0..words)
        .map(|j| VOCABULARY[(index * 7 + j * 3) % VOCABULARY.len()])
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run the warm-up-then-measure protocol through `adapter`
///
/// # Errors
///
/// Returns the backend failure of the first iteration that fails.
#[allow(clippy::cast_precision_loss)]
pub fn measure_throughput(
    adapter: &mut AdapterHandle,
    speed: &SpeedConfig,
    inference: &InferenceConfig,
    generation: &GenerationConfig,
    seed: u64,
) -> Result<Vec<ExampleScore>, BackendError> {
    let generative = adapter.capabilities().contains(Capability::Generate);
    let max_length = adapter.max_length(inference);
    let batch_size = speed.batch_size.max(1);

    let batch = (0..batch_size)
        .map(|i| {
            let doc = synthetic_document(i, speed.synthetic_words);
            let input = if generative {
                ModelInput::Prompt(doc)
            } else {
                ModelInput::Text {
                    text: doc,
                    pair: None,
                }
            };
            adapter
                .fit_input(i, input, max_length, OversizePolicy::Truncate)
                .map_err(|e| BackendError::InvalidInput(e.to_string()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let batch_config = InferenceConfig {
        batch_size,
        ..inference.clone()
    };

    for _ in 0..speed.warmup_iterations {
        adapter.infer(
            &batch,
            Capability::MeasureLatency,
            seed,
            &batch_config,
            generation,
        )?;
    }

    let mut throughputs = Vec::with_capacity(speed.measured_iterations);
    for iteration in 0..speed.measured_iterations {
        let start = Instant::now();
        adapter.infer(
            &batch,
            Capability::MeasureLatency,
            seed,
            &batch_config,
            generation,
        )?;
        let secs = start.elapsed().as_secs_f64().max(1e-9);
        let throughput = batch_size as f64 / secs;
        debug!(iteration, throughput, "Speed iteration");
        throughputs.push(ExampleScore::Value(throughput));
    }

    Ok(throughputs)
}
