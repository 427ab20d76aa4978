//! Fine-tuning loop for local encoders.
//!
//! Epochs run over a seeded shuffle of the training split. Validation loss
//! after each epoch drives early stopping and checkpoint selection. An
//! out-of-memory failure rolls back to the epoch-start checkpoint, halves the
//! batch size and restarts the epoch.

use crate::adapter::Checkpoint;
use crate::config::TrainerConfig;
use crate::error::BackendError;
use crate::pipeline::{ModelInput, Target};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;
use tracing::{debug, info, warn};

/// One supervised example
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingExample {
    pub input: ModelInput,
    pub target: Target,
}

/// Model side of the training loop
pub trait Trainable {
    /// # Errors
    ///
    /// Returns `BackendError::OutOfMemory` when the batch does not fit.
    fn train_step(
        &mut self,
        batch: &[TrainingExample],
        learning_rate: f64,
    ) -> Result<f64, BackendError>;

    /// # Errors
    ///
    /// Returns `BackendError::OutOfMemory` when the batch does not fit.
    fn eval_loss(&mut self, batch: &[TrainingExample]) -> Result<f64, BackendError>;

    /// # Errors
    ///
    /// Returns a `BackendError` if the weights cannot be copied.
    fn checkpoint(&self) -> Result<Checkpoint, BackendError>;

    /// # Errors
    ///
    /// Returns a `BackendError` if the checkpoint cannot be loaded.
    fn restore(&mut self, checkpoint: &Checkpoint) -> Result<(), BackendError>;
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrainError {
    #[error("Out of memory at batch size {batch_size} after {halvings} halvings")]
    OutOfMemory { halvings: u32, batch_size: usize },

    #[error("Training failed: {0}")]
    Backend(BackendError),
}

/// Result of a fit
#[derive(Debug, Clone, PartialEq)]
pub struct FitOutcome {
    /// Validation loss improved on the untrained model
    pub converged: bool,
    pub epochs: usize,
    pub best_val_loss: Option<f64>,
    pub final_batch_size: usize,
    pub halvings: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Trainer {
    config: TrainerConfig,
}

struct BatchBudget {
    batch_size: usize,
    halvings: u32,
    max_halvings: u32,
}

impl BatchBudget {
    /// Halve the batch size, or report exhaustion
    fn halve(&mut self) -> Result<(), TrainError> {
        if self.halvings >= self.max_halvings || self.batch_size <= 1 {
            return Err(TrainError::OutOfMemory {
                halvings: self.halvings,
                batch_size: self.batch_size,
            });
        }
        self.batch_size = (self.batch_size / 2).max(1);
        self.halvings += 1;
        warn!(
            batch_size = self.batch_size,
            halvings = self.halvings,
            "Out of memory, halving batch size"
        );
        Ok(())
    }
}

impl Trainer {
    #[must_use]
    pub const fn new(config: TrainerConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &TrainerConfig {
        &self.config
    }

    /// Fine-tune `model`, leaving it at the best validation checkpoint.
    ///
    /// Without a validation split every epoch runs and the final weights
    /// are kept.
    ///
    /// # Errors
    ///
    /// Returns `TrainError::OutOfMemory` when the halving budget is exhausted,
    /// or `TrainError::Backend` for any other backend failure.
    pub fn fit(
        &self,
        model: &mut dyn Trainable,
        train: &[TrainingExample],
        val: &[TrainingExample],
        seed: u64,
    ) -> Result<FitOutcome, TrainError> {
        let mut budget = BatchBudget {
            batch_size: self.config.batch_size.max(1),
            halvings: 0,
            max_halvings: self.config.max_halvings,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut order: Vec<usize> = (0..train.len()).collect();

        let initial_loss = self.validate(model, val, &mut budget)?;
        let mut best_loss = initial_loss;
        let mut best_checkpoint = model.checkpoint().map_err(TrainError::Backend)?;
        let mut stale_epochs = 0;
        let mut epochs = 0;

        for epoch in 0..self.config.max_epochs {
            order.shuffle(&mut rng);
            let start = model.checkpoint().map_err(TrainError::Backend)?;

            let train_loss = loop {
                match self.run_epoch(model, train, &order, budget.batch_size) {
                    Ok(loss) => break loss,
                    Err(BackendError::OutOfMemory) => {
                        budget.halve()?;
                        model.restore(&start).map_err(TrainError::Backend)?;
                    }
                    Err(e) => return Err(TrainError::Backend(e)),
                }
            };
            epochs = epoch + 1;

            let Some(val_loss) = self.validate(model, val, &mut budget)? else {
                debug!(epoch, train_loss, "Epoch finished");
                best_checkpoint = model.checkpoint().map_err(TrainError::Backend)?;
                continue;
            };
            debug!(epoch, train_loss, val_loss, "Epoch finished");

            let improved = best_loss.map_or(true, |best| val_loss < best - self.config.min_delta);
            if improved {
                best_loss = Some(val_loss);
                best_checkpoint = model.checkpoint().map_err(TrainError::Backend)?;
                stale_epochs = 0;
            } else {
                stale_epochs += 1;
                if stale_epochs >= self.config.patience {
                    info!(epoch, "Validation loss plateaued, stopping early");
                    break;
                }
            }
        }

        model
            .restore(&best_checkpoint)
            .map_err(TrainError::Backend)?;

        let converged = match (initial_loss, best_loss) {
            (Some(initial), Some(best)) => best < initial,
            _ => true,
        };
        if !converged {
            warn!("Validation loss never improved, scoring the initial weights");
        }

        Ok(FitOutcome {
            converged,
            epochs,
            best_val_loss: best_loss,
            final_batch_size: budget.batch_size,
            halvings: budget.halvings,
        })
    }

    fn run_epoch(
        &self,
        model: &mut dyn Trainable,
        train: &[TrainingExample],
        order: &[usize],
        batch_size: usize,
    ) -> Result<f64, BackendError> {
        let mut total = 0.0;
        let mut batches = 0usize;
        for chunk in order.chunks(batch_size) {
            let batch: Vec<TrainingExample> = chunk.iter().map(|&i| train[i].clone()).collect();
            total += model.train_step(&batch, self.config.learning_rate)?;
            batches += 1;
        }
        Ok(if batches == 0 {
            0.0
        } else {
            total / batches as f64
        })
    }

    /// Mean validation loss weighted by batch size; `None` without data
    fn validate(
        &self,
        model: &mut dyn Trainable,
        val: &[TrainingExample],
        budget: &mut BatchBudget,
    ) -> Result<Option<f64>, TrainError> {
        if val.is_empty() {
            return Ok(None);
        }
        'attempt: loop {
            let mut total = 0.0;
            for chunk in val.chunks(budget.batch_size) {
                match model.eval_loss(chunk) {
                    Ok(loss) => total += loss * chunk.len() as f64,
                    Err(BackendError::OutOfMemory) => {
                        budget.halve()?;
                        continue 'attempt;
                    }
                    Err(e) => return Err(TrainError::Backend(e)),
                }
            }
            return Ok(Some(total / val.len() as f64));
        }
    }
}
