//! Fitting an estimator's own network on its learning loss.

use rand::RngCore;

use crate::batch::SampleBatch;
use crate::error::Result;
use crate::estimators::{apply_gradients, MiEstimator};
use crate::optimizer::{GradientClipper, LearningRateSchedule, OptimizerWrapper};

/// Optimizer, clipping and learning-rate schedule for repeated learning steps.
#[derive(Debug, Clone)]
pub struct EstimatorTrainer {
    pub optimizer: OptimizerWrapper,
    pub clipper: GradientClipper,
    pub schedule: LearningRateSchedule,
    steps_taken: usize,
}

impl EstimatorTrainer {
    /// Constant learning rate, no clipping.
    pub fn new(optimizer: OptimizerWrapper, learning_rate: f32) -> Self {
        EstimatorTrainer {
            optimizer,
            clipper: GradientClipper::None,
            schedule: LearningRateSchedule::constant(learning_rate),
            steps_taken: 0,
        }
    }

    pub fn with_clipper(mut self, clipper: GradientClipper) -> Self {
        self.clipper = clipper;
        self
    }

    pub fn with_schedule(mut self, schedule: LearningRateSchedule) -> Result<Self> {
        schedule.validate()?;
        self.schedule = schedule;
        Ok(self)
    }

    pub fn steps_taken(&self) -> usize {
        self.steps_taken
    }

    /// One update of the estimator's parameters; returns the learning loss
    /// measured before the update.
    pub fn step(&mut self, estimator: &mut dyn MiEstimator, batch: &SampleBatch<'_>, rng: &mut dyn RngCore) -> Result<f32> {
        let (loss, mut gradients) = estimator.learning_gradients(batch, rng)?;
        let norm = self.clipper.clip(&mut gradients);
        let learning_rate = self.schedule.rate(self.steps_taken);
        apply_gradients(estimator.layers_mut(), &gradients, &mut self.optimizer, learning_rate)?;
        self.steps_taken += 1;
        log::trace!(
            "{} step {}: loss={:.5} grad_norm={:.5} lr={}",
            estimator.kind().name(),
            self.steps_taken,
            loss,
            norm,
            learning_rate
        );
        Ok(loss)
    }

    /// `steps` updates on the same batch; returns the loss before each one.
    pub fn fit(
        &mut self,
        estimator: &mut dyn MiEstimator,
        batch: &SampleBatch<'_>,
        rng: &mut dyn RngCore,
        steps: usize,
    ) -> Result<Vec<f32>> {
        let mut losses = Vec::with_capacity(steps);
        for _ in 0..steps {
            losses.push(self.step(estimator, batch, rng)?);
        }
        if let (Some(first), Some(last)) = (losses.first(), losses.last()) {
            log::debug!(
                "fitted {} for {} steps: loss {:.5} -> {:.5}",
                estimator.kind().name(),
                steps,
                first,
                last
            );
        }
        Ok(losses)
    }
}
