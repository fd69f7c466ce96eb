use serde::{Deserialize, Serialize};

use crate::error::{MiError, Result};

/// Learning rate as a function of the number of estimator updates so far.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningRateSchedule {
    Constant { lr: f32 },

    /// `initial_lr * decay_rate^(step / step_size)`
    StepDecay {
        initial_lr: f32,
        decay_rate: f32,
        step_size: usize,
    },

    /// `initial_lr * decay_rate^step`
    ExponentialDecay { initial_lr: f32, decay_rate: f32 },

    /// Cosine from `max_lr` down to `min_lr`, restarting every `period` steps
    CosineAnnealing { max_lr: f32, min_lr: f32, period: usize },

    /// Linear ramp from `initial_lr` to `target_lr`, then constant
    WarmupConstant {
        initial_lr: f32,
        warmup_steps: usize,
        target_lr: f32,
    },
}

impl Default for LearningRateSchedule {
    fn default() -> Self {
        LearningRateSchedule::Constant { lr: 1e-3 }
    }
}

impl LearningRateSchedule {
    pub fn constant(lr: f32) -> Self {
        LearningRateSchedule::Constant { lr }
    }

    pub fn rate(&self, step: usize) -> f32 {
        match *self {
            LearningRateSchedule::Constant { lr } => lr,
            LearningRateSchedule::StepDecay { initial_lr, decay_rate, step_size } => {
                initial_lr * decay_rate.powi((step / step_size) as i32)
            }
            LearningRateSchedule::ExponentialDecay { initial_lr, decay_rate } => {
                initial_lr * decay_rate.powf(step as f32)
            }
            LearningRateSchedule::CosineAnnealing { max_lr, min_lr, period } => {
                let progress = (step % period) as f32 / period as f32;
                min_lr + 0.5 * (max_lr - min_lr) * (1.0 + (std::f32::consts::PI * progress).cos())
            }
            LearningRateSchedule::WarmupConstant { initial_lr, warmup_steps, target_lr } => {
                if step < warmup_steps {
                    let progress = step as f32 / warmup_steps as f32;
                    initial_lr + (target_lr - initial_lr) * progress
                } else {
                    target_lr
                }
            }
        }
    }

    /// Periods must be non-zero and every rate finite and non-negative.
    pub fn validate(&self) -> Result<()> {
        let (rates, period): (&[f32], Option<usize>) = match self {
            LearningRateSchedule::Constant { lr } => (std::slice::from_ref(lr), None),
            LearningRateSchedule::StepDecay { initial_lr, step_size, .. } => {
                (std::slice::from_ref(initial_lr), Some(*step_size))
            }
            LearningRateSchedule::ExponentialDecay { initial_lr, .. } => (std::slice::from_ref(initial_lr), None),
            LearningRateSchedule::CosineAnnealing { max_lr, period, .. } => (std::slice::from_ref(max_lr), Some(*period)),
            LearningRateSchedule::WarmupConstant { target_lr, .. } => (std::slice::from_ref(target_lr), None),
        };
        if period == Some(0) {
            return Err(MiError::invalid_parameter("schedule", "period must be positive"));
        }
        if rates.iter().any(|r| !r.is_finite() || *r < 0.0) {
            return Err(MiError::invalid_parameter("schedule", "learning rates must be finite and non-negative"));
        }
        Ok(())
    }
}
