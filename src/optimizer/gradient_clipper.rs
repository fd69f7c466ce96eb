use serde::{Deserialize, Serialize};

use crate::layers::LayerGradients;

/// Gradient clipping methods
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Default)]
pub enum GradientClipper {
    /// Clip each gradient entry into `[min, max]`
    ClipByValue { min: f32, max: f32 },

    /// Rescale each layer's gradients to at most `max_norm`
    ClipByNorm { max_norm: f32 },

    /// Rescale all gradients together to a global norm of at most `max_norm`
    ClipByGlobalNorm { max_norm: f32 },

    /// No clipping
    #[default]
    None,
}

impl GradientClipper {
    /// Clip `gradients` in place; returns the global norm before clipping.
    pub fn clip(&self, gradients: &mut [LayerGradients]) -> f32 {
        let global_norm = Self::global_norm(gradients);
        match *self {
            GradientClipper::ClipByValue { min, max } => {
                for grad in gradients.iter_mut() {
                    grad.weights.mapv_inplace(|g| g.max(min).min(max));
                    grad.biases.mapv_inplace(|g| g.max(min).min(max));
                }
            }
            GradientClipper::ClipByNorm { max_norm } => {
                for grad in gradients.iter_mut() {
                    let norm = grad.squared_norm().sqrt();
                    if norm > max_norm {
                        grad.scale(max_norm / norm);
                    }
                }
            }
            GradientClipper::ClipByGlobalNorm { max_norm } => {
                if global_norm > max_norm {
                    let scale = max_norm / global_norm;
                    for grad in gradients.iter_mut() {
                        grad.scale(scale);
                    }
                }
            }
            GradientClipper::None => {}
        }
        global_norm
    }

    /// Compute global norm of all gradients
    pub fn global_norm(gradients: &[LayerGradients]) -> f32 {
        gradients.iter().map(LayerGradients::squared_norm).sum::<f32>().sqrt()
    }
}
