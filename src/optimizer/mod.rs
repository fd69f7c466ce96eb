//! Optimizers for fitting estimator networks.
//!
//! Each trainable layer is addressed by a slot index (its position in
//! `MiEstimator::layers_mut`), so stateful optimizers keep their moment
//! estimates per layer. `advance` is called once after every layer has been
//! updated.

pub mod gradient_clipper;
pub mod lr_scheduler;

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};

pub use gradient_clipper::GradientClipper;
pub use lr_scheduler::LearningRateSchedule;

pub trait Optimizer {
    fn update_weights(&mut self, slot: usize, weights: &mut Array2<f32>, gradients: &Array2<f32>, learning_rate: f32);
    fn update_biases(&mut self, slot: usize, biases: &mut Array1<f32>, gradients: &Array1<f32>, learning_rate: f32);
    /// Finish one optimization step
    fn advance(&mut self) {}
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub enum OptimizerWrapper {
    SGD(SGD),
    Adam(Adam),
}

impl Optimizer for OptimizerWrapper {
    fn update_weights(&mut self, slot: usize, weights: &mut Array2<f32>, gradients: &Array2<f32>, learning_rate: f32) {
        match self {
            OptimizerWrapper::SGD(optimizer) => optimizer.update_weights(slot, weights, gradients, learning_rate),
            OptimizerWrapper::Adam(optimizer) => optimizer.update_weights(slot, weights, gradients, learning_rate),
        }
    }

    fn update_biases(&mut self, slot: usize, biases: &mut Array1<f32>, gradients: &Array1<f32>, learning_rate: f32) {
        match self {
            OptimizerWrapper::SGD(optimizer) => optimizer.update_biases(slot, biases, gradients, learning_rate),
            OptimizerWrapper::Adam(optimizer) => optimizer.update_biases(slot, biases, gradients, learning_rate),
        }
    }

    fn advance(&mut self) {
        match self {
            OptimizerWrapper::SGD(optimizer) => optimizer.advance(),
            OptimizerWrapper::Adam(optimizer) => optimizer.advance(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SGD;

impl SGD {
    pub fn new() -> SGD {
        SGD
    }
}

impl Default for SGD {
    fn default() -> Self {
        Self::new()
    }
}

impl Optimizer for SGD {
    fn update_weights(&mut self, _slot: usize, weights: &mut Array2<f32>, gradients: &Array2<f32>, learning_rate: f32) {
        weights.zip_mut_with(gradients, |w, &g| *w -= learning_rate * g);
    }

    fn update_biases(&mut self, _slot: usize, biases: &mut Array1<f32>, gradients: &Array1<f32>, learning_rate: f32) {
        biases.zip_mut_with(gradients, |b, &g| *b -= learning_rate * g);
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct Moments<T> {
    m: T,
    v: T,
}

/// Adam with bias correction. Moment buffers are allocated lazily per slot.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Adam {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub t: i32,
    weights: Vec<Option<Moments<Array2<f32>>>>,
    biases: Vec<Option<Moments<Array1<f32>>>>,
}

impl Adam {
    pub fn new(beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Adam {
            beta1,
            beta2,
            epsilon,
            t: 1,
            weights: Vec::new(),
            biases: Vec::new(),
        }
    }

    fn corrections(&self) -> (f32, f32) {
        (1.0 - self.beta1.powi(self.t), 1.0 - self.beta2.powi(self.t))
    }
}

impl Default for Adam {
    fn default() -> Self {
        Self::new(0.9, 0.999, 1e-8)
    }
}

fn slot_entry<T>(slots: &mut Vec<Option<T>>, slot: usize, init: impl FnOnce() -> T) -> &mut T {
    if slots.len() <= slot {
        slots.resize_with(slot + 1, || None);
    }
    slots[slot].get_or_insert_with(init)
}

impl Optimizer for Adam {
    fn update_weights(&mut self, slot: usize, weights: &mut Array2<f32>, gradients: &Array2<f32>, learning_rate: f32) {
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);
        let (c1, c2) = self.corrections();
        let state = slot_entry(&mut self.weights, slot, || Moments {
            m: Array2::zeros(weights.raw_dim()),
            v: Array2::zeros(weights.raw_dim()),
        });

        state.m.zip_mut_with(gradients, |m, &g| *m = beta1 * *m + (1.0 - beta1) * g);
        state.v.zip_mut_with(gradients, |v, &g| *v = beta2 * *v + (1.0 - beta2) * g * g);

        ndarray::Zip::from(weights)
            .and(&state.m)
            .and(&state.v)
            .for_each(|w, &m, &v| *w -= learning_rate * (m / c1) / ((v / c2).sqrt() + epsilon));
    }

    fn update_biases(&mut self, slot: usize, biases: &mut Array1<f32>, gradients: &Array1<f32>, learning_rate: f32) {
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);
        let (c1, c2) = self.corrections();
        let state = slot_entry(&mut self.biases, slot, || Moments {
            m: Array1::zeros(biases.raw_dim()),
            v: Array1::zeros(biases.raw_dim()),
        });

        state.m.zip_mut_with(gradients, |m, &g| *m = beta1 * *m + (1.0 - beta1) * g);
        state.v.zip_mut_with(gradients, |v, &g| *v = beta2 * *v + (1.0 - beta2) * g * g);

        ndarray::Zip::from(biases)
            .and(&state.m)
            .and(&state.v)
            .for_each(|b, &m, &v| *b -= learning_rate * (m / c1) / ((v / c2).sqrt() + epsilon));
    }

    fn advance(&mut self) {
        self.t += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_sgd_step() {
        let mut sgd = SGD::new();
        let mut w = arr2(&[[1.0, 2.0]]);
        sgd.update_weights(0, &mut w, &arr2(&[[0.5, -1.0]]), 0.1);
        assert_eq!(w, arr2(&[[0.95, 2.1]]));
    }

    #[test]
    fn test_adam_first_step_moves_by_learning_rate() {
        let mut adam = Adam::default();
        let mut b = arr1(&[0.0, 0.0]);
        adam.update_biases(3, &mut b, &arr1(&[2.0, -0.5]), 0.01);
        // bias-corrected first step is lr * sign(g)
        assert!((b[0] + 0.01).abs() < 1e-5);
        assert!((b[1] - 0.01).abs() < 1e-5);
    }

    #[test]
    fn test_adam_keeps_separate_state_per_slot() {
        let mut adam = Adam::default();
        let mut w0 = arr2(&[[0.0]]);
        let mut w1 = arr2(&[[0.0, 0.0]]);
        adam.update_weights(0, &mut w0, &arr2(&[[1.0]]), 0.1);
        adam.update_weights(1, &mut w1, &arr2(&[[1.0, 1.0]]), 0.1);
        adam.advance();
        adam.update_weights(0, &mut w0, &arr2(&[[1.0]]), 0.1);
        assert_eq!(adam.t, 2);
        assert!(w0[[0, 0]] < w1[[0, 0]]);
    }
}
