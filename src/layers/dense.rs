use ndarray::{Array1, Array2, ArrayView2, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::initialization::WeightInit;
use crate::activations::Activation;
use crate::error::{MiError, Result};

/// A fully connected layer computing `activation(inputs · W + b)` with `W` stored as `[in, out]`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DenseLayer {
    pub weights: Array2<f32>,
    pub biases: Array1<f32>,
    pub activation: Activation,
    #[serde(skip)]
    pre_activation_output: Option<Array2<f32>>,
    #[serde(skip)]
    inputs: Option<Array2<f32>>,
}

/// Gradients of a scalar objective with respect to one layer's parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerGradients {
    pub weights: Array2<f32>,
    pub biases: Array1<f32>,
}

impl LayerGradients {
    /// Sum of squared entries, used for global-norm clipping
    pub fn squared_norm(&self) -> f32 {
        self.weights.iter().chain(self.biases.iter()).map(|g| g * g).sum()
    }

    pub fn scale(&mut self, factor: f32) {
        self.weights.mapv_inplace(|g| g * factor);
        self.biases.mapv_inplace(|g| g * factor);
    }

    pub fn negated(mut self) -> Self {
        self.scale(-1.0);
        self
    }
}

impl DenseLayer {
    /// Create a new dense layer, drawing its parameters from `init` with the given RNG.
    pub fn new<R: Rng + ?Sized>(
        input_size: usize,
        output_size: usize,
        activation: Activation,
        init: WeightInit,
        rng: &mut R,
    ) -> Result<Self> {
        let weights = init.initialize_weights((input_size, output_size), rng)?;
        let biases = init.initialize_biases(output_size, input_size, rng);
        Ok(DenseLayer {
            weights,
            biases,
            activation,
            pre_activation_output: None,
            inputs: None,
        })
    }

    pub fn input_size(&self) -> usize {
        self.weights.shape()[0]
    }

    pub fn output_size(&self) -> usize {
        self.weights.shape()[1]
    }

    pub fn forward_batch(&mut self, inputs: ArrayView2<f32>) -> Array2<f32> {
        self.inputs = Some(inputs.to_owned());
        let mut outputs = inputs.dot(&self.weights) + &self.biases.view().insert_axis(Axis(0));
        self.pre_activation_output = Some(outputs.clone());
        self.activation.apply_batch(&mut outputs);
        outputs
    }

    /// Backpropagate `output_errors` (dL/d output) through the activation.
    ///
    /// Returns the error with respect to the pre-activation together with the
    /// weight and bias gradients.
    pub fn backward_batch(
        &self,
        output_errors: ArrayView2<f32>,
    ) -> Result<(Array2<f32>, Array2<f32>, Array1<f32>)> {
        let (pre_activation_output, inputs) =
            match (self.pre_activation_output.as_ref(), self.inputs.as_ref()) {
                (Some(pre), Some(inputs)) => (pre, inputs),
                _ => {
                    return Err(MiError::invalid_parameter(
                        "layer",
                        "forward_batch() must be called before backward_batch()",
                    ))
                }
            };
        if output_errors.dim() != pre_activation_output.dim() {
            return Err(MiError::shape_mismatch(
                format!("{:?}", pre_activation_output.dim()),
                format!("{:?}", output_errors.dim()),
            ));
        }

        let activation_deriv = self.activation.derivative_batch(pre_activation_output.view());
        let adjusted_error = output_errors.to_owned() * &activation_deriv;
        let weight_gradients = inputs.t().dot(&adjusted_error);
        let bias_gradients = adjusted_error.sum_axis(Axis(0));

        Ok((adjusted_error, weight_gradients, bias_gradients))
    }
}
