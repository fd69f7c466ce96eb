use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::error::{MiError, Result};
use crate::layers::{DenseLayer, LayerGradients};
use crate::snapshot::ParameterSnapshot;

/// A fixed feed-forward stack of dense layers.
///
/// The architecture is decided once by [`NetworkBuilder`](crate::builders::NetworkBuilder)
/// and never changes afterwards; only the parameters move.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FeedForward {
    layers: Vec<DenseLayer>,
}

impl FeedForward {
    /// Wrap an ordered list of layers, checking that consecutive widths chain.
    pub fn from_layers(layers: Vec<DenseLayer>) -> Result<Self> {
        if layers.is_empty() {
            return Err(MiError::invalid_parameter("layers", "a network needs at least one layer"));
        }
        for (i, pair) in layers.windows(2).enumerate() {
            if pair[0].output_size() != pair[1].input_size() {
                return Err(MiError::shape_mismatch(
                    format!("layer {} input width {}", i + 1, pair[0].output_size()),
                    format!("{}", pair[1].input_size()),
                ));
            }
        }
        Ok(FeedForward { layers })
    }

    pub fn input_size(&self) -> usize {
        self.layers[0].input_size()
    }

    pub fn output_size(&self) -> usize {
        self.layers[self.layers.len() - 1].output_size()
    }

    pub fn layers(&self) -> &[DenseLayer] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> impl Iterator<Item = &mut DenseLayer> {
        self.layers.iter_mut()
    }

    pub fn forward(&mut self, inputs: ArrayView2<f32>) -> Array2<f32> {
        let mut current_output = inputs.to_owned();
        for layer in &mut self.layers {
            current_output = layer.forward_batch(current_output.view());
        }
        current_output
    }

    /// Backpropagate dL/d output of the last [`forward`](Self::forward) call.
    ///
    /// Returns per-layer parameter gradients (first layer first) and dL/d input.
    pub fn backward(&self, output_errors: ArrayView2<f32>) -> Result<(Vec<LayerGradients>, Array2<f32>)> {
        let mut gradients = Vec::with_capacity(self.layers.len());
        let mut current_error = output_errors.to_owned();

        for layer in self.layers.iter().rev() {
            let (adjusted_error, weights, biases) = layer.backward_batch(current_error.view())?;
            gradients.push(LayerGradients { weights, biases });
            current_error = adjusted_error.dot(&layer.weights.t());
        }

        gradients.reverse();
        Ok((gradients, current_error))
    }

    pub fn layer_name(prefix: &str, index: usize) -> String {
        format!("{}.{}", prefix, index)
    }

    /// Export the parameters as `"<prefix>.<index>"` entries.
    pub fn snapshot(&self, prefix: &str) -> ParameterSnapshot {
        let mut snapshot = ParameterSnapshot::new();
        for (i, layer) in self.layers.iter().enumerate() {
            snapshot.insert(
                Self::layer_name(prefix, i),
                layer.weights.clone(),
                layer.biases.clone(),
            );
        }
        snapshot
    }

    /// Replace every parameter from `snapshot`.
    ///
    /// All names and shapes are checked before anything is written, so a
    /// failed import leaves the network untouched.
    pub fn load_snapshot(&mut self, prefix: &str, snapshot: &ParameterSnapshot) -> Result<()> {
        let mut staged = Vec::with_capacity(self.layers.len());
        for (i, layer) in self.layers.iter().enumerate() {
            let name = Self::layer_name(prefix, i);
            let params = snapshot.get(&name).ok_or_else(|| {
                MiError::invalid_parameter(
                    "snapshot".to_string(),
                    format!("missing layer '{}'", name),
                )
            })?;
            if params.weights.dim() != layer.weights.dim() || params.biases.dim() != layer.biases.dim() {
                return Err(MiError::shape_mismatch(
                    format!("{}: {:?} / {:?}", name, layer.weights.dim(), layer.biases.dim()),
                    format!("{:?} / {:?}", params.weights.dim(), params.biases.dim()),
                ));
            }
            staged.push(params);
        }
        for (layer, params) in self.layers.iter_mut().zip(staged) {
            layer.weights.assign(&params.weights);
            layer.biases.assign(&params.biases);
        }
        Ok(())
    }
}
