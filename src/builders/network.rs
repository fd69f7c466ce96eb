use rand::Rng;

use crate::activations::Activation;
use crate::error::{MiError, Result};
use crate::layers::{DenseLayer, WeightInit};
use crate::network::FeedForward;

/// Builder assembling a fixed feed-forward stack from declared layer widths.
#[derive(Debug, Clone)]
pub struct NetworkBuilder {
    input_size: usize,
    layers: Vec<(usize, Activation)>,
    init: WeightInit,
}

impl NetworkBuilder {
    /// Start a network that accepts rows of width `input_size`
    pub fn new(input_size: usize) -> Self {
        NetworkBuilder {
            input_size,
            layers: Vec::new(),
            init: WeightInit::default(),
        }
    }

    /// Declare the full stack at once: `widths[0]` is the input width and each
    /// following width is one dense layer using the matching activation.
    pub fn from_widths(widths: &[usize], activations: &[Activation]) -> Result<Self> {
        if widths.len() < 2 {
            return Err(MiError::InvalidParameter {
                name: "widths".to_string(),
                reason: "Must have at least 2 layer widths".to_string(),
            });
        }

        if widths.len() - 1 != activations.len() {
            return Err(MiError::ShapeMismatch {
                expected: format!("{} activations", widths.len() - 1),
                actual: format!("{} activations", activations.len()),
            });
        }

        let mut builder = NetworkBuilder::new(widths[0]);
        for (&width, &activation) in widths[1..].iter().zip(activations) {
            builder = builder.dense(width, activation);
        }
        Ok(builder)
    }

    /// Append a dense layer of the given width
    pub fn dense(mut self, width: usize, activation: Activation) -> Self {
        self.layers.push((width, activation));
        self
    }

    pub fn with_init(mut self, init: WeightInit) -> Self {
        self.init = init;
        self
    }

    /// Initialize every layer from `rng` and return the network
    pub fn build<R: Rng + ?Sized>(self, rng: &mut R) -> Result<FeedForward> {
        if self.layers.is_empty() {
            return Err(MiError::invalid_parameter("layers", "no layers declared"));
        }

        let mut input_size = self.input_size;
        let mut layers = Vec::with_capacity(self.layers.len());
        for (width, activation) in self.layers {
            layers.push(DenseLayer::new(input_size, width, activation, self.init, rng)?);
            input_size = width;
        }
        FeedForward::from_layers(layers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_from_widths() {
        let net = NetworkBuilder::from_widths(&[6, 4, 2], &[Activation::Relu, Activation::Tanh])
            .unwrap()
            .build(&mut StdRng::seed_from_u64(0))
            .unwrap();
        assert_eq!(net.layers().len(), 2);
        assert_eq!(net.layers()[1].activation, Activation::Tanh);
        assert_eq!(net.output_size(), 2);
    }

    #[test]
    fn test_mismatched_declarations() {
        assert!(NetworkBuilder::from_widths(&[4], &[]).is_err());
        assert!(matches!(
            NetworkBuilder::from_widths(&[4, 2], &[Activation::Relu, Activation::Linear]),
            Err(MiError::ShapeMismatch { .. })
        ));
        assert!(NetworkBuilder::new(3).build(&mut StdRng::seed_from_u64(0)).is_err());
        assert!(NetworkBuilder::new(3)
            .dense(0, Activation::Relu)
            .build(&mut StdRng::seed_from_u64(0))
            .is_err());
    }
}
