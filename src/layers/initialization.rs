use ndarray::{Array1, Array2};
use rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{MiError, Result};

/// Weight initialization strategies
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub enum WeightInit {
    /// U(-1/sqrt(fan_in), 1/sqrt(fan_in)) for weights and biases, the
    /// common default for linear layers
    #[default]
    TorchDefault,

    /// Xavier/Glorot uniform initialization, zero biases
    XavierUniform,

    /// He/Kaiming normal initialization (for ReLU), zero biases
    HeNormal,

    /// Uniform distribution with custom range, zero biases
    Uniform { min: f32, max: f32 },

    /// All zeros
    Zeros,
}

impl WeightInit {
    pub fn validate(&self) -> Result<()> {
        match self {
            WeightInit::Uniform { min, max } if !(min < max) => Err(MiError::invalid_parameter(
                "weight_init".to_string(),
                format!("uniform range [{}, {}) is empty", min, max),
            )),
            _ => Ok(()),
        }
    }

    /// Initialize a `[fan_in, fan_out]` weight matrix
    pub fn initialize_weights<R: Rng + ?Sized>(
        &self,
        shape: (usize, usize),
        rng: &mut R,
    ) -> Result<Array2<f32>> {
        self.validate()?;
        let (fan_in, fan_out) = shape;
        if fan_in == 0 || fan_out == 0 {
            return Err(MiError::invalid_parameter(
                "layer_shape".to_string(),
                format!("layer dimensions must be positive, got {:?}", shape),
            ));
        }

        let weights = match self {
            WeightInit::TorchDefault => {
                let bound = 1.0 / (fan_in as f32).sqrt();
                Array2::random_using(shape, Uniform::new(-bound, bound), rng)
            }
            WeightInit::XavierUniform => {
                let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
                Array2::random_using(shape, Uniform::new(-limit, limit), rng)
            }
            WeightInit::HeNormal => {
                let std = (2.0 / fan_in as f32).sqrt();
                let normal = Normal::new(0.0, std)
                    .map_err(|e| MiError::invalid_parameter("weight_init".to_string(), e.to_string()))?;
                Array2::random_using(shape, normal, rng)
            }
            WeightInit::Uniform { min, max } => {
                Array2::random_using(shape, Uniform::new(*min, *max), rng)
            }
            WeightInit::Zeros => Array2::zeros(shape),
        };
        Ok(weights)
    }

    /// Initialize the biases of a layer with `fan_in` inputs
    pub fn initialize_biases<R: Rng + ?Sized>(
        &self,
        size: usize,
        fan_in: usize,
        rng: &mut R,
    ) -> Array1<f32> {
        match self {
            WeightInit::TorchDefault if fan_in > 0 => {
                let bound = 1.0 / (fan_in as f32).sqrt();
                Array1::random_using(size, Uniform::new(-bound, bound), rng)
            }
            _ => Array1::zeros(size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_torch_default_bounds() {
        let mut rng = StdRng::seed_from_u64(3);
        let init = WeightInit::TorchDefault;
        let weights = init.initialize_weights((16, 4), &mut rng).unwrap();
        let biases = init.initialize_biases(4, 16, &mut rng);
        for &w in weights.iter().chain(biases.iter()) {
            assert!(w.abs() <= 0.25);
        }
        assert!(biases.iter().any(|&b| b != 0.0));
    }

    #[test]
    fn test_seeded_initialization_is_reproducible() {
        let a = WeightInit::XavierUniform
            .initialize_weights((5, 3), &mut StdRng::seed_from_u64(11))
            .unwrap();
        let b = WeightInit::XavierUniform
            .initialize_weights((5, 3), &mut StdRng::seed_from_u64(11))
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_ranges_are_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        let init = WeightInit::Uniform { min: 1.0, max: 1.0 };
        assert!(init.initialize_weights((2, 2), &mut rng).is_err());
        assert!(WeightInit::Zeros.initialize_weights((0, 2), &mut rng).is_err());
    }
}
