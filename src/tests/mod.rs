pub mod test_estimators;

use ndarray::{s, Array2};
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Correlated samples: `y` is a noisy linear image of `x`, `con` is independent.
pub(crate) struct Samples {
    pub x: Array2<f32>,
    pub y: Array2<f32>,
    pub con: Array2<f32>,
}

pub(crate) fn samples(rows: usize, x_dim: usize, y_dim: usize, con_dim: usize, seed: u64) -> Samples {
    let mut rng = StdRng::seed_from_u64(seed);
    let x = Array2::<f32>::random_using((rows, x_dim), StandardNormal, &mut rng);
    let noise: Array2<f32> = Array2::<f32>::random_using((rows, y_dim), StandardNormal, &mut rng);
    let mut y = noise * 0.3;
    let shared = y_dim.min(x_dim);
    {
        let mut head = y.slice_mut(s![.., ..shared]);
        head += &(&x.slice(s![.., ..shared]) * 0.8);
    }
    let con = Array2::<f32>::random_using((rows, con_dim), StandardNormal, &mut rng);
    Samples { x, y, con }
}
