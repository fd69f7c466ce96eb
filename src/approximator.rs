//! # Variational Approximator
//!
//! Maps an input row (optionally `x` concatenated with a conditioning row) to
//! the mean and log-variance of a diagonal Gaussian `q(y | x)`.
//!
//! Two layouts exist. `Split` uses one small network per output, the
//! log-variance head ending in `tanh`. `Joint` uses a single encoder whose
//! output is cut into a mean half and a log-variance half; its parameters can
//! be overwritten from a snapshot of an externally trained encoder.

use ndarray::{concatenate, s, Array1, Array2, ArrayView2, Axis};
use rand::Rng;

use crate::activations::Activation;
use crate::builders::NetworkBuilder;
use crate::config::EstimatorConfig;
use crate::error::{MiError, Result};
use crate::layers::{DenseLayer, LayerGradients};
use crate::network::FeedForward;
use crate::numerics::{ensure_finite, soft_clamp};
use crate::snapshot::ParameterSnapshot;

const JOINT_LEAKY_SLOPE: f32 = 0.01;

/// Per-row Gaussian parameters, shape `[rows, y_dim]` each.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianParams {
    pub mu: Array2<f32>,
    pub logvar: Array2<f32>,
}

impl GaussianParams {
    pub fn rows(&self) -> usize {
        self.mu.nrows()
    }

    /// `exp(-logvar)`
    pub fn precision(&self) -> Array2<f32> {
        self.logvar.mapv(|lv| (-lv).exp())
    }

    /// Unnormalized log-likelihood of `targets`:
    /// `mean_rows(sum_dims(-(mu - y)^2 / exp(logvar) - logvar))`.
    pub fn loglikeli(&self, targets: ArrayView2<f32>) -> f32 {
        let diff = &self.mu - &targets;
        let terms = -(&diff * &diff) * &self.precision() - &self.logvar;
        terms.sum() / self.rows() as f32
    }

    /// d(-loglikeli)/d mu and d(-loglikeli)/d logvar.
    pub fn nll_output_errors(&self, targets: ArrayView2<f32>) -> (Array2<f32>, Array2<f32>) {
        let n = self.rows() as f32;
        let precision = self.precision();
        let diff = &self.mu - &targets;
        let d_mu = &diff * &precision * (2.0 / n);
        let d_logvar = (1.0 - &(&diff * &diff * &precision)) / n;
        (d_mu, d_logvar)
    }
}

#[derive(Debug, Clone)]
enum Heads {
    Split { mu: FeedForward, logvar: FeedForward },
    Joint(FeedForward),
}

#[derive(Debug, Clone)]
pub struct VariationalApproximator {
    heads: Heads,
    input_dim: usize,
    y_dim: usize,
    soft_plus: bool,
    min_logvar: Array1<f32>,
    max_logvar: Array1<f32>,
    clamp_derivative: Option<Array2<f32>>,
}

impl VariationalApproximator {
    /// Separate mean and log-variance networks, each `input -> hidden/2 -> y_dim`.
    pub fn split<R: Rng + ?Sized>(
        input_dim: usize,
        y_dim: usize,
        hidden_size: usize,
        config: &EstimatorConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let half = hidden_size / 2;
        let mu = NetworkBuilder::new(input_dim)
            .dense(half, Activation::Relu)
            .dense(y_dim, Activation::Linear)
            .with_init(config.weight_init)
            .build(rng)?;
        let logvar = NetworkBuilder::new(input_dim)
            .dense(half, Activation::Relu)
            .dense(y_dim, Activation::Tanh)
            .with_init(config.weight_init)
            .build(rng)?;
        Ok(Self::with_heads(Heads::Split { mu, logvar }, input_dim, y_dim, config))
    }

    /// One encoder `input -> hidden -> 2 * y_dim` whose output halves are mean and log-variance.
    pub fn joint<R: Rng + ?Sized>(
        input_dim: usize,
        y_dim: usize,
        hidden_size: usize,
        config: &EstimatorConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let encoder = NetworkBuilder::new(input_dim)
            .dense(hidden_size, Activation::LeakyRelu { alpha: JOINT_LEAKY_SLOPE })
            .dense(2 * y_dim, Activation::Linear)
            .with_init(config.weight_init)
            .build(rng)?;
        Ok(Self::with_heads(Heads::Joint(encoder), input_dim, y_dim, config))
    }

    fn with_heads(heads: Heads, input_dim: usize, y_dim: usize, config: &EstimatorConfig) -> Self {
        VariationalApproximator {
            heads,
            input_dim,
            y_dim,
            soft_plus: config.soft_plus,
            min_logvar: Array1::from_elem(y_dim, config.min_logvar),
            max_logvar: Array1::from_elem(y_dim, config.max_logvar),
            clamp_derivative: None,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn y_dim(&self) -> usize {
        self.y_dim
    }

    pub fn forward(&mut self, inputs: ArrayView2<f32>) -> GaussianParams {
        let (mu, raw_logvar) = match &mut self.heads {
            Heads::Split { mu, logvar } => (mu.forward(inputs), logvar.forward(inputs)),
            Heads::Joint(encoder) => {
                let out = encoder.forward(inputs);
                let y_dim = self.y_dim;
                (
                    out.slice(s![.., ..y_dim]).to_owned(),
                    out.slice(s![.., y_dim..]).to_owned(),
                )
            }
        };

        let logvar = if self.soft_plus {
            let (clamped, derivative) = soft_clamp(&raw_logvar, &self.min_logvar, &self.max_logvar);
            self.clamp_derivative = Some(derivative);
            clamped
        } else {
            raw_logvar
        };
        GaussianParams { mu, logvar }
    }

    /// Backpropagate errors on the outputs of the last [`forward`](Self::forward).
    ///
    /// Gradients come back in [`layers_mut`](Self::layers_mut) order, followed
    /// by dL/d input.
    pub fn backward(
        &self,
        d_mu: ArrayView2<f32>,
        d_logvar: ArrayView2<f32>,
    ) -> Result<(Vec<LayerGradients>, Array2<f32>)> {
        let d_raw_logvar = if self.soft_plus {
            let derivative = self.clamp_derivative.as_ref().ok_or_else(|| {
                MiError::invalid_parameter("approximator", "forward() must be called before backward()")
            })?;
            if derivative.dim() != d_logvar.dim() {
                return Err(MiError::shape_mismatch(
                    format!("{:?}", derivative.dim()),
                    format!("{:?}", d_logvar.dim()),
                ));
            }
            &d_logvar * derivative
        } else {
            d_logvar.to_owned()
        };

        match &self.heads {
            Heads::Split { mu, logvar } => {
                let (mut gradients, input_mu) = mu.backward(d_mu)?;
                let (logvar_gradients, input_logvar) = logvar.backward(d_raw_logvar.view())?;
                gradients.extend(logvar_gradients);
                Ok((gradients, input_mu + input_logvar))
            }
            Heads::Joint(encoder) => {
                let output_errors = concatenate(Axis(1), &[d_mu.view(), d_raw_logvar.view()])
                    .map_err(|e| MiError::shape_mismatch(format!("{} columns", 2 * self.y_dim), e.to_string()))?;
                encoder.backward(output_errors.view())
            }
        }
    }

    pub fn loglikeli(&mut self, inputs: ArrayView2<f32>, targets: ArrayView2<f32>) -> Result<f32> {
        ensure_finite("log-likelihood", self.forward(inputs).loglikeli(targets))
    }

    /// `-loglikeli` and its gradient with respect to every parameter.
    pub fn nll_gradients(
        &mut self,
        inputs: ArrayView2<f32>,
        targets: ArrayView2<f32>,
    ) -> Result<(f32, Vec<LayerGradients>)> {
        let params = self.forward(inputs);
        // An overflowing loss must never reach the optimizer
        let loss = ensure_finite("negative log-likelihood", -params.loglikeli(targets))?;
        let (d_mu, d_logvar) = params.nll_output_errors(targets);
        let (gradients, _) = self.backward(d_mu.view(), d_logvar.view())?;
        Ok((loss, gradients))
    }

    pub fn layers_mut(&mut self) -> Vec<&mut DenseLayer> {
        match &mut self.heads {
            Heads::Split { mu, logvar } => mu.layers_mut().chain(logvar.layers_mut()).collect(),
            Heads::Joint(encoder) => encoder.layers_mut().collect(),
        }
    }

    /// Parameters as `p_mu.*` / `p_logvar.*` (split) or `encoder.*` (joint).
    pub fn snapshot(&self) -> ParameterSnapshot {
        match &self.heads {
            Heads::Split { mu, logvar } => {
                let mut snapshot = mu.snapshot("p_mu");
                snapshot.extend(logvar.snapshot("p_logvar"));
                snapshot
            }
            Heads::Joint(encoder) => encoder.snapshot("encoder"),
        }
    }

    /// Replace all parameters from a snapshot laid out like [`snapshot`](Self::snapshot).
    pub fn load_snapshot(&mut self, snapshot: &ParameterSnapshot) -> Result<()> {
        match &mut self.heads {
            Heads::Split { mu, logvar } => {
                // Stage on copies so a bad logvar head cannot leave a half-updated mean head
                let mut new_mu = mu.clone();
                let mut new_logvar = logvar.clone();
                new_mu.load_snapshot("p_mu", snapshot)?;
                new_logvar.load_snapshot("p_logvar", snapshot)?;
                *mu = new_mu;
                *logvar = new_logvar;
                Ok(())
            }
            Heads::Joint(encoder) => encoder.load_snapshot("encoder", snapshot),
        }
    }
}
