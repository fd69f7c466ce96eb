//! Variational upper bound: the KL divergence of `q(y | x)` from a standard
//! normal prior, `1/2 * mean(mu^2 + exp(logvar) - 1 - logvar)`.
//!
//! The bound only reads `y` through the learning loss; its gradient with
//! respect to `y` is zero.

use ndarray::Array2;
use rand::{Rng, RngCore};

use super::{checked_spec, finite_bound, BoundEstimate, MiEstimator, SampleGradients, Selected, SelectedGradients};
use crate::approximator::{GaussianParams, VariationalApproximator};
use crate::batch::{EstimatorDims, SampleBatch};
use crate::config::{EstimatorConfig, EstimatorKind, EstimatorSpec};
use crate::error::Result;
use crate::layers::{DenseLayer, LayerGradients};
use crate::snapshot::ParameterSnapshot;

#[derive(Debug, Clone)]
pub struct VarUb {
    dims: EstimatorDims,
    approximator: VariationalApproximator,
}

impl VarUb {
    pub fn new<R: Rng + ?Sized>(
        x_dim: usize,
        y_dim: usize,
        hidden_size: usize,
        config: EstimatorConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let spec = EstimatorSpec::new(EstimatorKind::VarUb, x_dim, y_dim, hidden_size).with_config(config);
        Self::from_spec(&spec, rng)
    }

    pub fn from_spec<R: Rng + ?Sized>(spec: &EstimatorSpec, rng: &mut R) -> Result<Self> {
        checked_spec(spec, EstimatorKind::VarUb)?;
        Ok(VarUb {
            dims: spec.dims(),
            approximator: VariationalApproximator::split(spec.x_dim, spec.y_dim, spec.hidden_size, &spec.config, rng)?,
        })
    }

    pub fn loglikeli(&mut self, batch: &SampleBatch<'_>) -> Result<f32> {
        let sel = Selected::from_batch(batch, &self.dims)?;
        self.approximator.loglikeli(sel.x.view(), sel.y.view())
    }

    fn kl_to_prior(params: &GaussianParams) -> f32 {
        let terms = &params.mu * &params.mu + params.logvar.mapv(|lv| lv.exp() - 1.0 - lv);
        terms.mean().unwrap_or(0.0) / 2.0
    }
}

impl MiEstimator for VarUb {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::VarUb
    }

    fn dims(&self) -> EstimatorDims {
        self.dims
    }

    fn estimate_bound(&mut self, batch: &SampleBatch<'_>, _rng: &mut dyn RngCore) -> Result<BoundEstimate> {
        let sel = Selected::from_batch(batch, &self.dims)?;
        let params = self.approximator.forward(sel.x.view());
        let value = finite_bound(EstimatorKind::VarUb, Self::kl_to_prior(&params))?;
        Ok(BoundEstimate { value, params: Some(params) })
    }

    fn bound_gradients(
        &mut self,
        batch: &SampleBatch<'_>,
        _rng: &mut dyn RngCore,
    ) -> Result<(BoundEstimate, SampleGradients)> {
        let sel = Selected::from_batch(batch, &self.dims)?;
        let params = self.approximator.forward(sel.x.view());
        let value = finite_bound(EstimatorKind::VarUb, Self::kl_to_prior(&params))?;

        let count = params.mu.len() as f32;
        let d_mu = &params.mu / count;
        let d_logvar = params.logvar.mapv(|lv| (lv.exp() - 1.0) / (2.0 * count));
        let (_, d_x) = self.approximator.backward(d_mu.view(), d_logvar.view())?;
        let gradients = SelectedGradients { x: d_x, y: Array2::zeros(sel.y.raw_dim()), con: None };
        Ok((BoundEstimate { value, params: Some(params) }, gradients.expand(batch, &sel.rows)))
    }

    fn learning_loss(&mut self, batch: &SampleBatch<'_>, _rng: &mut dyn RngCore) -> Result<f32> {
        Ok(-self.loglikeli(batch)?)
    }

    fn learning_gradients(
        &mut self,
        batch: &SampleBatch<'_>,
        _rng: &mut dyn RngCore,
    ) -> Result<(f32, Vec<LayerGradients>)> {
        let sel = Selected::from_batch(batch, &self.dims)?;
        self.approximator.nll_gradients(sel.x.view(), sel.y.view())
    }

    fn layers_mut(&mut self) -> Vec<&mut DenseLayer> {
        self.approximator.layers_mut()
    }

    fn snapshot(&self) -> ParameterSnapshot {
        self.approximator.snapshot()
    }
}
