//! CLUB: contrastive log-ratio upper bounds on I(X; Y).
//!
//! Both estimators fit `q(y | x)` with a [`VariationalApproximator`] and
//! contrast the log-density of each true pair with that of negative pairs.
//! [`Club`] averages over every selected `y` (N² terms); [`ClubSample`] uses
//! one shuffled partner per row.

use ndarray::Axis;
use rand::{Rng, RngCore};

use super::{
    checked_spec, finite_bound, BoundEstimate, MiEstimator, SampleGradients, Selected, SelectedGradients,
};
use crate::approximator::{GaussianParams, VariationalApproximator};
use crate::batch::{scatter_add_rows, EstimatorDims, SampleBatch};
use crate::config::{EstimatorConfig, EstimatorKind, EstimatorSpec};
use crate::error::{MiError, Result};
use crate::layers::{DenseLayer, LayerGradients};
use crate::sampling::Pairing;
use crate::snapshot::ParameterSnapshot;

struct Evaluation {
    value: f32,
    params: GaussianParams,
    gradients: Option<SelectedGradients>,
}

/// Full pairwise CLUB.
#[derive(Debug, Clone)]
pub struct Club {
    dims: EstimatorDims,
    approximator: VariationalApproximator,
}

impl Club {
    pub fn new<R: Rng + ?Sized>(
        x_dim: usize,
        y_dim: usize,
        hidden_size: usize,
        config: EstimatorConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let spec = EstimatorSpec::new(EstimatorKind::Club, x_dim, y_dim, hidden_size).with_config(config);
        Self::from_spec(&spec, rng)
    }

    pub fn from_spec<R: Rng + ?Sized>(spec: &EstimatorSpec, rng: &mut R) -> Result<Self> {
        checked_spec(spec, EstimatorKind::Club)?;
        Ok(Club {
            dims: spec.dims(),
            approximator: VariationalApproximator::split(spec.x_dim, spec.y_dim, spec.hidden_size, &spec.config, rng)?,
        })
    }

    pub fn approximator(&self) -> &VariationalApproximator {
        &self.approximator
    }

    /// Log-likelihood of the selected true pairs under `q(y | x)`.
    pub fn loglikeli(&mut self, batch: &SampleBatch<'_>) -> Result<f32> {
        let sel = Selected::from_batch(batch, &self.dims)?;
        self.approximator.loglikeli(sel.x.view(), sel.y.view())
    }

    fn evaluate(&mut self, sel: &Selected, with_gradients: bool) -> Result<Evaluation> {
        let n = sel.len() as f32;
        let params = self.approximator.forward(sel.x.view());
        let precision = params.precision();
        let diff = &params.mu - &sel.y;
        let sq = &diff * &diff;

        // mean_j (y_j - mu_i)^2 = var(y) + (mu_i - mean(y))^2
        let y_mean = sel.y.mean_axis(Axis(0)).ok_or_else(|| MiError::InvalidMask("empty selection".to_string()))?;
        let y_centered = &sel.y - &y_mean;
        let y_var = (&y_centered * &y_centered).mean_axis(Axis(0)).ok_or_else(|| MiError::InvalidMask("empty selection".to_string()))?;
        let mu_centered = &params.mu - &y_mean;
        let pairwise_sq = &(&mu_centered * &mu_centered) + &y_var;

        let positive = -(&sq * &precision) / 2.0;
        let negative = -(&pairwise_sq * &precision) / 2.0;
        let value = finite_bound(EstimatorKind::Club, (&positive - &negative).sum() / n)?;

        let gradients = if with_gradients {
            let d_mu = &y_centered * &precision / n;
            let d_logvar = (&sq - &pairwise_sq) * &precision / (2.0 * n);
            let (_, d_x) = self.approximator.backward(d_mu.view(), d_logvar.view())?;

            // sum_i (y_k - mu_i) / var_i, per dimension
            let precision_sum = precision.sum_axis(Axis(0));
            let weighted_mu_sum = (&params.mu * &precision).sum_axis(Axis(0));
            let pairwise = (&sel.y * &precision_sum - &weighted_mu_sum) / n;
            let d_y = (&diff * &precision + pairwise) / n;
            Some(SelectedGradients { x: d_x, y: d_y, con: None })
        } else {
            None
        };

        Ok(Evaluation { value, params, gradients })
    }
}

impl MiEstimator for Club {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Club
    }

    fn dims(&self) -> EstimatorDims {
        self.dims
    }

    fn estimate_bound(&mut self, batch: &SampleBatch<'_>, _rng: &mut dyn RngCore) -> Result<BoundEstimate> {
        let sel = Selected::from_batch(batch, &self.dims)?;
        let eval = self.evaluate(&sel, false)?;
        Ok(BoundEstimate { value: eval.value, params: Some(eval.params) })
    }

    fn bound_gradients(
        &mut self,
        batch: &SampleBatch<'_>,
        _rng: &mut dyn RngCore,
    ) -> Result<(BoundEstimate, SampleGradients)> {
        let sel = Selected::from_batch(batch, &self.dims)?;
        let eval = self.evaluate(&sel, true)?;
        let gradients = eval.gradients.map(|g| g.expand(batch, &sel.rows)).unwrap_or_else(|| SampleGradients::zeros(batch));
        Ok((BoundEstimate { value: eval.value, params: Some(eval.params) }, gradients))
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

/// Sampled CLUB: each selected row is contrasted with one shuffled partner
/// from the same mask.
#[derive(Debug, Clone)]
pub struct ClubSample {
    dims: EstimatorDims,
    approximator: VariationalApproximator,
}

impl ClubSample {
    pub fn new<R: Rng + ?Sized>(
        x_dim: usize,
        y_dim: usize,
        hidden_size: usize,
        config: EstimatorConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let spec = EstimatorSpec::new(EstimatorKind::ClubSample, x_dim, y_dim, hidden_size).with_config(config);
        Self::from_spec(&spec, rng)
    }

    pub fn from_spec<R: Rng + ?Sized>(spec: &EstimatorSpec, rng: &mut R) -> Result<Self> {
        checked_spec(spec, EstimatorKind::ClubSample)?;
        Ok(ClubSample {
            dims: spec.dims(),
            approximator: VariationalApproximator::split(spec.x_dim, spec.y_dim, spec.hidden_size, &spec.config, rng)?,
        })
    }

    pub fn approximator(&self) -> &VariationalApproximator {
        &self.approximator
    }

    pub fn loglikeli(&mut self, batch: &SampleBatch<'_>) -> Result<f32> {
        let sel = Selected::from_batch(batch, &self.dims)?;
        self.approximator.loglikeli(sel.x.view(), sel.y.view())
    }

    /// Bound for an explicit negative pairing over the mask-selected rows.
    pub fn estimate_bound_with_pairing(&mut self, batch: &SampleBatch<'_>, pairing: &Pairing) -> Result<BoundEstimate> {
        let sel = Selected::from_batch(batch, &self.dims)?;
        check_anchors(&sel, pairing)?;
        let eval = self.evaluate(&sel, pairing, false)?;
        Ok(BoundEstimate { value: eval.value, params: Some(eval.params) })
    }

    fn evaluate(&mut self, sel: &Selected, pairing: &Pairing, with_gradients: bool) -> Result<Evaluation> {
        let n = sel.len() as f32;
        let params = self.approximator.forward(sel.x.view());
        let precision = params.precision();
        let y_negative = sel.y.select(Axis(0), pairing.partner_positions());

        let diff_pos = &params.mu - &sel.y;
        let diff_neg = &params.mu - &y_negative;
        let positive = -(&diff_pos * &diff_pos) * &precision;
        let negative = -(&diff_neg * &diff_neg) * &precision;
        let value = finite_bound(EstimatorKind::ClubSample, (&positive - &negative).sum() / n / 2.0)?;

        let gradients = if with_gradients {
            let scale = 1.0 / (2.0 * n);
            let d_mu = (&sel.y - &y_negative) * &precision * (2.0 * scale);
            let d_logvar = (&negative - &positive) * scale;
            let (_, d_x) = self.approximator.backward(d_mu.view(), d_logvar.view())?;

            let mut d_y = &diff_pos * &precision * (2.0 * scale);
            let d_y_negative = &diff_neg * &precision * (-2.0 * scale);
            scatter_add_rows(&mut d_y, pairing.partner_positions(), d_y_negative.view());
            Some(SelectedGradients { x: d_x, y: d_y, con: None })
        } else {
            None
        };

        Ok(Evaluation { value, params, gradients })
    }
}

/// The pairing must cover exactly the rows the mask selects.
pub(crate) fn check_anchors(sel: &Selected, pairing: &Pairing) -> Result<()> {
    if pairing.anchors() != sel.rows.as_slice() {
        return Err(MiError::InvalidMask(format!(
            "pairing covers rows {:?} but the mask selects {:?}",
            pairing.anchors(),
            sel.rows
        )));
    }
    Ok(())
}

impl MiEstimator for ClubSample {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::ClubSample
    }

    fn dims(&self) -> EstimatorDims {
        self.dims
    }

    fn estimate_bound(&mut self, batch: &SampleBatch<'_>, rng: &mut dyn RngCore) -> Result<BoundEstimate> {
        let sel = Selected::from_batch(batch, &self.dims)?;
        let pairing = Pairing::shuffled(&sel.rows, rng)?;
        let eval = self.evaluate(&sel, &pairing, false)?;
        Ok(BoundEstimate { value: eval.value, params: Some(eval.params) })
    }

    fn bound_gradients(
        &mut self,
        batch: &SampleBatch<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<(BoundEstimate, SampleGradients)> {
        let sel = Selected::from_batch(batch, &self.dims)?;
        let pairing = Pairing::shuffled(&sel.rows, rng)?;
        let eval = self.evaluate(&sel, &pairing, true)?;
        let gradients = eval.gradients.map(|g| g.expand(batch, &sel.rows)).unwrap_or_else(|| SampleGradients::zeros(batch));
        Ok((BoundEstimate { value: eval.value, params: Some(eval.params) }, gradients))
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
