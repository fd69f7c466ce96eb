//! Conditioned sampled CLUB: an upper bound on I(X; Y | C).
//!
//! `q(y | x, c)` is fitted on the concatenation `[x, c]`. Negative samples
//! replace exactly one of the two factors by a shuffled row from the same
//! mask: `x` when `random_is_x` is set, otherwise `c` (and then the target
//! `y` follows the shuffled row).

use ndarray::{concatenate, s, Array2, ArrayView2, Axis};
use rand::{Rng, RngCore};

use super::club::check_anchors;
use super::{checked_spec, finite_bound, BoundEstimate, MiEstimator, SampleGradients, Selected, SelectedGradients};
use crate::approximator::{GaussianParams, VariationalApproximator};
use crate::batch::{scatter_add_rows, EstimatorDims, SampleBatch};
use crate::config::{EstimatorConfig, EstimatorKind, EstimatorSpec};
use crate::error::{MiError, Result};
use crate::layers::{DenseLayer, LayerGradients};
use crate::sampling::Pairing;
use crate::snapshot::ParameterSnapshot;

fn join_columns(left: ArrayView2<f32>, right: ArrayView2<f32>) -> Result<Array2<f32>> {
    concatenate(Axis(1), &[left.view(), right.view()]).map_err(|e| MiError::shape_mismatch("equal row counts".to_string(), e.to_string()))
}

/// `-(mu - y)^2 / var - logvar` per element
fn log_density_terms(params: &GaussianParams, targets: &Array2<f32>) -> Array2<f32> {
    let diff = &params.mu - targets;
    -(&diff * &diff) * &params.precision() - &params.logvar
}

/// Shared core of the conditioned estimators.
#[derive(Debug, Clone)]
struct ConditionalClub {
    kind: EstimatorKind,
    dims: EstimatorDims,
    random_is_x: bool,
    approximator: VariationalApproximator,
}

impl ConditionalClub {
    fn con(sel: &Selected) -> Result<&Array2<f32>> {
        sel.con.as_ref().ok_or(MiError::MissingConditioning)
    }

    fn loglikeli(&mut self, batch: &SampleBatch<'_>) -> Result<f32> {
        let sel = Selected::from_batch(batch, &self.dims)?;
        let inputs = join_columns(sel.x.view(), Self::con(&sel)?.view())?;
        self.approximator.loglikeli(inputs.view(), sel.y.view())
    }

    fn nll_gradients(&mut self, batch: &SampleBatch<'_>) -> Result<(f32, Vec<LayerGradients>)> {
        let sel = Selected::from_batch(batch, &self.dims)?;
        let inputs = join_columns(sel.x.view(), Self::con(&sel)?.view())?;
        self.approximator.nll_gradients(inputs.view(), sel.y.view())
    }

    fn evaluate(
        &mut self,
        sel: &Selected,
        pairing: &Pairing,
        with_gradients: bool,
    ) -> Result<(BoundEstimate, Option<SelectedGradients>)> {
        let m = sel.len();
        let n = m as f32;
        let con = Self::con(sel)?;
        let partners = pairing.partner_positions();
        let identity = pairing.is_identity();

        let positive_inputs = join_columns(sel.x.view(), con.view())?;
        let (negative_inputs, negative_targets) = if self.random_is_x {
            (join_columns(sel.x.select(Axis(0), partners).view(), con.view())?, sel.y.clone())
        } else {
            (
                join_columns(sel.x.view(), con.select(Axis(0), partners).view())?,
                sel.y.select(Axis(0), partners),
            )
        };

        // An identity pairing reuses the positive pass so the bound is exactly zero
        let negative_offset = if identity { 0 } else { m };
        let stacked = if identity {
            positive_inputs
        } else {
            concatenate(Axis(0), &[positive_inputs.view(), negative_inputs.view()])
                .map_err(|e| MiError::shape_mismatch("matching input widths".to_string(), e.to_string()))?
        };
        let all = self.approximator.forward(stacked.view());
        let rows = |offset: usize| GaussianParams {
            mu: all.mu.slice(s![offset..offset + m, ..]).to_owned(),
            logvar: all.logvar.slice(s![offset..offset + m, ..]).to_owned(),
        };
        let positive_params = rows(0);
        let negative_params = rows(negative_offset);

        let positive = log_density_terms(&positive_params, &sel.y);
        let negative = log_density_terms(&negative_params, &negative_targets);
        let value = finite_bound(self.kind, (&positive - &negative).sum() / n / 2.0)?;
        let estimate = BoundEstimate { value, params: Some(positive_params.clone()) };
        if !with_gradients {
            return Ok((estimate, None));
        }

        let scale = 1.0 / (2.0 * n);
        let pos_diff = &positive_params.mu - &sel.y;
        let pos_precision = positive_params.precision();
        let neg_diff = &negative_params.mu - &negative_targets;
        let neg_precision = negative_params.precision();

        let mut d_mu = Array2::zeros(all.mu.raw_dim());
        let mut d_logvar = Array2::zeros(all.logvar.raw_dim());
        {
            let mut head = d_mu.slice_mut(s![0..m, ..]);
            head -= &(&pos_diff * &pos_precision * (2.0 * scale));
            let mut head = d_logvar.slice_mut(s![0..m, ..]);
            head += &((&pos_diff * &pos_diff * &pos_precision - 1.0) * scale);
            let mut tail = d_mu.slice_mut(s![negative_offset..negative_offset + m, ..]);
            tail += &(&neg_diff * &neg_precision * (2.0 * scale));
            let mut tail = d_logvar.slice_mut(s![negative_offset..negative_offset + m, ..]);
            tail -= &((&neg_diff * &neg_diff * &neg_precision - 1.0) * scale);
        }
        let (_, d_inputs) = self.approximator.backward(d_mu.view(), d_logvar.view())?;

        let x_dim = self.dims.x_dim;
        let mut d_x = Array2::zeros(sel.x.raw_dim());
        let mut d_con = Array2::zeros(con.raw_dim());
        let own: Vec<usize> = (0..m).collect();
        scatter_add_rows(&mut d_x, &own, d_inputs.slice(s![0..m, ..x_dim]));
        scatter_add_rows(&mut d_con, &own, d_inputs.slice(s![0..m, x_dim..]));
        if !identity {
            let negative_rows = d_inputs.slice(s![m..2 * m, ..]);
            let (x_rows, con_rows) = if self.random_is_x { (partners, own.as_slice()) } else { (own.as_slice(), partners) };
            scatter_add_rows(&mut d_x, x_rows, negative_rows.slice(s![.., ..x_dim]));
            scatter_add_rows(&mut d_con, con_rows, negative_rows.slice(s![.., x_dim..]));
        }

        let mut d_y = &pos_diff * &pos_precision * (2.0 * scale);
        let d_negative_targets = &neg_diff * &neg_precision * (-2.0 * scale);
        let target_rows = if self.random_is_x { own.as_slice() } else { partners };
        scatter_add_rows(&mut d_y, target_rows, d_negative_targets.view());

        Ok((estimate, Some(SelectedGradients { x: d_x, y: d_y, con: Some(d_con) })))
    }

    fn estimate(&mut self, batch: &SampleBatch<'_>, rng: &mut dyn RngCore) -> Result<BoundEstimate> {
        let sel = Selected::from_batch(batch, &self.dims)?;
        let pairing = Pairing::shuffled(&sel.rows, rng)?;
        Ok(self.evaluate(&sel, &pairing, false)?.0)
    }

    fn estimate_with_pairing(&mut self, batch: &SampleBatch<'_>, pairing: &Pairing) -> Result<BoundEstimate> {
        let sel = Selected::from_batch(batch, &self.dims)?;
        check_anchors(&sel, pairing)?;
        Ok(self.evaluate(&sel, pairing, false)?.0)
    }

    fn gradients(&mut self, batch: &SampleBatch<'_>, rng: &mut dyn RngCore) -> Result<(BoundEstimate, SampleGradients)> {
        let sel = Selected::from_batch(batch, &self.dims)?;
        let pairing = Pairing::shuffled(&sel.rows, rng)?;
        let (estimate, gradients) = self.evaluate(&sel, &pairing, true)?;
        let gradients = match gradients {
            Some(g) => g.expand(batch, &sel.rows),
            None => SampleGradients::zeros(batch),
        };
        Ok((estimate, gradients))
    }
}

/// Conditioned sampled CLUB with an independently trained approximator.
#[derive(Debug, Clone)]
pub struct ConClubSample {
    core: ConditionalClub,
}

impl ConClubSample {
    pub fn new<R: Rng + ?Sized>(
        x_dim: usize,
        y_dim: usize,
        con_dim: usize,
        hidden_size: usize,
        config: EstimatorConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let spec = EstimatorSpec::new(EstimatorKind::ConClubSample, x_dim, y_dim, hidden_size)
            .with_con_dim(con_dim)
            .with_config(config);
        Self::from_spec(&spec, rng)
    }

    pub fn from_spec<R: Rng + ?Sized>(spec: &EstimatorSpec, rng: &mut R) -> Result<Self> {
        checked_spec(spec, EstimatorKind::ConClubSample)?;
        let dims = spec.dims();
        let approximator =
            VariationalApproximator::split(dims.input_dim(), spec.y_dim, spec.hidden_size, &spec.config, rng)?;
        Ok(ConClubSample {
            core: ConditionalClub {
                kind: EstimatorKind::ConClubSample,
                dims,
                random_is_x: spec.config.random_is_x,
                approximator,
            },
        })
    }

    pub fn random_is_x(&self) -> bool {
        self.core.random_is_x
    }

    pub fn loglikeli(&mut self, batch: &SampleBatch<'_>) -> Result<f32> {
        self.core.loglikeli(batch)
    }

    pub fn estimate_bound_with_pairing(&mut self, batch: &SampleBatch<'_>, pairing: &Pairing) -> Result<BoundEstimate> {
        self.core.estimate_with_pairing(batch, pairing)
    }
}

impl MiEstimator for ConClubSample {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::ConClubSample
    }

    fn dims(&self) -> EstimatorDims {
        self.core.dims
    }

    fn estimate_bound(&mut self, batch: &SampleBatch<'_>, rng: &mut dyn RngCore) -> Result<BoundEstimate> {
        self.core.estimate(batch, rng)
    }

    fn bound_gradients(
        &mut self,
        batch: &SampleBatch<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<(BoundEstimate, SampleGradients)> {
        self.core.gradients(batch, rng)
    }

    fn learning_loss(&mut self, batch: &SampleBatch<'_>, _rng: &mut dyn RngCore) -> Result<f32> {
        Ok(-self.core.loglikeli(batch)?)
    }

    fn learning_gradients(
        &mut self,
        batch: &SampleBatch<'_>,
        _rng: &mut dyn RngCore,
    ) -> Result<(f32, Vec<LayerGradients>)> {
        self.core.nll_gradients(batch)
    }

    fn layers_mut(&mut self) -> Vec<&mut DenseLayer> {
        self.core.approximator.layers_mut()
    }

    fn snapshot(&self) -> ParameterSnapshot {
        self.core.approximator.snapshot()
    }
}

/// Conditioned sampled CLUB whose encoder tracks a separately trained one.
///
/// The encoder is never fitted here: its learning loss is reported detached
/// (no parameter gradients) and its weights only change through
/// [`synchronize_parameters`](Self::synchronize_parameters).
#[derive(Debug, Clone)]
pub struct SyncedConClubSample {
    core: ConditionalClub,
}

impl SyncedConClubSample {
    pub fn new<R: Rng + ?Sized>(
        x_dim: usize,
        y_dim: usize,
        con_dim: usize,
        hidden_size: usize,
        config: EstimatorConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let spec = EstimatorSpec::new(EstimatorKind::SyncedConClubSample, x_dim, y_dim, hidden_size)
            .with_con_dim(con_dim)
            .with_config(config);
        Self::from_spec(&spec, rng)
    }

    pub fn from_spec<R: Rng + ?Sized>(spec: &EstimatorSpec, rng: &mut R) -> Result<Self> {
        checked_spec(spec, EstimatorKind::SyncedConClubSample)?;
        let dims = spec.dims();
        let approximator =
            VariationalApproximator::joint(dims.input_dim(), spec.y_dim, spec.hidden_size, &spec.config, rng)?;
        Ok(SyncedConClubSample {
            core: ConditionalClub {
                kind: EstimatorKind::SyncedConClubSample,
                dims,
                random_is_x: spec.config.random_is_x,
                approximator,
            },
        })
    }

    /// Replace the encoder with the external encoder's current parameters.
    ///
    /// The snapshot must hold `encoder.0` and `encoder.1` with matching
    /// shapes; on error nothing is changed.
    pub fn synchronize_parameters(&mut self, external_state: &ParameterSnapshot) -> Result<()> {
        match self.core.approximator.load_snapshot(external_state) {
            Ok(()) => {
                log::info!("synchronized encoder from external snapshot ({} layers)", external_state.len());
                Ok(())
            }
            Err(e) => {
                log::warn!("rejected external encoder snapshot: {}", e);
                Err(e)
            }
        }
    }

    pub fn loglikeli(&mut self, batch: &SampleBatch<'_>) -> Result<f32> {
        self.core.loglikeli(batch)
    }

    pub fn estimate_bound_with_pairing(&mut self, batch: &SampleBatch<'_>, pairing: &Pairing) -> Result<BoundEstimate> {
        self.core.estimate_with_pairing(batch, pairing)
    }
}

impl MiEstimator for SyncedConClubSample {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::SyncedConClubSample
    }

    fn dims(&self) -> EstimatorDims {
        self.core.dims
    }

    fn estimate_bound(&mut self, batch: &SampleBatch<'_>, rng: &mut dyn RngCore) -> Result<BoundEstimate> {
        self.core.estimate(batch, rng)
    }

    fn bound_gradients(
        &mut self,
        batch: &SampleBatch<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<(BoundEstimate, SampleGradients)> {
        self.core.gradients(batch, rng)
    }

    fn learning_loss(&mut self, batch: &SampleBatch<'_>, _rng: &mut dyn RngCore) -> Result<f32> {
        Ok(-self.core.loglikeli(batch)?)
    }

    /// Detached: the loss is reported but carries no parameter gradient.
    fn learning_gradients(
        &mut self,
        batch: &SampleBatch<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<(f32, Vec<LayerGradients>)> {
        Ok((self.learning_loss(batch, rng)?, Vec::new()))
    }

    fn layers_mut(&mut self) -> Vec<&mut DenseLayer> {
        Vec::new()
    }

    fn snapshot(&self) -> ParameterSnapshot {
        self.core.approximator.snapshot()
    }
}
