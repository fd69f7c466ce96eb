//! Critic-based lower bounds on I(X; Y): MINE, NWJ and InfoNCE.
//!
//! Each estimator learns a scalar critic `F(x, y)` on concatenated pairs.
//! The bound is a contrast between critic scores on true pairs and on
//! mismatched pairs; the learning loss is the negated bound, so fitting the
//! critic tightens the bound.

use ndarray::{concatenate, s, Array1, Array2, Axis};
use rand::{Rng, RngCore};

use super::club::check_anchors;
use super::{checked_spec, finite_bound, BoundEstimate, MiEstimator, SampleGradients, Selected, SelectedGradients};
use crate::activations::Activation;
use crate::batch::{scatter_add_rows, EstimatorDims, SampleBatch};
use crate::builders::NetworkBuilder;
use crate::config::{EstimatorConfig, EstimatorKind, EstimatorSpec};
use crate::error::{MiError, Result};
use crate::layers::{DenseLayer, LayerGradients};
use crate::network::FeedForward;
use crate::numerics::{log_sum_exp, log_sum_exp_axis, softmax_axis};
use crate::sampling::Pairing;
use crate::snapshot::ParameterSnapshot;

const CRITIC_PREFIX: &str = "critic";

/// Scalar critic over `[x, y]` rows, scored in one stacked pass.
#[derive(Debug, Clone)]
struct Critic {
    network: FeedForward,
    x_dim: usize,
}

/// Result of one critic evaluation with optional gradients.
struct Scored {
    value: f32,
    parameters: Vec<LayerGradients>,
    inputs: Option<SelectedGradients>,
}

impl Critic {
    fn new<R: Rng + ?Sized>(spec: &EstimatorSpec, output: Activation, rng: &mut R) -> Result<Self> {
        let network = NetworkBuilder::new(spec.x_dim + spec.y_dim)
            .dense(spec.hidden_size, Activation::Relu)
            .dense(1, output)
            .with_init(spec.config.weight_init)
            .build(rng)?;
        Ok(Critic { network, x_dim: spec.x_dim })
    }

    /// `F(x[xs[k]], y[ys[k]])` for every k.
    fn score(&mut self, sel: &Selected, xs: &[usize], ys: &[usize]) -> Result<Array1<f32>> {
        let inputs = concatenate(Axis(1), &[sel.x.select(Axis(0), xs).view(), sel.y.select(Axis(0), ys).view()])
            .map_err(|e| MiError::shape_mismatch("one y row per x row".to_string(), e.to_string()))?;
        let scores = self.network.forward(inputs.view());
        Ok(scores.column(0).to_owned())
    }

    /// Backpropagate `d_scores` from the last [`score`](Self::score) call,
    /// accumulating input gradients into the selected rows.
    fn backward(&self, sel: &Selected, xs: &[usize], ys: &[usize], d_scores: Array1<f32>) -> Result<(Vec<LayerGradients>, SelectedGradients)> {
        let rows = d_scores.len();
        let output_errors = d_scores
            .into_shape((rows, 1))
            .map_err(|e| MiError::shape_mismatch(format!("{} scores", rows), e.to_string()))?;
        let (parameters, d_inputs) = self.network.backward(output_errors.view())?;
        let mut d_x = Array2::zeros(sel.x.raw_dim());
        let mut d_y = Array2::zeros(sel.y.raw_dim());
        scatter_add_rows(&mut d_x, xs, d_inputs.slice(s![.., ..self.x_dim]));
        scatter_add_rows(&mut d_y, ys, d_inputs.slice(s![.., self.x_dim..]));
        Ok((parameters, SelectedGradients { x: d_x, y: d_y, con: None }))
    }

    /// Score matrix `S[i, j] = F(x_j, y_i)` together with the pair indices.
    fn score_matrix(&mut self, sel: &Selected) -> Result<(Array2<f32>, Vec<usize>, Vec<usize>)> {
        let m = sel.len();
        let xs: Vec<usize> = (0..m * m).map(|k| k % m).collect();
        let ys: Vec<usize> = (0..m * m).map(|k| k / m).collect();
        let flat = self.score(sel, &xs, &ys)?;
        let matrix = flat
            .into_shape((m, m))
            .map_err(|e| MiError::shape_mismatch(format!("{}x{} scores", m, m), e.to_string()))?;
        Ok((matrix, xs, ys))
    }

    fn layers_mut(&mut self) -> Vec<&mut DenseLayer> {
        self.network.layers_mut().collect()
    }

    fn snapshot(&self) -> ParameterSnapshot {
        self.network.snapshot(CRITIC_PREFIX)
    }
}

fn negate(gradients: Vec<LayerGradients>) -> Vec<LayerGradients> {
    gradients.into_iter().map(LayerGradients::negated).collect()
}

/// MINE: `mean(T0) - log(mean(exp(T1)))` with marginal pairs drawn with
/// replacement.
///
/// The estimate is not bias-corrected; the log-mean-exp goes through the
/// stable log-sum-exp so large critic scores do not overflow.
#[derive(Debug, Clone)]
pub struct Mine {
    dims: EstimatorDims,
    critic: Critic,
}

impl Mine {
    pub fn new<R: Rng + ?Sized>(
        x_dim: usize,
        y_dim: usize,
        hidden_size: usize,
        config: EstimatorConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let spec = EstimatorSpec::new(EstimatorKind::Mine, x_dim, y_dim, hidden_size).with_config(config);
        Self::from_spec(&spec, rng)
    }

    pub fn from_spec<R: Rng + ?Sized>(spec: &EstimatorSpec, rng: &mut R) -> Result<Self> {
        checked_spec(spec, EstimatorKind::Mine)?;
        Ok(Mine {
            dims: spec.dims(),
            critic: Critic::new(spec, Activation::Linear, rng)?,
        })
    }

    /// Bound for an explicit marginal pairing: anchor `x` with partner `y`.
    pub fn estimate_bound_with_pairing(&mut self, batch: &SampleBatch<'_>, pairing: &Pairing) -> Result<BoundEstimate> {
        let sel = Selected::from_batch(batch, &self.dims)?;
        check_anchors(&sel, pairing)?;
        let scored = self.evaluate(&sel, pairing, false)?;
        Ok(BoundEstimate { value: scored.value, params: None })
    }

    fn evaluate(&mut self, sel: &Selected, pairing: &Pairing, with_gradients: bool) -> Result<Scored> {
        let m = sel.len();
        let n = m as f32;
        let own: Vec<usize> = (0..m).collect();
        let xs: Vec<usize> = own.iter().chain(own.iter()).copied().collect();
        let ys: Vec<usize> = own.iter().chain(pairing.partner_positions()).copied().collect();

        let scores = self.critic.score(sel, &xs, &ys)?;
        let joint = scores.slice(s![..m]);
        let marginal = scores.slice(s![m..]);
        let marginal_lse = log_sum_exp(&marginal);
        let value = finite_bound(EstimatorKind::Mine, joint.sum() / n - (marginal_lse - n.ln()))?;
        if !with_gradients {
            return Ok(Scored { value, parameters: Vec::new(), inputs: None });
        }

        let mut d_scores = Array1::from_elem(2 * m, 1.0 / n);
        d_scores
            .slice_mut(s![m..])
            .assign(&marginal.mapv(|t| -(t - marginal_lse).exp()));
        let (parameters, inputs) = self.critic.backward(sel, &xs, &ys, d_scores)?;
        Ok(Scored { value, parameters, inputs: Some(inputs) })
    }
}

impl MiEstimator for Mine {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Mine
    }

    fn dims(&self) -> EstimatorDims {
        self.dims
    }

    fn estimate_bound(&mut self, batch: &SampleBatch<'_>, rng: &mut dyn RngCore) -> Result<BoundEstimate> {
        let sel = Selected::from_batch(batch, &self.dims)?;
        let pairing = Pairing::with_replacement(&sel.rows, rng)?;
        let scored = self.evaluate(&sel, &pairing, false)?;
        Ok(BoundEstimate { value: scored.value, params: None })
    }

    fn bound_gradients(
        &mut self,
        batch: &SampleBatch<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<(BoundEstimate, SampleGradients)> {
        let sel = Selected::from_batch(batch, &self.dims)?;
        let pairing = Pairing::with_replacement(&sel.rows, rng)?;
        let scored = self.evaluate(&sel, &pairing, true)?;
        let gradients = match scored.inputs {
            Some(g) => g.expand(batch, &sel.rows),
            None => SampleGradients::zeros(batch),
        };
        Ok((BoundEstimate { value: scored.value, params: None }, gradients))
    }

    fn learning_loss(&mut self, batch: &SampleBatch<'_>, rng: &mut dyn RngCore) -> Result<f32> {
        Ok(-self.estimate_bound(batch, rng)?.value)
    }

    fn learning_gradients(
        &mut self,
        batch: &SampleBatch<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<(f32, Vec<LayerGradients>)> {
        let sel = Selected::from_batch(batch, &self.dims)?;
        let pairing = Pairing::with_replacement(&sel.rows, rng)?;
        let scored = self.evaluate(&sel, &pairing, true)?;
        Ok((-scored.value, negate(scored.parameters)))
    }

    fn layers_mut(&mut self) -> Vec<&mut DenseLayer> {
        self.critic.layers_mut()
    }

    fn snapshot(&self) -> ParameterSnapshot {
        self.critic.snapshot()
    }
}

/// NWJ: `mean(T0) - mean_i(exp(logsumexp_j(T1[i, j]) - ln N))` where
/// `T1[i, j] = F(x_j, y_i) - 1` and `T0` is the diagonal of the score matrix.
#[derive(Debug, Clone)]
pub struct Nwj {
    dims: EstimatorDims,
    critic: Critic,
}

impl Nwj {
    pub fn new<R: Rng + ?Sized>(
        x_dim: usize,
        y_dim: usize,
        hidden_size: usize,
        config: EstimatorConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let spec = EstimatorSpec::new(EstimatorKind::Nwj, x_dim, y_dim, hidden_size).with_config(config);
        Self::from_spec(&spec, rng)
    }

    pub fn from_spec<R: Rng + ?Sized>(spec: &EstimatorSpec, rng: &mut R) -> Result<Self> {
        checked_spec(spec, EstimatorKind::Nwj)?;
        Ok(Nwj {
            dims: spec.dims(),
            critic: Critic::new(spec, Activation::Linear, rng)?,
        })
    }

    fn evaluate(&mut self, batch: &SampleBatch<'_>, with_gradients: bool) -> Result<(Scored, Vec<usize>)> {
        let sel = Selected::from_batch(batch, &self.dims)?;
        let n = sel.len() as f32;
        let (scores, xs, ys) = self.critic.score_matrix(&sel)?;
        let shifted = &scores - 1.0;
        let row_lse = log_sum_exp_axis(&shifted, Axis(1));
        let row_means = row_lse.mapv(|lse| (lse - n.ln()).exp());
        let value = finite_bound(EstimatorKind::Nwj, scores.diag().sum() / n - row_means.sum() / n)?;
        if !with_gradients {
            return Ok((Scored { value, parameters: Vec::new(), inputs: None }, sel.rows));
        }

        let weights = softmax_axis(&shifted, Axis(1));
        let mut d_scores = -(&weights * &row_means.insert_axis(Axis(1))) / n;
        d_scores.diag_mut().mapv_inplace(|d| d + 1.0 / n);
        let flat = Array1::from_iter(d_scores.iter().copied());
        let (parameters, inputs) = self.critic.backward(&sel, &xs, &ys, flat)?;
        Ok((Scored { value, parameters, inputs: Some(inputs) }, sel.rows))
    }
}

impl MiEstimator for Nwj {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::Nwj
    }

    fn dims(&self) -> EstimatorDims {
        self.dims
    }

    fn estimate_bound(&mut self, batch: &SampleBatch<'_>, _rng: &mut dyn RngCore) -> Result<BoundEstimate> {
        let (scored, _) = self.evaluate(batch, false)?;
        Ok(BoundEstimate { value: scored.value, params: None })
    }

    fn bound_gradients(
        &mut self,
        batch: &SampleBatch<'_>,
        _rng: &mut dyn RngCore,
    ) -> Result<(BoundEstimate, SampleGradients)> {
        let (scored, rows) = self.evaluate(batch, true)?;
        let gradients = match scored.inputs {
            Some(g) => g.expand(batch, &rows),
            None => SampleGradients::zeros(batch),
        };
        Ok((BoundEstimate { value: scored.value, params: None }, gradients))
    }

    fn learning_loss(&mut self, batch: &SampleBatch<'_>, _rng: &mut dyn RngCore) -> Result<f32> {
        Ok(-self.evaluate(batch, false)?.0.value)
    }

    fn learning_gradients(
        &mut self,
        batch: &SampleBatch<'_>,
        _rng: &mut dyn RngCore,
    ) -> Result<(f32, Vec<LayerGradients>)> {
        let (scored, _) = self.evaluate(batch, true)?;
        Ok((-scored.value, negate(scored.parameters)))
    }

    fn layers_mut(&mut self) -> Vec<&mut DenseLayer> {
        self.critic.layers_mut()
    }

    fn snapshot(&self) -> ParameterSnapshot {
        self.critic.snapshot()
    }
}

/// InfoNCE: `mean_i(S[i, i]) - (mean_i(logsumexp_j(S[i, j])) - ln N)`.
///
/// The critic ends in a softplus. Because the positive scores are the
/// diagonal of the same matrix, the bound never exceeds `ln N`.
#[derive(Debug, Clone)]
pub struct InfoNce {
    dims: EstimatorDims,
    critic: Critic,
}

impl InfoNce {
    pub fn new<R: Rng + ?Sized>(
        x_dim: usize,
        y_dim: usize,
        hidden_size: usize,
        config: EstimatorConfig,
        rng: &mut R,
    ) -> Result<Self> {
        let spec = EstimatorSpec::new(EstimatorKind::InfoNce, x_dim, y_dim, hidden_size).with_config(config);
        Self::from_spec(&spec, rng)
    }

    pub fn from_spec<R: Rng + ?Sized>(spec: &EstimatorSpec, rng: &mut R) -> Result<Self> {
        checked_spec(spec, EstimatorKind::InfoNce)?;
        Ok(InfoNce {
            dims: spec.dims(),
            critic: Critic::new(spec, Activation::Softplus, rng)?,
        })
    }

    fn evaluate(&mut self, batch: &SampleBatch<'_>, with_gradients: bool) -> Result<(Scored, Vec<usize>)> {
        let sel = Selected::from_batch(batch, &self.dims)?;
        let n = sel.len() as f32;
        let (scores, xs, ys) = self.critic.score_matrix(&sel)?;
        let row_lse = log_sum_exp_axis(&scores, Axis(1));
        let value = finite_bound(EstimatorKind::InfoNce, scores.diag().sum() / n - (row_lse.sum() / n - n.ln()))?;
        if !with_gradients {
            return Ok((Scored { value, parameters: Vec::new(), inputs: None }, sel.rows));
        }

        let mut d_scores = -softmax_axis(&scores, Axis(1)) / n;
        d_scores.diag_mut().mapv_inplace(|d| d + 1.0 / n);
        let flat = Array1::from_iter(d_scores.iter().copied());
        let (parameters, inputs) = self.critic.backward(&sel, &xs, &ys, flat)?;
        Ok((Scored { value, parameters, inputs: Some(inputs) }, sel.rows))
    }
}

impl MiEstimator for InfoNce {
    fn kind(&self) -> EstimatorKind {
        EstimatorKind::InfoNce
    }

    fn dims(&self) -> EstimatorDims {
        self.dims
    }

    fn estimate_bound(&mut self, batch: &SampleBatch<'_>, _rng: &mut dyn RngCore) -> Result<BoundEstimate> {
        let (scored, _) = self.evaluate(batch, false)?;
        Ok(BoundEstimate { value: scored.value, params: None })
    }

    fn bound_gradients(
        &mut self,
        batch: &SampleBatch<'_>,
        _rng: &mut dyn RngCore,
    ) -> Result<(BoundEstimate, SampleGradients)> {
        let (scored, rows) = self.evaluate(batch, true)?;
        let gradients = match scored.inputs {
            Some(g) => g.expand(batch, &rows),
            None => SampleGradients::zeros(batch),
        };
        Ok((BoundEstimate { value: scored.value, params: None }, gradients))
    }

    fn learning_loss(&mut self, batch: &SampleBatch<'_>, _rng: &mut dyn RngCore) -> Result<f32> {
        Ok(-self.evaluate(batch, false)?.0.value)
    }

    fn learning_gradients(
        &mut self,
        batch: &SampleBatch<'_>,
        _rng: &mut dyn RngCore,
    ) -> Result<(f32, Vec<LayerGradients>)> {
        let (scored, _) = self.evaluate(batch, true)?;
        Ok((-scored.value, negate(scored.parameters)))
    }

    fn layers_mut(&mut self) -> Vec<&mut DenseLayer> {
        self.critic.layers_mut()
    }

    fn snapshot(&self) -> ParameterSnapshot {
        self.critic.snapshot()
    }
}
