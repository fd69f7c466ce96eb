//! # Mutual-Information Bound Estimators
//!
//! Every estimator exposes the same contract:
//!
//! - [`MiEstimator::estimate_bound`] returns the information bound used as a
//!   regularization signal, and [`MiEstimator::bound_gradients`] its gradient
//!   with respect to every input row.
//! - [`MiEstimator::learning_loss`] returns the separate objective that fits
//!   the estimator's own network, and [`MiEstimator::learning_gradients`] its
//!   gradient with respect to those parameters only.
//!
//! The two paths are independent: the representation is regularized with
//! the bound while the estimator is fitted with its learning loss, usually in
//! alternating steps.
//!
//! | Estimator | Bound | Pairs per call |
//! |-----------|-------|----------------|
//! | [`Club`] | upper | N² |
//! | [`ClubSample`] | upper | N |
//! | [`ConClubSample`] | upper (conditional) | N |
//! | [`SyncedConClubSample`] | upper (conditional) | N |
//! | [`Mine`] | lower | N |
//! | [`Nwj`] | lower | N² |
//! | [`InfoNce`] | lower, at most ln N | N² |
//! | [`L1OutUb`] | upper | N² |
//! | [`VarUb`] | upper | N |
//!
//! Every estimator honours an optional mask: only the selected rows take part
//! and negative pairs are drawn among them.

pub mod categorical;
pub mod club;
pub mod con_club;
pub mod l1out;
pub mod scoring;
pub mod var_ub;

pub use categorical::ClubCategorical;
pub use club::{Club, ClubSample};
pub use con_club::{ConClubSample, SyncedConClubSample};
pub use l1out::L1OutUb;
pub use scoring::{InfoNce, Mine, Nwj};
pub use var_ub::VarUb;

use ndarray::Array2;
use rand::{Rng, RngCore};

use crate::approximator::GaussianParams;
use crate::batch::{gather_rows, scatter_add_rows, EstimatorDims, SampleBatch};
use crate::config::{EstimatorKind, EstimatorSpec};
use crate::error::{MiError, Result};
use crate::layers::{DenseLayer, LayerGradients};
use crate::optimizer::{Optimizer, OptimizerWrapper};
use crate::snapshot::ParameterSnapshot;

/// Value of a bound, plus the Gaussian parameters of the selected rows for
/// estimators built on a variational approximator.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundEstimate {
    pub value: f32,
    pub params: Option<GaussianParams>,
}

/// Gradient of a bound with respect to the full batch; rows the mask leaves
/// out are zero.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleGradients {
    pub x: Array2<f32>,
    pub y: Array2<f32>,
    pub con: Option<Array2<f32>>,
}

impl SampleGradients {
    pub fn zeros(batch: &SampleBatch<'_>) -> Self {
        SampleGradients {
            x: Array2::zeros(batch.x.raw_dim()),
            y: Array2::zeros(batch.y.raw_dim()),
            con: batch.con.map(|con| Array2::zeros(con.raw_dim())),
        }
    }
}

/// A mutual-information bound estimator with its own trainable parameters.
///
/// Calls take `&mut self` because the networks cache activations for the
/// backward pass; one instance must not be shared across threads without
/// external serialization.
pub trait MiEstimator {
    fn kind(&self) -> EstimatorKind;

    fn dims(&self) -> EstimatorDims;

    fn estimate_bound(&mut self, batch: &SampleBatch<'_>, rng: &mut dyn RngCore) -> Result<BoundEstimate>;

    fn bound_gradients(
        &mut self,
        batch: &SampleBatch<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<(BoundEstimate, SampleGradients)>;

    fn learning_loss(&mut self, batch: &SampleBatch<'_>, rng: &mut dyn RngCore) -> Result<f32>;

    /// Learning loss and its gradient, ordered like [`layers_mut`](Self::layers_mut).
    fn learning_gradients(
        &mut self,
        batch: &SampleBatch<'_>,
        rng: &mut dyn RngCore,
    ) -> Result<(f32, Vec<LayerGradients>)>;

    /// Trainable layers in a fixed order
    fn layers_mut(&mut self) -> Vec<&mut DenseLayer>;

    fn snapshot(&self) -> ParameterSnapshot;

    /// One optimizer update on the learning loss; returns the loss before the update.
    fn learning_step(
        &mut self,
        batch: &SampleBatch<'_>,
        rng: &mut dyn RngCore,
        optimizer: &mut OptimizerWrapper,
        learning_rate: f32,
    ) -> Result<f32> {
        let (loss, gradients) = self.learning_gradients(batch, rng)?;
        apply_gradients(self.layers_mut(), &gradients, optimizer, learning_rate)?;
        Ok(loss)
    }
}

/// Apply `gradients` to `layers` (same order) with one optimizer step.
pub fn apply_gradients(
    layers: Vec<&mut DenseLayer>,
    gradients: &[LayerGradients],
    optimizer: &mut OptimizerWrapper,
    learning_rate: f32,
) -> Result<()> {
    if layers.len() != gradients.len() {
        return Err(MiError::shape_mismatch(
            format!("{} layer gradients", layers.len()),
            format!("{}", gradients.len()),
        ));
    }
    for (slot, (layer, grad)) in layers.into_iter().zip(gradients).enumerate() {
        if layer.weights.dim() != grad.weights.dim() || layer.biases.dim() != grad.biases.dim() {
            return Err(MiError::shape_mismatch(
                format!("slot {}: {:?}", slot, layer.weights.dim()),
                format!("{:?}", grad.weights.dim()),
            ));
        }
        optimizer.update_weights(slot, &mut layer.weights, &grad.weights, learning_rate);
        optimizer.update_biases(slot, &mut layer.biases, &grad.biases, learning_rate);
    }
    optimizer.advance();
    Ok(())
}

/// Build the estimator described by `spec`.
pub fn build_estimator<R: Rng + ?Sized>(spec: &EstimatorSpec, rng: &mut R) -> Result<Box<dyn MiEstimator>> {
    spec.validate()?;
    log::debug!(
        "building {} estimator (x_dim={}, y_dim={}, con_dim={:?}, hidden={})",
        spec.kind.name(),
        spec.x_dim,
        spec.y_dim,
        spec.con_dim,
        spec.hidden_size
    );
    let estimator: Box<dyn MiEstimator> = match spec.kind {
        EstimatorKind::Club => Box::new(Club::from_spec(spec, rng)?),
        EstimatorKind::ClubSample => Box::new(ClubSample::from_spec(spec, rng)?),
        EstimatorKind::ConClubSample => Box::new(ConClubSample::from_spec(spec, rng)?),
        EstimatorKind::SyncedConClubSample => Box::new(SyncedConClubSample::from_spec(spec, rng)?),
        EstimatorKind::Mine => Box::new(Mine::from_spec(spec, rng)?),
        EstimatorKind::Nwj => Box::new(Nwj::from_spec(spec, rng)?),
        EstimatorKind::InfoNce => Box::new(InfoNce::from_spec(spec, rng)?),
        EstimatorKind::L1Out => Box::new(L1OutUb::from_spec(spec, rng)?),
        EstimatorKind::VarUb => Box::new(VarUb::from_spec(spec, rng)?),
    };
    Ok(estimator)
}

/// Check that `spec` describes `expected` and is valid.
pub(crate) fn checked_spec(spec: &EstimatorSpec, expected: EstimatorKind) -> Result<()> {
    if spec.kind != expected {
        return Err(MiError::invalid_parameter(
            "kind".to_string(),
            format!("expected {}, got {}", expected.name(), spec.kind.name()),
        ));
    }
    spec.validate()
}

/// The mask-selected rows of a batch, copied out contiguously.
pub(crate) struct Selected {
    pub rows: Vec<usize>,
    pub x: Array2<f32>,
    pub y: Array2<f32>,
    pub con: Option<Array2<f32>>,
}

impl Selected {
    pub fn from_batch(batch: &SampleBatch<'_>, dims: &EstimatorDims) -> Result<Self> {
        let rows = batch.select(dims)?;
        Ok(Selected {
            x: gather_rows(batch.x, &rows),
            y: gather_rows(batch.y, &rows),
            con: batch.con.map(|con| gather_rows(con, &rows)),
            rows,
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Gradients with respect to the selected rows only, in selection order.
pub(crate) struct SelectedGradients {
    pub x: Array2<f32>,
    pub y: Array2<f32>,
    pub con: Option<Array2<f32>>,
}

impl SelectedGradients {
    /// Scatter back into full-batch shape.
    pub fn expand(self, batch: &SampleBatch<'_>, rows: &[usize]) -> SampleGradients {
        let mut full = SampleGradients::zeros(batch);
        scatter_add_rows(&mut full.x, rows, self.x.view());
        scatter_add_rows(&mut full.y, rows, self.y.view());
        if let (Some(full_con), Some(con)) = (full.con.as_mut(), self.con.as_ref()) {
            scatter_add_rows(full_con, rows, con.view());
        }
        full
    }
}

/// Bound value checked for overflow, logging negative upper bounds.
pub(crate) fn finite_bound(kind: EstimatorKind, value: f32) -> Result<f32> {
    let value = crate::numerics::ensure_finite(kind.name(), value)?;
    if kind.is_upper_bound() && value < 0.0 {
        log::trace!("{} upper bound is negative ({}); returned unchanged", kind.name(), value);
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::SGD;
    use ndarray::{arr1, arr2};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_factory_builds_every_kind() {
        let mut rng = StdRng::seed_from_u64(0);
        for kind in [
            EstimatorKind::Club,
            EstimatorKind::ClubSample,
            EstimatorKind::ConClubSample,
            EstimatorKind::SyncedConClubSample,
            EstimatorKind::Mine,
            EstimatorKind::Nwj,
            EstimatorKind::InfoNce,
            EstimatorKind::L1Out,
            EstimatorKind::VarUb,
        ] {
            let mut spec = EstimatorSpec::new(kind, 3, 2, 8);
            if kind.is_conditioned() {
                spec = spec.with_con_dim(2);
            }
            let estimator = build_estimator(&spec, &mut rng).unwrap();
            assert_eq!(estimator.kind(), kind);
            assert_eq!(estimator.dims(), spec.dims());
        }
    }

    #[test]
    fn test_constructor_rejects_wrong_kind() {
        let mut rng = StdRng::seed_from_u64(0);
        let spec = EstimatorSpec::new(EstimatorKind::Mine, 3, 2, 8);
        assert!(Club::from_spec(&spec, &mut rng).is_err());
    }

    #[test]
    fn test_selected_gradients_expand_into_masked_rows() {
        let x = Array2::<f32>::zeros((4, 1));
        let y = Array2::<f32>::zeros((4, 1));
        let mask = arr1(&[false, true, false, true]);
        let batch = SampleBatch::new(x.view(), y.view()).with_mask(mask.view());
        let grads = SelectedGradients {
            x: arr2(&[[1.0], [2.0]]),
            y: arr2(&[[3.0], [4.0]]),
            con: None,
        }
        .expand(&batch, &[1, 3]);
        assert_eq!(grads.x, arr2(&[[0.0], [1.0], [0.0], [2.0]]));
        assert_eq!(grads.y, arr2(&[[0.0], [3.0], [0.0], [4.0]]));
        assert!(grads.con.is_none());
    }

    #[test]
    fn test_apply_gradients_checks_layout() {
        let mut rng = StdRng::seed_from_u64(0);
        let spec = EstimatorSpec::new(EstimatorKind::VarUb, 3, 2, 8);
        let mut estimator = build_estimator(&spec, &mut rng).unwrap();
        let mut optimizer = OptimizerWrapper::SGD(SGD::new());
        assert!(apply_gradients(estimator.layers_mut(), &[], &mut optimizer, 0.1).is_err());
    }
}
