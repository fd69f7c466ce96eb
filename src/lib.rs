//! # mi-bounds - Mutual-Information Bound Estimators
//!
//! Differentiable estimators of upper and lower bounds on the mutual
//! information between two batches of vectors, optionally conditioned on a
//! third. A training loop uses them as regularization signals for the
//! representation that produced the vectors, and fits each estimator's own
//! small network on a separate learning loss.
//!
//! ## Key Features
//!
//! - **Upper bounds**: CLUB (full and sampled), conditioned sampled CLUB,
//!   leave-one-out and variational bounds
//! - **Lower bounds**: MINE, NWJ and InfoNCE critics
//! - **Masks**: every estimator restricts itself to the selected rows, and
//!   negative pairs are drawn only among them
//! - **Gradients**: bounds come with their gradient with respect to every
//!   input row; learning losses with their gradient with respect to the
//!   estimator's parameters
//! - **Injectable randomness**: every sampling call takes the caller's RNG
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mi_bounds::batch::SampleBatch;
//! use mi_bounds::config::{EstimatorKind, EstimatorSpec};
//! use mi_bounds::estimators::build_estimator;
//! use mi_bounds::optimizer::{Adam, OptimizerWrapper};
//! use mi_bounds::training::EstimatorTrainer;
//! use ndarray::Array2;
//! use rand::rngs::StdRng;
//! use rand::SeedableRng;
//!
//! let mut rng = StdRng::seed_from_u64(0);
//! let spec = EstimatorSpec::new(EstimatorKind::ClubSample, 4, 4, 16);
//! let mut estimator = build_estimator(&spec, &mut rng)?;
//!
//! let x = Array2::<f32>::zeros((32, 4));
//! let y = Array2::<f32>::zeros((32, 4));
//! let batch = SampleBatch::new(x.view(), y.view());
//!
//! let mut trainer = EstimatorTrainer::new(OptimizerWrapper::Adam(Adam::default()), 1e-3);
//! trainer.step(estimator.as_mut(), &batch, &mut rng)?;
//! let (bound, gradients) = estimator.bound_gradients(&batch, &mut rng)?;
//! # let _ = (bound, gradients);
//! # Ok::<(), mi_bounds::error::MiError>(())
//! ```
//!
//! ## Module Organization
//!
//! - [`estimators`] - The bound estimators and the [`MiEstimator`](estimators::MiEstimator) trait
//! - [`approximator`] - Variational Gaussian `q(y | x)` shared by the CLUB family
//! - [`batch`] - Batches, masks and row selection
//! - [`sampling`] - Negative-pair construction
//! - [`numerics`] - Stable log-sum-exp, softplus and the log-variance clamp
//! - [`config`] - Estimator configuration and JSON loading
//! - [`training`] - Fitting an estimator on its learning loss
//! - [`activations`], [`layers`], [`network`], [`builders`] - The small networks
//! - [`optimizer`] - SGD, Adam, gradient clipping and learning-rate schedules
//! - [`snapshot`] - Named parameter snapshots for saving and synchronizing
//! - [`debug`] - Finite-difference gradient checks
//! - [`error`] - Error types and result handling

pub mod activations;
pub mod approximator;
pub mod batch;
pub mod builders;
pub mod config;
pub mod debug;
pub mod error;
pub mod estimators;
pub mod layers;
pub mod network;
pub mod numerics;
pub mod optimizer;
pub mod sampling;
pub mod snapshot;
pub mod training;

pub use batch::{EstimatorDims, SampleBatch};
pub use config::{EstimatorConfig, EstimatorKind, EstimatorSpec};
pub use error::{MiError, Result};
pub use estimators::{build_estimator, BoundEstimate, MiEstimator, SampleGradients};

#[cfg(test)]
mod tests;
