//! # Activation Functions Module
//!
//! Element-wise nonlinearities used inside the approximator and critic
//! networks. Every variant provides a batched forward and the derivative with
//! respect to the pre-activation, which is what [`DenseLayer`] caches.
//!
//! - **ReLU**: hidden layers of the CLUB-family approximators and critics
//! - **LeakyReLU**: hidden layer of the joint encoder that tracks an external encoder
//! - **Tanh**: bounds the raw log-variance head to `(-1, 1)`
//! - **Softplus**: keeps the InfoNCE critic score positive
//! - **Linear**: mean heads and unconstrained scores
//!
//! [`DenseLayer`]: crate::layers::DenseLayer

pub mod functions;

pub use functions::Activation;
