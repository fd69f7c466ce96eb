//! Finite-difference checks for the hand-written backward passes.

pub mod gradient_check;

pub use gradient_check::{max_relative_error, numerical_gradient};
