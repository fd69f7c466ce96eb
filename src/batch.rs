//! Sample batches handed to the estimators by the training loop.

use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{MiError, Result};
use crate::sampling::masked_indices;

/// Row widths an estimator was constructed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EstimatorDims {
    pub x_dim: usize,
    pub y_dim: usize,
    pub con_dim: Option<usize>,
}

impl EstimatorDims {
    pub fn new(x_dim: usize, y_dim: usize) -> Self {
        EstimatorDims { x_dim, y_dim, con_dim: None }
    }

    pub fn conditioned(x_dim: usize, y_dim: usize, con_dim: usize) -> Self {
        EstimatorDims { x_dim, y_dim, con_dim: Some(con_dim) }
    }

    /// Width of the approximator input: `x_dim + con_dim`.
    pub fn input_dim(&self) -> usize {
        self.x_dim + self.con_dim.unwrap_or(0)
    }
}

/// Paired samples `x`, `y`, optional conditioning `con`, and an optional
/// mask selecting the valid rows. Rows line up across all of them.
#[derive(Debug, Clone, Copy)]
pub struct SampleBatch<'a> {
    pub x: ArrayView2<'a, f32>,
    pub y: ArrayView2<'a, f32>,
    pub con: Option<ArrayView2<'a, f32>>,
    pub mask: Option<ArrayView1<'a, bool>>,
}

impl<'a> SampleBatch<'a> {
    pub fn new(x: ArrayView2<'a, f32>, y: ArrayView2<'a, f32>) -> Self {
        SampleBatch { x, y, con: None, mask: None }
    }

    pub fn with_con(mut self, con: ArrayView2<'a, f32>) -> Self {
        self.con = Some(con);
        self
    }

    pub fn with_mask(mut self, mask: ArrayView1<'a, bool>) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Number of rows, selected or not
    pub fn len(&self) -> usize {
        self.x.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validate the batch against `dims` and return the selected row indices.
    ///
    /// Shapes are checked before the mask so that a malformed call fails
    /// before any computation.
    pub fn select(&self, dims: &EstimatorDims) -> Result<Vec<usize>> {
        let rows = self.x.nrows();
        check_len("y rows", rows, self.y.nrows())?;
        check_len("x columns", dims.x_dim, self.x.ncols())?;
        check_len("y columns", dims.y_dim, self.y.ncols())?;

        match (dims.con_dim, self.con) {
            (Some(con_dim), Some(con)) => {
                check_len("con rows", rows, con.nrows())?;
                check_len("con columns", con_dim, con.ncols())?;
            }
            (Some(_), None) => return Err(MiError::MissingConditioning),
            (None, Some(con)) => {
                return Err(MiError::shape_mismatch(
                    "no conditioning samples".to_string(),
                    format!("{} conditioning columns", con.ncols()),
                ))
            }
            (None, None) => {}
        }

        match self.mask {
            Some(mask) => {
                check_len("mask length", rows, mask.len())?;
                masked_indices(mask)
            }
            None if rows == 0 => Err(MiError::InvalidMask("batch has no rows".to_string())),
            None => Ok((0..rows).collect()),
        }
    }
}

fn check_len(what: &str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(MiError::shape_mismatch(
            format!("{} = {}", what, expected),
            format!("{}", actual),
        ))
    }
}

/// Copy the given rows out of `values`.
pub fn gather_rows(values: ArrayView2<f32>, rows: &[usize]) -> Array2<f32> {
    values.select(Axis(0), rows)
}

/// Add each row of `rows_grad` into `target` at the matching index of `rows`.
pub fn scatter_add_rows(target: &mut Array2<f32>, rows: &[usize], rows_grad: ArrayView2<f32>) {
    for (&row, grad) in rows.iter().zip(rows_grad.outer_iter()) {
        let mut target_row = target.row_mut(row);
        target_row += &grad;
    }
}
