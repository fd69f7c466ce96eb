//! # Masking and Negative Sampling
//!
//! Negative (marginal) samples are built by pairing each selected row with
//! another selected row. Pairing never reaches outside the mask; the RNG is
//! always supplied by the caller so tests can pin the pairing with a seed.

use std::collections::HashMap;

use ndarray::ArrayView1;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{MiError, Result};

/// Indices of the rows the mask selects, in ascending order.
pub fn masked_indices(mask: ArrayView1<bool>) -> Result<Vec<usize>> {
    let indices: Vec<usize> = mask
        .iter()
        .enumerate()
        .filter(|&(_, &valid)| valid)
        .map(|(i, _)| i)
        .collect();
    if indices.is_empty() {
        return Err(MiError::InvalidMask(format!(
            "mask of length {} selects no rows",
            mask.len()
        )));
    }
    Ok(indices)
}

/// A negative pairing: `partners()[i]` is the row paired with `anchors()[i]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pairing {
    anchors: Vec<usize>,
    partners: Vec<usize>,
    positions: Vec<usize>,
}

impl Pairing {
    /// Every row paired with itself.
    pub fn identity(anchors: &[usize]) -> Result<Self> {
        let positions: Vec<usize> = (0..anchors.len()).collect();
        Self::from_positions(anchors, positions)
    }

    /// A uniformly random permutation of the selected rows.
    pub fn shuffled<R: Rng + ?Sized>(anchors: &[usize], rng: &mut R) -> Result<Self> {
        let mut positions: Vec<usize> = (0..anchors.len()).collect();
        positions.shuffle(rng);
        if anchors.len() == 1 {
            log::debug!("single selected row; negative pairing degenerates to identity");
        }
        Self::from_positions(anchors, positions)
    }

    /// Independent uniform draws among the selected rows (with replacement).
    pub fn with_replacement<R: Rng + ?Sized>(anchors: &[usize], rng: &mut R) -> Result<Self> {
        let n = anchors.len();
        let positions: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n.max(1))).collect();
        Self::from_positions(anchors, positions)
    }

    /// An explicit pairing; every partner must itself be a selected row.
    pub fn from_partners(anchors: &[usize], partners: &[usize]) -> Result<Self> {
        if anchors.len() != partners.len() {
            return Err(MiError::shape_mismatch(
                format!("{} partners", anchors.len()),
                format!("{}", partners.len()),
            ));
        }
        let lookup: HashMap<usize, usize> =
            anchors.iter().enumerate().map(|(pos, &row)| (row, pos)).collect();
        let positions = partners
            .iter()
            .map(|row| {
                lookup.get(row).copied().ok_or_else(|| {
                    MiError::InvalidMask(format!("partner row {} is not selected by the mask", row))
                })
            })
            .collect::<Result<Vec<usize>>>()?;
        Self::from_positions(anchors, positions)
    }

    fn from_positions(anchors: &[usize], positions: Vec<usize>) -> Result<Self> {
        if anchors.is_empty() {
            return Err(MiError::InvalidMask("cannot pair an empty selection".to_string()));
        }
        let partners = positions.iter().map(|&p| anchors[p]).collect();
        Ok(Pairing {
            anchors: anchors.to_vec(),
            partners,
            positions,
        })
    }

    pub fn anchors(&self) -> &[usize] {
        &self.anchors
    }

    /// Batch row index of each anchor's partner
    pub fn partners(&self) -> &[usize] {
        &self.partners
    }

    /// Position of each partner within `anchors`, for indexing gathered rows
    pub fn partner_positions(&self) -> &[usize] {
        &self.positions
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// True when every anchor is paired with itself.
    pub fn is_identity(&self) -> bool {
        self.positions.iter().enumerate().all(|(i, &p)| i == p)
    }
}
