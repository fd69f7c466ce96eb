use ndarray::{Array, ArrayBase, Data, Dimension};

use crate::error::Result;

/// Central-difference gradient of `f` with respect to every entry of `params`.
///
/// Each entry is nudged by `±epsilon` and restored before the next one, so
/// `params` holds its original values again when this returns.
pub fn numerical_gradient<D, F>(params: &mut Array<f32, D>, epsilon: f32, mut f: F) -> Result<Array<f32, D>>
where
    D: Dimension,
    F: FnMut(&Array<f32, D>) -> Result<f32>,
{
    let mut gradient = Array::zeros(params.raw_dim());
    for (k, grad) in gradient.iter_mut().enumerate() {
        let original = set_entry(params, k, 0.0);
        set_entry(params, k, original + epsilon);
        let plus = f(params);
        set_entry(params, k, original - epsilon);
        let minus = f(params);
        set_entry(params, k, original);
        *grad = (plus? - minus?) / (2.0 * epsilon);
    }
    Ok(gradient)
}

/// Overwrite the `k`-th entry in logical order, returning the old value.
fn set_entry<D: Dimension>(params: &mut Array<f32, D>, k: usize, value: f32) -> f32 {
    match params.iter_mut().nth(k) {
        Some(entry) => std::mem::replace(entry, value),
        None => 0.0,
    }
}

/// Largest `|a - n| / max(|a|, |n|, floor)` over matching entries.
///
/// `floor` keeps entries that are both near zero from dominating.
pub fn max_relative_error<S1, S2, D>(analytic: &ArrayBase<S1, D>, numeric: &ArrayBase<S2, D>, floor: f32) -> f32
where
    S1: Data<Elem = f32>,
    S2: Data<Elem = f32>,
    D: Dimension,
{
    analytic
        .iter()
        .zip(numeric.iter())
        .map(|(&a, &n)| (a - n).abs() / a.abs().max(n.abs()).max(floor))
        .fold(0.0, f32::max)
}
