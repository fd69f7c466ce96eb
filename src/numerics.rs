//! # Numerical Stabilization
//!
//! Every sum of exponentials in the estimators goes through the stable
//! log-sum-exp defined here: the maximum is subtracted before exponentiating
//! and added back after the logarithm, so values such as `1000.0` do not
//! overflow. The soft clamp keeps predicted log-variances inside
//! `[min_logvar, max_logvar]` without killing their gradient.

use ndarray::{Array, Array1, Array2, ArrayBase, ArrayView1, Axis, Data, Dimension, RemoveAxis, Zip};

use crate::error::{MiError, Result};

/// Maximum of the values, or the value the whole reduction must return
/// (`NaN` if any element is NaN, `±inf` if the maximum is infinite).
fn stable_max<'a, I>(values: I) -> std::result::Result<f32, f32>
where
    I: Iterator<Item = &'a f32>,
{
    let mut max = f32::NEG_INFINITY;
    for &v in values {
        if v.is_nan() {
            return Err(f32::NAN);
        }
        if v > max {
            max = v;
        }
    }
    if max.is_infinite() {
        Err(max)
    } else {
        Ok(max)
    }
}

fn lane_log_sum_exp(lane: ArrayView1<f32>) -> f32 {
    match stable_max(lane.iter()) {
        Ok(max) => max + lane.iter().map(|&v| (v - max).exp()).sum::<f32>().ln(),
        Err(special) => special,
    }
}

/// `log(sum(exp(values)))` over every element (the no-axis case).
///
/// An empty array or one holding only `-inf` yields `-inf`.
pub fn log_sum_exp<S, D>(values: &ArrayBase<S, D>) -> f32
where
    S: Data<Elem = f32>,
    D: Dimension,
{
    match stable_max(values.iter()) {
        Ok(max) => max + values.iter().map(|&v| (v - max).exp()).sum::<f32>().ln(),
        Err(special) => special,
    }
}

/// Log-sum-exp reduced along `axis`; the axis is removed from the result.
pub fn log_sum_exp_axis<S, D>(values: &ArrayBase<S, D>, axis: Axis) -> Array<f32, D::Smaller>
where
    S: Data<Elem = f32>,
    D: RemoveAxis,
{
    values.map_axis(axis, lane_log_sum_exp)
}

/// Log-sum-exp reduced along `axis`, keeping it with length one.
pub fn log_sum_exp_keepdim<S, D>(values: &ArrayBase<S, D>, axis: Axis) -> Array<f32, D>
where
    S: Data<Elem = f32>,
    D: RemoveAxis,
{
    let mut shape = values.raw_dim();
    shape[axis.index()] = 1;
    let mut reduced = Array::zeros(shape);
    Zip::from(reduced.lanes_mut(axis))
        .and(values.lanes(axis))
        .for_each(|mut out, lane| out[0] = lane_log_sum_exp(lane));
    reduced
}

/// Softmax of each lane along `axis`, i.e. `exp(v - log_sum_exp(lane))`.
pub fn softmax_axis(values: &Array2<f32>, axis: Axis) -> Array2<f32> {
    let lse = log_sum_exp_keepdim(values, axis);
    (values - &lse).mapv(f32::exp)
}

/// `ln(1 + e^x)` without overflow for large `x`.
#[inline]
pub fn softplus(x: f32) -> f32 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

/// Logistic function; also the derivative of [`softplus`].
#[inline]
pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Smoothly clamp log-variances between per-dimension bounds:
///
/// `logstd = max - softplus(max - logvar)`,
/// `logvar' = min + softplus(logstd - min)`.
///
/// Returns the clamped values and `d logvar' / d logvar` elementwise.
pub fn soft_clamp(
    logvar: &Array2<f32>,
    min_logvar: &Array1<f32>,
    max_logvar: &Array1<f32>,
) -> (Array2<f32>, Array2<f32>) {
    let mut clamped = Array2::zeros(logvar.raw_dim());
    let mut derivative = Array2::zeros(logvar.raw_dim());
    Zip::from(&mut clamped)
        .and(&mut derivative)
        .and(logvar)
        .and_broadcast(min_logvar)
        .and_broadcast(max_logvar)
        .for_each(|c, d, &lv, &lo, &hi| {
            let logstd = hi - softplus(hi - lv);
            *c = lo + softplus(logstd - lo);
            *d = sigmoid(logstd - lo) * sigmoid(hi - lv);
        });
    (clamped, derivative)
}

/// Propagate overflow or NaN as an error instead of a silent default.
pub fn ensure_finite(context: &str, value: f32) -> Result<f32> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(MiError::NonFinite {
            context: context.to_string(),
            value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2, Array1};

    fn naive(values: &[f32]) -> f32 {
        values.iter().map(|v| v.exp()).sum::<f32>().ln()
    }

    #[test]
    fn test_matches_naive_for_moderate_values() {
        let values = arr1(&[0.5, -1.25, 2.0, 3.5, -0.1]);
        assert_abs_diff_eq!(
            log_sum_exp(&values),
            naive(values.as_slice().unwrap()),
            epsilon = 1e-5
        );
    }

    #[test]
    fn test_large_values_do_not_overflow() {
        let values = arr1(&[1000.0, 1000.0, 999.0]);
        assert!(naive(values.as_slice().unwrap()).is_infinite());

        let expected = 1000.0 + (2.0f32 + (-1.0f32).exp()).ln();
        assert_abs_diff_eq!(log_sum_exp(&values), expected, epsilon = 1e-3);
    }

    #[test]
    fn test_axis_reduction() {
        let values = arr2(&[[1.0, 2.0, 3.0], [1000.0, 0.0, -1000.0]]);

        let rows = log_sum_exp_axis(&values, Axis(1));
        assert_abs_diff_eq!(rows[0], naive(&[1.0, 2.0, 3.0]), epsilon = 1e-5);
        assert_abs_diff_eq!(rows[1], 1000.0, epsilon = 1e-3);

        let cols = log_sum_exp_axis(&values, Axis(0));
        assert_eq!(cols.len(), 3);
        assert_abs_diff_eq!(cols[0], 1000.0, epsilon = 1e-3);
        assert_abs_diff_eq!(cols[2], 3.0, epsilon = 1e-5);

        let kept = log_sum_exp_keepdim(&values, Axis(1));
        assert_eq!(kept.shape(), &[2, 1]);
        assert_abs_diff_eq!(kept[[0, 0]], rows[0]);
    }

    #[test]
    fn test_degenerate_inputs() {
        let empty: Array1<f32> = Array1::zeros(0);
        assert_eq!(log_sum_exp(&empty), f32::NEG_INFINITY);

        let all_neg_inf = arr1(&[f32::NEG_INFINITY, f32::NEG_INFINITY]);
        assert_eq!(log_sum_exp(&all_neg_inf), f32::NEG_INFINITY);

        let with_inf = arr1(&[1.0, f32::INFINITY]);
        assert_eq!(log_sum_exp(&with_inf), f32::INFINITY);

        let with_nan = arr1(&[1.0, f32::NAN]);
        assert!(log_sum_exp(&with_nan).is_nan());
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let values = arr2(&[[1.0, 2.0, 3.0], [500.0, 500.0, -20.0]]);
        let probs = softmax_axis(&values, Axis(1));
        for row in probs.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-5);
        }
        assert_abs_diff_eq!(probs[[1, 0]], 0.5, epsilon = 1e-5);
    }

    #[test]
    fn test_softplus_is_stable() {
        assert_abs_diff_eq!(softplus(0.0), 2.0f32.ln(), epsilon = 1e-6);
        assert_abs_diff_eq!(softplus(100.0), 100.0, epsilon = 1e-4);
        assert!(softplus(-100.0) >= 0.0);
        assert_abs_diff_eq!(sigmoid(0.0), 0.5);
        assert!(sigmoid(-200.0).is_finite());
    }

    #[test]
    fn test_soft_clamp_stays_in_range() {
        let logvar = arr2(&[[-50.0, -1.0, 0.0, 0.4, 30.0]]);
        let min = Array1::from_elem(5, -10.0);
        let max = Array1::from_elem(5, 0.5);
        let (clamped, derivative) = soft_clamp(&logvar, &min, &max);

        for &v in clamped.iter() {
            assert!(v >= -10.0 && v <= 0.5 + 1e-3, "clamped value {} out of range", v);
        }
        // Interior values pass through almost unchanged
        assert_abs_diff_eq!(clamped[[0, 1]], -1.0, epsilon = 0.25);
        for &d in derivative.iter() {
            assert!((0.0..=1.0).contains(&d));
        }

        // Compare the analytic derivative with a central difference
        let eps = 1e-2;
        let plus = soft_clamp(&(&logvar + eps), &min, &max).0;
        let minus = soft_clamp(&(&logvar - eps), &min, &max).0;
        for j in 0..5 {
            let numeric = (plus[[0, j]] - minus[[0, j]]) / (2.0 * eps);
            assert_abs_diff_eq!(numeric, derivative[[0, j]], epsilon = 1e-2);
        }
    }

    #[test]
    fn test_ensure_finite() {
        assert_eq!(ensure_finite("ok", 1.5), Ok(1.5));
        assert!(matches!(
            ensure_finite("bound", f32::INFINITY),
            Err(MiError::NonFinite { .. })
        ));
        assert!(ensure_finite("bound", f32::NAN).is_err());
    }
}
