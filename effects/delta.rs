// =============================================================================
// Delta-Method Uncertainty
// =============================================================================
//
// Model-based standard errors for any smooth function of the coefficients:
//
//     Var(g(β̂)) ≈ J V Jᵀ,   J = ∂g/∂β evaluated at β̂
//
// J is computed numerically with centred differences, so any quantity the
// estimation layer can evaluate for a coefficient vector gets a standard error
// without an analytic derivative.
//
// =============================================================================

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use statrs::distribution::{ContinuousCDF, Normal};

/// Quantile of the standard normal distribution.
pub fn normal_quantile(p: f64) -> f64 {
    match Normal::new(0.0, 1.0) {
        Ok(normal) => normal.inverse_cdf(p),
        Err(_) => f64::NAN,
    }
}

/// Two-sided p-value for a z statistic.
pub fn two_sided_p_value(z: f64) -> f64 {
    if !z.is_finite() {
        return f64::NAN;
    }
    match Normal::new(0.0, 1.0) {
        Ok(normal) => 2.0 * (1.0 - normal.cdf(z.abs())),
        Err(_) => f64::NAN,
    }
}

/// Critical value for a two-sided interval at `conf_level`.
pub fn critical_value(conf_level: f64) -> f64 {
    normal_quantile(1.0 - (1.0 - conf_level) / 2.0)
}

/// Step used for coefficient `j` in the centred difference.
#[inline]
fn step_for(beta_j: f64) -> f64 {
    1e-5 * beta_j.abs().max(1.0)
}

/// Numerical Jacobian (`K × p`) of `g` at `beta`, where `g` returns `K` values.
pub fn jacobian<F, E>(beta: ArrayView1<f64>, expected_len: usize, g: F) -> Result<Array2<f64>, E>
where
    F: Fn(Array1<f64>) -> Result<Array1<f64>, E>,
{
    let p = beta.len();
    let mut jac = Array2::<f64>::zeros((expected_len, p));
    for j in 0..p {
        let h = step_for(beta[j]);
        let mut plus = beta.to_owned();
        plus[j] += h;
        let mut minus = beta.to_owned();
        minus[j] -= h;
        let upper = g(plus)?;
        let lower = g(minus)?;
        for k in 0..expected_len.min(upper.len()).min(lower.len()) {
            jac[(k, j)] = (upper[k] - lower[k]) / (2.0 * h);
        }
    }
    Ok(jac)
}

/// `sqrt(diag(J V Jᵀ))`, computed row by row.
pub fn standard_errors(jac: &Array2<f64>, vcov: ArrayView2<f64>) -> Array1<f64> {
    let jv = jac.dot(&vcov);
    Array1::from_shape_fn(jac.nrows(), |k| {
        let var = jv.row(k).dot(&jac.row(k));
        if var >= 0.0 { var.sqrt() } else { f64::NAN }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn normal_helpers_match_tables() {
        assert_abs_diff_eq!(critical_value(0.95), 1.959964, epsilon = 1e-5);
        assert_abs_diff_eq!(two_sided_p_value(1.959964), 0.05, epsilon = 1e-5);
        assert_abs_diff_eq!(two_sided_p_value(0.0), 1.0, epsilon = 1e-12);
        assert!(two_sided_p_value(f64::NAN).is_nan());
    }

    #[test]
    fn jacobian_of_linear_map_is_exact() {
        let a = array![[1.0, 2.0], [0.5, -1.0], [0.0, 3.0]];
        let beta = array![0.3, -0.7];
        let jac = jacobian(beta.view(), 3, |b| Ok::<_, ()>(a.dot(&b))).unwrap();
        for i in 0..3 {
            for j in 0..2 {
                assert_abs_diff_eq!(jac[(i, j)], a[(i, j)], epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn standard_errors_of_a_sum() {
        let jac = array![[1.0, 1.0]];
        let vcov = array![[4.0, 1.0], [1.0, 9.0]];
        let se = standard_errors(&jac, vcov.view());
        assert_abs_diff_eq!(se[0], 15.0_f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn jacobian_propagates_errors() {
        let beta = array![1.0];
        let result = jacobian(beta.view(), 1, |_| Err::<Array1<f64>, _>("boom"));
        assert_eq!(result.unwrap_err(), "boom");
    }
}
