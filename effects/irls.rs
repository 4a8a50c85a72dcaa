//! Iteratively reweighted least squares for the canonical-link GLM families.
//!
//! The Gaussian family is a single weighted least-squares solve. Binomial and
//! Poisson iterate on the working response `z = η + (y − μ)/μ'(η)` with working
//! weights `w μ'(η)² / V(μ)` until the relative deviance change drops below the
//! tolerance.
//!
//! Each solve equilibrates `XᵀWX` to unit diagonal before the Cholesky
//! factorization, so the singularity check is independent of column scale.

use crate::faer_ndarray::{FaerCholesky, FaerCholeskyFactor};
use crate::model::{Family, Fit, ModelError};
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};

/// Smallest acceptable squared pivot ratio of the equilibrated cross-product.
const SINGULARITY_THRESHOLD: f64 = 1e-12;

#[derive(Debug, Clone, Copy)]
pub struct IrlsOptions {
    pub max_iterations: usize,
    pub tolerance: f64,
}

impl Default for IrlsOptions {
    fn default() -> Self {
        Self {
            max_iterations: 25,
            tolerance: 1e-8,
        }
    }
}

/// Solution of one weighted least-squares problem.
struct WlsSolution {
    beta: Array1<f64>,
    xtwx_inverse: Array2<f64>,
}

fn weighted_least_squares(
    x: ArrayView2<f64>,
    z: &Array1<f64>,
    w: &Array1<f64>,
) -> Result<WlsSolution, ModelError> {
    let sqrt_w = w.mapv(|v| v.max(0.0).sqrt());
    let xw = &x * &sqrt_w.view().insert_axis(Axis(1));
    let zw = z * &sqrt_w;

    let xtwx = xw.t().dot(&xw);
    let xtwz = xw.t().dot(&zw);

    let diag = xtwx.diag().to_owned();
    if diag.iter().any(|&d| !(d > 0.0) || !d.is_finite()) {
        return Err(ModelError::SingularDesign);
    }
    let scale = diag.mapv(|d| 1.0 / d.sqrt());
    let outer = scale
        .view()
        .insert_axis(Axis(1))
        .dot(&scale.view().insert_axis(Axis(0)));
    let equilibrated = &xtwx * &outer;

    let factor: FaerCholeskyFactor = equilibrated
        .cholesky(Side::Lower)
        .map_err(|_| ModelError::SingularDesign)?;
    if factor.pivot_ratio() < SINGULARITY_THRESHOLD {
        return Err(ModelError::SingularDesign);
    }

    let beta = factor.solve_vec(&(&xtwz * &scale)) * &scale;
    let xtwx_inverse = factor.inverse() * &outer;
    Ok(WlsSolution { beta, xtwx_inverse })
}

fn deviance(family: Family, y: ArrayView1<f64>, mu: &Array1<f64>, w: ArrayView1<f64>) -> f64 {
    ndarray::Zip::from(y)
        .and(mu)
        .and(w)
        .fold(0.0, |acc, &yi, &mui, &wi| acc + wi * family.unit_deviance(yi, mui))
}

fn positive_weight_count(w: ArrayView1<f64>) -> usize {
    w.iter().filter(|&&v| v > 0.0).count()
}

/// Fits `family` by (iteratively re)weighted least squares.
pub fn fit_glm(
    family: Family,
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    prior_weights: ArrayView1<f64>,
    options: &IrlsOptions,
) -> Result<Fit, ModelError> {
    let p = x.ncols();
    let nobs = positive_weight_count(prior_weights);
    let required = p + 1;
    if nobs < required {
        return Err(ModelError::InsufficientObservations {
            found: nobs,
            required,
        });
    }

    if family == Family::Gaussian {
        let solution = weighted_least_squares(x, &y.to_owned(), &prior_weights.to_owned())?;
        let mu = x.dot(&solution.beta);
        let rss = deviance(family, y, &mu, prior_weights);
        let df_residual = (nobs - p) as f64;
        let sigma2 = rss / df_residual;
        if !solution.beta.iter().all(|b| b.is_finite()) || !sigma2.is_finite() {
            return Err(ModelError::NonFinite(1));
        }
        return Ok(Fit {
            coefficients: solution.beta,
            vcov: solution.xtwx_inverse * sigma2,
            deviance: rss,
            iterations: 1,
            df_residual,
            nobs,
        });
    }

    let link = family.link();
    let mut mu = match family {
        Family::Binomial => y.mapv(|v| (v + 0.5) / 2.0),
        _ => y.mapv(|v| v + 0.1),
    };
    let mut eta = mu.mapv(|m| link.link(m));
    let mut deviance_old = deviance(family, y, &mu, prior_weights);
    let mut last_change = f64::INFINITY;

    for iteration in 1..=options.max_iterations {
        let mu_eta = eta.mapv(|e| link.mu_eta(e));
        let z = &eta + &((&y - &mu) / &mu_eta);
        let variance = mu.mapv(|m| family.variance(m));
        let working_weights = &prior_weights * &(&mu_eta * &mu_eta / &variance);

        let solution = weighted_least_squares(x, &z, &working_weights)?;
        eta = x.dot(&solution.beta);
        mu = eta.mapv(|e| link.inverse(e));
        let deviance_new = deviance(family, y, &mu, prior_weights);

        if !deviance_new.is_finite() || !solution.beta.iter().all(|b| b.is_finite()) {
            log::error!("Non-finite IRLS state at iteration {iteration}");
            return Err(ModelError::NonFinite(iteration));
        }

        last_change = (deviance_new - deviance_old).abs() / (deviance_new.abs() + 0.1);
        log::debug!(
            "IRLS iteration {iteration}: deviance {deviance_new:.8}, relative change {last_change:.3e}"
        );
        if last_change < options.tolerance {
            return Ok(Fit {
                coefficients: solution.beta,
                vcov: solution.xtwx_inverse,
                deviance: deviance_new,
                iterations: iteration,
                df_residual: (nobs - p) as f64,
                nobs,
            });
        }
        deviance_old = deviance_new;
    }

    Err(ModelError::DidNotConverge {
        max_iterations: options.max_iterations,
        last_change,
    })
}
