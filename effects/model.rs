use crate::data::{DataError, Dataset};
use crate::delta::two_sided_p_value;
use crate::design::{build_design, response};
use crate::formula::{Formula, FormulaError};
use crate::registry::Estimator;
use crate::types::Coefficients;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Defines the link function, connecting the linear predictor to the mean response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFunction {
    /// The identity link, for continuous outcomes (Gaussian regression).
    Identity,
    /// The logit link, for binary or proportional outcomes.
    /// Maps probabilities (0, 1) to the real line (-inf, +inf).
    Logit,
    /// The log link, for counts.
    Log,
}

impl LinkFunction {
    pub fn link(self, mu: f64) -> f64 {
        match self {
            Self::Identity => mu,
            Self::Logit => (mu / (1.0 - mu)).ln(),
            Self::Log => mu.ln(),
        }
    }

    /// Inverse link. `eta` is clamped before exponentiation to prevent overflow.
    pub fn inverse(self, eta: f64) -> f64 {
        match self {
            Self::Identity => eta,
            Self::Logit => {
                let e = eta.clamp(-700.0, 700.0);
                1.0 / (1.0 + (-e).exp())
            }
            Self::Log => eta.min(700.0).exp(),
        }
    }

    /// dμ/dη.
    pub fn mu_eta(self, eta: f64) -> f64 {
        match self {
            Self::Identity => 1.0,
            Self::Logit => {
                let mu = self.inverse(eta);
                (mu * (1.0 - mu)).max(f64::EPSILON)
            }
            Self::Log => eta.min(700.0).exp().max(f64::EPSILON),
        }
    }
}

/// Error distribution of the response; each family uses its canonical link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Gaussian,
    Binomial,
    Poisson,
}

impl Family {
    pub fn link(self) -> LinkFunction {
        match self {
            Self::Gaussian => LinkFunction::Identity,
            Self::Binomial => LinkFunction::Logit,
            Self::Poisson => LinkFunction::Log,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Gaussian => "gaussian",
            Self::Binomial => "binomial",
            Self::Poisson => "poisson",
        }
    }

    pub fn variance(self, mu: f64) -> f64 {
        match self {
            Self::Gaussian => 1.0,
            Self::Binomial => (mu * (1.0 - mu)).max(f64::EPSILON),
            Self::Poisson => mu.max(f64::EPSILON),
        }
    }

    /// Unit deviance contribution `d(y, μ)` before the prior weight.
    pub fn unit_deviance(self, y: f64, mu: f64) -> f64 {
        fn ylogy(y: f64, mu: f64) -> f64 {
            if y > 0.0 { y * (y / mu).ln() } else { 0.0 }
        }
        match self {
            Self::Gaussian => (y - mu).powi(2),
            Self::Binomial => {
                let mu = mu.clamp(1e-10, 1.0 - 1e-10);
                2.0 * (ylogy(y, mu) + ylogy(1.0 - y, 1.0 - mu))
            }
            Self::Poisson => 2.0 * (ylogy(y, mu) - (y - mu)),
        }
    }

    /// Checks that a response value lies in the family's support.
    pub fn validate_response(self, y: ArrayView1<f64>) -> Result<(), ModelError> {
        fn finite(v: f64) -> bool {
            v.is_finite()
        }
        fn unit_interval(v: f64) -> bool {
            (0.0..=1.0).contains(&v)
        }
        fn non_negative(v: f64) -> bool {
            v >= 0.0 && v.is_finite()
        }
        let (ok, requirement): (fn(f64) -> bool, &'static str) = match self {
            Self::Gaussian => (finite as fn(f64) -> bool, "a finite response"),
            Self::Binomial => (unit_interval, "a response in [0, 1]"),
            Self::Poisson => (non_negative, "a non-negative response"),
        };
        match y.iter().position(|&v| !ok(v)) {
            Some(row) => Err(ModelError::InvalidResponse {
                family: self.name(),
                requirement,
                value: y[row],
                row: row + 1,
            }),
            None => Ok(()),
        }
    }
}

/// Scale on which predictions are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scale {
    #[default]
    Response,
    Link,
}

/// Custom error type for model fitting and prediction.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Data error: {0}")]
    Data(#[from] DataError),
    #[error("Formula error: {0}")]
    Formula(#[from] FormulaError),
    #[error("No estimator is registered under the tag '{tag}'. Available: {available}.")]
    UnknownEstimator { tag: String, available: String },
    #[error("The design matrix has no columns.")]
    EmptyDesign,
    #[error(
        "The weighted cross-product matrix is singular; the design is rank deficient on this data."
    )]
    SingularDesign,
    #[error(
        "{found} observations with positive weight are not enough to estimate {required} coefficients."
    )]
    InsufficientObservations { found: usize, required: usize },
    #[error(
        "IRLS did not converge within {max_iterations} iterations. Last relative deviance change was {last_change:.3e}."
    )]
    DidNotConverge {
        max_iterations: usize,
        last_change: f64,
    },
    #[error("Non-finite coefficients or deviance at IRLS iteration {0}.")]
    NonFinite(usize),
    #[error("The {family} family requires {requirement}; found {value} at row {row}.")]
    InvalidResponse {
        family: &'static str,
        requirement: &'static str,
        value: f64,
        row: usize,
    },
    #[error("Case weights must be finite and non-negative; found {value} at row {row}.")]
    InvalidWeights { value: f64, row: usize },
    #[error("Replacement coefficient vector has length {found}, but the model has {expected}.")]
    CoefficientLength { found: usize, expected: usize },
    #[error("Replicate weight vector has length {found}, but the data has {expected} rows.")]
    WeightLength { found: usize, expected: usize },
}

/// The outcome of one estimator run on a design matrix.
#[derive(Debug, Clone)]
pub struct Fit {
    pub coefficients: Array1<f64>,
    pub vcov: Array2<f64>,
    pub deviance: f64,
    pub iterations: usize,
    pub df_residual: f64,
    pub nobs: usize,
}

/// A model that can produce the quantity of interest for arbitrary data.
pub trait Predictable {
    fn coefficients(&self) -> ArrayView1<'_, f64>;

    fn vcov(&self) -> ArrayView2<'_, f64>;

    /// Same model with the coefficient vector swapped; the covariance is kept.
    fn with_coefficients(&self, coefficients: Array1<f64>) -> Result<Self, ModelError>
    where
        Self: Sized;

    fn predict(&self, data: &Dataset, scale: Scale) -> Result<Array1<f64>, ModelError>;
}

/// A model that can be re-estimated on new data with the same specification.
pub trait Fittable {
    fn data(&self) -> &Arc<Dataset>;

    /// Whether the specification includes an explicit case-weight column.
    fn has_case_weights(&self) -> bool;

    /// Re-runs the estimator on `data`. `replicate_weights`, when given, multiply
    /// the case weights row by row.
    fn refit(
        &self,
        data: Arc<Dataset>,
        replicate_weights: Option<ArrayView1<'_, f64>>,
    ) -> Result<Self, ModelError>
    where
        Self: Sized;
}

/// A fitted regression model together with everything needed to refit it.
#[derive(Debug, Clone)]
pub struct FittedModel {
    estimator: Arc<dyn Estimator>,
    formula: Formula,
    weights: Option<String>,
    data: Arc<Dataset>,
    coefficients: Coefficients,
    vcov: Array2<f64>,
    deviance: f64,
    iterations: usize,
    df_residual: f64,
    nobs: usize,
}

impl FittedModel {
    pub fn fit(
        estimator: Arc<dyn Estimator>,
        formula: Formula,
        data: Arc<Dataset>,
        weights: Option<String>,
    ) -> Result<Self, ModelError> {
        Self::fit_internal(estimator, formula, data, weights, None)
    }

    fn fit_internal(
        estimator: Arc<dyn Estimator>,
        formula: Formula,
        data: Arc<Dataset>,
        weights: Option<String>,
        replicate_weights: Option<ArrayView1<'_, f64>>,
    ) -> Result<Self, ModelError> {
        let x = build_design(&formula, &data)?;
        if x.ncols() == 0 {
            return Err(ModelError::EmptyDesign);
        }
        let y = response(&formula, &data)?;
        estimator.family().validate_response(y.view())?;

        let mut w = match &weights {
            Some(column) => data.column(column)?.to_owned(),
            None => Array1::ones(data.nrows()),
        };
        if let Some(row) = w.iter().position(|&v| !v.is_finite() || v < 0.0) {
            return Err(ModelError::InvalidWeights {
                value: w[row],
                row: row + 1,
            });
        }
        if let Some(extra) = replicate_weights {
            if extra.len() != w.len() {
                return Err(ModelError::WeightLength {
                    found: extra.len(),
                    expected: w.len(),
                });
            }
            w *= &extra;
        }

        let fit = estimator.fit(x.view(), y.view(), w.view())?;
        log::debug!(
            "Fitted '{}' ({}) on {} rows in {} iterations, deviance {:.6}",
            estimator.tag(),
            formula,
            fit.nobs,
            fit.iterations,
            fit.deviance
        );

        Ok(Self {
            estimator,
            formula,
            weights,
            data,
            coefficients: Coefficients::new(fit.coefficients),
            vcov: fit.vcov,
            deviance: fit.deviance,
            iterations: fit.iterations,
            df_residual: fit.df_residual,
            nobs: fit.nobs,
        })
    }

    pub fn tag(&self) -> &'static str {
        self.estimator.tag()
    }

    pub fn family(&self) -> Family {
        self.estimator.family()
    }

    pub fn formula(&self) -> &Formula {
        &self.formula
    }

    pub fn weights_column(&self) -> Option<&str> {
        self.weights.as_deref()
    }

    pub fn deviance(&self) -> f64 {
        self.deviance
    }

    pub fn df_residual(&self) -> f64 {
        self.df_residual
    }

    pub fn nobs(&self) -> usize {
        self.nobs
    }

    pub fn coefficient_names(&self) -> Vec<String> {
        self.formula.column_names()
    }

    pub fn std_errors(&self) -> Array1<f64> {
        self.vcov.diag().mapv(|v| v.max(0.0).sqrt())
    }
}

impl Predictable for FittedModel {
    fn coefficients(&self) -> ArrayView1<'_, f64> {
        self.coefficients.as_view()
    }

    fn vcov(&self) -> ArrayView2<'_, f64> {
        self.vcov.view()
    }

    fn with_coefficients(&self, coefficients: Array1<f64>) -> Result<Self, ModelError> {
        if coefficients.len() != self.coefficients.len() {
            return Err(ModelError::CoefficientLength {
                found: coefficients.len(),
                expected: self.coefficients.len(),
            });
        }
        let mut swapped = self.clone();
        swapped.coefficients = Coefficients::new(coefficients);
        Ok(swapped)
    }

    fn predict(&self, data: &Dataset, scale: Scale) -> Result<Array1<f64>, ModelError> {
        let x = build_design(&self.formula, data)?;
        let eta = x.dot(&*self.coefficients);
        Ok(match scale {
            Scale::Link => eta,
            Scale::Response => {
                let link = self.family().link();
                eta.mapv(|e| link.inverse(e))
            }
        })
    }
}

impl Fittable for FittedModel {
    fn data(&self) -> &Arc<Dataset> {
        &self.data
    }

    fn has_case_weights(&self) -> bool {
        self.weights.is_some()
    }

    fn refit(
        &self,
        data: Arc<Dataset>,
        replicate_weights: Option<ArrayView1<'_, f64>>,
    ) -> Result<Self, ModelError> {
        Self::fit_internal(
            Arc::clone(&self.estimator),
            self.formula.clone(),
            data,
            self.weights.clone(),
            replicate_weights,
        )
    }
}

impl fmt::Display for FittedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Model: {} ({}), formula: {}", self.tag(), self.family().name(), self.formula)?;
        if let Some(column) = &self.weights {
            writeln!(f, "Case weights: {column}")?;
        }
        writeln!(
            f,
            "{:<20} {:>12} {:>12} {:>9} {:>10}",
            "", "Estimate", "Std. Error", "z", "Pr(>|z|)"
        )?;
        let std_errors = self.std_errors();
        for ((name, &estimate), &se) in self
            .coefficient_names()
            .iter()
            .zip(self.coefficients.iter())
            .zip(std_errors.iter())
        {
            let z = estimate / se;
            writeln!(
                f,
                "{:<20} {:>12.6} {:>12.6} {:>9.3} {:>10.4}",
                name,
                estimate,
                se,
                z,
                two_sided_p_value(z)
            )?;
        }
        write!(
            f,
            "n = {}, residual df = {}, deviance = {:.6}, iterations = {}",
            self.nobs, self.df_residual, self.deviance, self.iterations
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModelRegistry;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn linear_data() -> Arc<Dataset> {
        let x = array![0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
        let y = array![1.1, 2.9, 5.2, 7.1, 8.8, 11.0];
        Arc::new(Dataset::new(vec![("y", y), ("x", x)]).unwrap())
    }

    #[test]
    fn link_functions_invert() {
        for link in [LinkFunction::Identity, LinkFunction::Logit, LinkFunction::Log] {
            let mu = 0.3;
            assert_abs_diff_eq!(link.inverse(link.link(mu)), mu, epsilon = 1e-12);
        }
    }

    #[test]
    fn with_coefficients_swaps_only_beta() {
        let model = ModelRegistry::default()
            .fit("lm", "y ~ x", linear_data(), None)
            .unwrap();
        let swapped = model.with_coefficients(array![0.0, 1.0]).unwrap();
        let preds = swapped.predict(&linear_data(), Scale::Response).unwrap();
        assert_eq!(preds.to_vec(), vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(swapped.vcov(), model.vcov());
        assert!(matches!(
            model.with_coefficients(array![1.0]),
            Err(ModelError::CoefficientLength { found: 1, expected: 2 })
        ));
    }

    #[test]
    fn refit_reuses_specification() {
        let data = linear_data();
        let model = ModelRegistry::default().fit("lm", "y ~ x", data.clone(), None).unwrap();
        let subset = Arc::new(data.select_rows(&[0, 1, 2, 3]).unwrap());
        let refitted = model.refit(subset, None).unwrap();
        assert_eq!(refitted.tag(), "lm");
        assert_eq!(refitted.nobs(), 4);
        assert_ne!(refitted.coefficients(), model.coefficients());
    }

    #[test]
    fn replicate_weights_multiply_case_weights() {
        let data = linear_data();
        let model = ModelRegistry::default().fit("lm", "y ~ x", data.clone(), None).unwrap();
        let zero_last = array![1.0, 1.0, 1.0, 1.0, 1.0, 0.0];
        let weighted = model.refit(data.clone(), Some(zero_last.view())).unwrap();
        let dropped = model
            .refit(Arc::new(data.select_rows(&[0, 1, 2, 3, 4]).unwrap()), None)
            .unwrap();
        for (a, b) in weighted.coefficients().iter().zip(dropped.coefficients().iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-10);
        }
        assert_eq!(weighted.nobs(), 5);

        let short = array![1.0, 1.0];
        assert!(matches!(
            model.refit(data, Some(short.view())),
            Err(ModelError::WeightLength { found: 2, expected: 6 })
        ));
    }

    #[test]
    fn binomial_response_is_validated() {
        let data = Arc::new(
            Dataset::new(vec![("y", array![0.0, 2.0, 1.0]), ("x", array![1.0, 2.0, 3.0])]).unwrap(),
        );
        let err = ModelRegistry::default().fit("logit", "y ~ x", data, None).unwrap_err();
        assert!(matches!(err, ModelError::InvalidResponse { row: 2, .. }));
    }

    #[test]
    fn display_lists_coefficients() {
        let model = ModelRegistry::default().fit("lm", "y ~ x", linear_data(), None).unwrap();
        let text = model.to_string();
        assert!(text.contains("(Intercept)"));
        assert!(text.contains("Std. Error"));
    }
}
