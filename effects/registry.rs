//! Explicit registry of model estimators keyed by a short tag (`lm`, `logit`,
//! `poisson`). A fitted model keeps a handle to the estimator that produced it,
//! which is what makes refitting on replicate data possible without knowing the
//! concrete model type.

use crate::data::Dataset;
use crate::formula::Formula;
use crate::irls::{IrlsOptions, fit_glm};
use crate::model::{Family, Fit, FittedModel, ModelError};
use ahash::AHashMap;
use ndarray::{ArrayView1, ArrayView2};
use std::fmt;
use std::sync::Arc;

/// One model family implementation.
pub trait Estimator: Send + Sync + fmt::Debug {
    fn tag(&self) -> &'static str;

    fn family(&self) -> Family;

    fn fit(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        weights: ArrayView1<f64>,
    ) -> Result<Fit, ModelError>;
}

/// Weighted least squares with Gaussian errors.
#[derive(Debug, Default)]
pub struct LinearRegression;

impl Estimator for LinearRegression {
    fn tag(&self) -> &'static str {
        "lm"
    }

    fn family(&self) -> Family {
        Family::Gaussian
    }

    fn fit(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        weights: ArrayView1<f64>,
    ) -> Result<Fit, ModelError> {
        fit_glm(Family::Gaussian, x, y, weights, &IrlsOptions::default())
    }
}

/// Binomial regression with the logit link.
#[derive(Debug, Default)]
pub struct LogisticRegression {
    pub options: IrlsOptions,
}

impl Estimator for LogisticRegression {
    fn tag(&self) -> &'static str {
        "logit"
    }

    fn family(&self) -> Family {
        Family::Binomial
    }

    fn fit(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        weights: ArrayView1<f64>,
    ) -> Result<Fit, ModelError> {
        fit_glm(Family::Binomial, x, y, weights, &self.options)
    }
}

/// Poisson regression with the log link.
#[derive(Debug, Default)]
pub struct PoissonRegression {
    pub options: IrlsOptions,
}

impl Estimator for PoissonRegression {
    fn tag(&self) -> &'static str {
        "poisson"
    }

    fn family(&self) -> Family {
        Family::Poisson
    }

    fn fit(
        &self,
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        weights: ArrayView1<f64>,
    ) -> Result<Fit, ModelError> {
        fit_glm(Family::Poisson, x, y, weights, &self.options)
    }
}

#[derive(Debug)]
pub struct ModelRegistry {
    estimators: AHashMap<&'static str, Arc<dyn Estimator>>,
}

impl ModelRegistry {
    /// A registry with no estimators.
    pub fn empty() -> Self {
        Self {
            estimators: AHashMap::new(),
        }
    }

    pub fn register(&mut self, estimator: Arc<dyn Estimator>) {
        self.estimators.insert(estimator.tag(), estimator);
    }

    pub fn tags(&self) -> Vec<&'static str> {
        let mut tags: Vec<_> = self.estimators.keys().copied().collect();
        tags.sort_unstable();
        tags
    }

    pub fn get(&self, tag: &str) -> Result<Arc<dyn Estimator>, ModelError> {
        self.estimators
            .get(tag)
            .cloned()
            .ok_or_else(|| ModelError::UnknownEstimator {
                tag: tag.to_string(),
                available: self.tags().join(", "),
            })
    }

    /// Parses `formula` and fits the estimator registered under `tag`.
    pub fn fit(
        &self,
        tag: &str,
        formula: &str,
        data: Arc<Dataset>,
        weights: Option<&str>,
    ) -> Result<FittedModel, ModelError> {
        let estimator = self.get(tag)?;
        let formula = Formula::parse(formula)?;
        log::info!("Fitting '{tag}' model {formula} on {} rows", data.nrows());
        FittedModel::fit(estimator, formula, data, weights.map(str::to_string))
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(LinearRegression));
        registry.register(Arc::new(LogisticRegression::default()));
        registry.register(Arc::new(PoissonRegression::default()));
        registry
    }
}
