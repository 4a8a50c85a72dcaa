//! # Estimate Tables
//!
//! A `Call` records everything needed to produce one table of estimates:
//! the quantity (predictions, comparisons or slopes), the evaluation data,
//! the aggregation, optional averaging weights and an optional hypothesis.
//! `Call::evaluate` is a pure function of a model and a dataset, which is what
//! lets the replication layer re-run the exact same call against refitted
//! models, resampled rows or simulated coefficients.
//!
//! Rows are identified by a `RowKey` (term, contrast, row id or grouping values)
//! rather than by position.

use crate::comparisons::{Comparison, Contrast, unit_comparisons};
use crate::data::{DataError, Dataset};
use crate::delta;
use crate::grid::NewData;
use crate::hypothesis::Hypothesis;
use crate::model::{Fittable, FittedModel, ModelError, Predictable, Scale};
use crate::replicate::InferenceAttachment;
use crate::slopes::{SlopeKind, unit_slopes};
use ahash::AHashMap;
use ndarray::{Array1, ArrayView1};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EstimateError {
    #[error("Model error: {0}")]
    Model(#[from] ModelError),
    #[error("Data error: {0}")]
    Data(#[from] DataError),
    #[error(
        "Custom comparison '{name}' returned {found} values for inputs of length {expected}."
    )]
    ComparisonLength {
        name: String,
        found: usize,
        expected: usize,
    },
    #[error("Hypothesis weights have length {found}, but there are {expected} estimates.")]
    HypothesisLength { found: usize, expected: usize },
    #[error("The '{hypothesis}' hypothesis needs at least {needed} estimates; found {found}.")]
    HypothesisRows {
        hypothesis: &'static str,
        needed: usize,
        found: usize,
    },
    #[error("conf_level must lie strictly between 0 and 1; got {0}.")]
    InvalidConfLevel(f64),
    #[error("The evaluation data has no rows.")]
    EmptyData,
}

/// Integers print without a decimal point; everything else uses `Display`.
pub(crate) fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// One component of a row key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyValue {
    /// Zero-based row of the evaluation data (printed one-based).
    Index(usize),
    /// A numeric grouping or grid value, stored by bit pattern.
    Number(u64),
    Label(String),
}

/// Bit pattern used for grouping; -0.0 and 0.0 share a group.
fn group_bits(value: f64) -> u64 {
    if value == 0.0 { 0.0f64.to_bits() } else { value.to_bits() }
}

impl KeyValue {
    pub fn number(value: f64) -> Self {
        Self::Number(group_bits(value))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Index(i) => Some(*i as f64),
            Self::Number(bits) => Some(f64::from_bits(*bits)),
            Self::Label(_) => None,
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "{}", i + 1),
            Self::Number(bits) => f.write_str(&format_number(f64::from_bits(*bits))),
            Self::Label(label) => f.write_str(label),
        }
    }
}

/// Ordered `(name, value)` pairs identifying one estimate row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct RowKey(Vec<(String, KeyValue)>);

impl RowKey {
    pub fn with(mut self, name: impl Into<String>, value: KeyValue) -> Self {
        self.0.push((name.into(), value));
        self
    }

    pub fn get(&self, name: &str) -> Option<&KeyValue> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(n, _)| n.as_str())
    }

    /// Values only, comma separated.
    pub fn values_label(&self) -> String {
        self.0
            .iter()
            .map(|(_, v)| v.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(n, v)| format!("{n}={v}")).collect();
        f.write_str(&parts.join(", "))
    }
}

/// A keyed point estimate, before any uncertainty is attached.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub key: RowKey,
    pub estimate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EstimateRow {
    pub key: RowKey,
    pub estimate: f64,
    pub std_error: Option<f64>,
    pub statistic: Option<f64>,
    pub p_value: Option<f64>,
    pub conf_low: Option<f64>,
    pub conf_high: Option<f64>,
}

impl EstimateRow {
    fn wald(point: Point, std_error: f64, critical: f64) -> Self {
        let statistic = point.estimate / std_error;
        Self {
            estimate: point.estimate,
            std_error: Some(std_error),
            statistic: Some(statistic),
            p_value: Some(delta::two_sided_p_value(statistic)),
            conf_low: Some(point.estimate - critical * std_error),
            conf_high: Some(point.estimate + critical * std_error),
            key: point.key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantityKind {
    Prediction,
    Comparison,
    Slope,
    Hypothesis,
}

impl fmt::Display for QuantityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Prediction => "prediction",
            Self::Comparison => "comparison",
            Self::Slope => "slope",
            Self::Hypothesis => "hypothesis",
        })
    }
}

#[derive(Debug, Clone)]
pub enum Quantity {
    Predictions {
        scale: Scale,
    },
    Comparisons {
        variable: String,
        contrast: Contrast,
        comparison: Comparison,
        scale: Scale,
    },
    Slopes {
        variable: String,
        kind: SlopeKind,
        eps: Option<f64>,
    },
}

/// How unit-level values are aggregated.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum By {
    /// One row per evaluation row.
    #[default]
    None,
    /// A single (weighted) average.
    Average,
    /// One (weighted) average per distinct combination of these columns.
    Columns(Vec<String>),
}

/// A fully specified quantity request.
#[derive(Debug, Clone)]
pub struct Call {
    pub quantity: Quantity,
    pub newdata: NewData,
    pub by: By,
    pub wts: Option<String>,
    pub hypothesis: Option<Hypothesis>,
    pub conf_level: f64,
}

impl Call {
    fn new(quantity: Quantity) -> Self {
        Self {
            quantity,
            newdata: NewData::Observed,
            by: By::None,
            wts: None,
            hypothesis: None,
            conf_level: 0.95,
        }
    }

    pub fn predictions() -> Self {
        Self::new(Quantity::Predictions {
            scale: Scale::Response,
        })
    }

    pub fn comparisons(variable: impl Into<String>) -> Self {
        Self::new(Quantity::Comparisons {
            variable: variable.into(),
            contrast: Contrast::default(),
            comparison: Comparison::default(),
            scale: Scale::Response,
        })
    }

    pub fn slopes(variable: impl Into<String>) -> Self {
        Self::new(Quantity::Slopes {
            variable: variable.into(),
            kind: SlopeKind::default(),
            eps: None,
        })
    }

    pub fn by(mut self, by: By) -> Self {
        self.by = by;
        self
    }

    pub fn average(self) -> Self {
        self.by(By::Average)
    }

    pub fn newdata(mut self, newdata: NewData) -> Self {
        self.newdata = newdata;
        self
    }

    pub fn wts(mut self, column: impl Into<String>) -> Self {
        self.wts = Some(column.into());
        self
    }

    pub fn hypothesis(mut self, hypothesis: Hypothesis) -> Self {
        self.hypothesis = Some(hypothesis);
        self
    }

    pub fn conf_level(mut self, conf_level: f64) -> Self {
        self.conf_level = conf_level;
        self
    }

    /// Sets the prediction scale; slopes are always on the response scale.
    pub fn scale(mut self, new_scale: Scale) -> Self {
        match &mut self.quantity {
            Quantity::Predictions { scale } | Quantity::Comparisons { scale, .. } => {
                *scale = new_scale
            }
            Quantity::Slopes { .. } => {}
        }
        self
    }

    /// Has no effect unless this is a comparisons call.
    pub fn contrast(mut self, new_contrast: Contrast) -> Self {
        if let Quantity::Comparisons { contrast, .. } = &mut self.quantity {
            *contrast = new_contrast;
        }
        self
    }

    /// Has no effect unless this is a comparisons call.
    pub fn comparison(mut self, new_comparison: Comparison) -> Self {
        if let Quantity::Comparisons { comparison, .. } = &mut self.quantity {
            *comparison = new_comparison;
        }
        self
    }

    /// Has no effect unless this is a slopes call.
    pub fn slope(mut self, new_kind: SlopeKind, new_eps: Option<f64>) -> Self {
        if let Quantity::Slopes { kind, eps, .. } = &mut self.quantity {
            *kind = new_kind;
            *eps = new_eps;
        }
        self
    }

    pub fn kind(&self) -> QuantityKind {
        if self.hypothesis.is_some() {
            return QuantityKind::Hypothesis;
        }
        match self.quantity {
            Quantity::Predictions { .. } => QuantityKind::Prediction,
            Quantity::Comparisons { .. } => QuantityKind::Comparison,
            Quantity::Slopes { .. } => QuantityKind::Slope,
        }
    }

    /// The user-facing function this call corresponds to.
    pub fn function_name(&self) -> &'static str {
        let averaged = !matches!(self.by, By::None);
        match (&self.quantity, averaged) {
            (Quantity::Predictions { .. }, false) => "predictions",
            (Quantity::Predictions { .. }, true) => "avg_predictions",
            (Quantity::Comparisons { .. }, false) => "comparisons",
            (Quantity::Comparisons { .. }, true) => "avg_comparisons",
            (Quantity::Slopes { .. }, false) => "slopes",
            (Quantity::Slopes { .. }, true) => "avg_slopes",
        }
    }

    /// Rows correspond one-to-one with rows of the evaluation data.
    pub fn is_unit_level(&self) -> bool {
        matches!(self.by, By::None)
    }

    /// Evaluates the call for `model` on `data`. `replicate_weights`, when
    /// given, multiply the averaging weights of observed-data aggregates.
    pub fn evaluate<M: Predictable>(
        &self,
        model: &M,
        data: &Dataset,
        replicate_weights: Option<ArrayView1<'_, f64>>,
    ) -> Result<Vec<Point>, EstimateError> {
        let frame = self.newdata.frame(data);
        if frame.nrows() == 0 {
            return Err(EstimateError::EmptyData);
        }

        let (base, unit) = match &self.quantity {
            Quantity::Predictions { scale } => (RowKey::default(), model.predict(frame, *scale)?),
            Quantity::Comparisons {
                variable,
                contrast,
                comparison,
                scale,
            } => (
                RowKey::default()
                    .with("term", KeyValue::Label(variable.clone()))
                    .with("contrast", KeyValue::Label(comparison.label(contrast))),
                unit_comparisons(model, data, frame, variable, contrast, comparison, *scale)?,
            ),
            Quantity::Slopes {
                variable,
                kind,
                eps,
            } => (
                RowKey::default()
                    .with("term", KeyValue::Label(variable.clone()))
                    .with("contrast", KeyValue::Label(kind.label().to_string())),
                unit_slopes(model, data, frame, variable, *kind, *eps)?,
            ),
        };

        let points = match &self.by {
            By::None => self.unit_points(base, &unit, frame)?,
            By::Average => {
                let weights = self.averaging_weights(frame, replicate_weights)?;
                let all: Vec<usize> = (0..unit.len()).collect();
                vec![Point {
                    key: base,
                    estimate: weighted_mean(&unit, weights.as_ref(), &all),
                }]
            }
            By::Columns(columns) => {
                let weights = self.averaging_weights(frame, replicate_weights)?;
                grouped_points(base, &unit, weights.as_ref(), frame, columns)?
            }
        };

        match &self.hypothesis {
            Some(hypothesis) => hypothesis.apply(points),
            None => Ok(points),
        }
    }

    fn unit_points(
        &self,
        base: RowKey,
        unit: &Array1<f64>,
        frame: &Dataset,
    ) -> Result<Vec<Point>, EstimateError> {
        let varying = self.newdata.varying();
        let mut columns = Vec::with_capacity(varying.len());
        for name in varying {
            columns.push((name.as_str(), frame.column(name)?));
        }
        Ok(unit
            .iter()
            .enumerate()
            .map(|(i, &estimate)| {
                let key = if columns.is_empty() {
                    base.clone().with("rowid", KeyValue::Index(i))
                } else {
                    columns.iter().fold(base.clone(), |key, (name, column)| {
                        key.with(*name, KeyValue::number(column[i]))
                    })
                };
                Point { key, estimate }
            })
            .collect())
    }

    fn averaging_weights(
        &self,
        frame: &Dataset,
        replicate_weights: Option<ArrayView1<'_, f64>>,
    ) -> Result<Option<Array1<f64>>, EstimateError> {
        let base = match &self.wts {
            Some(column) => Some(frame.column(column)?.to_owned()),
            None => None,
        };
        let replicate = replicate_weights
            .filter(|w| self.newdata.is_observed() && w.len() == frame.nrows());
        Ok(match (base, replicate) {
            (Some(base), Some(extra)) => Some(base * &extra),
            (Some(base), None) => Some(base),
            (None, Some(extra)) => Some(extra.to_owned()),
            (None, None) => None,
        })
    }
}

fn weighted_mean(values: &Array1<f64>, weights: Option<&Array1<f64>>, rows: &[usize]) -> f64 {
    match weights {
        Some(w) => {
            let total: f64 = rows.iter().map(|&i| w[i]).sum();
            if total > 0.0 {
                rows.iter().map(|&i| w[i] * values[i]).sum::<f64>() / total
            } else {
                f64::NAN
            }
        }
        None => rows.iter().map(|&i| values[i]).sum::<f64>() / rows.len() as f64,
    }
}

/// Weighted means per distinct combination of `columns`, in ascending order.
fn grouped_points(
    base: RowKey,
    unit: &Array1<f64>,
    weights: Option<&Array1<f64>>,
    frame: &Dataset,
    columns: &[String],
) -> Result<Vec<Point>, EstimateError> {
    let mut views = Vec::with_capacity(columns.len());
    for name in columns {
        views.push(frame.column(name)?);
    }

    let mut groups: AHashMap<Vec<u64>, Vec<usize>> = AHashMap::new();
    for i in 0..frame.nrows() {
        let group = views.iter().map(|column| group_bits(column[i])).collect();
        groups.entry(group).or_default().push(i);
    }

    let mut ordered: Vec<(Vec<u64>, Vec<usize>)> = groups.into_iter().collect();
    ordered.sort_by(|(a, _), (b, _)| {
        a.iter()
            .zip(b)
            .map(|(x, y)| f64::from_bits(*x).total_cmp(&f64::from_bits(*y)))
            .find(|ord| ord.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    Ok(ordered
        .into_iter()
        .map(|(group, rows)| {
            let key = columns
                .iter()
                .zip(&group)
                .fold(base.clone(), |key, (name, bits)| {
                    key.with(name.clone(), KeyValue::Number(*bits))
                });
            Point {
                key,
                estimate: weighted_mean(unit, weights, &rows),
            }
        })
        .collect())
}

/// An estimate table with provenance.
#[derive(Debug, Clone)]
pub struct Estimates {
    rows: Vec<EstimateRow>,
    call: Call,
    model: Arc<FittedModel>,
    inference: Option<InferenceAttachment>,
}

impl Estimates {
    /// Evaluates `call` on the model's data with delta-method uncertainty.
    pub fn compute(model: Arc<FittedModel>, call: Call) -> Result<Self, EstimateError> {
        if !(call.conf_level > 0.0 && call.conf_level < 1.0) {
            return Err(EstimateError::InvalidConfLevel(call.conf_level));
        }
        let data = model.data();
        let points = call.evaluate(model.as_ref(), data, None)?;

        let jac = delta::jacobian(model.coefficients(), points.len(), |beta| {
            let perturbed = model.with_coefficients(beta)?;
            let values = call.evaluate(&perturbed, data, None)?;
            Ok::<_, EstimateError>(values.iter().map(|p| p.estimate).collect())
        })?;
        let std_errors = delta::standard_errors(&jac, model.vcov());
        let critical = delta::critical_value(call.conf_level);

        let rows = points
            .into_iter()
            .zip(std_errors.iter())
            .map(|(point, &se)| EstimateRow::wald(point, se, critical))
            .collect();
        log::debug!("Computed {} with delta-method standard errors", call.function_name());

        Ok(Self {
            rows,
            call,
            model,
            inference: None,
        })
    }

    pub(crate) fn with_inference(&self, rows: Vec<EstimateRow>, inference: InferenceAttachment) -> Self {
        Self {
            rows,
            call: self.call.clone(),
            model: Arc::clone(&self.model),
            inference: Some(inference),
        }
    }

    pub fn rows(&self) -> &[EstimateRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn kind(&self) -> QuantityKind {
        self.call.kind()
    }

    pub fn call(&self) -> &Call {
        &self.call
    }

    pub fn model(&self) -> &Arc<FittedModel> {
        &self.model
    }

    pub fn inference(&self) -> Option<&InferenceAttachment> {
        self.inference.as_ref()
    }

    pub fn estimates(&self) -> Array1<f64> {
        self.rows.iter().map(|r| r.estimate).collect()
    }

    /// First `n` rows, keeping their replicate rows when present.
    pub fn head(&self, n: usize) -> Self {
        let n = n.min(self.rows.len());
        Self {
            rows: self.rows[..n].to_vec(),
            call: self.call.clone(),
            model: Arc::clone(&self.model),
            inference: self.inference.as_ref().map(|inf| inf.head(n)),
        }
    }
}

pub fn predictions(model: &Arc<FittedModel>) -> Result<Estimates, EstimateError> {
    Estimates::compute(Arc::clone(model), Call::predictions())
}

pub fn avg_predictions(model: &Arc<FittedModel>) -> Result<Estimates, EstimateError> {
    Estimates::compute(Arc::clone(model), Call::predictions().average())
}

pub fn comparisons(model: &Arc<FittedModel>, variable: &str) -> Result<Estimates, EstimateError> {
    Estimates::compute(Arc::clone(model), Call::comparisons(variable))
}

pub fn avg_comparisons(model: &Arc<FittedModel>, variable: &str) -> Result<Estimates, EstimateError> {
    Estimates::compute(Arc::clone(model), Call::comparisons(variable).average())
}

pub fn slopes(model: &Arc<FittedModel>, variable: &str) -> Result<Estimates, EstimateError> {
    Estimates::compute(Arc::clone(model), Call::slopes(variable))
}

pub fn avg_slopes(model: &Arc<FittedModel>, variable: &str) -> Result<Estimates, EstimateError> {
    Estimates::compute(Arc::clone(model), Call::slopes(variable).average())
}
