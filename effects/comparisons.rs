//! Counterfactual comparisons on a numeric regressor.
//!
//! A comparison predicts twice, once with the variable moved "low" and once
//! "high", and combines the two prediction vectors element-wise.

use crate::data::Dataset;
use crate::estimates::{EstimateError, format_number};
use crate::model::{Predictable, Scale};
use ndarray::{Array1, ArrayView1};
use std::fmt;
use std::sync::Arc;

/// How the low and high values of the variable are chosen.
#[derive(Debug, Clone, PartialEq)]
pub enum Contrast {
    /// `x - h/2` versus `x + h/2`.
    Increment(f64),
    /// Every row set to `from`, then to `to`.
    Levels { from: f64, to: f64 },
    /// Centred change of one standard deviation of the model data.
    Sd,
    /// Minimum versus maximum of the model data.
    MinMax,
}

impl Default for Contrast {
    fn default() -> Self {
        Self::Increment(1.0)
    }
}

impl Contrast {
    /// Low and high versions of `x`. Spreads and extremes come from `model_data`,
    /// not from the evaluation frame.
    pub fn counterfactuals(
        &self,
        x: ArrayView1<f64>,
        model_data: &Dataset,
        variable: &str,
    ) -> Result<(Array1<f64>, Array1<f64>), EstimateError> {
        let shifted = |half: f64| (x.mapv(|v| v - half), x.mapv(|v| v + half));
        Ok(match *self {
            Self::Increment(h) => shifted(h / 2.0),
            Self::Sd => shifted(model_data.std_dev(variable)? / 2.0),
            Self::Levels { from, to } => {
                (Array1::from_elem(x.len(), from), Array1::from_elem(x.len(), to))
            }
            Self::MinMax => {
                let (min, max) = model_data.range(variable)?;
                (Array1::from_elem(x.len(), min), Array1::from_elem(x.len(), max))
            }
        })
    }

    pub fn label(&self) -> String {
        match *self {
            Self::Increment(h) => format!("+{}", format_number(h)),
            Self::Levels { from, to } => format!("{} - {}", format_number(to), format_number(from)),
            Self::Sd => "+sd".to_string(),
            Self::MinMax => "max - min".to_string(),
        }
    }
}

/// Element-wise function of high and low predictions.
pub type ComparisonFn = Arc<dyn Fn(&[f64], &[f64]) -> Vec<f64> + Send + Sync>;

#[derive(Clone, Default)]
pub enum Comparison {
    #[default]
    Difference,
    Ratio,
    LnRatio,
    Custom { name: String, function: ComparisonFn },
}

impl fmt::Debug for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom { name, .. } => f.debug_struct("Custom").field("name", name).finish(),
            other => f.write_str(other.name()),
        }
    }
}

impl Comparison {
    /// Wraps a user function. Its output length is checked on every call.
    pub fn custom<F>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn(&[f64], &[f64]) -> Vec<f64> + Send + Sync + 'static,
    {
        Self::Custom {
            name: name.into(),
            function: Arc::new(function),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Difference => "difference",
            Self::Ratio => "ratio",
            Self::LnRatio => "lnratio",
            Self::Custom { name, .. } => name,
        }
    }

    pub fn apply(&self, hi: &Array1<f64>, lo: &Array1<f64>) -> Result<Array1<f64>, EstimateError> {
        Ok(match self {
            Self::Difference => hi - lo,
            Self::Ratio => hi / lo,
            Self::LnRatio => (hi / lo).mapv(f64::ln),
            Self::Custom { name, function } => {
                let (hi, lo) = (hi.to_vec(), lo.to_vec());
                let out = (function.as_ref())(&hi, &lo);
                if out.len() != hi.len() {
                    return Err(EstimateError::ComparisonLength {
                        name: name.clone(),
                        found: out.len(),
                        expected: hi.len(),
                    });
                }
                Array1::from_vec(out)
            }
        })
    }

    /// Row label combining the contrast with the comparison function.
    pub fn label(&self, contrast: &Contrast) -> String {
        match self {
            Self::Difference => contrast.label(),
            other => format!("{} ({})", contrast.label(), other.name()),
        }
    }
}

/// Unit-level comparisons of `variable` on `frame`.
pub fn unit_comparisons<M: Predictable>(
    model: &M,
    model_data: &Dataset,
    frame: &Dataset,
    variable: &str,
    contrast: &Contrast,
    comparison: &Comparison,
    scale: Scale,
) -> Result<Array1<f64>, EstimateError> {
    let x = frame.column(variable)?;
    let (lo, hi) = contrast.counterfactuals(x, model_data, variable)?;
    let lo_pred = model.predict(&frame.with_column(variable, lo)?, scale)?;
    let hi_pred = model.predict(&frame.with_column(variable, hi)?, scale)?;
    comparison.apply(&hi_pred, &lo_pred)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModelRegistry;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn linear_model() -> (crate::model::FittedModel, Arc<Dataset>) {
        let data = Arc::new(
            Dataset::new(vec![
                ("y", array![1.0, 3.1, 4.9, 7.2, 9.0, 10.8]),
                ("x", array![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]),
            ])
            .unwrap(),
        );
        let model = ModelRegistry::default().fit("lm", "y ~ x", data.clone(), None).unwrap();
        (model, data)
    }

    #[test]
    fn increment_difference_is_slope_for_linear_model() {
        let (model, data) = linear_model();
        let slope = model.coefficients()[1];
        let out = unit_comparisons(
            &model,
            &data,
            &data,
            "x",
            &Contrast::Increment(1.0),
            &Comparison::Difference,
            Scale::Response,
        )
        .unwrap();
        for v in out.iter() {
            assert_abs_diff_eq!(*v, slope, epsilon = 1e-10);
        }
    }

    #[test]
    fn minmax_spans_the_observed_range() {
        let (model, data) = linear_model();
        let slope = model.coefficients()[1];
        let out = unit_comparisons(
            &model,
            &data,
            &data,
            "x",
            &Contrast::MinMax,
            &Comparison::Difference,
            Scale::Response,
        )
        .unwrap();
        assert_abs_diff_eq!(out[0], 5.0 * slope, epsilon = 1e-10);
    }

    #[test]
    fn custom_comparison_length_is_checked() {
        let (model, data) = linear_model();
        let bad = Comparison::custom("first", |hi: &[f64], _lo: &[f64]| vec![hi[0]]);
        let err = unit_comparisons(
            &model,
            &data,
            &data,
            "x",
            &Contrast::default(),
            &bad,
            Scale::Response,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            EstimateError::ComparisonLength { found: 1, expected: 6, .. }
        ));

        let good = Comparison::custom("sum", |hi: &[f64], lo: &[f64]| {
            hi.iter().zip(lo).map(|(a, b)| a + b).collect()
        });
        let out = good.apply(&array![1.0, 2.0], &array![3.0, 4.0]).unwrap();
        assert_eq!(out.to_vec(), vec![4.0, 6.0]);
    }

    #[test]
    fn labels() {
        assert_eq!(Contrast::Increment(1.0).label(), "+1");
        assert_eq!(Contrast::Levels { from: 0.0, to: 2.5 }.label(), "2.5 - 0");
        assert_eq!(Comparison::Ratio.label(&Contrast::Sd), "+sd (ratio)");
        assert_eq!(format!("{:?}", Comparison::LnRatio), "lnratio");
    }
}
