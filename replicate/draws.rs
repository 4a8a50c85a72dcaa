//! Read access to the replicate values attached by `inferences`.
//!
//! Every function here is a pure read of the attachment: calling it twice on
//! the same table gives the same output.

use super::error::{InferenceError, PreconditionError};
use super::orchestrator::InferenceAttachment;
use super::summary::{finite_sorted, highest_density, mean, quantile};
use crate::estimates::{Estimates, KeyValue, RowKey};
use crate::report::ReportError;
use crate::types::ReplicateIndex;
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrawsLayout {
    /// One row per (estimate row, replicate).
    #[default]
    Long,
    /// Replicates in rows, estimate rows in columns.
    Matrix,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrawRow {
    /// Position of the estimate row in the table.
    pub row: usize,
    pub key: RowKey,
    pub draw_id: ReplicateIndex,
    pub draw: f64,
    pub estimate: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Draws {
    Long(Vec<DrawRow>),
    /// `R × K`.
    Matrix(Array2<f64>),
}

impl Draws {
    /// Number of (replicate, row) values.
    pub fn len(&self) -> usize {
        match self {
            Self::Long(rows) => rows.len(),
            Self::Matrix(matrix) => matrix.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn attachment(estimates: &Estimates) -> Result<&InferenceAttachment, PreconditionError> {
    estimates.inference().ok_or(PreconditionError::MissingDraws)
}

/// The replicate values of `estimates` in the requested layout.
pub fn posterior_draws(
    estimates: &Estimates,
    layout: DrawsLayout,
) -> Result<Draws, PreconditionError> {
    let inference = attachment(estimates)?;
    Ok(match layout {
        DrawsLayout::Matrix => Draws::Matrix(inference.draws.t().to_owned()),
        DrawsLayout::Long => {
            let mut rows = Vec::with_capacity(inference.draws.len());
            for (row, (estimate_row, values)) in estimates
                .rows()
                .iter()
                .zip(inference.draws.rows())
                .enumerate()
            {
                for (&draw_id, &draw) in inference.replicate_ids.iter().zip(values.iter()) {
                    rows.push(DrawRow {
                        row,
                        key: estimate_row.key.clone(),
                        draw_id,
                        draw,
                        estimate: estimate_row.estimate,
                    });
                }
            }
            Draws::Long(rows)
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Center {
    #[default]
    Mean,
    Median,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredibleInterval {
    /// Equal-tailed interval.
    #[default]
    Eti,
    /// Highest-density interval.
    Hdi,
}

/// How replicate values are summarised into a centre and an interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DrawSummary {
    pub center: Center,
    pub interval: CredibleInterval,
    pub conf_level: f64,
}

impl Default for DrawSummary {
    fn default() -> Self {
        Self {
            center: Center::Mean,
            interval: CredibleInterval::Eti,
            conf_level: 0.95,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DrawSummaryRow {
    pub key: RowKey,
    /// The point estimate computed from the original fit.
    pub estimate: f64,
    /// Centre of the replicate distribution.
    pub center: f64,
    pub conf_low: f64,
    pub conf_high: f64,
}

impl DrawSummary {
    fn apply(&self, key: RowKey, estimate: f64, values: ArrayView1<f64>) -> DrawSummaryRow {
        let sorted = finite_sorted(values.iter().copied());
        let center = match self.center {
            _ if sorted.is_empty() => f64::NAN,
            Center::Mean => mean(&sorted),
            Center::Median => quantile(&sorted, 0.5),
        };
        let alpha = (1.0 - self.conf_level) / 2.0;
        let (conf_low, conf_high) = match self.interval {
            CredibleInterval::Eti => (quantile(&sorted, alpha), quantile(&sorted, 1.0 - alpha)),
            CredibleInterval::Hdi => highest_density(&sorted, self.conf_level),
        };
        DrawSummaryRow {
            key,
            estimate,
            center,
            conf_low,
            conf_high,
        }
    }
}

/// Centre and interval of every row's replicate values.
pub fn summarize_draws(
    estimates: &Estimates,
    summary: &DrawSummary,
) -> Result<Vec<DrawSummaryRow>, PreconditionError> {
    let inference = attachment(estimates)?;
    Ok(estimates
        .rows()
        .iter()
        .zip(inference.draws.rows())
        .map(|(row, values)| summary.apply(row.key.clone(), row.estimate, values))
        .collect())
}

/// Evaluates `f` on the full estimate vector for the point estimate and on
/// every replicate column for the uncertainty. `f` must return the same
/// number of values every time.
pub fn hypothesis_draws<F>(
    estimates: &Estimates,
    f: F,
    summary: &DrawSummary,
) -> Result<Vec<DrawSummaryRow>, InferenceError>
where
    F: Fn(ArrayView1<f64>) -> Vec<f64>,
{
    let inference = attachment(estimates)?;
    let point = f(estimates.estimates().view());
    let m = point.len();

    let mut replicated = Array2::<f64>::zeros((m, inference.n_replicates()));
    for (j, column) in inference.draws.columns().into_iter().enumerate() {
        let values = f(column);
        if values.len() != m {
            return Err(InferenceError::DrawFunctionLength {
                found: values.len(),
                expected: m,
            });
        }
        replicated.column_mut(j).assign(&Array1::from_vec(values));
    }

    Ok(point
        .iter()
        .zip(replicated.rows())
        .enumerate()
        .map(|(i, (&estimate, values))| {
            let key = RowKey::default().with("hypothesis", KeyValue::Label(format!("h{}", i + 1)));
            summary.apply(key, estimate, values)
        })
        .collect())
}

/// Writes the long layout as tab-separated text.
pub fn write_draws_tsv_to<W: Write>(estimates: &Estimates, writer: W) -> Result<(), InferenceError> {
    let Draws::Long(rows) = posterior_draws(estimates, DrawsLayout::Long)? else {
        return Ok(());
    };
    let mut out = csv::WriterBuilder::new().delimiter(b'\t').from_writer(writer);
    out.write_record(["row", "key", "draw_id", "draw", "estimate"])
        .map_err(ReportError::from)?;
    for row in rows {
        out.write_record([
            (row.row + 1).to_string(),
            row.key.to_string(),
            row.draw_id.to_string(),
            row.draw.to_string(),
            row.estimate.to_string(),
        ])
        .map_err(ReportError::from)?;
    }
    out.flush().map_err(ReportError::from)?;
    Ok(())
}

pub fn write_draws_tsv(estimates: &Estimates, path: impl AsRef<Path>) -> Result<(), InferenceError> {
    let file = File::create(path.as_ref()).map_err(ReportError::from)?;
    write_draws_tsv_to(estimates, file)?;
    log::info!("Wrote posterior draws to '{}'", path.as_ref().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Dataset;
    use crate::estimates::{By, Call, avg_predictions};
    use crate::model::FittedModel;
    use crate::registry::ModelRegistry;
    use crate::replicate::{InferenceOptions, inferences};
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::sync::Arc;

    fn model() -> Arc<FittedModel> {
        let data = Arc::new(
            Dataset::new(vec![
                ("y", array![1.2, 1.9, 3.1, 3.9, 5.2, 6.1, 6.8, 8.2]),
                ("x", array![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]),
                ("g", array![0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0]),
            ])
            .unwrap(),
        );
        Arc::new(ModelRegistry::default().fit("lm", "y ~ x", data, None).unwrap())
    }

    fn grouped_with_draws(r: usize) -> Estimates {
        let call = Call::predictions().by(By::Columns(vec!["g".to_string()]));
        let est = Estimates::compute(model(), call).unwrap();
        let options = InferenceOptions {
            seed: Some(21),
            ..InferenceOptions::default()
        };
        inferences(&est, "simulation", r, &options).unwrap()
    }

    #[test]
    fn long_layout_has_r_times_k_rows() {
        let est = grouped_with_draws(25);
        let draws = posterior_draws(&est, DrawsLayout::Long).unwrap();
        assert_eq!(draws.len(), 25 * 4);
        let Draws::Long(rows) = draws else {
            panic!("expected long layout");
        };
        assert_eq!(rows[0].row, 0);
        assert_eq!(rows[25].row, 1);
        assert_eq!(rows[26].draw_id, ReplicateIndex(1));
        assert_eq!(rows[25].estimate, est.rows()[1].estimate);
    }

    #[test]
    fn matrix_layout_is_replicates_by_rows() {
        let est = grouped_with_draws(10);
        let Draws::Matrix(matrix) = posterior_draws(&est, DrawsLayout::Matrix).unwrap() else {
            panic!("expected matrix layout");
        };
        assert_eq!(matrix.dim(), (10, 4));
        assert_eq!(matrix[(3, 2)], est.inference().unwrap().draws[(2, 3)]);
    }

    #[test]
    fn draws_are_idempotent() {
        let est = grouped_with_draws(15);
        let first = posterior_draws(&est, DrawsLayout::Long).unwrap();
        let second = posterior_draws(&est, DrawsLayout::Long).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_draws_is_a_precondition_error() {
        let est = avg_predictions(&model()).unwrap();
        assert_eq!(
            posterior_draws(&est, DrawsLayout::Long).unwrap_err(),
            PreconditionError::MissingDraws
        );
        assert!(summarize_draws(&est, &DrawSummary::default()).is_err());
    }

    #[test]
    fn summaries_respect_the_configuration() {
        let est = grouped_with_draws(400);
        let mean_eti = summarize_draws(&est, &DrawSummary::default()).unwrap();
        let median_hdi = summarize_draws(
            &est,
            &DrawSummary {
                center: Center::Median,
                interval: CredibleInterval::Hdi,
                conf_level: 0.9,
            },
        )
        .unwrap();
        for (a, b) in mean_eti.iter().zip(&median_hdi) {
            assert_eq!(a.key, b.key);
            assert!(a.conf_low < a.center && a.center < a.conf_high);
            assert!(b.conf_low <= b.center && b.center <= b.conf_high);
            // the 90% HDI is narrower than the 95% ETI
            assert!(b.conf_high - b.conf_low < a.conf_high - a.conf_low);
            assert_abs_diff_eq!(a.center, a.estimate, epsilon = 0.2);
        }
    }

    #[test]
    fn hypothesis_draws_use_the_joint_distribution() {
        let est = grouped_with_draws(200);
        let contrast = |v: ArrayView1<f64>| vec![v[3] - v[0], v[3] / v[0]];
        let rows = hypothesis_draws(&est, contrast, &DrawSummary::default()).unwrap();
        assert_eq!(rows.len(), 2);
        let estimates = est.estimates();
        assert_abs_diff_eq!(rows[0].estimate, estimates[3] - estimates[0], epsilon = 1e-12);
        assert!(rows[0].conf_low < rows[0].estimate && rows[0].estimate < rows[0].conf_high);

        let ragged = |v: ArrayView1<f64>| if v[0] == estimates[0] { vec![1.0] } else { vec![] };
        assert!(matches!(
            hypothesis_draws(&est, ragged, &DrawSummary::default()),
            Err(InferenceError::DrawFunctionLength { expected: 1, .. })
        ));
    }

    #[test]
    fn draws_tsv_has_header_and_rows() {
        let est = grouped_with_draws(5);
        let mut buffer = Vec::new();
        write_draws_tsv_to(&est, &mut buffer).unwrap();
        let text = String::from_utf8(buffer).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "row\tkey\tdraw_id\tdraw\testimate");
        assert_eq!(lines.len(), 1 + 5 * 4);
        assert!(lines[1].starts_with("1\tg=0\t1\t"));
    }
}
