//! # Replicate Orchestration
//!
//! `inferences` re-derives the uncertainty of an estimate table by replication:
//!
//! 1. Validate the configuration; nothing is drawn until it passes.
//! 2. Draw all perturbations sequentially from one seeded RNG, so a seed pins
//!    down the whole replicate set regardless of thread scheduling.
//! 3. Apply every perturbation on the rayon pool: refit (or swap coefficients)
//!    and re-run the table's own `Call`. Each replicate is tagged with its
//!    index and owns all of its intermediate state.
//! 4. Align replicate values to the original rows by row key.
//! 5. Summarise each row and attach the replicate matrix to a copy of the table.

use super::backend::{BackendInput, Perturbation, ResamplingBackend, backend_for};
use super::config::{InferenceOptions, IntervalType, Method};
use super::error::{ConfigurationError, InferenceError, PreconditionError, RefitError};
use super::summary::summarize_row;
use crate::estimates::{Call, EstimateError, EstimateRow, Estimates, Point, RowKey};
use crate::model::{Fittable, FittedModel, Predictable};
use crate::types::ReplicateIndex;
use ahash::AHashMap;
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array1, Array2, s};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use std::sync::Arc;

/// Describes how a replicate set was produced.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendInfo {
    pub method: Method,
    pub replicates_requested: usize,
    pub replicates_used: usize,
    pub seed: u64,
    pub interval: IntervalType,
    pub conf_level: f64,
    pub failures: Vec<RefitError>,
}

/// Replicate values attached to an estimate table by `inferences`.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceAttachment {
    pub backend: BackendInfo,
    /// `K × R`: one row per estimate row, one column per surviving replicate.
    pub draws: Array2<f64>,
    /// Index of the replicate behind each column of `draws`.
    pub replicate_ids: Vec<ReplicateIndex>,
}

impl InferenceAttachment {
    pub fn n_replicates(&self) -> usize {
        self.draws.ncols()
    }

    /// The first `n` estimate rows.
    pub fn head(&self, n: usize) -> Self {
        let n = n.min(self.draws.nrows());
        Self {
            backend: self.backend.clone(),
            draws: self.draws.slice(s![..n, ..]).to_owned(),
            replicate_ids: self.replicate_ids.clone(),
        }
    }
}

/// Replicate-based uncertainty for `estimates` using the method named `method`.
pub fn inferences(
    estimates: &Estimates,
    method: &str,
    replicates: usize,
    options: &InferenceOptions,
) -> Result<Estimates, InferenceError> {
    let method: Method = method.parse()?;
    inferences_with(estimates, backend_for(method).as_ref(), replicates, options)
}

/// As `inferences`, with an explicit backend.
pub fn inferences_with(
    estimates: &Estimates,
    backend: &dyn ResamplingBackend,
    replicates: usize,
    options: &InferenceOptions,
) -> Result<Estimates, InferenceError> {
    let method = backend.method();
    let model = estimates.model();
    let input = BackendInput {
        data: model.data(),
        coefficients: model.coefficients(),
        vcov: model.vcov(),
    };

    if replicates == 0 {
        return Err(ConfigurationError::InvalidReplicates(replicates).into());
    }
    options.validate()?;
    if replicates < options.min_replicates {
        return Err(ConfigurationError::ReplicatesBelowMinimum {
            replicates,
            min: options.min_replicates,
        }
        .into());
    }
    if method == Method::Fwb && model.has_case_weights() {
        return Err(ConfigurationError::WeightConflict {
            column: model.weights_column().unwrap_or_default().to_string(),
        }
        .into());
    }
    backend.validate(&input, &options.backend)?;
    let positions = row_positions(estimates)?;

    let seed = options.seed.unwrap_or_else(rand::random);
    let mut rng = StdRng::seed_from_u64(seed);
    let perturbations = backend.perturbations(&input, replicates, &options.backend, &mut rng)?;
    log::info!(
        "Running {replicates} '{method}' replicates of {} ({} rows, seed {seed})",
        estimates.call().function_name(),
        estimates.len()
    );

    let progress = options.progress.then(|| progress_bar(replicates));
    let call = estimates.call();

    let outcomes: Vec<(ReplicateIndex, Result<Array1<f64>, RefitError>)> = perturbations
        .into_par_iter()
        .enumerate()
        .map(|(r, perturbation)| {
            let replicate = ReplicateIndex(r);
            let outcome = run_replicate(model, call, perturbation)
                .map(|points| align(points, &positions))
                .map_err(|e| RefitError {
                    replicate,
                    reason: e.to_string(),
                });
            if let Some(bar) = &progress {
                bar.inc(1);
            }
            (replicate, outcome)
        })
        .collect();
    if let Some(bar) = progress {
        bar.finish_and_clear();
    }

    let mut columns = Vec::with_capacity(outcomes.len());
    let mut replicate_ids = Vec::with_capacity(outcomes.len());
    let mut failures = Vec::new();
    for (replicate, outcome) in outcomes {
        match outcome {
            Ok(values) => {
                columns.push(values);
                replicate_ids.push(replicate);
            }
            Err(failure) => failures.push(failure),
        }
    }

    if !failures.is_empty() {
        log::warn!(
            "{} of {replicates} '{method}' replicates failed and were dropped. First failure: {}",
            failures.len(),
            failures[0]
        );
    }
    if columns.len() < options.min_replicates {
        return Err(InferenceError::TooFewReplicates {
            survived: columns.len(),
            required: options.min_replicates,
            first_failure: failures
                .first()
                .map(|f| f.to_string())
                .unwrap_or_else(|| "none".to_string()),
        });
    }

    let k = estimates.len();
    let draws = Array2::from_shape_fn((k, columns.len()), |(i, j)| columns[j][i]);
    let mut unsummarised = 0;
    let rows: Vec<EstimateRow> = estimates
        .rows()
        .iter()
        .zip(draws.rows())
        .map(|(row, values)| {
            let summary = summarize_row(
                values.iter().copied(),
                row.estimate,
                options.interval,
                options.conf_level,
            );
            if summary.is_none() {
                unsummarised += 1;
            }
            EstimateRow {
                std_error: Some(summary.map_or(f64::NAN, |s| s.std_error)),
                statistic: None,
                p_value: None,
                conf_low: Some(summary.map_or(f64::NAN, |s| s.conf_low)),
                conf_high: Some(summary.map_or(f64::NAN, |s| s.conf_high)),
                ..row.clone()
            }
        })
        .collect();
    if unsummarised > 0 {
        log::warn!(
            "{unsummarised} rows have fewer than 2 finite replicate values; their uncertainty is NaN"
        );
    }

    log::info!(
        "Summarised {} rows from {} replicates ({} interval)",
        k,
        columns.len(),
        options.interval
    );
    let attachment = InferenceAttachment {
        backend: BackendInfo {
            method,
            replicates_requested: replicates,
            replicates_used: columns.len(),
            seed,
            interval: options.interval,
            conf_level: options.conf_level,
            failures,
        },
        draws,
        replicate_ids,
    };
    Ok(estimates.with_inference(rows, attachment))
}

fn progress_bar(replicates: usize) -> ProgressBar {
    let bar = ProgressBar::new(replicates as u64);
    if let Ok(style) = ProgressStyle::with_template(
        "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} replicates ({eta})",
    ) {
        bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    bar
}

/// Applies one perturbation and re-runs `call`.
///
/// Unit-level calls are evaluated on the original rows so that row ids keep
/// their meaning; aggregated calls are evaluated on the replicate's own data.
fn run_replicate(
    model: &Arc<FittedModel>,
    call: &Call,
    perturbation: Perturbation,
) -> Result<Vec<Point>, EstimateError> {
    let original = model.data();
    match perturbation {
        Perturbation::Coefficients(beta) => {
            let simulated = model.with_coefficients(beta)?;
            call.evaluate(&simulated, original, None)
        }
        Perturbation::Rows(indices) => {
            let resampled = Arc::new(original.select_rows(&indices)?);
            let refitted = model.refit(Arc::clone(&resampled), None)?;
            let data = if call.is_unit_level() { original } else { &resampled };
            call.evaluate(&refitted, data, None)
        }
        Perturbation::Weights(weights) => {
            let refitted = model.refit(Arc::clone(original), Some(weights.view()))?;
            let averaging = (!call.is_unit_level()).then(|| weights.view());
            call.evaluate(&refitted, original, averaging)
        }
    }
}

/// Position of every row key. Keys must be unique for replicate values to be
/// matched back to a single row.
fn row_positions(estimates: &Estimates) -> Result<AHashMap<&RowKey, usize>, PreconditionError> {
    let mut positions = AHashMap::with_capacity(estimates.len());
    for (i, row) in estimates.rows().iter().enumerate() {
        if positions.insert(&row.key, i).is_some() {
            return Err(PreconditionError::DuplicateRowKey(row.key.to_string()));
        }
    }
    Ok(positions)
}

/// Places replicate values at the positions of the matching original rows.
/// Keys the replicate did not produce stay NaN; unknown keys are ignored.
fn align(points: Vec<Point>, positions: &AHashMap<&RowKey, usize>) -> Array1<f64> {
    let mut values = Array1::from_elem(positions.len(), f64::NAN);
    for point in points {
        if let Some(&i) = positions.get(&point.key) {
            values[i] = point.estimate;
        }
    }
    values
}
