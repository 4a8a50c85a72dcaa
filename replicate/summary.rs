//! Per-row statistics of replicate values.

use super::config::IntervalType;
use crate::delta::critical_value;

/// Sample quantile with linear interpolation between order statistics
/// (Hyndman and Fan type 7). `sorted` must be ascending and non-empty.
pub fn quantile(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    let h = (n - 1) as f64 * p.clamp(0.0, 1.0);
    let lo = h.floor() as usize;
    let hi = (lo + 1).min(n - 1);
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

pub fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Standard deviation with the `n - 1` denominator.
pub fn sample_sd(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return f64::NAN;
    }
    let m = mean(values);
    let ss: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    (ss / (n - 1) as f64).sqrt()
}

/// Shortest interval holding a `level` share of the sorted values.
pub fn highest_density(sorted: &[f64], level: f64) -> (f64, f64) {
    let n = sorted.len();
    if n == 0 {
        return (f64::NAN, f64::NAN);
    }
    let width = ((level * n as f64).ceil() as usize).clamp(1, n);
    let start = (0..=n - width)
        .min_by(|&a, &b| {
            let wa = sorted[a + width - 1] - sorted[a];
            let wb = sorted[b + width - 1] - sorted[b];
            wa.total_cmp(&wb)
        })
        .unwrap_or(0);
    (sorted[start], sorted[start + width - 1])
}

/// Finite values of `values`, sorted ascending.
pub fn finite_sorted(values: impl IntoIterator<Item = f64>) -> Vec<f64> {
    let mut finite: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
    finite.sort_by(f64::total_cmp);
    finite
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RowSummary {
    pub std_error: f64,
    pub conf_low: f64,
    pub conf_high: f64,
}

/// Summarises the replicate values of one row. `None` when fewer than two
/// finite values are available.
pub fn summarize_row(
    values: impl IntoIterator<Item = f64>,
    estimate: f64,
    interval: IntervalType,
    conf_level: f64,
) -> Option<RowSummary> {
    let sorted = finite_sorted(values);
    if sorted.len() < 2 {
        return None;
    }
    let std_error = sample_sd(&sorted);
    let alpha = (1.0 - conf_level) / 2.0;
    let (conf_low, conf_high) = match interval {
        IntervalType::Percentile => (quantile(&sorted, alpha), quantile(&sorted, 1.0 - alpha)),
        IntervalType::Basic => (
            2.0 * estimate - quantile(&sorted, 1.0 - alpha),
            2.0 * estimate - quantile(&sorted, alpha),
        ),
        IntervalType::Wald => {
            let z = critical_value(conf_level);
            (estimate - z * std_error, estimate + z * std_error)
        }
    };
    Some(RowSummary {
        std_error,
        conf_low,
        conf_high,
    })
}
