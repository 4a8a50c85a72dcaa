//! Linear hypotheses over an estimate table, applied after aggregation.

use crate::estimates::{EstimateError, KeyValue, Point, RowKey, format_number};

#[derive(Debug, Clone, PartialEq)]
pub enum Hypothesis {
    /// Every pair `i < j`: row i minus row j.
    Pairwise,
    /// Every row after the first, minus the first.
    Reference,
    /// Every row after the first, minus its predecessor.
    Sequential,
    /// One weighted sum of all rows.
    Linear(Vec<f64>),
}

impl Hypothesis {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pairwise => "pairwise",
            Self::Reference => "reference",
            Self::Sequential => "sequential",
            Self::Linear(_) => "linear",
        }
    }

    pub fn apply(&self, points: Vec<Point>) -> Result<Vec<Point>, EstimateError> {
        let labels: Vec<String> = points
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let label = p.key.values_label();
                if label.is_empty() { format!("b{}", i + 1) } else { label }
            })
            .collect();
        let difference = |i: usize, j: usize| Point {
            key: hypothesis_key(format!("({}) - ({})", labels[i], labels[j])),
            estimate: points[i].estimate - points[j].estimate,
        };

        let needed = match self {
            Self::Linear(_) => 1,
            _ => 2,
        };
        if points.len() < needed {
            return Err(EstimateError::HypothesisRows {
                hypothesis: self.name(),
                needed,
                found: points.len(),
            });
        }

        Ok(match self {
            Self::Pairwise => {
                let n = points.len();
                (0..n)
                    .flat_map(|i| (i + 1..n).map(move |j| (i, j)))
                    .map(|(i, j)| difference(i, j))
                    .collect()
            }
            Self::Reference => (1..points.len()).map(|i| difference(i, 0)).collect(),
            Self::Sequential => (1..points.len()).map(|i| difference(i, i - 1)).collect(),
            Self::Linear(weights) => {
                if weights.len() != points.len() {
                    return Err(EstimateError::HypothesisLength {
                        found: weights.len(),
                        expected: points.len(),
                    });
                }
                let label = weights
                    .iter()
                    .zip(&labels)
                    .filter(|(w, _)| **w != 0.0)
                    .map(|(w, l)| format!("{}*({})", format_number(*w), l))
                    .collect::<Vec<_>>()
                    .join(" + ");
                let estimate = weights
                    .iter()
                    .zip(&points)
                    .map(|(w, p)| w * p.estimate)
                    .sum();
                vec![Point {
                    key: hypothesis_key(label),
                    estimate,
                }]
            }
        })
    }
}

fn hypothesis_key(label: String) -> RowKey {
    RowKey::default().with("hypothesis", KeyValue::Label(label))
}
