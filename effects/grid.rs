//! Evaluation data for a quantity: the model's own rows, or a fixed grid built
//! once from the model data.

use crate::data::{DataError, Dataset};
use itertools::Itertools;
use ndarray::Array1;

#[derive(Debug, Clone, Default)]
pub enum NewData {
    /// The rows the model was fitted on (or a replicate's rows).
    #[default]
    Observed,
    /// A materialised grid. `varying` names the user-supplied columns; every
    /// other column holds its mean in the model data.
    Grid { data: Dataset, varying: Vec<String> },
}

impl NewData {
    /// Cartesian product of `values`, with the remaining columns of
    /// `model_data` held at their means. Later columns vary fastest. Repeated
    /// levels are kept once, in order of first appearance.
    pub fn grid(model_data: &Dataset, values: &[(&str, Vec<f64>)]) -> Result<Self, DataError> {
        for (name, levels) in values {
            if !model_data.has_column(name) {
                return Err(DataError::ColumnNotFound(name.to_string()));
            }
            if levels.is_empty() {
                return Err(DataError::EmptyGridValues(name.to_string()));
            }
        }

        let combinations: Vec<Vec<f64>> = if values.is_empty() {
            vec![Vec::new()]
        } else {
            values
                .iter()
                .map(|(_, levels)| {
                    levels
                        .iter()
                        .copied()
                        .unique_by(|&v| if v == 0.0 { 0 } else { v.to_bits() })
                        .collect::<Vec<f64>>()
                })
                .multi_cartesian_product()
                .collect()
        };
        let nrows = combinations.len();

        let mut columns = Vec::with_capacity(model_data.ncols());
        for name in model_data.names() {
            let column = match values.iter().position(|(v, _)| v == name) {
                Some(pos) => combinations.iter().map(|combo| combo[pos]).collect(),
                None => Array1::from_elem(nrows, model_data.mean(name)?),
            };
            columns.push((name.clone(), column));
        }

        Ok(Self::Grid {
            data: Dataset::new(columns)?,
            varying: values.iter().map(|(name, _)| name.to_string()).collect(),
        })
    }

    /// A single row holding every column's mean.
    pub fn means(model_data: &Dataset) -> Result<Self, DataError> {
        Self::grid(model_data, &[])
    }

    pub fn is_observed(&self) -> bool {
        matches!(self, Self::Observed)
    }

    /// The rows to evaluate on, given the data of the (possibly refitted) model.
    pub fn frame<'a>(&'a self, model_data: &'a Dataset) -> &'a Dataset {
        match self {
            Self::Observed => model_data,
            Self::Grid { data, .. } => data,
        }
    }

    pub fn varying(&self) -> &[String] {
        match self {
            Self::Observed => &[],
            Self::Grid { varying, .. } => varying,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn data() -> Dataset {
        Dataset::new(vec![
            ("y", array![1.0, 2.0, 3.0, 6.0]),
            ("x1", array![0.0, 1.0, 2.0, 3.0]),
            ("x2", array![1.0, 1.0, 0.0, 0.0]),
        ])
        .unwrap()
    }

    #[test]
    fn grid_is_cartesian_with_means_elsewhere() {
        let grid = NewData::grid(&data(), &[("x1", vec![0.0, 3.0]), ("x2", vec![0.0, 1.0])]).unwrap();
        let frame = grid.frame(&data()).clone();
        assert_eq!(frame.nrows(), 4);
        assert_eq!(frame.column("x1").unwrap().to_vec(), vec![0.0, 0.0, 3.0, 3.0]);
        assert_eq!(frame.column("x2").unwrap().to_vec(), vec![0.0, 1.0, 0.0, 1.0]);
        for v in frame.column("y").unwrap() {
            assert_abs_diff_eq!(*v, 3.0, epsilon = 1e-12);
        }
        assert_eq!(grid.varying(), &["x1".to_string(), "x2".to_string()]);
    }

    #[test]
    fn repeated_levels_are_kept_once() {
        let model_data = data();
        let grid = NewData::grid(&model_data, &[("x1", vec![2.0, 2.0, 5.0, -0.0, 0.0])]).unwrap();
        let frame = grid.frame(&model_data);
        assert_eq!(frame.column("x1").unwrap().to_vec(), vec![2.0, 5.0, -0.0]);
    }

    #[test]
    fn means_is_one_row() {
        let grid = NewData::means(&data()).unwrap();
        let model_data = data();
        let frame = grid.frame(&model_data);
        assert_eq!(frame.nrows(), 1);
        assert_abs_diff_eq!(frame.column("x1").unwrap()[0], 1.5, epsilon = 1e-12);
        assert!(grid.varying().is_empty());
    }

    #[test]
    fn grid_validates_columns() {
        assert!(matches!(
            NewData::grid(&data(), &[("z", vec![1.0])]),
            Err(DataError::ColumnNotFound(_))
        ));
        assert!(matches!(
            NewData::grid(&data(), &[("x1", vec![])]),
            Err(DataError::EmptyGridValues(_))
        ));
    }

    #[test]
    fn observed_frame_is_model_data() {
        let model_data = data();
        let frame = NewData::Observed.frame(&model_data);
        assert!(std::ptr::eq(frame, &model_data));
    }
}
