//! # Dataset Module
//!
//! The numeric, column-oriented table shared by model fitting and by every
//! quantity evaluation. A `Dataset` is immutable: resampling and counterfactual
//! edits produce new values, so a fitted model can hold its data behind an `Arc`
//! and hand it to replicate workers without copying.
//!
//! Tabular files are read with the `polars` CSV reader (tab separated, header
//! required). Every column must be numeric, complete and finite; failures are
//! assumed to be user-input errors and are reported through `DataError`.

use ahash::AHashMap;
use ndarray::{Array1, ArrayView1};
use std::path::Path;
use thiserror::Error;

/// A comprehensive error type for data loading and column access.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] polars::prelude::PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("The column '{0}' was not found in the dataset. Please check spelling and case.")]
    ColumnNotFound(String),
    #[error(
        "The column '{column_name}' could not be converted to f64. It contains non-numeric data. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        found_type: String,
    },
    #[error("Missing or null values were found in column '{0}'.")]
    MissingValuesFound(String),
    #[error("Non-finite values (NaN or Infinity) were found in column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("Column '{column}' has {found} rows, but the dataset has {expected}.")]
    LengthMismatch {
        column: String,
        found: usize,
        expected: usize,
    },
    #[error("Column '{0}' appears more than once.")]
    DuplicateColumn(String),
    #[error("Row index {index} is out of bounds for a dataset with {nrows} rows.")]
    RowOutOfBounds { index: usize, nrows: usize },
    #[error("A dataset needs at least one column.")]
    NoColumns,
    #[error("No values were supplied for grid column '{0}'.")]
    EmptyGridValues(String),
}

/// Named, equal-length `f64` columns.
#[derive(Debug, Clone)]
pub struct Dataset {
    names: Vec<String>,
    columns: Vec<Array1<f64>>,
    index: AHashMap<String, usize>,
    nrows: usize,
}

impl Dataset {
    /// Builds a dataset from `(name, values)` pairs, preserving column order.
    pub fn new<S: Into<String>>(columns: Vec<(S, Array1<f64>)>) -> Result<Self, DataError> {
        let mut names = Vec::with_capacity(columns.len());
        let mut values = Vec::with_capacity(columns.len());
        let mut index = AHashMap::with_capacity(columns.len());
        let mut nrows = None;

        for (name, column) in columns {
            let name = name.into();
            let expected = *nrows.get_or_insert(column.len());
            if column.len() != expected {
                return Err(DataError::LengthMismatch {
                    column: name,
                    found: column.len(),
                    expected,
                });
            }
            if index.insert(name.clone(), names.len()).is_some() {
                return Err(DataError::DuplicateColumn(name));
            }
            names.push(name);
            values.push(column);
        }

        let nrows = nrows.ok_or(DataError::NoColumns)?;
        Ok(Self {
            names,
            columns: values,
            index,
            nrows,
        })
    }

    /// Reads a tab-separated file with a header row.
    pub fn from_tsv(path: impl AsRef<Path>) -> Result<Self, DataError> {
        internal::read_tsv(path.as_ref())
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.columns.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn column(&self, name: &str) -> Result<ArrayView1<'_, f64>, DataError> {
        self.index
            .get(name)
            .map(|&idx| self.columns[idx].view())
            .ok_or_else(|| DataError::ColumnNotFound(name.to_string()))
    }

    /// Returns a copy with `name` replaced (or appended when absent).
    pub fn with_column(&self, name: &str, values: Array1<f64>) -> Result<Dataset, DataError> {
        if values.len() != self.nrows {
            return Err(DataError::LengthMismatch {
                column: name.to_string(),
                found: values.len(),
                expected: self.nrows,
            });
        }
        let mut out = self.clone();
        match out.index.get(name) {
            Some(&idx) => out.columns[idx] = values,
            None => {
                out.index.insert(name.to_string(), out.names.len());
                out.names.push(name.to_string());
                out.columns.push(values);
            }
        }
        Ok(out)
    }

    /// Gathers rows by index. Indices may repeat, which is how case resampling
    /// builds its replicate datasets.
    pub fn select_rows(&self, indices: &[usize]) -> Result<Dataset, DataError> {
        if let Some(&index) = indices.iter().find(|&&i| i >= self.nrows) {
            return Err(DataError::RowOutOfBounds {
                index,
                nrows: self.nrows,
            });
        }
        let columns = self
            .columns
            .iter()
            .map(|column| indices.iter().map(|&i| column[i]).collect::<Array1<f64>>())
            .collect();
        Ok(Dataset {
            names: self.names.clone(),
            columns,
            index: self.index.clone(),
            nrows: indices.len(),
        })
    }

    pub fn mean(&self, name: &str) -> Result<f64, DataError> {
        let column = self.column(name)?;
        Ok(column.mean().unwrap_or(f64::NAN))
    }

    /// Sample standard deviation (n - 1 denominator).
    pub fn std_dev(&self, name: &str) -> Result<f64, DataError> {
        let column = self.column(name)?;
        if column.len() < 2 {
            return Ok(0.0);
        }
        Ok(column.std(1.0))
    }

    pub fn range(&self, name: &str) -> Result<(f64, f64), DataError> {
        let column = self.column(name)?;
        let min = column.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        let max = column.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        Ok((min, max))
    }
}

mod internal {
    use super::{DataError, Dataset};
    use ndarray::Array1;
    use polars::prelude::*;
    use std::fs::File;
    use std::path::Path;

    fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
        let series = df.column(column_name)?;
        if series.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }

        let wrong_type = || DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            found_type: format!("{:?}", series.dtype()),
        };
        let casted = series.cast(&DataType::Float64).map_err(|_| wrong_type())?;
        if casted.null_count() > 0 {
            return Err(wrong_type());
        }

        let values: Vec<f64> = casted.f64()?.into_no_null_iter().collect();
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(values)
    }

    pub(super) fn read_tsv(path: &Path) -> Result<Dataset, DataError> {
        log::info!("Loading data from '{}'", path.display());
        let df = CsvReader::new(File::open(path)?)
            .with_options(
                CsvReadOptions::default()
                    .with_has_header(true)
                    .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
            )
            .finish()?;

        let names: Vec<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        let mut columns = Vec::with_capacity(names.len());
        for name in names {
            let values = extract_numeric_column(&df, &name)?;
            columns.push((name, Array1::from_vec(values)));
        }

        let dataset = Dataset::new(columns)?;
        log::info!(
            "Loaded {} rows and {} columns.",
            dataset.nrows(),
            dataset.ncols()
        );
        Ok(dataset)
    }
}
