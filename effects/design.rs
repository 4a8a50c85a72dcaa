use crate::data::{DataError, Dataset};
use crate::formula::Formula;
use ndarray::{Array1, Array2};

/// Builds the `n × p` model matrix for `formula` over `data`, in the column
/// order given by `Formula::column_names`. The response is not required.
pub fn build_design(formula: &Formula, data: &Dataset) -> Result<Array2<f64>, DataError> {
    let n = data.nrows();
    let offset = usize::from(formula.intercept);
    let mut x = Array2::<f64>::zeros((n, offset + formula.terms.len()));
    if formula.intercept {
        x.column_mut(0).fill(1.0);
    }

    for (j, term) in formula.terms.iter().enumerate() {
        let mut column = Array1::<f64>::ones(n);
        for factor in &term.factors {
            let raw = data.column(&factor.variable)?;
            column.zip_mut_with(&raw, |acc, &v| *acc *= factor.apply(v));
        }
        x.column_mut(offset + j).assign(&column);
    }
    Ok(x)
}

/// Extracts the response column named on the left-hand side.
pub fn response(formula: &Formula, data: &Dataset) -> Result<Array1<f64>, DataError> {
    Ok(data.column(&formula.response)?.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn interaction_columns_are_products() {
        let data = Dataset::new(vec![
            ("y", array![0.0, 0.0, 0.0]),
            ("x1", array![1.0, 2.0, 3.0]),
            ("x2", array![0.5, 1.0, -1.0]),
        ])
        .unwrap();
        let formula = Formula::parse("y ~ x1 * x2").unwrap();
        let x = build_design(&formula, &data).unwrap();

        assert_eq!(x.dim(), (3, 4));
        assert_eq!(x.column(0).to_vec(), vec![1.0, 1.0, 1.0]);
        assert_eq!(x.column(3).to_vec(), vec![0.5, 2.0, -3.0]);
    }

    #[test]
    fn transforms_apply_per_factor() {
        let data = Dataset::new(vec![("y", array![1.0, 2.0]), ("x", array![2.0, 3.0])]).unwrap();
        let formula = Formula::parse("y ~ I(x^2) - 1").unwrap();
        let x = build_design(&formula, &data).unwrap();
        assert_eq!(x.column(0).to_vec(), vec![4.0, 9.0]);
    }

    #[test]
    fn missing_predictor_is_reported() {
        let data = Dataset::new(vec![("y", array![1.0])]).unwrap();
        let formula = Formula::parse("y ~ z").unwrap();
        assert!(matches!(
            build_design(&formula, &data),
            Err(DataError::ColumnNotFound(name)) if name == "z"
        ));
    }
}
