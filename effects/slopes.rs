//! Partial derivatives and elasticities of the response-scale prediction with
//! respect to one numeric regressor, by centred finite differences.

use crate::data::Dataset;
use crate::estimates::EstimateError;
use crate::model::{Predictable, Scale};
use ndarray::Array1;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlopeKind {
    /// dY/dX
    #[default]
    Dydx,
    /// dY/dX · X/Y
    Eyex,
    /// dY/dX / Y
    Eydx,
    /// dY/dX · X
    Dyex,
}

impl SlopeKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Dydx => "dY/dX",
            Self::Eyex => "eY/eX",
            Self::Eydx => "eY/dX",
            Self::Dyex => "dY/eX",
        }
    }
}

impl fmt::Display for SlopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for SlopeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dydx" => Ok(Self::Dydx),
            "eyex" => Ok(Self::Eyex),
            "eydx" => Ok(Self::Eydx),
            "dyex" => Ok(Self::Dyex),
            other => Err(format!(
                "unknown slope '{other}'; expected one of dydx, eyex, eydx, dyex"
            )),
        }
    }
}

/// Default step: a ten-thousandth of the variable's range in the model data.
pub fn default_eps(model_data: &Dataset, variable: &str) -> Result<f64, EstimateError> {
    let (min, max) = model_data.range(variable)?;
    let range = max - min;
    Ok(if range > 0.0 { 1e-4 * range } else { 1e-4 })
}

/// Unit-level slopes of `variable` on `frame`.
pub fn unit_slopes<M: Predictable>(
    model: &M,
    model_data: &Dataset,
    frame: &Dataset,
    variable: &str,
    kind: SlopeKind,
    eps: Option<f64>,
) -> Result<Array1<f64>, EstimateError> {
    let eps = match eps {
        Some(eps) => eps,
        None => default_eps(model_data, variable)?,
    };
    let x = frame.column(variable)?.to_owned();
    let lo = model.predict(&frame.with_column(variable, x.mapv(|v| v - eps / 2.0))?, Scale::Response)?;
    let hi = model.predict(&frame.with_column(variable, x.mapv(|v| v + eps / 2.0))?, Scale::Response)?;
    let dydx = (hi - lo) / eps;

    Ok(match kind {
        SlopeKind::Dydx => dydx,
        SlopeKind::Dyex => dydx * &x,
        SlopeKind::Eyex => dydx * &x / &model.predict(frame, Scale::Response)?,
        SlopeKind::Eydx => dydx / &model.predict(frame, Scale::Response)?,
    })
}
