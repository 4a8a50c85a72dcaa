//! Settings for the replication step. Everything is an explicit value passed
//! into `inferences`; nothing is read from process-wide state.

use super::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// How replicates are generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    /// Coefficients drawn from N(β̂, V); data fixed.
    Simulation,
    /// Rows resampled with replacement; model refitted.
    Boot,
    /// Row resampling, optionally within strata; model refitted.
    Rsample,
    /// Fractional weighted bootstrap: random case weights; model refitted.
    Fwb,
}

impl Method {
    pub fn name(self) -> &'static str {
        match self {
            Self::Simulation => "simulation",
            Self::Boot => "boot",
            Self::Rsample => "rsample",
            Self::Fwb => "fwb",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Method {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simulation" => Ok(Self::Simulation),
            "boot" => Ok(Self::Boot),
            "rsample" => Ok(Self::Rsample),
            "fwb" => Ok(Self::Fwb),
            _ => Err(ConfigurationError::UnknownMethod(s.to_string())),
        }
    }
}

/// How replicate values become confidence bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntervalType {
    /// Quantiles of the replicate distribution.
    #[default]
    Percentile,
    /// Point estimate ± z · replicate SE.
    Wald,
    /// Reflected percentiles: 2·estimate − quantile.
    Basic,
}

impl fmt::Display for IntervalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Percentile => "percentile",
            Self::Wald => "wald",
            Self::Basic => "basic",
        })
    }
}

impl FromStr for IntervalType {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "percentile" | "perc" => Ok(Self::Percentile),
            "wald" => Ok(Self::Wald),
            "basic" => Ok(Self::Basic),
            _ => Err(ConfigurationError::UnknownOption {
                kind: "interval type",
                value: s.to_string(),
                expected: "percentile, wald, basic",
            }),
        }
    }
}

/// Distribution of fractional bootstrap weights. Every choice has mean 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FwbWeights {
    /// Exponential(1), the Bayesian bootstrap.
    #[default]
    Exp,
    /// Poisson(1) counts.
    Poisson,
    /// Multinomial counts summing to n, equivalent to a case bootstrap.
    Multinomial,
    /// Mammen's two-point distribution shifted to mean 1.
    Mammen,
}

impl FromStr for FwbWeights {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exp" => Ok(Self::Exp),
            "poisson" => Ok(Self::Poisson),
            "multinomial" => Ok(Self::Multinomial),
            "mammen" => Ok(Self::Mammen),
            _ => Err(ConfigurationError::UnknownOption {
                kind: "fwb weight type",
                value: s.to_string(),
                expected: "exp, poisson, multinomial, mammen",
            }),
        }
    }
}

/// Options forwarded untouched to the resampling backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendOptions {
    /// Column whose distinct values define resampling strata (`rsample`).
    pub strata: Option<String>,
    pub fwb_weights: FwbWeights,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceOptions {
    pub conf_level: f64,
    pub interval: IntervalType,
    /// Seed for the perturbation stream. Drawn at random when absent.
    pub seed: Option<u64>,
    /// Fewer surviving replicates than this is an error.
    pub min_replicates: usize,
    pub backend: BackendOptions,
    /// Show a progress bar on stderr while replicates run.
    pub progress: bool,
}

impl Default for InferenceOptions {
    fn default() -> Self {
        Self {
            conf_level: 0.95,
            interval: IntervalType::default(),
            seed: None,
            min_replicates: 2,
            backend: BackendOptions::default(),
            progress: false,
        }
    }
}

impl InferenceOptions {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigurationError> {
        toml::from_str(text).map_err(|e| ConfigurationError::OptionsFile {
            path: "<string>".to_string(),
            reason: e.to_string(),
        })
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let failure = |reason: String| ConfigurationError::OptionsFile {
            path: path.display().to_string(),
            reason,
        };
        let text = fs::read_to_string(path).map_err(|e| failure(e.to_string()))?;
        toml::from_str(&text).map_err(|e| failure(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !(self.conf_level > 0.0 && self.conf_level < 1.0) {
            return Err(ConfigurationError::InvalidConfLevel(self.conf_level));
        }
        if self.min_replicates == 0 {
            return Err(ConfigurationError::InvalidMinReplicates(0));
        }
        Ok(())
    }
}
