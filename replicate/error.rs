use crate::estimates::EstimateError;
use crate::report::ReportError;
use crate::types::ReplicateIndex;
use thiserror::Error;

/// Invalid or conflicting settings, rejected before any replicate is computed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("Unknown inference method '{0}'. Expected one of: simulation, boot, rsample, fwb.")]
    UnknownMethod(String),
    #[error(
        "Weighting conflict: the model was fitted with case weights ('{column}'), and fwb replicate weights cannot be composed with them. Refit without weights or use method 'boot'."
    )]
    WeightConflict { column: String },
    #[error("The number of replicates must be at least 1; got {0}.")]
    InvalidReplicates(usize),
    #[error("conf_level must lie strictly between 0 and 1; got {0}.")]
    InvalidConfLevel(f64),
    #[error("min_replicates must be at least 1; got {0}.")]
    InvalidMinReplicates(usize),
    #[error(
        "{replicates} replicates were requested but at least {min} must survive (min_replicates). Request more replicates or lower min_replicates."
    )]
    ReplicatesBelowMinimum { replicates: usize, min: usize },
    #[error("Unknown {kind} '{value}'. Expected one of: {expected}.")]
    UnknownOption {
        kind: &'static str,
        value: String,
        expected: &'static str,
    },
    #[error("The strata column '{0}' is not present in the model data.")]
    MissingStrata(String),
    #[error("Failed to read inference options from '{path}': {reason}")]
    OptionsFile { path: String, reason: String },
}

/// One replicate whose refit or re-evaluation failed.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Replicate {replicate} failed: {reason}")]
pub struct RefitError {
    pub replicate: ReplicateIndex,
    pub reason: String,
}

/// A downstream operation needs metadata the table does not carry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PreconditionError {
    #[error(
        "This estimate table carries no replicate draws. Run `inferences` on it before requesting posterior draws."
    )]
    MissingDraws,
    #[error(
        "Estimate rows must have distinct keys to be matched across replicates; '{0}' appears more than once."
    )]
    DuplicateRowKey(String),
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("Precondition failed: {0}")]
    Precondition(#[from] PreconditionError),
    #[error("Estimation error: {0}")]
    Estimate(#[from] EstimateError),
    #[error(
        "Only {survived} replicates succeeded, fewer than the required {required}. First failure: {first_failure}"
    )]
    TooFewReplicates {
        survived: usize,
        required: usize,
        first_failure: String,
    },
    #[error("Resampling backend failed: {0}")]
    Backend(String),
    #[error("The draw function returned {found} values; expected {expected} for every replicate.")]
    DrawFunctionLength { found: usize, expected: usize },
    #[error("Output error: {0}")]
    Report(#[from] ReportError),
}
