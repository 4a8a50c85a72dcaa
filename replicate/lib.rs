//! Replication of estimate tables: simulation from the coefficient sampling
//! distribution, case and stratified bootstrap, fractional weighted bootstrap,
//! and read access to the resulting draws.

pub mod backend;
pub mod config;
pub mod draws;
pub mod error;
pub mod orchestrator;
pub mod summary;

pub use backend::{BackendInput, Perturbation, ResamplingBackend, backend_for};
pub use config::{BackendOptions, FwbWeights, InferenceOptions, IntervalType, Method};
pub use draws::{
    Center, CredibleInterval, DrawRow, DrawSummary, DrawSummaryRow, Draws, DrawsLayout,
    hypothesis_draws, posterior_draws, summarize_draws, write_draws_tsv, write_draws_tsv_to,
};
pub use error::{ConfigurationError, InferenceError, PreconditionError, RefitError};
pub use orchestrator::{BackendInfo, InferenceAttachment, inferences, inferences_with};
