#![deny(dead_code)]
#![deny(unused_imports)]

pub mod comparisons;
pub mod data;
pub mod delta;
pub mod design;
pub mod estimates;
pub mod faer_ndarray;
pub mod formula;
pub mod grid;
pub mod hypothesis;
pub mod irls;
pub mod model;
pub mod registry;
pub mod report;
pub mod slopes;
pub mod types;

// Replication layer: bootstrap, simulation and posterior draws.
#[path = "../replicate/lib.rs"]
pub mod replicate;

pub use comparisons::{Comparison, Contrast};
pub use data::Dataset;
pub use estimates::{
    By, Call, EstimateError, EstimateRow, Estimates, KeyValue, Quantity, QuantityKind, RowKey,
    avg_comparisons, avg_predictions, avg_slopes, comparisons, predictions, slopes,
};
pub use grid::NewData;
pub use hypothesis::Hypothesis;
pub use model::{Fittable, FittedModel, Predictable, Scale};
pub use registry::ModelRegistry;
pub use replicate::{InferenceOptions, inferences, posterior_draws};
pub use slopes::SlopeKind;
