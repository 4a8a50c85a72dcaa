//! Replicate generators, one per inference method.
//!
//! A backend turns the model's data and coefficient distribution into `R`
//! perturbations. It never fits or evaluates anything itself: the orchestrator
//! applies each perturbation and re-runs the original call.

use super::config::{BackendOptions, FwbWeights, Method};
use super::error::{ConfigurationError, InferenceError};
use crate::data::Dataset;
use crate::faer_ndarray::FaerCholesky;
use ahash::AHashMap;
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::Rng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Exp1, Poisson, StandardNormal};

/// Largest diagonal jitter tried before a covariance matrix is declared unusable,
/// relative to its mean diagonal.
const MAX_RELATIVE_JITTER: f64 = 1e-6;

/// What one replicate changes.
#[derive(Debug, Clone, PartialEq)]
pub enum Perturbation {
    /// Row indices into the model data, with repeats.
    Rows(Vec<usize>),
    /// Case weights, one per model-data row.
    Weights(Array1<f64>),
    /// A replacement coefficient vector.
    Coefficients(Array1<f64>),
}

/// Read-only view of the fitted model handed to a backend.
#[derive(Debug, Clone, Copy)]
pub struct BackendInput<'a> {
    pub data: &'a Dataset,
    pub coefficients: ArrayView1<'a, f64>,
    pub vcov: ArrayView2<'a, f64>,
}

pub trait ResamplingBackend: Send + Sync {
    fn method(&self) -> Method;

    /// Checks backend options against the model before anything is drawn.
    fn validate(
        &self,
        _input: &BackendInput<'_>,
        _options: &BackendOptions,
    ) -> Result<(), ConfigurationError> {
        Ok(())
    }

    /// Draws `replicates` perturbations sequentially from `rng`.
    fn perturbations(
        &self,
        input: &BackendInput<'_>,
        replicates: usize,
        options: &BackendOptions,
        rng: &mut StdRng,
    ) -> Result<Vec<Perturbation>, InferenceError>;
}

/// The built-in backend for `method`.
pub fn backend_for(method: Method) -> Box<dyn ResamplingBackend> {
    match method {
        Method::Simulation => Box::new(CoefficientSimulation),
        Method::Boot => Box::new(CaseBootstrap),
        Method::Rsample => Box::new(StratifiedBootstrap),
        Method::Fwb => Box::new(FractionalWeights),
    }
}

/// `β* = β̂ + L z` with `L Lᵀ = V` and `z ~ N(0, I)`.
#[derive(Debug, Default)]
pub struct CoefficientSimulation;

impl CoefficientSimulation {
    /// Lower Cholesky factor of `vcov`, adding diagonal jitter when needed.
    fn factor(vcov: ArrayView2<f64>) -> Result<Array2<f64>, InferenceError> {
        if let Ok(factor) = vcov.cholesky(Side::Lower) {
            return Ok(factor.lower());
        }
        let p = vcov.nrows();
        let mean_diag = vcov.diag().iter().map(|v| v.abs()).sum::<f64>() / p.max(1) as f64;
        let ceiling = MAX_RELATIVE_JITTER * mean_diag;
        let mut jitter = 1e-10 * mean_diag;
        while jitter > 0.0 && jitter <= ceiling {
            let mut adjusted = vcov.to_owned();
            adjusted.diag_mut().mapv_inplace(|d| d + jitter);
            if let Ok(factor) = adjusted.cholesky(Side::Lower) {
                log::warn!(
                    "Coefficient covariance is not positive definite; added {jitter:.3e} to its diagonal"
                );
                return Ok(factor.lower());
            }
            jitter *= 10.0;
        }
        Err(InferenceError::Backend(
            "the coefficient covariance matrix is not positive definite".to_string(),
        ))
    }
}

impl ResamplingBackend for CoefficientSimulation {
    fn method(&self) -> Method {
        Method::Simulation
    }

    fn perturbations(
        &self,
        input: &BackendInput<'_>,
        replicates: usize,
        _options: &BackendOptions,
        rng: &mut StdRng,
    ) -> Result<Vec<Perturbation>, InferenceError> {
        let lower = Self::factor(input.vcov)?;
        let p = input.coefficients.len();
        Ok((0..replicates)
            .map(|_| {
                let z: Array1<f64> = (0..p).map(|_| rng.sample::<f64, _>(StandardNormal)).collect();
                Perturbation::Coefficients(&input.coefficients + &lower.dot(&z))
            })
            .collect())
    }
}

/// `n` rows drawn uniformly with replacement.
#[derive(Debug, Default)]
pub struct CaseBootstrap;

fn resample_rows(n: usize, rng: &mut StdRng) -> Vec<usize> {
    (0..n).map(|_| rng.gen_range(0..n)).collect()
}

impl ResamplingBackend for CaseBootstrap {
    fn method(&self) -> Method {
        Method::Boot
    }

    fn perturbations(
        &self,
        input: &BackendInput<'_>,
        replicates: usize,
        _options: &BackendOptions,
        rng: &mut StdRng,
    ) -> Result<Vec<Perturbation>, InferenceError> {
        let n = input.data.nrows();
        Ok((0..replicates)
            .map(|_| Perturbation::Rows(resample_rows(n, rng)))
            .collect())
    }
}

/// Case resampling within strata, preserving each stratum's size. Without a
/// strata column this is the plain case bootstrap.
#[derive(Debug, Default)]
pub struct StratifiedBootstrap;

impl StratifiedBootstrap {
    /// Row indices per stratum, strata in order of first appearance.
    fn strata(data: &Dataset, column: &str) -> Result<Vec<Vec<usize>>, ConfigurationError> {
        let values = data
            .column(column)
            .map_err(|_| ConfigurationError::MissingStrata(column.to_string()))?;
        let mut position: AHashMap<u64, usize> = AHashMap::new();
        let mut groups: Vec<Vec<usize>> = Vec::new();
        for (row, value) in values.iter().enumerate() {
            let slot = *position.entry(value.to_bits()).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[slot].push(row);
        }
        Ok(groups)
    }
}

impl ResamplingBackend for StratifiedBootstrap {
    fn method(&self) -> Method {
        Method::Rsample
    }

    fn validate(
        &self,
        input: &BackendInput<'_>,
        options: &BackendOptions,
    ) -> Result<(), ConfigurationError> {
        match &options.strata {
            Some(column) if !input.data.has_column(column) => {
                Err(ConfigurationError::MissingStrata(column.clone()))
            }
            _ => Ok(()),
        }
    }

    fn perturbations(
        &self,
        input: &BackendInput<'_>,
        replicates: usize,
        options: &BackendOptions,
        rng: &mut StdRng,
    ) -> Result<Vec<Perturbation>, InferenceError> {
        let Some(column) = &options.strata else {
            return CaseBootstrap.perturbations(input, replicates, options, rng);
        };
        let strata = Self::strata(input.data, column)?;
        log::debug!("Resampling within {} strata of '{column}'", strata.len());
        Ok((0..replicates)
            .map(|_| {
                let rows = strata
                    .iter()
                    .flat_map(|members| {
                        resample_rows(members.len(), rng)
                            .into_iter()
                            .map(|i| members[i])
                            .collect::<Vec<_>>()
                    })
                    .collect();
                Perturbation::Rows(rows)
            })
            .collect())
    }
}

/// Random case weights with mean one.
#[derive(Debug, Default)]
pub struct FractionalWeights;

impl FractionalWeights {
    fn draw(kind: FwbWeights, n: usize, rng: &mut StdRng) -> Result<Array1<f64>, InferenceError> {
        Ok(match kind {
            FwbWeights::Exp => {
                let raw: Array1<f64> = (0..n).map(|_| rng.sample::<f64, _>(Exp1)).collect();
                let total = raw.sum();
                raw * (n as f64 / total)
            }
            FwbWeights::Poisson => {
                let poisson = Poisson::<f64>::new(1.0)
                    .map_err(|e| InferenceError::Backend(format!("Poisson weights: {e}")))?;
                (0..n).map(|_| poisson.sample(rng)).collect()
            }
            FwbWeights::Multinomial => {
                let mut counts = Array1::<f64>::zeros(n);
                for _ in 0..n {
                    counts[rng.gen_range(0..n)] += 1.0;
                }
                counts
            }
            FwbWeights::Mammen => {
                let sqrt5 = 5.0_f64.sqrt();
                let low = 1.0 - (sqrt5 - 1.0) / 2.0;
                let high = 1.0 + (sqrt5 + 1.0) / 2.0;
                let p_low = (sqrt5 + 1.0) / (2.0 * sqrt5);
                (0..n)
                    .map(|_| if rng.gen_bool(p_low) { low } else { high })
                    .collect()
            }
        })
    }
}

impl ResamplingBackend for FractionalWeights {
    fn method(&self) -> Method {
        Method::Fwb
    }

    fn perturbations(
        &self,
        input: &BackendInput<'_>,
        replicates: usize,
        options: &BackendOptions,
        rng: &mut StdRng,
    ) -> Result<Vec<Perturbation>, InferenceError> {
        let n = input.data.nrows();
        (0..replicates)
            .map(|_| Self::draw(options.fwb_weights, n, rng).map(Perturbation::Weights))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::SeedableRng;

    fn data() -> Dataset {
        Dataset::new(vec![
            ("y", array![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]),
            ("s", array![0.0, 0.0, 1.0, 1.0, 1.0, 2.0]),
        ])
        .unwrap()
    }

    fn input<'a>(data: &'a Dataset, beta: &'a Array1<f64>, vcov: &'a Array2<f64>) -> BackendInput<'a> {
        BackendInput {
            data,
            coefficients: beta.view(),
            vcov: vcov.view(),
        }
    }

    #[test]
    fn simulation_recovers_covariance() {
        let data = data();
        let beta = array![1.0, -2.0];
        let vcov = array![[0.5, 0.2], [0.2, 0.3]];
        let mut rng = StdRng::seed_from_u64(7);
        let draws = CoefficientSimulation
            .perturbations(&input(&data, &beta, &vcov), 20_000, &BackendOptions::default(), &mut rng)
            .unwrap();
        let mut sum = Array1::<f64>::zeros(2);
        let mut cross = Array2::<f64>::zeros((2, 2));
        for draw in &draws {
            let Perturbation::Coefficients(b) = draw else {
                panic!("expected coefficients");
            };
            let centred = b - &beta;
            sum += &centred;
            for i in 0..2 {
                for j in 0..2 {
                    cross[(i, j)] += centred[i] * centred[j];
                }
            }
        }
        let r = draws.len() as f64;
        assert_abs_diff_eq!(sum[0] / r, 0.0, epsilon = 0.02);
        assert_abs_diff_eq!(cross[(0, 0)] / r, 0.5, epsilon = 0.03);
        assert_abs_diff_eq!(cross[(0, 1)] / r, 0.2, epsilon = 0.03);
        assert_abs_diff_eq!(cross[(1, 1)] / r, 0.3, epsilon = 0.03);
    }

    #[test]
    fn simulation_rejects_indefinite_covariance() {
        let data = data();
        let beta = array![0.0, 0.0];
        let vcov = array![[1.0, 0.0], [0.0, -1.0]];
        let mut rng = StdRng::seed_from_u64(1);
        let result = CoefficientSimulation.perturbations(
            &input(&data, &beta, &vcov),
            3,
            &BackendOptions::default(),
            &mut rng,
        );
        assert!(matches!(result, Err(InferenceError::Backend(_))));
    }

    #[test]
    fn bootstrap_is_seed_reproducible() {
        let data = data();
        let beta = array![0.0];
        let vcov = array![[1.0]];
        let run = |seed| {
            let mut rng = StdRng::seed_from_u64(seed);
            CaseBootstrap
                .perturbations(&input(&data, &beta, &vcov), 5, &BackendOptions::default(), &mut rng)
                .unwrap()
        };
        assert_eq!(run(11), run(11));
        assert_ne!(run(11), run(12));
        for p in run(3) {
            let Perturbation::Rows(rows) = p else {
                panic!("expected rows");
            };
            assert_eq!(rows.len(), 6);
            assert!(rows.iter().all(|&i| i < 6));
        }
    }

    #[test]
    fn strata_sizes_are_preserved() {
        let data = data();
        let beta = array![0.0];
        let vcov = array![[1.0]];
        let options = BackendOptions {
            strata: Some("s".to_string()),
            ..BackendOptions::default()
        };
        let mut rng = StdRng::seed_from_u64(5);
        let draws = StratifiedBootstrap
            .perturbations(&input(&data, &beta, &vcov), 50, &options, &mut rng)
            .unwrap();
        let strata = data.column("s").unwrap().to_owned();
        for p in draws {
            let Perturbation::Rows(rows) = p else {
                panic!("expected rows");
            };
            let count = |s: f64| rows.iter().filter(|&&i| strata[i] == s).count();
            assert_eq!((count(0.0), count(1.0), count(2.0)), (2, 3, 1));
        }

        let missing = BackendOptions {
            strata: Some("nope".to_string()),
            ..BackendOptions::default()
        };
        assert!(matches!(
            StratifiedBootstrap.validate(&input(&data, &beta, &vcov), &missing),
            Err(ConfigurationError::MissingStrata(_))
        ));
    }

    #[test]
    fn fractional_weights_have_unit_mean() {
        let n = 4000;
        let mut rng = StdRng::seed_from_u64(9);
        for kind in [
            FwbWeights::Exp,
            FwbWeights::Poisson,
            FwbWeights::Multinomial,
            FwbWeights::Mammen,
        ] {
            let w = FractionalWeights::draw(kind, n, &mut rng).unwrap();
            assert_eq!(w.len(), n);
            assert!(w.iter().all(|&v| v >= 0.0));
            assert_abs_diff_eq!(w.mean().unwrap(), 1.0, epsilon = 0.1);
        }
        let exact = FractionalWeights::draw(FwbWeights::Exp, 10, &mut rng).unwrap();
        assert_abs_diff_eq!(exact.sum(), 10.0, epsilon = 1e-10);
        let counts = FractionalWeights::draw(FwbWeights::Multinomial, 10, &mut rng).unwrap();
        assert_abs_diff_eq!(counts.sum(), 10.0, epsilon = 0.0);
    }
}
