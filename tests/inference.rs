use approx::{assert_abs_diff_eq, assert_relative_eq};
use margins::replicate::{DrawSummary, Draws, DrawsLayout, InferenceError, summarize_draws};
use margins::{
    By, Call, Dataset, Estimates, Fittable, FittedModel, InferenceOptions, KeyValue,
    ModelRegistry, Predictable, Scale, inferences, posterior_draws,
};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::fs;
use std::process::Command;
use std::sync::Arc;
use tempfile::tempdir;

const METHODS: [&str; 4] = ["simulation", "boot", "rsample", "fwb"];

/// Gaussian outcome with an interaction, a three-level group and positive weights.
fn interaction_data(n: usize, seed: u64) -> Dataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut x1 = Vec::with_capacity(n);
    let mut x2 = Vec::with_capacity(n);
    let mut g = Vec::with_capacity(n);
    let mut w = Vec::with_capacity(n);
    let mut y = Vec::with_capacity(n);
    for i in 0..n {
        let a: f64 = rng.sample(StandardNormal);
        let b: f64 = rng.gen_range(0.0..2.0);
        let noise: f64 = rng.sample(StandardNormal);
        x1.push(a);
        x2.push(b);
        g.push((i % 3) as f64);
        w.push(rng.gen_range(0.5..1.5));
        y.push(1.0 + 0.8 * a - 0.5 * b + 0.4 * a * b + noise);
    }
    Dataset::new(vec![
        ("y", Array1::from_vec(y)),
        ("x1", Array1::from_vec(x1)),
        ("x2", Array1::from_vec(x2)),
        ("g", Array1::from_vec(g)),
        ("w", Array1::from_vec(w)),
    ])
    .unwrap()
}

fn binary_data(n: usize, seed: u64) -> Dataset {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut x = Vec::with_capacity(n);
    let mut y = Vec::with_capacity(n);
    for _ in 0..n {
        let v: f64 = rng.sample(StandardNormal);
        let p = 1.0 / (1.0 + (0.5 - 1.2 * v).exp());
        x.push(v);
        y.push(if rng.gen_bool(p) { 1.0 } else { 0.0 });
    }
    Dataset::new(vec![("y", Array1::from_vec(y)), ("x", Array1::from_vec(x))]).unwrap()
}

fn ols(data: Dataset, weights: Option<&str>) -> Arc<FittedModel> {
    Arc::new(
        ModelRegistry::default()
            .fit("lm", "y ~ x1 * x2", Arc::new(data), weights)
            .unwrap(),
    )
}

fn seeded(seed: u64) -> InferenceOptions {
    InferenceOptions {
        seed: Some(seed),
        ..InferenceOptions::default()
    }
}

#[test]
fn every_method_preserves_unit_level_rows() {
    let model = ols(interaction_data(60, 1), None);
    let est = Estimates::compute(model, Call::predictions()).unwrap();
    for method in METHODS {
        let out = inferences(&est, method, 30, &seeded(2)).unwrap();
        assert_eq!(out.len(), est.len(), "{method}");
        for (before, after) in est.rows().iter().zip(out.rows()) {
            assert_eq!(before.key, after.key, "{method}");
            assert_eq!(before.estimate, after.estimate, "{method}");
            assert!(after.conf_low.is_some() && after.conf_high.is_some());
        }
    }
}

#[test]
fn every_method_preserves_group_keys() {
    let model = ols(interaction_data(90, 3), None);
    let call = Call::comparisons("x1").by(By::Columns(vec!["g".to_string()]));
    let est = Estimates::compute(model, call).unwrap();
    assert_eq!(est.len(), 3);

    let mut options = seeded(4);
    options.backend.strata = Some("g".to_string());
    for method in METHODS {
        let out = inferences(&est, method, 40, &options).unwrap();
        let keys: Vec<_> = out.rows().iter().map(|r| r.key.clone()).collect();
        let expected: Vec<_> = est.rows().iter().map(|r| r.key.clone()).collect();
        assert_eq!(keys, expected, "{method}");
        assert_eq!(keys[2].get("g"), Some(&KeyValue::number(2.0)));
    }
}

#[test]
fn simulation_leaves_estimates_bit_identical() {
    let model = ols(interaction_data(50, 5), None);
    let est = Estimates::compute(model, Call::slopes("x1").average()).unwrap();
    let out = inferences(&est, "simulation", 100, &seeded(6)).unwrap();
    assert_eq!(
        est.estimates().to_vec(),
        out.estimates().to_vec(),
    );
    assert!(out.rows()[0].std_error.unwrap() > 0.0);
}

#[test]
fn probability_intervals_stay_inside_the_unit_interval() {
    let data = Arc::new(binary_data(300, 7));
    let model = Arc::new(ModelRegistry::default().fit("logit", "y ~ x", data, None).unwrap());

    let averaged = Estimates::compute(model.clone(), Call::predictions().average()).unwrap();
    let unit = Estimates::compute(model, Call::predictions()).unwrap().head(10);
    for est in [averaged, unit] {
        for method in METHODS {
            let out = inferences(&est, method, 200, &seeded(8)).unwrap();
            for row in out.rows() {
                let (lo, hi) = (row.conf_low.unwrap(), row.conf_high.unwrap());
                assert!(lo > 0.0 && hi < 1.0, "{method}: ({lo}, {hi})");
                assert!(lo < row.estimate && row.estimate < hi, "{method}");
            }
        }
    }
}

#[test]
fn long_draws_have_one_row_per_replicate_and_estimate() {
    let model = ols(interaction_data(40, 9), None);
    let est = Estimates::compute(model, Call::predictions().by(By::Columns(vec!["g".into()])))
        .unwrap();
    let out = inferences(&est, "boot", 25, &seeded(10)).unwrap();
    let draws = posterior_draws(&out, DrawsLayout::Long).unwrap();
    assert_eq!(draws.len(), 25 * 3);
    let Draws::Matrix(matrix) = posterior_draws(&out, DrawsLayout::Matrix).unwrap() else {
        panic!("expected matrix layout");
    };
    assert_eq!(matrix.dim(), (25, 3));
}

#[test]
fn fwb_refuses_models_with_case_weights() {
    let model = ols(interaction_data(40, 11), Some("w"));
    let est = Estimates::compute(model, Call::predictions().average()).unwrap();
    let err = inferences(&est, "fwb", 20, &seeded(12)).unwrap_err();
    assert!(matches!(err, InferenceError::Configuration(_)));
    assert!(err.to_string().contains("Weighting conflict"), "{err}");

    // case weights compose with the ordinary bootstrap
    assert!(inferences(&est, "boot", 20, &seeded(12)).is_ok());
}

#[test]
fn bootstrap_is_reproducible_and_matches_a_direct_resampling_loop() {
    let data = interaction_data(200, 13);
    let model = ols(data.clone(), None);
    let est = Estimates::compute(model.clone(), Call::predictions().average()).unwrap();
    let delta_se = est.rows()[0].std_error.unwrap();

    let first = inferences(&est, "boot", 500, &seeded(14)).unwrap();
    let second = inferences(&est, "boot", 500, &seeded(14)).unwrap();
    assert_eq!(first.rows(), second.rows());
    assert_eq!(
        first.inference().unwrap().draws,
        second.inference().unwrap().draws
    );

    // Same stream, same resamples: refit on each and average the fitted values.
    let n = data.nrows();
    let mut rng = StdRng::seed_from_u64(14);
    let averages: Vec<f64> = (0..500)
        .map(|_| {
            let rows: Vec<usize> = (0..n).map(|_| rng.gen_range(0..n)).collect();
            let resampled = Arc::new(data.select_rows(&rows).unwrap());
            let refitted = model.refit(Arc::clone(&resampled), None).unwrap();
            refitted.predict(&resampled, Scale::Response).unwrap().mean().unwrap()
        })
        .collect();
    let mean = averages.iter().sum::<f64>() / averages.len() as f64;
    let variance = averages.iter().map(|v| (v - mean).powi(2)).sum::<f64>()
        / (averages.len() - 1) as f64;

    let boot_se = first.rows()[0].std_error.unwrap();
    assert_abs_diff_eq!(boot_se, variance.sqrt(), epsilon = 1e-9);
    assert_relative_eq!(boot_se, delta_se, max_relative = 0.25);
}

#[test]
fn draw_access_is_idempotent() {
    let model = ols(interaction_data(40, 15), None);
    let est = Estimates::compute(model, Call::comparisons("x2").average()).unwrap();
    let out = inferences(&est, "simulation", 50, &seeded(16)).unwrap();
    assert_eq!(
        posterior_draws(&out, DrawsLayout::Long).unwrap(),
        posterior_draws(&out, DrawsLayout::Long).unwrap()
    );
    assert_eq!(
        summarize_draws(&out, &DrawSummary::default()).unwrap(),
        summarize_draws(&out, &DrawSummary::default()).unwrap()
    );
}

#[test]
fn cli_writes_estimates_and_draws() {
    let tmp = tempdir().expect("temporary directory");
    let data_path = tmp.path().join("data.tsv");
    let mut text = String::from("y\tx1\tx2\n");
    let data = interaction_data(30, 17);
    let columns = ["y", "x1", "x2"].map(|c| data.column(c).unwrap().to_vec());
    for i in 0..30 {
        text.push_str(&format!("{}\t{}\t{}\n", columns[0][i], columns[1][i], columns[2][i]));
    }
    fs::write(&data_path, text).expect("write data");

    let exe = env!("CARGO_BIN_EXE_margins");
    let estimates_path = tmp.path().join("estimates.tsv");
    let status = Command::new(exe)
        .current_dir(tmp.path())
        .args([
            "estimate",
            data_path.to_str().expect("path str"),
            "--formula",
            "y ~ x1 * x2",
            "--average",
            "--method",
            "boot",
            "--replicates",
            "40",
            "--seed",
            "1",
            "--output",
            estimates_path.to_str().expect("path str"),
        ])
        .status()
        .expect("run margins cli");
    assert!(status.success(), "CLI exited with status {status:?}");
    let written = fs::read_to_string(&estimates_path).expect("read estimates");
    assert!(written.starts_with("estimate\tstd_error\t"));
    assert_eq!(written.lines().count(), 2);

    let status = Command::new(exe)
        .current_dir(tmp.path())
        .args([
            "draws",
            data_path.to_str().expect("path str"),
            "--formula",
            "y ~ x1 * x2",
            "--average",
            "--method",
            "simulation",
            "--replicates",
            "15",
        ])
        .status()
        .expect("run margins cli");
    assert!(status.success());
    let draws = fs::read_to_string(tmp.path().join("draws.tsv")).expect("read draws");
    assert_eq!(draws.lines().count(), 1 + 15);

    let status = Command::new(exe)
        .args([
            "estimate",
            data_path.to_str().expect("path str"),
            "--formula",
            "y ~ x1",
            "--method",
            "jackknife",
        ])
        .status()
        .expect("run margins cli");
    assert!(!status.success());

    let help = Command::new(exe)
        .args(["estimate", "--help"])
        .output()
        .expect("run margins cli");
    let help = String::from_utf8_lossy(&help.stdout);
    assert!(help.contains("--output writes TSV"), "{help}");
    assert!(!help.contains("estimates.tsv"), "{help}");
}
