//! Monte Carlo simulation scenarios.
//!
//! Runs the full pipeline on synthetic datasets: calibration of the
//! rejection rate under the null, the reference end-to-end scenario,
//! reproducibility across worker counts, and the failure policies.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};

use gammsim::config::AppConfig;
use gammsim::data::synthetic::{generate, SyntheticConfig};
use gammsim::harness::run_simulation;
use gammsim::model::gamm::PenalizedGamm;
use gammsim::model::{FitError, Grouping, ModelSpec, RandomKind, RhoKeyword, RhoSpec};
use gammsim::simulation::{
    FailurePolicy, MonteCarlo, MonteCarloConfig, Sampler, SamplerConfig,
};
use gammsim::types::{Dataset, EffectShape, EffectSpec, FitOutcome, LabelScope, PValues};

use crate::mock_fitter::{constant, failing, fitted, MockFitter};

/// iid Gaussian noise around a flat mean: the naive model is correctly specified.
fn iid_dataset(subjects: usize, trajectories: usize) -> Arc<Dataset> {
    iid_dataset_seeded(subjects, trajectories, 11)
}

fn iid_dataset_seeded(subjects: usize, trajectories: usize, seed: u64) -> Arc<Dataset> {
    let cfg = SyntheticConfig {
        n_subjects: subjects,
        trajectories_per_subject: trajectories,
        points_per_trajectory: 11,
        mean_amplitude: 0.0,
        subject_sd: 0.0,
        subject_curve_sd: 0.0,
        trajectory_sd: 0.0,
        noise_sd: 1.0,
        ar1_rho: 0.0,
        seed,
    };
    Arc::new(generate(&cfg).unwrap())
}

fn sampler(dataset: Arc<Dataset>, n_subjects: usize) -> Sampler {
    Sampler::new(dataset, SamplerConfig { n_subjects, ..SamplerConfig::default() }).unwrap()
}

// ---------------------------------------------------------------------------
// Calibration
// ---------------------------------------------------------------------------

/// One null iteration on its own freshly generated dataset. The pool is
/// exactly the sample, so every iteration sees new data and a new split.
async fn fresh_null_p_values(seed: u64) -> PValues {
    let mc = MonteCarlo::new(
        sampler(iid_dataset_seeded(10, 4, seed), 10),
        Arc::new(PenalizedGamm::default()),
        vec![ModelSpec::naive("naive")],
        MonteCarloConfig { iterations: 1, seed, workers: 1, ..MonteCarloConfig::default() },
    )
    .unwrap();
    let runs = mc.run().await.unwrap();
    runs[0].results[0].p_values().cloned().expect("naive model fits iid data")
}

#[tokio::test]
async fn test_type_one_error_near_alpha_for_correct_model() {
    const ITERATIONS: u64 = 2000;
    let tested: Vec<PValues> = stream::iter(0..ITERATIONS)
        .map(|i| fresh_null_p_values(1_000 + i))
        .buffer_unordered(8)
        .collect()
        .await;
    assert_eq!(tested.len() as u64, ITERATIONS);

    let n = ITERATIONS as f64;
    let param = tested.iter().filter(|p| p.parametric_rejects(0.05)).count() as f64 / n;
    let smooth = tested.iter().filter(|p| p.smooth_rejects(0.05) == Some(true)).count() as f64 / n;
    assert!((0.02..=0.08).contains(&param), "parametric rate {param}");
    assert!((0.02..=0.08).contains(&smooth), "smooth rate {smooth}");
}

#[tokio::test]
async fn test_injected_effect_is_detected() {
    let dataset = iid_dataset(20, 4);
    let cfg = SamplerConfig {
        n_subjects: 10,
        effect: Some(EffectSpec { size: 1.0, shape: EffectShape::Constant }),
        ..SamplerConfig::default()
    };
    let mc = MonteCarlo::new(
        Sampler::new(dataset, cfg).unwrap(),
        Arc::new(PenalizedGamm::default()),
        vec![ModelSpec::naive("naive")],
        MonteCarloConfig { iterations: 20, ..MonteCarloConfig::default() },
    )
    .unwrap();

    let runs = mc.run().await.unwrap();
    let rejected = runs[0]
        .results
        .iter()
        .filter_map(|r| r.p_values())
        .filter(|p| p.parametric_rejects(0.05))
        .count();
    // Effect of one noise SD over 220 observations per group
    assert_eq!(rejected, 20);
}

// ---------------------------------------------------------------------------
// End to end
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_end_to_end_reference_scenario() {
    let mut cfg = AppConfig::default();
    cfg.simulation.iterations = 10;
    cfg.simulation.workers = 4;
    cfg.sampler.n_subjects = 20;
    cfg.models = vec![
        ModelSpec::naive("naive"),
        ModelSpec::naive("rand_intercept").with_random(Grouping::Subject, RandomKind::Intercept),
        ModelSpec::naive("ar1_estimated").with_ar1(RhoSpec::Keyword(RhoKeyword::Estimate)),
    ];
    cfg.validate().unwrap();

    // 30 subjects x 40 trajectories x 11 points
    let dataset = Arc::new(generate(&cfg.synthetic).unwrap());
    assert_eq!(dataset.n_subjects(), 30);
    assert_eq!(dataset.n_observations(), 30 * 40 * 11);

    let output = run_simulation(&cfg, dataset, Arc::new(PenalizedGamm::default())).await.unwrap();
    assert_eq!(output.report.rows.len(), 3);
    assert_eq!(output.report.iterations, 10);
    for row in &output.report.rows {
        assert_eq!(row.iterations, 10);
        assert_eq!(row.valid + row.imputed + row.missing, 10);
        let (Some(param), Some(smooth)) = (row.parametric.rate, row.smooth.rate) else {
            panic!("{}: both rejection rates must be reported", row.variant);
        };
        assert!((0.0..=1.0).contains(&param), "{}: parametric {param}", row.variant);
        assert!((0.0..=1.0).contains(&smooth), "{}: smooth {smooth}", row.variant);
    }
    let table = output.report.to_string();
    assert!(table.contains("rand_intercept"));
}

#[tokio::test]
async fn test_trajectory_scope_with_trajectory_random_intercept() {
    let mut cfg = AppConfig::default();
    cfg.simulation.iterations = 4;
    cfg.sampler = SamplerConfig {
        n_subjects: 6,
        trajectories_per_subject: Some(4),
        label_scope: LabelScope::Trajectory,
        ..SamplerConfig::default()
    };
    cfg.models = vec![ModelSpec::naive("rt").with_random(Grouping::Trajectory, RandomKind::Intercept)];
    let synthetic = SyntheticConfig { n_subjects: 8, trajectories_per_subject: 6, ..SyntheticConfig::default() };
    let dataset = Arc::new(generate(&synthetic).unwrap());

    let output = run_simulation(&cfg, dataset, Arc::new(PenalizedGamm::default())).await.unwrap();
    assert_eq!(output.runs[0].results.len(), 4);
    let row = &output.report.rows[0];
    assert_eq!(row.valid + row.missing, 4);
    assert!(row.valid > 0);
}

// ---------------------------------------------------------------------------
// Reproducibility
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_results_independent_of_worker_count() {
    let variants = vec![
        ModelSpec::naive("naive"),
        ModelSpec::naive("ar1").with_ar1(RhoSpec::Fixed(0.3)),
    ];
    let dataset = iid_dataset(12, 3);
    let run_with = |workers: usize| {
        MonteCarlo::new(
            sampler(Arc::clone(&dataset), 8),
            Arc::new(PenalizedGamm::default()),
            variants.clone(),
            MonteCarloConfig { iterations: 12, seed: 99, workers, ..MonteCarloConfig::default() },
        )
        .unwrap()
    };

    let one = run_with(1).run().await.unwrap();
    let many = run_with(6).run().await.unwrap();
    for (a, b) in one.iter().zip(&many) {
        assert_eq!(a.variant, b.variant);
        assert_eq!(a.results, b.results);
    }
}

// ---------------------------------------------------------------------------
// Failure policies
// ---------------------------------------------------------------------------

fn policy_config(policy: FailurePolicy) -> MonteCarloConfig {
    MonteCarloConfig { iterations: 5, failure_policy: policy, ..MonteCarloConfig::default() }
}

#[tokio::test]
async fn test_exclude_policy_drops_failures_from_rates() {
    let mc = MonteCarlo::new(
        sampler(iid_dataset(10, 2), 6),
        Arc::new(failing(FitError::NonConvergence { iterations: 200 })),
        vec![ModelSpec::naive("m")],
        policy_config(FailurePolicy::Exclude),
    )
    .unwrap();
    let runs = mc.run().await.unwrap();
    assert!(runs[0]
        .results
        .iter()
        .all(|r| matches!(&r.outcome, FitOutcome::Missing { reason } if reason.contains("converge"))));
}

#[tokio::test]
async fn test_count_non_significant_policy_keeps_denominator() {
    let mut cfg = AppConfig::default();
    cfg.simulation.iterations = 5;
    cfg.simulation.failure_policy = FailurePolicy::CountNonSignificant;
    cfg.sampler.n_subjects = 6;
    cfg.models = vec![ModelSpec::naive("m")];

    let fitter = Arc::new(failing(FitError::RankDeficient("singular".into())));
    let output = run_simulation(&cfg, iid_dataset(10, 2), fitter).await.unwrap();
    let row = &output.report.rows[0];
    assert_eq!(row.imputed, 5);
    assert_eq!(row.parametric.total, 5);
    assert_eq!(row.parametric.rate, Some(0.0));
    assert_eq!(output.report.fitter, "mock");
}

#[tokio::test]
async fn test_retry_policy_redraws_after_failure() {
    let mut mock = MockFitter::new();
    let mut calls = 0;
    mock.expect_fit().returning(move |_| {
        calls += 1;
        // First attempt of every variant fails.
        if calls % 2 == 1 {
            Err(FitError::Timeout { iterations: 3 })
        } else {
            Ok(fitted("group", 0.01, 0.5))
        }
    });
    mock.expect_name().return_const("mock".to_string());

    let mc = MonteCarlo::new(
        sampler(iid_dataset(10, 2), 6),
        Arc::new(mock),
        vec![ModelSpec::naive("m")],
        MonteCarloConfig { workers: 1, ..policy_config(FailurePolicy::Retry { max_attempts: 2 }) },
    )
    .unwrap();
    let runs = mc.run().await.unwrap();
    for result in &runs[0].results {
        assert_eq!(result.attempts, 2);
        assert!(matches!(result.outcome, FitOutcome::Tested(_)));
    }
}

#[tokio::test]
async fn test_deadline_expiry_is_recorded_missing() {
    let mc = MonteCarlo::new(
        sampler(iid_dataset(10, 2), 6),
        Arc::new(PenalizedGamm::default()),
        vec![ModelSpec::naive("m")],
        MonteCarloConfig { fit_timeout: Some(Duration::ZERO), ..policy_config(FailurePolicy::Exclude) },
    )
    .unwrap();
    let runs = mc.run().await.unwrap();
    assert!(runs[0]
        .results
        .iter()
        .all(|r| matches!(&r.outcome, FitOutcome::Missing { reason } if reason.contains("deadline"))));
}

#[tokio::test]
async fn test_unrelated_predictor_terms_are_never_extracted() {
    // The fitter only reports terms for "group2"; nothing matches "group".
    let mc = MonteCarlo::new(
        sampler(iid_dataset(10, 2), 6),
        Arc::new(constant("group2", 0.001)),
        vec![ModelSpec::naive("m")],
        policy_config(FailurePolicy::Exclude),
    )
    .unwrap();
    let runs = mc.run().await.unwrap();
    assert!(runs[0]
        .results
        .iter()
        .all(|r| matches!(&r.outcome, FitOutcome::Missing { reason } if reason.starts_with("extract"))));
}

#[test]
fn test_setup_fails_when_pool_too_small() {
    let err = Sampler::new(iid_dataset(5, 2), SamplerConfig { n_subjects: 8, ..SamplerConfig::default() });
    assert!(err.is_err());
}
