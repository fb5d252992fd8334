//! End-to-end wiring: dataset source -> sampler -> Monte Carlo -> report.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::AppConfig;
use crate::data::{CsvSource, DatasetSource, SyntheticSource};
use crate::model::ModelFitter;
use crate::simulation::{MonteCarlo, RejectionReport, ReportContext, Sampler};
use crate::types::{Dataset, SimulationRun};

/// Pick the dataset source: the CSV file when configured, otherwise the
/// synthetic generator.
pub fn dataset_source(cfg: &AppConfig) -> Box<dyn DatasetSource> {
    match &cfg.data.path {
        Some(path) => Box::new(CsvSource::new(path.clone(), cfg.data.clone())),
        None => Box::new(SyntheticSource::new(cfg.synthetic.clone())),
    }
}

/// Output of one complete run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub runs: Vec<SimulationRun>,
    pub report: RejectionReport,
}

/// Build the sampler and Monte Carlo engine for `dataset`, run every
/// iteration and summarize.
pub async fn run_simulation(
    cfg: &AppConfig,
    dataset: Arc<Dataset>,
    fitter: Arc<dyn ModelFitter>,
) -> Result<RunOutput> {
    let sampler = Sampler::new(dataset, cfg.sampler.clone()).context("Sampler setup failed")?;

    for spec in &cfg.models {
        info!(variant = %spec.name, formula = %spec.formula(&cfg.simulation.predictor), "Model variant");
    }

    let fitter_name = fitter.name().to_string();
    let mc = MonteCarlo::new(sampler, fitter, cfg.models.clone(), cfg.simulation.monte_carlo())
        .context("Monte Carlo setup failed")?;
    let runs = mc.run().await?;

    let ctx = ReportContext {
        fitter: fitter_name,
        alpha: cfg.simulation.alpha,
        confidence_level: cfg.simulation.confidence_level,
        n_subjects: cfg.sampler.n_subjects,
        seed: cfg.simulation.seed,
    };
    let report = RejectionReport::build(&runs, &ctx);
    for row in &report.rows {
        info!(
            variant = %row.variant,
            valid = row.valid,
            missing = row.missing,
            parametric = ?row.parametric.rate,
            smooth = ?row.smooth.rate,
            "Rejection rate"
        );
    }
    Ok(RunOutput { runs, report })
}

/// How long shutdown waits for blocking fits that are still running.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Drive `future` to completion on a fresh multi-threaded runtime, then shut
/// the runtime down waiting at most `grace` for blocking tasks. Fits
/// abandoned by an interrupted run keep their worker threads busy until
/// their own deadline, and dropping the runtime would wait for all of them.
pub fn block_on_with_grace<F: Future>(future: F, grace: Duration) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start tokio runtime")?;
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(grace);
    Ok(output)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
