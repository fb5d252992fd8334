//! Monte Carlo engine.
//!
//! Runs SAMPLE -> FIT -> EXTRACT for every model variant, N times.
//! Each iteration is a pure function of (dataset, base seed, iteration
//! index) and returns its own results; they are collated by iteration
//! index at the end, so worker count and completion order do not affect
//! the outcome.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::extract::extract_p_values;
use super::sampler::Sampler;
use crate::model::{FitRequest, ModelFitter, ModelSpec};
use crate::types::{FitOutcome, FitResult, Observation, PValues, SimError, SimulationRun};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What to do when a fit (or extraction) fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Record as missing; excluded from the rejection-rate denominator.
    Exclude,
    /// Record as a non-rejection (p = 1).
    CountNonSignificant,
    /// Redraw a fresh sample and refit, up to `max_attempts` fits in total;
    /// then exclude.
    Retry { max_attempts: u32 },
}

impl Default for FailurePolicy {
    fn default() -> Self {
        FailurePolicy::Exclude
    }
}

#[derive(Debug, Clone)]
pub struct MonteCarloConfig {
    pub iterations: usize,
    pub seed: u64,
    /// Iterations in flight at once.
    pub workers: usize,
    /// Name of the synthetic predictor.
    pub predictor: String,
    pub failure_policy: FailurePolicy,
    /// Per-fit deadline.
    pub fit_timeout: Option<Duration>,
}

impl Default for MonteCarloConfig {
    fn default() -> Self {
        Self {
            iterations: 100,
            seed: 1,
            workers: 4,
            predictor: "group".into(),
            failure_policy: FailurePolicy::Exclude,
            fit_timeout: Some(Duration::from_secs(60)),
        }
    }
}

// ---------------------------------------------------------------------------
// Seeds
// ---------------------------------------------------------------------------

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Deterministic child seed of `parent` for stream `index`.
pub fn derive_seed(parent: u64, index: u64) -> u64 {
    splitmix64(parent ^ splitmix64(index))
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct Harness {
    sampler: Sampler,
    fitter: Arc<dyn ModelFitter>,
    variants: Vec<ModelSpec>,
    config: MonteCarloConfig,
}

pub struct MonteCarlo {
    harness: Arc<Harness>,
}

impl MonteCarlo {
    pub fn new(
        sampler: Sampler,
        fitter: Arc<dyn ModelFitter>,
        variants: Vec<ModelSpec>,
        config: MonteCarloConfig,
    ) -> Result<Self, SimError> {
        if variants.is_empty() {
            return Err(SimError::Config("at least one model variant is required".into()));
        }
        if config.iterations == 0 {
            return Err(SimError::Config("iterations must be positive".into()));
        }
        if config.workers == 0 {
            return Err(SimError::Config("workers must be positive".into()));
        }
        if let FailurePolicy::Retry { max_attempts: 0 } = config.failure_policy {
            return Err(SimError::Config("retry policy needs max_attempts >= 1".into()));
        }
        Ok(Self {
            harness: Arc::new(Harness { sampler, fitter, variants, config }),
        })
    }

    pub fn config(&self) -> &MonteCarloConfig {
        &self.harness.config
    }

    pub fn variants(&self) -> &[ModelSpec] {
        &self.harness.variants
    }

    pub fn sampler(&self) -> &Sampler {
        &self.harness.sampler
    }

    /// Run all iterations on tokio's blocking pool, at most `workers` at a time.
    pub async fn run(&self) -> Result<Vec<SimulationRun>, SimError> {
        let cfg = &self.harness.config;
        let started = Instant::now();
        info!(
            iterations = cfg.iterations,
            workers = cfg.workers,
            variants = self.harness.variants.len(),
            fitter = self.harness.fitter.name(),
            seed = cfg.seed,
            "Monte Carlo run starting"
        );

        let mut pending = stream::iter(0..cfg.iterations)
            .map(|i| {
                let harness = Arc::clone(&self.harness);
                tokio::task::spawn_blocking(move || (i, harness.run_iteration(i)))
            })
            .buffer_unordered(cfg.workers);

        let step = (cfg.iterations / 10).max(1);
        let mut records = Vec::with_capacity(cfg.iterations);
        while let Some(joined) = pending.next().await {
            let record = joined.map_err(|e| SimError::Worker(e.to_string()))?;
            records.push(record);
            if records.len() % step == 0 {
                info!(done = records.len(), total = cfg.iterations, "Progress");
            }
        }

        info!(elapsed_ms = started.elapsed().as_millis() as u64, "Monte Carlo run complete");
        Ok(collate(&self.harness.variants, records))
    }

    /// Same as `run`, on the calling thread.
    pub fn run_sequential(&self) -> Vec<SimulationRun> {
        let records = (0..self.harness.config.iterations)
            .map(|i| (i, self.harness.run_iteration(i)))
            .collect();
        collate(&self.harness.variants, records)
    }

    /// Results of every variant for one iteration.
    pub fn run_iteration(&self, iteration: usize) -> Vec<FitResult> {
        self.harness.run_iteration(iteration)
    }
}

impl Harness {
    fn run_iteration(&self, iteration: usize) -> Vec<FitResult> {
        let iteration_seed = derive_seed(self.config.seed, iteration as u64);
        let mut rng = StdRng::seed_from_u64(iteration_seed);
        let observations = Arc::new(self.sampler.draw(&mut rng).observations());

        self.variants
            .iter()
            .enumerate()
            .map(|(v, spec)| self.run_variant(iteration, iteration_seed, v, spec, &observations))
            .collect()
    }

    fn run_variant(
        &self,
        iteration: usize,
        iteration_seed: u64,
        variant_index: usize,
        spec: &ModelSpec,
        observations: &Arc<Vec<Observation>>,
    ) -> FitResult {
        let mut attempts = 1;
        let mut observations = Arc::clone(observations);

        loop {
            let reason = match self.fit_once(spec, observations) {
                Ok(p_values) => {
                    debug!(
                        iteration,
                        variant = %spec.name,
                        p_param = p_values.parametric,
                        p_smooth = ?p_values.smooth,
                        "Iteration recorded"
                    );
                    return FitResult {
                        iteration,
                        variant: spec.name.clone(),
                        attempts,
                        outcome: FitOutcome::Tested(p_values),
                    };
                }
                Err(reason) => reason,
            };

            warn!(iteration, variant = %spec.name, attempt = attempts, error = %reason, "Fit failed");
            let outcome = match self.config.failure_policy {
                FailurePolicy::Exclude => FitOutcome::Missing { reason },
                FailurePolicy::CountNonSignificant => FitOutcome::Imputed { reason },
                FailurePolicy::Retry { max_attempts } if attempts < max_attempts => {
                    attempts += 1;
                    let stream = ((variant_index as u64 + 1) << 32) | attempts as u64;
                    let mut rng = StdRng::seed_from_u64(derive_seed(iteration_seed, stream));
                    observations = Arc::new(self.sampler.draw(&mut rng).observations());
                    continue;
                }
                FailurePolicy::Retry { .. } => FitOutcome::Missing { reason },
            };
            return FitResult {
                iteration,
                variant: spec.name.clone(),
                attempts,
                outcome,
            };
        }
    }

    fn fit_once(&self, spec: &ModelSpec, observations: Arc<Vec<Observation>>) -> Result<PValues, String> {
        let request = FitRequest {
            spec: spec.clone(),
            observations,
            predictor: self.config.predictor.clone(),
            deadline: self.config.fit_timeout.map(|t| Instant::now() + t),
        };
        let model = self.fitter.fit(&request).map_err(|e| format!("fit: {e}"))?;
        extract_p_values(&model, &self.config.predictor).map_err(|e| format!("extract: {e}"))
    }
}

/// Fold per-iteration records into one run per variant, ordered by iteration.
fn collate(variants: &[ModelSpec], mut records: Vec<(usize, Vec<FitResult>)>) -> Vec<SimulationRun> {
    records.sort_by_key(|(i, _)| *i);
    let mut runs: Vec<SimulationRun> = variants
        .iter()
        .map(|spec| SimulationRun {
            variant: spec.name.clone(),
            results: Vec::with_capacity(records.len()),
        })
        .collect();
    for (_, results) in records {
        for (run, result) in runs.iter_mut().zip(results) {
            run.results.push(result);
        }
    }
    runs
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
