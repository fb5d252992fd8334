//! Configuration loading from TOML.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Every section is optional; missing values take the defaults below.
//! `validate` rejects inconsistent settings before any work starts.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::data::{DataConfig, SyntheticConfig};
use crate::model::gamm::GammConfig;
use crate::model::{Grouping, ModelSpec, RandomKind, RhoKeyword, RhoSpec};
use crate::simulation::{FailurePolicy, MonteCarloConfig, SamplerConfig};
use crate::types::LabelScope;

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub synthetic: SyntheticConfig,
    #[serde(default)]
    pub fitter: GammConfig,
    #[serde(default = "default_models")]
    pub models: Vec<ModelSpec>,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub iterations: usize,
    pub seed: u64,
    pub workers: usize,
    pub alpha: f64,
    pub confidence_level: f64,
    /// Name given to the synthetic label in model terms.
    pub predictor: String,
    /// Per-fit deadline; `None` disables it.
    pub fit_timeout_secs: Option<u64>,
    pub failure_policy: FailurePolicy,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            iterations: 100,
            seed: 1,
            workers: 4,
            alpha: 0.05,
            confidence_level: 0.95,
            predictor: "group".into(),
            fit_timeout_secs: Some(60),
            failure_policy: FailurePolicy::Exclude,
        }
    }
}

impl SimulationConfig {
    pub fn monte_carlo(&self) -> MonteCarloConfig {
        MonteCarloConfig {
            iterations: self.iterations,
            seed: self.seed,
            workers: self.workers,
            predictor: self.predictor.clone(),
            failure_policy: self.failure_policy,
            fit_timeout: self.fit_timeout_secs.map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Full JSON report.
    pub report_json: Option<PathBuf>,
    /// One row per (iteration, variant) with the extracted p-values.
    pub iterations_csv: Option<PathBuf>,
}

/// Naive GAMM, random intercepts, random smooths, random smooths + AR1.
pub fn default_models() -> Vec<ModelSpec> {
    vec![
        ModelSpec::naive("naive"),
        ModelSpec::naive("rand_intercept").with_random(Grouping::Subject, RandomKind::Intercept),
        ModelSpec::naive("rand_smooth").with_random(Grouping::Subject, RandomKind::Smooth),
        ModelSpec::naive("rand_smooth_ar1")
            .with_random(Grouping::Subject, RandomKind::Smooth)
            .with_ar1(RhoSpec::Keyword(RhoKeyword::Estimate)),
    ]
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            simulation: SimulationConfig::default(),
            sampler: SamplerConfig::default(),
            data: DataConfig::default(),
            synthetic: SyntheticConfig::default(),
            fitter: GammConfig::default(),
            models: default_models(),
            output: OutputConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config = Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make a run meaningless or fail midway.
    pub fn validate(&self) -> Result<()> {
        let sim = &self.simulation;
        if !(sim.alpha > 0.0 && sim.alpha < 1.0) {
            bail!("simulation.alpha must be in (0, 1), got {}", sim.alpha);
        }
        if !(sim.confidence_level > 0.0 && sim.confidence_level < 1.0) {
            bail!("simulation.confidence_level must be in (0, 1), got {}", sim.confidence_level);
        }
        if sim.iterations == 0 {
            bail!("simulation.iterations must be positive");
        }
        if sim.workers == 0 {
            bail!("simulation.workers must be positive");
        }
        if sim.predictor.trim().is_empty() {
            bail!("simulation.predictor must not be empty");
        }
        if sim.fit_timeout_secs == Some(0) {
            bail!("simulation.fit_timeout_secs must be positive (omit it to disable)");
        }
        if let FailurePolicy::Retry { max_attempts: 0 } = sim.failure_policy {
            bail!("simulation.failure_policy retry needs max_attempts >= 1");
        }

        if self.sampler.n_subjects < 2 {
            bail!("sampler.n_subjects must be at least 2");
        }
        match (self.sampler.label_scope, self.sampler.trajectories_per_subject) {
            (_, Some(0)) => bail!("sampler.trajectories_per_subject must be positive"),
            (LabelScope::Trajectory, Some(m)) if m < 2 => bail!(
                "sampler.trajectories_per_subject must be at least 2 with label_scope = \"trajectory\", got {m}"
            ),
            _ => {}
        }

        if self.fitter.max_iterations == 0 || !(self.fitter.tolerance > 0.0) {
            bail!("fitter.max_iterations and fitter.tolerance must be positive");
        }

        if self.models.is_empty() {
            bail!("at least one [[models]] entry is required");
        }
        let mut names = HashSet::new();
        for model in &self.models {
            if model.name.trim().is_empty() {
                bail!("model names must not be empty");
            }
            if !names.insert(model.name.as_str()) {
                bail!("duplicate model name '{}'", model.name);
            }
            if model.basis_size < 4 {
                bail!("model '{}': basis_size must be at least 4", model.name);
            }
            if let Some(RhoSpec::Fixed(rho)) = model.ar1.map(|a| a.rho) {
                if !(rho > -1.0 && rho < 1.0) {
                    bail!("model '{}': AR1 rho {rho} is outside (-1, 1)", model.name);
                }
            }
        }

        if self.data.path.is_none() {
            self.synthetic.validate().context("invalid [synthetic] section")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
