//! Rejection-rate summary.
//!
//! Folds the per-variant runs into empirical rejection rates with Wilson
//! score intervals. Under the null a well-calibrated model rejects at
//! about `alpha`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use uuid::Uuid;

use crate::types::{FitOutcome, SimulationRun};

// ---------------------------------------------------------------------------
// Rates
// ---------------------------------------------------------------------------

/// Proportion of counted iterations with p < alpha.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectionRate {
    pub rejections: usize,
    pub total: usize,
    /// `None` when nothing was counted.
    pub rate: Option<f64>,
    /// Wilson score interval (low, high).
    pub ci: Option<(f64, f64)>,
}

impl RejectionRate {
    pub fn new(rejections: usize, total: usize, confidence_level: f64) -> Self {
        if total == 0 {
            return Self { rejections, total, rate: None, ci: None };
        }
        Self {
            rejections,
            total,
            rate: Some(rejections as f64 / total as f64),
            ci: Some(wilson_interval(rejections, total, confidence_level)),
        }
    }
}

impl fmt::Display for RejectionRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.rate, self.ci) {
            (Some(rate), Some((lo, hi))) => write!(f, "{rate:.3} [{lo:.3}, {hi:.3}]"),
            _ => write!(f, "n/a"),
        }
    }
}

/// Wilson score interval for `successes` out of `n` trials.
pub fn wilson_interval(successes: usize, n: usize, confidence_level: f64) -> (f64, f64) {
    if n == 0 {
        return (0.0, 1.0);
    }
    let z = Normal::new(0.0, 1.0)
        .map(|d| d.inverse_cdf(1.0 - (1.0 - confidence_level) / 2.0))
        .unwrap_or(1.959_963_985);
    let n = n as f64;
    let p = successes as f64 / n;
    let z2 = z * z;
    let denom = 1.0 + z2 / n;
    let center = (p + z2 / (2.0 * n)) / denom;
    let half = z * (p * (1.0 - p) / n + z2 / (4.0 * n * n)).sqrt() / denom;
    // Exact at the extremes; center - half leaves round-off there.
    let lo = if successes == 0 { 0.0 } else { (center - half).max(0.0) };
    let hi = if successes as f64 >= n { 1.0 } else { (center + half).min(1.0) };
    (lo, hi)
}

// ---------------------------------------------------------------------------
// Per-variant summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantSummary {
    pub variant: String,
    pub iterations: usize,
    /// Iterations with extracted p-values.
    pub valid: usize,
    /// Failed iterations counted as non-rejections.
    pub imputed: usize,
    /// Failed iterations excluded from the rates.
    pub missing: usize,
    pub parametric: RejectionRate,
    pub smooth: RejectionRate,
}

impl VariantSummary {
    pub fn from_run(run: &SimulationRun, alpha: f64, confidence_level: f64) -> Self {
        let mut valid = 0;
        let mut imputed = 0;
        let mut missing = 0;
        let mut param_rej = 0;
        let mut smooth_rej = 0;
        let mut smooth_total = 0;

        for result in &run.results {
            match &result.outcome {
                FitOutcome::Tested(p) => {
                    valid += 1;
                    if p.parametric_rejects(alpha) {
                        param_rej += 1;
                    }
                    if let Some(rejects) = p.smooth_rejects(alpha) {
                        smooth_total += 1;
                        if rejects {
                            smooth_rej += 1;
                        }
                    }
                }
                FitOutcome::Imputed { .. } => imputed += 1,
                FitOutcome::Missing { .. } => missing += 1,
            }
        }

        // Imputed failures only join the smooth denominator when the variant
        // has smooth terms at all.
        if smooth_total > 0 {
            smooth_total += imputed;
        }

        Self {
            variant: run.variant.clone(),
            iterations: run.results.len(),
            valid,
            imputed,
            missing,
            parametric: RejectionRate::new(param_rej, valid + imputed, confidence_level),
            smooth: RejectionRate::new(smooth_rej, smooth_total, confidence_level),
        }
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectionReport {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub fitter: String,
    pub alpha: f64,
    pub confidence_level: f64,
    pub iterations: usize,
    pub n_subjects: usize,
    pub seed: u64,
    pub rows: Vec<VariantSummary>,
}

/// Run-level settings echoed into the report.
#[derive(Debug, Clone)]
pub struct ReportContext {
    pub fitter: String,
    pub alpha: f64,
    pub confidence_level: f64,
    pub n_subjects: usize,
    pub seed: u64,
}

impl RejectionReport {
    pub fn build(runs: &[SimulationRun], ctx: &ReportContext) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            generated_at: Utc::now(),
            fitter: ctx.fitter.clone(),
            alpha: ctx.alpha,
            confidence_level: ctx.confidence_level,
            iterations: runs.iter().map(|r| r.results.len()).max().unwrap_or(0),
            n_subjects: ctx.n_subjects,
            seed: ctx.seed,
            rows: runs
                .iter()
                .map(|r| VariantSummary::from_run(r, ctx.alpha, ctx.confidence_level))
                .collect(),
        }
    }

    pub fn row(&self, variant: &str) -> Option<&VariantSummary> {
        self.rows.iter().find(|r| r.variant == variant)
    }
}

impl fmt::Display for RejectionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Rejection rates at alpha = {} ({} iterations, {} subjects, {:.0}% CI, fitter {})",
            self.alpha,
            self.iterations,
            self.n_subjects,
            self.confidence_level * 100.0,
            self.fitter,
        )?;
        writeln!(
            f,
            "{:<24} {:>6} {:>6} {:>6}  {:<22} {:<22}",
            "variant", "valid", "imput", "miss", "parametric", "smooth"
        )?;
        for row in &self.rows {
            writeln!(
                f,
                "{:<24} {:>6} {:>6} {:>6}  {:<22} {:<22}",
                row.variant,
                row.valid,
                row.imputed,
                row.missing,
                row.parametric.to_string(),
                row.smooth.to_string(),
            )?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
