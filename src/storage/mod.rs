//! Persistence layer.
//!
//! Saves the rejection report as JSON and exports the raw
//! per-iteration p-values as CSV for downstream analysis.

use anyhow::{Context, Result};
use serde::Serialize;
use std::io::Write;
use tracing::info;

use crate::simulation::RejectionReport;
use crate::types::{FitOutcome, SimulationRun};

/// Default report file path.
const DEFAULT_REPORT_FILE: &str = "gammsim_report.json";

/// Save a report to a JSON file.
pub fn save_report(report: &RejectionReport, path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(DEFAULT_REPORT_FILE);
    let json = serde_json::to_string_pretty(report).context("Failed to serialise report")?;

    std::fs::write(path, &json).context(format!("Failed to write report to {path}"))?;

    info!(path, run_id = %report.run_id, rows = report.rows.len(), "Report saved");
    Ok(())
}

// ---------------------------------------------------------------------------
// Per-iteration export
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct IterationRow<'a> {
    iteration: usize,
    variant: &'a str,
    attempts: u32,
    status: &'static str,
    p_parametric: Option<f64>,
    /// Semicolon-separated; empty when the model had no smooth term for the predictor.
    p_smooth: String,
    reason: &'a str,
}

/// Write one row per (iteration, variant), ordered by variant then iteration.
pub fn write_iterations<W: Write>(runs: &[SimulationRun], writer: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    for run in runs {
        for result in &run.results {
            let row = match &result.outcome {
                FitOutcome::Tested(p) => IterationRow {
                    iteration: result.iteration,
                    variant: &run.variant,
                    attempts: result.attempts,
                    status: "tested",
                    p_parametric: Some(p.parametric),
                    p_smooth: p.smooth.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(";"),
                    reason: "",
                },
                FitOutcome::Imputed { reason } | FitOutcome::Missing { reason } => IterationRow {
                    iteration: result.iteration,
                    variant: &run.variant,
                    attempts: result.attempts,
                    status: if matches!(result.outcome, FitOutcome::Imputed { .. }) {
                        "imputed"
                    } else {
                        "missing"
                    },
                    p_parametric: None,
                    p_smooth: String::new(),
                    reason,
                },
            };
            wtr.serialize(row).context("Failed to write iteration row")?;
        }
    }
    wtr.flush().context("Failed to flush iteration CSV")?;
    Ok(())
}

pub fn save_iterations(runs: &[SimulationRun], path: &str) -> Result<()> {
    let file = std::fs::File::create(path).context(format!("Failed to create {path}"))?;
    write_iterations(runs, file)?;
    info!(path, variants = runs.len(), "Per-iteration p-values saved");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
