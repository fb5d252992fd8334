//! CSV input and output of trajectory datasets.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::DatasetSource;
use crate::types::Dataset;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// CSV file. When absent, the synthetic generator is used.
    pub path: Option<PathBuf>,
    pub subject_column: String,
    pub trajectory_column: String,
    pub time_column: String,
    pub response_column: String,
    /// Rescale each trajectory's time to [0, 1].
    pub normalize_time: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            path: None,
            subject_column: "subject".into(),
            trajectory_column: "trajectory".into(),
            time_column: "time".into(),
            response_column: "response".into(),
            normalize_time: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

pub struct CsvSource {
    path: PathBuf,
    config: DataConfig,
}

impl CsvSource {
    pub fn new(path: impl Into<PathBuf>, config: DataConfig) -> Self {
        Self { path: path.into(), config }
    }
}

impl DatasetSource for CsvSource {
    fn describe(&self) -> String {
        format!("csv:{}", self.path.display())
    }

    fn load(&self) -> Result<Dataset> {
        let file = std::fs::File::open(&self.path)
            .with_context(|| format!("Failed to open dataset {}", self.path.display()))?;
        let dataset = read_dataset(file, &self.config)
            .with_context(|| format!("Failed to read dataset {}", self.path.display()))?;
        info!(path = %self.path.display(), %dataset, "Dataset loaded");
        Ok(dataset)
    }
}

fn column(headers: &csv::StringRecord, name: &str) -> Result<usize> {
    headers
        .iter()
        .position(|h| h.trim() == name)
        .with_context(|| format!("Missing column '{name}'"))
}

fn parse_number(record: &csv::StringRecord, idx: usize, name: &str, line: usize) -> Result<f64> {
    let raw = record.get(idx).unwrap_or("").trim();
    let value: f64 = raw
        .parse()
        .with_context(|| format!("Line {line}: '{name}' is not a number: '{raw}'"))?;
    if !value.is_finite() {
        bail!("Line {line}: '{name}' is not finite");
    }
    Ok(value)
}

/// Parse long-format rows (one observation per row) into a dataset.
///
/// Rows may arrive in any order. Trajectories are keyed by
/// (subject, trajectory) and sorted by time; subjects and trajectories
/// keep their order of first appearance.
pub fn read_dataset<R: Read>(reader: R, config: &DataConfig) -> Result<Dataset> {
    let mut rdr = csv::ReaderBuilder::new().has_headers(true).trim(csv::Trim::All).from_reader(reader);
    let headers = rdr.headers().context("Failed to read CSV header")?.clone();
    let subject_idx = column(&headers, &config.subject_column)?;
    let trajectory_idx = column(&headers, &config.trajectory_column)?;
    let time_idx = column(&headers, &config.time_column)?;
    let response_idx = column(&headers, &config.response_column)?;

    let mut order: Vec<(String, String)> = Vec::new();
    let mut points: HashMap<(String, String), Vec<(f64, f64)>> = HashMap::new();

    for (row, record) in rdr.records().enumerate() {
        let line = row + 2;
        let record = record.with_context(|| format!("Line {line}: malformed row"))?;
        let subject = record.get(subject_idx).unwrap_or("").to_string();
        let trajectory = record.get(trajectory_idx).unwrap_or("").to_string();
        if subject.is_empty() || trajectory.is_empty() {
            bail!("Line {line}: empty subject or trajectory id");
        }
        let time = parse_number(&record, time_idx, &config.time_column, line)?;
        let response = parse_number(&record, response_idx, &config.response_column, line)?;

        let key = (subject, trajectory);
        if !points.contains_key(&key) {
            order.push(key.clone());
        }
        points.entry(key).or_default().push((time, response));
    }

    if order.is_empty() {
        bail!("Dataset has no rows");
    }

    let mut dataset = Dataset::default();
    let mut out_of_range = 0;
    for key in order {
        let mut pts = points.remove(&key).unwrap_or_default();
        pts.sort_by(|a, b| a.0.total_cmp(&b.0));
        let mut times: Vec<f64> = pts.iter().map(|p| p.0).collect();
        let values: Vec<f64> = pts.iter().map(|p| p.1).collect();

        if config.normalize_time {
            normalize(&mut times);
        } else if times.iter().any(|t| !(0.0..=1.0).contains(t)) {
            out_of_range += 1;
        }
        dataset.push_trajectory(&key.0, &key.1, times, values);
    }

    if out_of_range > 0 {
        bail!(
            "{out_of_range} trajectories have time points outside [0, 1]; \
             enable normalize_time or rescale the data"
        );
    }
    Ok(dataset)
}

/// Rescale ascending `times` to [0, 1]. A single distinct time maps to 0.
fn normalize(times: &mut [f64]) {
    let (Some(&min), Some(&max)) = (times.first(), times.last()) else {
        return;
    };
    let span = max - min;
    for t in times.iter_mut() {
        *t = if span > 0.0 { (*t - min) / span } else { 0.0 };
    }
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

/// Write a dataset in long format with the default column names.
pub fn write_dataset<W: Write>(dataset: &Dataset, writer: W) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(["subject", "trajectory", "time", "response"])?;
    for traj in &dataset.trajectories {
        let subject = &dataset.subjects[traj.subject].id;
        for (t, y) in traj.times.iter().zip(&traj.values) {
            wtr.write_record([
                subject.as_str(),
                traj.id.as_str(),
                t.to_string().as_str(),
                y.to_string().as_str(),
            ])?;
        }
    }
    wtr.flush().context("Failed to flush dataset CSV")?;
    Ok(())
}

pub fn save_dataset(dataset: &Dataset, path: &Path) -> Result<()> {
    if dataset.n_trajectories() == 0 {
        warn!(path = %path.display(), "Writing an empty dataset");
    }
    let file = std::fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    write_dataset(dataset, file)?;
    info!(path = %path.display(), %dataset, "Dataset written");
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
