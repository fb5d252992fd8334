//! Dataset sources.
//!
//! Defines the `DatasetSource` trait and the two shipped sources: a CSV
//! file of repeated measurements and a seeded synthetic generator.

pub mod loader;
pub mod synthetic;

use anyhow::Result;

use crate::types::Dataset;

pub use loader::{read_dataset, save_dataset, write_dataset, CsvSource, DataConfig};
pub use synthetic::{SyntheticConfig, SyntheticSource};

/// Anything that can produce the read-only trajectory pool for a run.
pub trait DatasetSource: Send + Sync {
    /// Short description for logs.
    fn describe(&self) -> String;

    /// Build the dataset. Called once, before the Monte Carlo loop.
    fn load(&self) -> Result<Dataset>;
}
