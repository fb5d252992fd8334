//! Monte Carlo type-I error harness: sample, fit, extract, summarize.

pub mod extract;
pub mod runner;
pub mod sampler;
pub mod summary;

pub use extract::{extract_p_values, ExtractError};
pub use runner::{FailurePolicy, MonteCarlo, MonteCarloConfig};
pub use sampler::{Sample, Sampler, SamplerConfig};
pub use summary::{RejectionRate, RejectionReport, ReportContext, VariantSummary};
