//! GAMMSIM: Monte Carlo type-I error simulation for GAMM strategies
//!
//! Entry point. Parses the command line, loads configuration, initialises
//! structured logging, and either runs the simulation or writes a
//! synthetic dataset to CSV.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use gammsim::config::AppConfig;
use gammsim::data::{save_dataset, synthetic, DatasetSource};
use gammsim::harness::{block_on_with_grace, dataset_source, run_simulation, SHUTDOWN_GRACE};
use gammsim::model::gamm::PenalizedGamm;
use gammsim::storage;

#[derive(Parser, Debug)]
#[command(name = "gammsim", version, about = "Type-I error simulation for GAMM strategies")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the Monte Carlo simulation and print rejection rates.
    Run {
        #[arg(short, long, default_value = "config.toml")]
        config: String,
        /// CSV dataset (overrides `data.path`).
        #[arg(long)]
        data: Option<PathBuf>,
        #[arg(short = 'n', long)]
        iterations: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Write the configured synthetic dataset to CSV.
    Generate {
        #[arg(short, long, default_value = "config.toml")]
        config: String,
        #[arg(short, long)]
        out: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();

    match cli.command {
        Command::Run { config, data, iterations, seed, workers } => {
            let mut cfg = AppConfig::load(&config)?;
            if let Some(path) = data {
                cfg.data.path = Some(path);
            }
            if let Some(n) = iterations {
                cfg.simulation.iterations = n;
            }
            if let Some(s) = seed {
                cfg.simulation.seed = s;
            }
            if let Some(w) = workers {
                cfg.simulation.workers = w;
            }
            cfg.validate().context("Invalid settings after command-line overrides")?;
            block_on_with_grace(run(cfg), SHUTDOWN_GRACE)?
        }
        Command::Generate { config, out } => {
            let cfg = AppConfig::load(&config)?;
            let dataset = synthetic::generate(&cfg.synthetic)?;
            save_dataset(&dataset, &out)
        }
    }
}

async fn run(cfg: AppConfig) -> Result<()> {
    let source = dataset_source(&cfg);
    info!(
        source = %source.describe(),
        iterations = cfg.simulation.iterations,
        workers = cfg.simulation.workers,
        n_subjects = cfg.sampler.n_subjects,
        "GAMMSIM starting up"
    );

    let dataset = Arc::new(source.load()?);
    let fitter = Arc::new(PenalizedGamm::new(cfg.fitter.clone()));

    let output = tokio::select! {
        result = run_simulation(&cfg, dataset, fitter) => result?,
        _ = tokio::signal::ctrl_c() => {
            warn!(
                in_flight = cfg.simulation.workers,
                grace_secs = SHUTDOWN_GRACE.as_secs(),
                "Interrupted, abandoning in-flight fits; no report written"
            );
            return Ok(());
        }
    };

    println!("{}", output.report);

    if let Some(path) = &cfg.output.report_json {
        let path = path.to_string_lossy();
        storage::save_report(&output.report, Some(&*path))?;
    }
    if let Some(path) = &cfg.output.iterations_csv {
        storage::save_iterations(&output.runs, &path.to_string_lossy())?;
    }
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("gammsim=info"));

    let json_logging = std::env::var("GAMMSIM_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    }
}
