//! stream-sim - run seeded stream channel simulations.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use virtstream_sim::{Config, build_runtime, get_seed, run_stream_simulation};

#[derive(Parser, Debug)]
#[command(
    name = "stream-sim",
    about = "Run deterministic simulations of virtstream channels"
)]
struct Cli {
    /// Path to config file. If omitted, uses defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seed to run with. Overrides the config file and DST_SEED.
    #[arg(long)]
    seed: Option<u64>,

    /// Number of stream sessions. Overrides config file if specified.
    #[arg(short, long)]
    sessions: Option<u64>,

    /// Probability of a host fault at each blocked step.
    #[arg(long)]
    fault_rate: Option<f64>,

    /// Open simulated channels in non-blocking mode by default.
    #[arg(long)]
    nonblocking: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = match cli.config {
        Some(ref path) => Config::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => Config::default(),
    };

    // CLI overrides
    if let Some(sessions) = cli.sessions {
        config.simulation.sessions = sessions;
    }
    if let Some(fault_rate) = cli.fault_rate {
        config.simulation.fault_rate = fault_rate;
    }
    if cli.nonblocking {
        config.transfer.nonblocking = true;
    }
    config.validate().context("Invalid configuration")?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let seed = cli
        .seed
        .or(config.simulation.seed)
        .unwrap_or_else(get_seed);
    info!(seed, "DST_SEED={seed} reproduces this run");

    let runtime = build_runtime().context("Failed to build runtime")?;
    let stats = runtime
        .block_on(run_stream_simulation(seed, &config))
        .with_context(|| format!("Simulation failed with seed {seed}"))?;

    println!(
        "sessions={} uploads={} downloads={} bytes={} waits={} faults={} aborts={}",
        stats.sessions,
        stats.uploads,
        stats.downloads,
        stats.bytes,
        stats.waits,
        stats.faults,
        stats.aborts
    );
    Ok(())
}
