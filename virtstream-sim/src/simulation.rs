//! Simulation runners and utilities.
//!
//! Sessions run on a single-threaded tokio runtime so spawned peers and the
//! async drivers interleave in a fixed order for a given seed.

use tracing::info;

use crate::config::Config;
use crate::harness::{SimulationError, StreamHarness, StreamStats};

/// Build a single-threaded tokio runtime for simulation.
pub fn build_runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}

/// Run a stream simulation with the given seed.
pub async fn run_stream_simulation(
    seed: u64,
    config: &Config,
) -> Result<StreamStats, SimulationError> {
    info!(
        seed,
        sessions = config.simulation.sessions,
        max_stream_bytes = config.simulation.max_stream_bytes,
        fault_rate = config.simulation.fault_rate,
        "stream simulation starting"
    );

    let mut harness = StreamHarness::new(seed, config);
    harness.run(config.simulation.sessions).await?;

    let stats = harness.stats().clone();
    info!(?stats, "stream simulation complete");
    Ok(stats)
}

/// Get the seed from environment or generate a random one.
pub fn get_seed() -> u64 {
    std::env::var("DST_SEED")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(rand::random)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(sessions: u64, max_stream_bytes: usize) -> Config {
        let mut config = Config::default();
        config.simulation.sessions = sessions;
        config.simulation.max_stream_bytes = max_stream_bytes;
        config
    }

    /// Quick stream simulation (PR-level).
    #[test]
    fn stream_simulation() {
        let seed = get_seed();
        eprintln!("DST_SEED={}", seed);
        let runtime = build_runtime().unwrap();
        let stats = runtime
            .block_on(run_stream_simulation(seed, &config(100, 8 * 1024)))
            .unwrap();
        assert_eq!(stats.sessions, 100);
    }

    /// Same seed, same run.
    #[test]
    fn stream_simulation_is_reproducible() {
        let seed = 0x5eed;
        let config = config(40, 4 * 1024);
        let first = build_runtime()
            .unwrap()
            .block_on(run_stream_simulation(seed, &config))
            .unwrap();
        let second = build_runtime()
            .unwrap()
            .block_on(run_stream_simulation(seed, &config))
            .unwrap();
        assert_eq!(first.bytes, second.bytes);
        assert_eq!(first.faults, second.faults);
        assert_eq!(first.aborts, second.aborts);
        assert_eq!(first.uploads, second.uploads);
    }

    /// Long-running stream simulation (nightly).
    #[test]
    #[ignore]
    fn stream_simulation_long() {
        let seed = get_seed();
        eprintln!("DST_SEED={}", seed);
        let runtime = build_runtime().unwrap();
        runtime
            .block_on(run_stream_simulation(seed, &config(10_000, 256 * 1024)))
            .unwrap();
    }
}
