//! Deterministic Simulation Testing (DST) for virtstream.
//!
//! Kept apart from the `virtstream` crate so the simulation peer and fault
//! injection never ship in production builds.
//!
//! ## Crate Structure
//!
//! - `config` - TOML configuration for simulation runs
//! - `harness` - Session harness and oracle for correctness verification
//! - `simulation` - Runtime and simulation runners
//!
//! ## Running DST Tests
//!
//! ```bash
//! # PR-level quick tests
//! cargo test -p virtstream-sim simulation
//!
//! # Nightly long-running tests, optionally pinned to a seed
//! DST_SEED=42 cargo test -p virtstream-sim simulation -- --ignored
//! ```

pub mod config;
pub mod harness;
pub mod simulation;

pub use config::{Config, SimulationConfig};
pub use harness::{
    DriveMode, Outcome, SimulationError, StreamAction, StreamHarness, StreamOracle, StreamStats,
};
pub use simulation::{build_runtime, get_seed, run_stream_simulation};
