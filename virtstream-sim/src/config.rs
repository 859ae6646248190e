//! Configuration for simulation runs.

use std::path::Path;

use serde::{Deserialize, Serialize};
use virtstream::{ConfigError, TransferConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.transfer.validate()?;
        self.simulation.validate()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Fixed seed. When unset, `DST_SEED` or a random seed is used.
    pub seed: Option<u64>,
    /// Stream sessions to run.
    pub sessions: u64,
    pub min_stream_bytes: usize,
    pub max_stream_bytes: usize,
    /// Largest host-side buffer drawn for a stream.
    pub max_capacity_bytes: usize,
    /// Largest per-call transfer limit drawn for a stream.
    pub max_transfer_bytes: usize,
    /// Probability of injecting a host fault at each blocked step.
    pub fault_rate: f64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: None,
            sessions: 100,
            min_stream_bytes: 0,
            max_stream_bytes: 64 * 1024,
            max_capacity_bytes: 16 * 1024,
            max_transfer_bytes: 4 * 1024,
            fault_rate: 0.05,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sessions == 0 {
            return Err(ConfigError::InvalidValue {
                field: "simulation.sessions",
                reason: "must be > 0",
            });
        }
        if self.min_stream_bytes > self.max_stream_bytes {
            return Err(ConfigError::InvalidValue {
                field: "simulation.min_stream_bytes",
                reason: "must be <= max_stream_bytes",
            });
        }
        if self.max_capacity_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "simulation.max_capacity_bytes",
                reason: "must be > 0",
            });
        }
        if self.max_transfer_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "simulation.max_transfer_bytes",
                reason: "must be > 0",
            });
        }
        if !(0.0..=1.0).contains(&self.fault_rate) {
            return Err(ConfigError::InvalidValue {
                field: "simulation.fault_rate",
                reason: "must be within [0, 1]",
            });
        }
        Ok(())
    }
}
