//! Transfer configuration.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::events::StreamFlags;

/// Default receive buffer for the batch receive driver (256 KiB).
pub const DEFAULT_CHUNK_SIZE_BYTES: usize = 256 * 1024;

/// Upper bound on the receive buffer, to keep per-channel allocation bounded.
pub const CHUNK_SIZE_MAX_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Buffer size used by `receive_all` for each receive attempt.
    pub chunk_size_bytes: usize,
    /// Open channels in non-blocking mode unless flags are given explicitly.
    pub nonblocking: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
            nonblocking: false,
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "transfer.chunk_size_bytes",
                reason: "must be > 0",
            });
        }
        if self.chunk_size_bytes > CHUNK_SIZE_MAX_BYTES {
            return Err(ConfigError::InvalidValue {
                field: "transfer.chunk_size_bytes",
                reason: "must be <= 16 MiB",
            });
        }
        Ok(())
    }

    pub fn stream_flags(&self) -> StreamFlags {
        if self.nonblocking {
            StreamFlags::NONBLOCK
        } else {
            StreamFlags::NONE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TransferConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stream_flags(), StreamFlags::NONE);
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let config = TransferConfig {
            chunk_size_bytes: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn rejects_oversized_chunk() {
        let config = TransferConfig {
            chunk_size_bytes: CHUNK_SIZE_MAX_BYTES + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_partial_toml() {
        let config: TransferConfig = toml::from_str("nonblocking = true").unwrap();
        assert_eq!(config.chunk_size_bytes, DEFAULT_CHUNK_SIZE_BYTES);
        assert!(config.stream_flags().is_nonblocking());
    }
}
