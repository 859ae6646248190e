//! Error types for virtstream.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::channel::StreamState;

pub type Result<T> = std::result::Result<T, StreamError>;

/// Result of a call into the hypervisor control API.
pub type HostResult<T> = std::result::Result<T, HostError>;

/// Failure reported by the hypervisor control API.
///
/// The code and message are carried verbatim; formatting them is the host's job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("host error {code}: {message}")]
pub struct HostError {
    pub code: i32,
    pub message: String,
}

impl HostError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Why an operation was refused by the channel state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    /// The channel left the `Open` state.
    State(StreamState),
    /// The owning host connection was closed or dropped.
    ConnectionClosed,
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::State(state) => write!(f, "stream is {state}"),
            Self::ConnectionClosed => write!(f, "host connection is closed"),
        }
    }
}

/// Stream channel errors.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("cannot {operation}: {reason}")]
    InvalidState {
        operation: &'static str,
        reason: InvalidReason,
    },

    #[error("transfer failed: {0}")]
    Transfer(#[source] HostError),

    /// The host claimed to move more bytes than the buffer holds.
    #[error("host reported {reported} bytes for a {capacity}-byte {operation}")]
    Overrun {
        operation: &'static str,
        reported: usize,
        capacity: usize,
    },

    #[error("cannot {operation} into an empty buffer")]
    EmptyBuffer { operation: &'static str },

    #[error("event callback registration failed: {0}")]
    Registration(#[source] HostError),

    #[error("stream source failed: {0}")]
    Source(#[source] io::Error),

    #[error("stream sink failed: {0}")]
    Sink(#[source] io::Error),
}

impl StreamError {
    pub(crate) fn invalid(operation: &'static str, state: StreamState) -> Self {
        Self::InvalidState {
            operation,
            reason: InvalidReason::State(state),
        }
    }

    pub(crate) fn connection_closed(operation: &'static str) -> Self {
        Self::InvalidState {
            operation,
            reason: InvalidReason::ConnectionClosed,
        }
    }

    /// True for errors caused by calling an operation in the wrong lifecycle state.
    pub fn is_invalid_state(&self) -> bool {
        matches!(self, Self::InvalidState { .. })
    }

    /// True for I/O failures reported by the host during a transfer.
    pub fn is_transfer(&self) -> bool {
        matches!(self, Self::Transfer(_) | Self::Overrun { .. })
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(io::Error),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}
