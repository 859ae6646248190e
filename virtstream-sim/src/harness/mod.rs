//! Simulation harnesses for virtstream.
//!
//! The harness plays every role around a channel: the remote peer, the host
//! event loop, and the fault injector. The oracle checks what the host saw
//! against what each session was expected to do.

pub mod stream;

pub use stream::{DriveMode, Outcome, StreamAction, StreamHarness, StreamOracle, StreamStats};

use thiserror::Error;
use tokio::task::JoinError;
use virtstream::{NativeStream, StreamError};

/// A session that broke the harness's expectations.
#[derive(Debug, Error)]
pub enum SimulationError {
    /// The host's accounting disagrees with what the session should have done.
    #[error("{stream}: {context}")]
    Mismatch { stream: NativeStream, context: String },

    /// A channel call that every well-formed session makes failed.
    #[error("{stream}: {operation} failed")]
    Channel {
        stream: NativeStream,
        operation: &'static str,
        #[source]
        source: StreamError,
    },

    #[error("{stream} is not known to the {side}")]
    Untracked {
        stream: NativeStream,
        side: &'static str,
    },

    /// A spawned peer task panicked or was cancelled.
    #[error("{stream}: peer task failed")]
    Peer {
        stream: NativeStream,
        #[source]
        source: JoinError,
    },
}

impl SimulationError {
    pub fn stream(&self) -> NativeStream {
        match self {
            Self::Mismatch { stream, .. }
            | Self::Channel { stream, .. }
            | Self::Untracked { stream, .. }
            | Self::Peer { stream, .. } => *stream,
        }
    }

    pub(crate) fn mismatch(stream: NativeStream, context: impl Into<String>) -> Self {
        Self::Mismatch {
            stream,
            context: context.into(),
        }
    }

    pub(crate) fn channel(
        stream: NativeStream,
        operation: &'static str,
    ) -> impl FnOnce(StreamError) -> Self {
        move |source| Self::Channel {
            stream,
            operation,
            source,
        }
    }
}
