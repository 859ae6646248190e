//! Boundary with the hypervisor control API.
//!
//! The control API owns sessions and native stream objects. This module defines
//! the calls a [`StreamChannel`](crate::StreamChannel) routes through it, and the
//! shared [`HostConnection`] that channels reference without owning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::debug;

use crate::channel::StreamChannel;
use crate::config::TransferConfig;
use crate::error::HostResult;
use crate::events::{StreamEvents, StreamFlags};

/// Opaque identifier of a native stream object allocated by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NativeStream(pub u64);

impl std::fmt::Display for NativeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Outcome of a single send or receive attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOutcome {
    /// Bytes moved. For a receive, `Bytes(0)` is end-of-stream.
    Bytes(usize),
    /// A non-blocking stream has no data or no room right now.
    WouldBlock,
}

impl IoOutcome {
    pub fn is_would_block(self) -> bool {
        matches!(self, Self::WouldBlock)
    }

    /// Number of bytes moved, or `None` for [`IoOutcome::WouldBlock`].
    pub fn bytes(self) -> Option<usize> {
        match self {
            Self::Bytes(n) => Some(n),
            Self::WouldBlock => None,
        }
    }
}

/// Readiness callback invoked by the host's event loop.
///
/// Must not block.
pub type EventCallback = Arc<dyn Fn(StreamEvents) + Send + Sync>;

/// Stream calls of the hypervisor control API.
///
/// Calls returning `HostResult<()>` have no meaningful success value.
pub trait HostApi: Send + Sync {
    /// Cancel an in-progress transfer.
    fn stream_abort(&self, stream: NativeStream) -> HostResult<()>;

    /// Signal that no further data will be sent.
    fn stream_finish(&self, stream: NativeStream) -> HostResult<()>;

    /// Drop the caller's reference to the native stream.
    ///
    /// Any event callback registered on the stream is dropped with it.
    fn stream_free(&self, stream: NativeStream) -> HostResult<()>;

    /// Receive up to `buf.len()` bytes.
    fn stream_recv(&self, stream: NativeStream, buf: &mut [u8]) -> HostResult<IoOutcome>;

    /// Send up to `data.len()` bytes.
    fn stream_send(&self, stream: NativeStream, data: &[u8]) -> HostResult<IoOutcome>;

    /// Register the stream's event callback. Fails if one is already registered.
    fn stream_event_add_callback(
        &self,
        stream: NativeStream,
        events: StreamEvents,
        callback: EventCallback,
    ) -> HostResult<()>;

    /// Change the event mask of the registered callback.
    fn stream_event_update_callback(
        &self,
        stream: NativeStream,
        events: StreamEvents,
    ) -> HostResult<()>;

    /// Remove the registered callback.
    fn stream_event_remove_callback(&self, stream: NativeStream) -> HostResult<()>;
}

/// A session with the hypervisor control API, shared by many channels.
///
/// Channels hold a [`Weak`] reference: closing or dropping the connection is
/// the owner's decision, after which channel operations fail with an
/// invalid-state error.
pub struct HostConnection {
    api: Arc<dyn HostApi>,
    config: TransferConfig,
    closed: AtomicBool,
}

impl HostConnection {
    pub fn new(api: Arc<dyn HostApi>) -> Arc<Self> {
        Self::with_config(api, TransferConfig::default())
    }

    pub fn with_config(api: Arc<dyn HostApi>, config: TransferConfig) -> Arc<Self> {
        Arc::new(Self {
            api,
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// Wrap an already-allocated native stream in a channel using the
    /// connection's transfer defaults.
    pub fn open_stream(self: &Arc<Self>, stream: NativeStream) -> StreamChannel {
        self.open_stream_with(stream, self.config.stream_flags())
    }

    /// Wrap an already-allocated native stream created with explicit flags.
    pub fn open_stream_with(
        self: &Arc<Self>,
        stream: NativeStream,
        flags: StreamFlags,
    ) -> StreamChannel {
        StreamChannel::new(Arc::downgrade(self), stream, flags)
            .with_chunk_size(self.config.chunk_size_bytes)
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn api(&self) -> &Arc<dyn HostApi> {
        &self.api
    }

    /// Mark the session closed. Channels bound to it stop routing calls.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("host connection closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Upgrade a channel's back-reference, refusing closed sessions.
pub(crate) fn live(connection: &Weak<HostConnection>) -> Option<Arc<HostConnection>> {
    connection.upgrade().filter(|conn| !conn.is_closed())
}
