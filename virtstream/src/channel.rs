//! Stream channel: owned native stream handle with a lifecycle state machine.
//!
//! ```text
//!            finish()            abort()
//!   Open ───────────▶ Finished   Open ───────▶ Aborted
//!     │                  │                        │
//!     └──────────────────┴───── release() ────────┴──▶ Released
//! ```
//!
//! `release()` is legal from every state and idempotent. Every other operation
//! on a released channel fails with [`StreamError::InvalidState`].

use std::fmt;
use std::sync::{Arc, Weak};

use tracing::{debug, trace, warn};

use crate::config::DEFAULT_CHUNK_SIZE_BYTES;
use crate::error::{Result, StreamError};
use crate::events::{StreamEvents, StreamFlags};
use crate::host::{EventCallback, HostConnection, IoOutcome, NativeStream, live};

/// Lifecycle state of a [`StreamChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Open,
    Finished,
    Aborted,
    Released,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Finished => "finished",
            Self::Aborted => "aborted",
            Self::Released => "released",
        };
        f.write_str(name)
    }
}

/// The channel's single event callback registration.
struct Registration {
    events: StreamEvents,
    /// Kept alive for as long as the host may invoke it.
    _callback: EventCallback,
}

/// Bidirectional data-transfer channel over a native hypervisor stream.
///
/// The channel owns its native handle and releases it exactly once, either
/// through [`release`](Self::release) or, as a last resort, on drop. Access
/// must be serialized: every operation takes `&mut self`.
pub struct StreamChannel {
    handle: Option<NativeStream>,
    connection: Weak<HostConnection>,
    flags: StreamFlags,
    state: StreamState,
    registration: Option<Registration>,
    chunk_size: usize,
}

impl StreamChannel {
    /// Take ownership of an already-allocated native stream.
    pub fn new(connection: Weak<HostConnection>, handle: NativeStream, flags: StreamFlags) -> Self {
        debug!(%handle, nonblocking = flags.is_nonblocking(), "stream channel opened");
        Self {
            handle: Some(handle),
            connection,
            flags,
            state: StreamState::Open,
            registration: None,
            chunk_size: DEFAULT_CHUNK_SIZE_BYTES,
        }
    }

    /// Set the receive buffer size used by the batch receive drivers.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// The native handle, or `None` once released.
    pub fn handle(&self) -> Option<NativeStream> {
        self.handle
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn flags(&self) -> StreamFlags {
        self.flags
    }

    pub fn is_nonblocking(&self) -> bool {
        self.flags.is_nonblocking()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Event mask of the current callback registration.
    pub fn callback_events(&self) -> Option<StreamEvents> {
        self.registration.as_ref().map(|r| r.events)
    }

    /// Resolve the handle and a live connection to route a host call through.
    fn route(&self, operation: &'static str) -> Result<(Arc<HostConnection>, NativeStream)> {
        let Some(handle) = self.handle else {
            return Err(StreamError::invalid(operation, StreamState::Released));
        };
        let connection =
            live(&self.connection).ok_or_else(|| StreamError::connection_closed(operation))?;
        Ok((connection, handle))
    }

    fn route_open(&self, operation: &'static str) -> Result<(Arc<HostConnection>, NativeStream)> {
        if self.state != StreamState::Open {
            return Err(StreamError::invalid(operation, self.state));
        }
        self.route(operation)
    }

    /// Receive up to `buf.len()` bytes.
    ///
    /// Returns `Bytes(0)` at end-of-stream. A non-blocking channel returns
    /// `WouldBlock` instead of waiting for data. An empty `buf` is refused
    /// with [`StreamError::EmptyBuffer`], since the host would answer it with
    /// `Bytes(0)` whether or not the stream has ended.
    pub fn receive(&mut self, buf: &mut [u8]) -> Result<IoOutcome> {
        let (connection, handle) = self.route_open("receive")?;
        if buf.is_empty() {
            return Err(StreamError::EmptyBuffer {
                operation: "receive",
            });
        }
        let outcome = connection
            .api()
            .stream_recv(handle, buf)
            .map_err(StreamError::Transfer)?;
        let outcome = bounded("receive", outcome, buf.len())?;
        trace!(%handle, ?outcome, capacity = buf.len(), "receive");
        Ok(outcome)
    }

    /// Send up to `data.len()` bytes. Partial writes are normal.
    pub fn send(&mut self, data: &[u8]) -> Result<IoOutcome> {
        let (connection, handle) = self.route_open("send")?;
        let outcome = connection
            .api()
            .stream_send(handle, data)
            .map_err(StreamError::Transfer)?;
        let outcome = bounded("send", outcome, data.len())?;
        trace!(%handle, ?outcome, length = data.len(), "send");
        Ok(outcome)
    }

    /// Signal orderly end of transmission.
    ///
    /// On host failure the channel stays `Open` so the caller can still abort.
    pub fn finish(&mut self) -> Result<()> {
        let (connection, handle) = self.route_open("finish")?;
        connection
            .api()
            .stream_finish(handle)
            .map_err(StreamError::Transfer)?;
        self.state = StreamState::Finished;
        debug!(%handle, "stream finished");
        Ok(())
    }

    /// Cancel the transfer.
    ///
    /// The channel becomes `Aborted` even if the host reports a failure; no
    /// further transfer is attempted and release stays safe.
    pub fn abort(&mut self) -> Result<()> {
        let (connection, handle) = self.route_open("abort")?;
        self.state = StreamState::Aborted;
        let result = connection.api().stream_abort(handle);
        debug!(%handle, ok = result.is_ok(), "stream aborted");
        result.map_err(StreamError::Transfer)
    }

    /// Release the native handle.
    ///
    /// Idempotent: releasing an already-released channel succeeds without
    /// touching the host. The handle is cleared before the host call, so a
    /// failed release is never retried.
    pub fn release(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.state = StreamState::Released;
        self.registration = None;

        let Some(connection) = live(&self.connection) else {
            warn!(%handle, "releasing stream after its host connection closed");
            return Err(StreamError::connection_closed("release"));
        };
        let result = connection.api().stream_free(handle);
        debug!(%handle, ok = result.is_ok(), "stream released");
        result.map_err(StreamError::Transfer)
    }

    /// Register `callback` for the readiness conditions in `events`.
    ///
    /// A channel has at most one registration; registering again replaces the
    /// previous callback and mask.
    pub fn add_callback<F>(&mut self, events: StreamEvents, callback: F) -> Result<()>
    where
        F: Fn(StreamEvents) + Send + Sync + 'static,
    {
        self.add_event_callback(events, Arc::new(callback))
    }

    /// Like [`add_callback`](Self::add_callback), with a shared callback value.
    pub fn add_event_callback(
        &mut self,
        events: StreamEvents,
        callback: EventCallback,
    ) -> Result<()> {
        let (connection, handle) = self.route_open("add event callback")?;
        let api = connection.api();

        if self.registration.is_some() {
            api.stream_event_remove_callback(handle)
                .map_err(StreamError::Registration)?;
            self.registration = None;
            debug!(%handle, "replacing stream event callback");
        }

        api.stream_event_add_callback(handle, events, Arc::clone(&callback))
            .map_err(StreamError::Registration)?;
        self.registration = Some(Registration {
            events,
            _callback: callback,
        });
        debug!(%handle, %events, "stream event callback registered");
        Ok(())
    }

    /// Change the event mask of the existing registration.
    pub fn update_callback(&mut self, events: StreamEvents) -> Result<()> {
        let (connection, handle) = self.route_open("update event callback")?;
        connection
            .api()
            .stream_event_update_callback(handle, events)
            .map_err(StreamError::Registration)?;
        if let Some(registration) = self.registration.as_mut() {
            registration.events = events;
        }
        debug!(%handle, %events, "stream event callback updated");
        Ok(())
    }

    /// Remove the event callback. A no-op when nothing is registered.
    ///
    /// Allowed after `finish` or `abort` so drivers can clean up.
    pub fn remove_callback(&mut self) -> Result<()> {
        let (connection, handle) = self.route("remove event callback")?;
        if self.registration.is_none() {
            return Ok(());
        }
        connection
            .api()
            .stream_event_remove_callback(handle)
            .map_err(StreamError::Registration)?;
        self.registration = None;
        debug!(%handle, "stream event callback removed");
        Ok(())
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        let Some(handle) = self.handle else {
            return;
        };
        warn!(%handle, state = %self.state, "stream channel dropped without release");
        if let Err(e) = self.release() {
            warn!(%handle, error = %e, "release on drop failed");
        }
    }
}

impl fmt::Debug for StreamChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamChannel")
            .field("handle", &self.handle)
            .field("flags", &self.flags)
            .field("state", &self.state)
            .field("callback_events", &self.callback_events())
            .finish()
    }
}

/// Reject a byte count larger than the buffer the host was handed.
fn bounded(operation: &'static str, outcome: IoOutcome, capacity: usize) -> Result<IoOutcome> {
    match outcome {
        IoOutcome::Bytes(reported) if reported > capacity => Err(StreamError::Overrun {
            operation,
            reported,
            capacity,
        }),
        outcome => Ok(outcome),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{HostError, HostResult, InvalidReason};
    use crate::host::HostApi;
    use crate::memory::{ERR_INJECTED, HostCall, MemoryHost};
    use bytes::Bytes;
    use std::io;
    use std::sync::Mutex;

    fn setup(flags: StreamFlags) -> (Arc<MemoryHost>, Arc<HostConnection>, StreamChannel) {
        let host = Arc::new(MemoryHost::new());
        let connection = HostConnection::new(host.clone());
        let stream = host.create_stream(flags);
        let channel = connection.open_stream_with(stream, flags);
        (host, connection, channel)
    }

    #[test]
    fn channel_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<StreamChannel>();
    }

    #[test]
    fn release_is_idempotent() {
        let (host, _conn, mut channel) = setup(StreamFlags::NONE);
        let handle = channel.handle().unwrap();

        channel.release().unwrap();
        assert_eq!(channel.state(), StreamState::Released);
        assert!(channel.handle().is_none());

        channel.release().unwrap();
        assert_eq!(channel.state(), StreamState::Released);
        assert_eq!(host.calls(handle).unwrap().free, 1);
    }

    #[test]
    fn failed_release_is_not_retried() {
        let (host, _conn, mut channel) = setup(StreamFlags::NONE);
        let handle = channel.handle().unwrap();
        host.inject_fault(handle, HostCall::Free, HostError::new(ERR_INJECTED, "free failed"));

        assert!(channel.release().unwrap_err().is_transfer());
        assert!(channel.handle().is_none());
        channel.release().unwrap();
        drop(channel);
        assert_eq!(host.calls(handle).unwrap().free, 1);
    }

    #[test]
    fn drop_releases_unreleased_channel() {
        let (host, _conn, channel) = setup(StreamFlags::NONE);
        let handle = channel.handle().unwrap();
        drop(channel);
        assert!(host.is_freed(handle));
        assert_eq!(host.calls(handle).unwrap().free, 1);
    }

    #[test]
    fn operations_after_release_fail() {
        let (_host, _conn, mut channel) = setup(StreamFlags::NONE);
        channel.release().unwrap();

        let mut buf = [0u8; 4];
        assert!(channel.receive(&mut buf).unwrap_err().is_invalid_state());
        assert!(channel.send(b"x").unwrap_err().is_invalid_state());
        assert!(channel.finish().unwrap_err().is_invalid_state());
        assert!(channel.abort().unwrap_err().is_invalid_state());
        assert!(channel.remove_callback().unwrap_err().is_invalid_state());
        assert!(
            channel
                .add_callback(StreamEvents::READABLE, |_| {})
                .unwrap_err()
                .is_invalid_state()
        );
    }

    #[test]
    fn send_after_finish_is_invalid_state() {
        let (_host, _conn, mut channel) = setup(StreamFlags::NONE);
        channel.finish().unwrap();
        assert_eq!(channel.state(), StreamState::Finished);

        let err = channel.send(b"data").unwrap_err();
        assert!(matches!(
            err,
            StreamError::InvalidState {
                operation: "send",
                reason: InvalidReason::State(StreamState::Finished),
            }
        ));
        assert!(channel.finish().unwrap_err().is_invalid_state());
        channel.release().unwrap();
    }

    #[test]
    fn receive_after_abort_is_invalid_state() {
        let (host, _conn, mut channel) = setup(StreamFlags::NONE);
        let handle = channel.handle().unwrap();
        channel.abort().unwrap();
        assert_eq!(channel.state(), StreamState::Aborted);

        let mut buf = [0u8; 8];
        assert!(channel.receive(&mut buf).unwrap_err().is_invalid_state());
        assert!(channel.abort().unwrap_err().is_invalid_state());
        channel.release().unwrap();
        assert_eq!(host.calls(handle).unwrap().abort, 1);
    }

    #[test]
    fn nonblocking_receive_on_empty_channel_would_block() {
        let (host, _conn, mut channel) = setup(StreamFlags::NONBLOCK);
        let mut buf = [0u8; 8];
        assert_eq!(channel.receive(&mut buf).unwrap(), IoOutcome::WouldBlock);

        host.peer_write(channel.handle().unwrap(), b"hi");
        assert_eq!(channel.receive(&mut buf).unwrap(), IoOutcome::Bytes(2));

        host.peer_finish(channel.handle().unwrap());
        assert_eq!(channel.receive(&mut buf).unwrap(), IoOutcome::Bytes(0));
        channel.release().unwrap();
    }

    #[test]
    fn transfer_error_carries_host_error() {
        let (host, _conn, mut channel) = setup(StreamFlags::NONBLOCK);
        let handle = channel.handle().unwrap();
        host.inject_fault(handle, HostCall::Send, HostError::new(ERR_INJECTED, "disk full"));

        match channel.send(b"abc") {
            Err(StreamError::Transfer(e)) => {
                assert_eq!(e.code, ERR_INJECTED);
                assert_eq!(e.message, "disk full");
            }
            other => panic!("expected transfer error, got {other:?}"),
        }
        // Still open: the caller decides how to clean up.
        assert_eq!(channel.state(), StreamState::Open);
        channel.abort().unwrap();
        channel.release().unwrap();
    }

    #[test]
    fn failed_finish_leaves_channel_open() {
        let (host, _conn, mut channel) = setup(StreamFlags::NONE);
        let handle = channel.handle().unwrap();
        host.inject_fault(handle, HostCall::Finish, HostError::new(ERR_INJECTED, "nope"));

        assert!(channel.finish().unwrap_err().is_transfer());
        assert_eq!(channel.state(), StreamState::Open);
        channel.abort().unwrap();
        channel.release().unwrap();
    }

    #[test]
    fn update_callback_changes_delivered_events() {
        let (host, _conn, mut channel) = setup(StreamFlags::NONBLOCK);
        let handle = channel.handle().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        channel
            .add_callback(StreamEvents::READABLE, move |events| {
                sink.lock().unwrap().push(events);
            })
            .unwrap();

        // Readable and writable at once.
        host.peer_write(handle, b"data");
        host.dispatch_events();
        channel.update_callback(StreamEvents::WRITABLE).unwrap();
        assert_eq!(channel.callback_events(), Some(StreamEvents::WRITABLE));
        host.dispatch_events();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![StreamEvents::READABLE, StreamEvents::WRITABLE]);
        drop(seen);
        channel.release().unwrap();
    }

    #[test]
    fn add_callback_replaces_previous_registration() {
        let (host, _conn, mut channel) = setup(StreamFlags::NONBLOCK);
        let handle = channel.handle().unwrap();
        let first = Arc::new(Mutex::new(0u32));
        let second = Arc::new(Mutex::new(0u32));

        let counter = Arc::clone(&first);
        channel
            .add_callback(StreamEvents::WRITABLE, move |_| *counter.lock().unwrap() += 1)
            .unwrap();
        let counter = Arc::clone(&second);
        channel
            .add_callback(StreamEvents::WRITABLE, move |_| *counter.lock().unwrap() += 1)
            .unwrap();

        assert_eq!(host.dispatch_events(), 1);
        assert_eq!(*first.lock().unwrap(), 0);
        assert_eq!(*second.lock().unwrap(), 1);

        let calls = host.calls(handle).unwrap();
        assert_eq!(calls.add_callback, 2);
        assert_eq!(calls.remove_callback, 1);
        channel.release().unwrap();
    }

    #[test]
    fn remove_callback_without_registration_is_noop() {
        let (host, _conn, mut channel) = setup(StreamFlags::NONBLOCK);
        let handle = channel.handle().unwrap();
        channel.remove_callback().unwrap();
        assert_eq!(host.calls(handle).unwrap().remove_callback, 0);

        channel.add_callback(StreamEvents::READABLE, |_| {}).unwrap();
        channel.remove_callback().unwrap();
        channel.remove_callback().unwrap();
        assert_eq!(host.registered_events(handle), None);
        assert_eq!(host.calls(handle).unwrap().remove_callback, 1);
        channel.release().unwrap();
    }

    #[test]
    fn update_without_registration_is_registration_error() {
        let (_host, _conn, mut channel) = setup(StreamFlags::NONBLOCK);
        let err = channel.update_callback(StreamEvents::READABLE).unwrap_err();
        assert!(matches!(err, StreamError::Registration(_)));
        channel.release().unwrap();
    }

    #[test]
    fn closed_connection_refuses_operations() {
        let (host, connection, mut channel) = setup(StreamFlags::NONE);
        let handle = channel.handle().unwrap();
        connection.close();

        let err = channel.send(b"x").unwrap_err();
        assert!(matches!(
            err,
            StreamError::InvalidState {
                reason: InvalidReason::ConnectionClosed,
                ..
            }
        ));
        assert!(channel.release().unwrap_err().is_invalid_state());
        assert_eq!(channel.state(), StreamState::Released);
        channel.release().unwrap();
        assert_eq!(host.calls(handle).unwrap().free, 0);
    }

    /// Host that claims one byte more than it was asked to move.
    struct Overreporting(MemoryHost);

    impl HostApi for Overreporting {
        fn stream_abort(&self, stream: NativeStream) -> HostResult<()> {
            self.0.stream_abort(stream)
        }

        fn stream_finish(&self, stream: NativeStream) -> HostResult<()> {
            self.0.stream_finish(stream)
        }

        fn stream_free(&self, stream: NativeStream) -> HostResult<()> {
            self.0.stream_free(stream)
        }

        fn stream_recv(&self, _stream: NativeStream, buf: &mut [u8]) -> HostResult<IoOutcome> {
            Ok(IoOutcome::Bytes(buf.len() + 1))
        }

        fn stream_send(&self, _stream: NativeStream, data: &[u8]) -> HostResult<IoOutcome> {
            Ok(IoOutcome::Bytes(data.len() + 1))
        }

        fn stream_event_add_callback(
            &self,
            stream: NativeStream,
            events: StreamEvents,
            callback: EventCallback,
        ) -> HostResult<()> {
            self.0.stream_event_add_callback(stream, events, callback)
        }

        fn stream_event_update_callback(
            &self,
            stream: NativeStream,
            events: StreamEvents,
        ) -> HostResult<()> {
            self.0.stream_event_update_callback(stream, events)
        }

        fn stream_event_remove_callback(&self, stream: NativeStream) -> HostResult<()> {
            self.0.stream_event_remove_callback(stream)
        }
    }

    #[test]
    fn overreported_counts_are_transfer_errors() {
        let host = Arc::new(Overreporting(MemoryHost::new()));
        let stream = host.0.create_stream(StreamFlags::NONE);
        let connection = HostConnection::new(host.clone());
        let mut channel = connection.open_stream_with(stream, StreamFlags::NONE);

        let err = channel.send(b"abc").unwrap_err();
        assert!(err.is_transfer());
        assert!(matches!(
            err,
            StreamError::Overrun {
                operation: "send",
                reported: 4,
                capacity: 3,
            }
        ));

        let mut buf = [0u8; 8];
        let err = channel.receive(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            StreamError::Overrun {
                operation: "receive",
                reported: 9,
                capacity: 8,
            }
        ));
        assert_eq!(channel.state(), StreamState::Open);

        let mut chunk = Some(Bytes::from_static(b"abc"));
        let err = channel
            .send_all(move || -> io::Result<Option<Bytes>> { Ok(chunk.take()) })
            .unwrap_err();
        assert!(err.is_transfer());
        let err = channel
            .receive_all(|data: &[u8]| -> io::Result<usize> { Ok(data.len()) })
            .unwrap_err();
        assert!(err.is_transfer());

        channel.abort().unwrap();
        channel.release().unwrap();
        assert!(host.0.is_freed(stream));
    }

    #[test]
    fn empty_receive_is_refused_without_consuming_data() {
        let (host, _conn, mut channel) = setup(StreamFlags::NONBLOCK);
        let handle = channel.handle().unwrap();
        host.peer_write(handle, b"abc");

        let err = channel.receive(&mut []).unwrap_err();
        assert!(matches!(
            err,
            StreamError::EmptyBuffer {
                operation: "receive"
            }
        ));
        assert!(!err.is_transfer());
        assert_eq!(host.calls(handle).unwrap().recv, 0);

        let mut buf = [0u8; 8];
        assert_eq!(channel.receive(&mut buf).unwrap(), IoOutcome::Bytes(3));
        assert_eq!(&buf[..3], b"abc");
        channel.release().unwrap();
    }

    #[test]
    fn dropped_connection_refuses_operations() {
        let (_host, connection, mut channel) = setup(StreamFlags::NONE);
        drop(connection);
        let mut buf = [0u8; 1];
        assert!(channel.receive(&mut buf).unwrap_err().is_invalid_state());
        // Drop must not panic either.
        drop(channel);
    }
}
