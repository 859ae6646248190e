//! Batch transfer drivers.
//!
//! A batch transfer moves a whole stream through a caller-supplied
//! [`StreamSource`] (upload) or [`StreamSink`] (download). The work is split
//! in two layers:
//!
//! - [`SendAll`] and [`ReceiveAll`] are resumable pumps. Each `pump()` call
//!   transfers as much as the channel accepts and returns
//!   [`Progress::Blocked`] on `WouldBlock`, holding on to any bytes not yet
//!   transferred. An external event loop can drive them from its own callback.
//! - [`StreamChannel::send_all`] / [`StreamChannel::receive_all`] and their
//!   async variants drive a pump to completion. When it blocks they register
//!   an event callback for the pump's interest and wait for the host to report
//!   readiness before pumping again. They never retry without a wakeup.
//!
//! A clean end of stream calls `finish()` exactly once. A transfer error stops
//! the batch without finishing, leaving the channel open for `abort()`.

use std::io;
use std::sync::Arc;

use bytes::{Buf, Bytes};
use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::channel::StreamChannel;
use crate::error::{Result, StreamError};
use crate::events::StreamEvents;
use crate::host::{EventCallback, IoOutcome};

/// Pull side of a batch upload.
pub trait StreamSource {
    /// Next chunk to send, or `None` at end of data.
    fn next_chunk(&mut self) -> io::Result<Option<Bytes>>;
}

impl<F> StreamSource for F
where
    F: FnMut() -> io::Result<Option<Bytes>>,
{
    fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        self()
    }
}

/// Push side of a batch download.
pub trait StreamSink {
    /// Consume a prefix of `chunk` and return its length.
    ///
    /// Unconsumed bytes are presented again before the next receive.
    fn consume(&mut self, chunk: &[u8]) -> io::Result<usize>;
}

impl<F> StreamSink for F
where
    F: FnMut(&[u8]) -> io::Result<usize>,
{
    fn consume(&mut self, chunk: &[u8]) -> io::Result<usize> {
        self(chunk)
    }
}

/// Counters for one batch transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// Payload bytes moved through the channel.
    pub bytes: u64,
    /// Send or receive attempts made against the host.
    pub calls: u64,
    /// Times the driver waited for a readiness event.
    pub waits: u64,
}

/// Result of one pump step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The channel would block; pump again once one of these events fires.
    Blocked(StreamEvents),
    /// The stream reached its end and was finished.
    Complete(TransferStats),
}

/// A resumable batch transfer.
pub trait Pump {
    /// Readiness that resumes a blocked pump.
    fn interest(&self) -> StreamEvents;

    /// Transfer until the channel blocks or the stream completes.
    fn pump(&mut self, channel: &mut StreamChannel) -> Result<Progress>;

    /// Note that the driver waited for readiness.
    fn record_wait(&mut self);
}

/// Resumable batch upload.
pub struct SendAll<S> {
    source: S,
    /// Unsent remainder of the current chunk.
    pending: Bytes,
    stats: TransferStats,
    complete: bool,
}

impl<S: StreamSource> SendAll<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            pending: Bytes::new(),
            stats: TransferStats::default(),
            complete: false,
        }
    }

    pub fn stats(&self) -> TransferStats {
        self.stats
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Bytes pulled from the source but not yet accepted by the channel.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

impl<S: StreamSource> Pump for SendAll<S> {
    fn interest(&self) -> StreamEvents {
        StreamEvents::WRITABLE | StreamEvents::ERROR | StreamEvents::HANGUP
    }

    fn pump(&mut self, channel: &mut StreamChannel) -> Result<Progress> {
        if self.complete {
            return Ok(Progress::Complete(self.stats));
        }

        loop {
            if self.pending.is_empty() {
                match self.source.next_chunk().map_err(StreamError::Source)? {
                    Some(chunk) => {
                        self.pending = chunk;
                        continue;
                    }
                    None => {
                        channel.finish()?;
                        self.complete = true;
                        debug!(
                            bytes = self.stats.bytes,
                            calls = self.stats.calls,
                            "send_all complete"
                        );
                        return Ok(Progress::Complete(self.stats));
                    }
                }
            }

            self.stats.calls += 1;
            match channel.send(&self.pending)? {
                IoOutcome::Bytes(0) | IoOutcome::WouldBlock => {
                    return Ok(Progress::Blocked(self.interest()));
                }
                IoOutcome::Bytes(n) => {
                    self.stats.bytes += n as u64;
                    // Re-present the rest of this chunk before pulling the next.
                    self.pending.advance(n);
                }
            }
        }
    }

    fn record_wait(&mut self) {
        self.stats.waits += 1;
    }
}

/// Resumable batch download.
pub struct ReceiveAll<K> {
    sink: K,
    buf: Box<[u8]>,
    /// Received bytes not yet consumed by the sink: `buf[start..end]`.
    start: usize,
    end: usize,
    stats: TransferStats,
    complete: bool,
}

impl<K: StreamSink> ReceiveAll<K> {
    pub fn new(sink: K, chunk_size: usize) -> Self {
        Self {
            sink,
            buf: vec![0u8; chunk_size.max(1)].into_boxed_slice(),
            start: 0,
            end: 0,
            stats: TransferStats::default(),
            complete: false,
        }
    }

    pub fn stats(&self) -> TransferStats {
        self.stats
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn into_sink(self) -> K {
        self.sink
    }
}

impl<K: StreamSink> Pump for ReceiveAll<K> {
    fn interest(&self) -> StreamEvents {
        StreamEvents::READABLE | StreamEvents::ERROR | StreamEvents::HANGUP
    }

    fn pump(&mut self, channel: &mut StreamChannel) -> Result<Progress> {
        if self.complete {
            return Ok(Progress::Complete(self.stats));
        }

        loop {
            while self.start < self.end {
                let chunk = &self.buf[self.start..self.end];
                let consumed = self.sink.consume(chunk).map_err(StreamError::Sink)?;
                if consumed == 0 || consumed > chunk.len() {
                    return Err(StreamError::Sink(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("sink consumed {consumed} of {} bytes", chunk.len()),
                    )));
                }
                self.start += consumed;
            }

            self.stats.calls += 1;
            match channel.receive(&mut self.buf)? {
                IoOutcome::WouldBlock => return Ok(Progress::Blocked(self.interest())),
                IoOutcome::Bytes(0) => {
                    channel.finish()?;
                    self.complete = true;
                    debug!(
                        bytes = self.stats.bytes,
                        calls = self.stats.calls,
                        "receive_all complete"
                    );
                    return Ok(Progress::Complete(self.stats));
                }
                IoOutcome::Bytes(n) => {
                    self.stats.bytes += n as u64;
                    self.start = 0;
                    self.end = n;
                }
            }
        }
    }

    fn record_wait(&mut self) {
        self.stats.waits += 1;
    }
}

/// Wakeup flag set by the event callback, waited on by the blocking driver.
#[derive(Default)]
struct Readiness {
    ready: Mutex<bool>,
    cond: Condvar,
}

impl Readiness {
    fn notify(&self) {
        *self.ready.lock() = true;
        self.cond.notify_one();
    }

    fn wait(&self) {
        let mut ready = self.ready.lock();
        while !*ready {
            self.cond.wait(&mut ready);
        }
        *ready = false;
    }
}

impl StreamChannel {
    /// Upload everything `source` produces, then finish the stream.
    ///
    /// Blocks the calling thread. On a non-blocking channel the driver takes
    /// over the channel's event callback while it waits for writability and
    /// removes it when done.
    pub fn send_all<S: StreamSource>(&mut self, source: S) -> Result<TransferStats> {
        self.drive(SendAll::new(source))
    }

    /// Download the stream into `sink` until end-of-stream, then finish it.
    pub fn receive_all<K: StreamSink>(&mut self, sink: K) -> Result<TransferStats> {
        let chunk_size = self.chunk_size();
        self.drive(ReceiveAll::new(sink, chunk_size))
    }

    /// Async [`send_all`](Self::send_all): the task suspends between readiness
    /// events instead of the thread. Intended for non-blocking channels.
    pub async fn send_all_async<S: StreamSource>(&mut self, source: S) -> Result<TransferStats> {
        self.drive_async(SendAll::new(source)).await
    }

    /// Async [`receive_all`](Self::receive_all).
    pub async fn receive_all_async<K: StreamSink>(&mut self, sink: K) -> Result<TransferStats> {
        let chunk_size = self.chunk_size();
        self.drive_async(ReceiveAll::new(sink, chunk_size)).await
    }

    /// Drive `pump` to completion, blocking the thread between readiness events.
    pub fn drive<P: Pump>(&mut self, mut pump: P) -> Result<TransferStats> {
        let mut readiness: Option<Arc<Readiness>> = None;

        let result = loop {
            match pump.pump(self) {
                Ok(Progress::Complete(stats)) => break Ok(stats),
                Ok(Progress::Blocked(interest)) => {
                    let waiter = match &readiness {
                        Some(waiter) => Arc::clone(waiter),
                        None => {
                            let waiter = Arc::new(Readiness::default());
                            let notify = Arc::clone(&waiter);
                            let callback: EventCallback =
                                Arc::new(move |_: StreamEvents| notify.notify());
                            if let Err(e) = self.add_event_callback(interest, callback) {
                                break Err(e);
                            }
                            readiness = Some(Arc::clone(&waiter));
                            waiter
                        }
                    };
                    waiter.wait();
                    pump.record_wait();
                }
                Err(e) => break Err(e),
            }
        };

        if readiness.is_some() {
            self.clear_driver_callback();
        }
        result
    }

    /// Drive `pump` to completion, suspending the task between readiness events.
    pub async fn drive_async<P: Pump>(&mut self, mut pump: P) -> Result<TransferStats> {
        let mut notify: Option<Arc<Notify>> = None;

        let result = loop {
            match pump.pump(self) {
                Ok(Progress::Complete(stats)) => break Ok(stats),
                Ok(Progress::Blocked(interest)) => {
                    let waiter = match &notify {
                        Some(waiter) => Arc::clone(waiter),
                        None => {
                            let waiter = Arc::new(Notify::new());
                            let wake = Arc::clone(&waiter);
                            let callback: EventCallback =
                                Arc::new(move |_: StreamEvents| wake.notify_one());
                            if let Err(e) = self.add_event_callback(interest, callback) {
                                break Err(e);
                            }
                            notify = Some(Arc::clone(&waiter));
                            waiter
                        }
                    };
                    waiter.notified().await;
                    pump.record_wait();
                }
                Err(e) => break Err(e),
            }
        };

        if notify.is_some() {
            self.clear_driver_callback();
        }
        result
    }

    fn clear_driver_callback(&mut self) {
        if let Err(e) = self.remove_callback() {
            warn!(error = %e, "failed to remove batch transfer callback");
        }
    }
}
