//! In-process hypervisor control API.
//!
//! [`MemoryHost`] keeps every native stream as a pair of bounded byte queues.
//! The test (or simulation) plays the remote peer through the `peer_*`
//! methods and plays the host event loop through [`MemoryHost::dispatch_events`].
//!
//! Readiness is level-triggered: every dispatch fires each registered callback
//! whose mask intersects the stream's current readiness.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::{HostError, HostResult};
use crate::events::{StreamEvents, StreamFlags};
use crate::host::{EventCallback, HostApi, IoOutcome, NativeStream};

// Error codes reported by the in-memory host
pub const ERR_INVALID_STREAM: i32 = 1;
pub const ERR_STREAM_CLOSED: i32 = 2;
pub const ERR_CALLBACK: i32 = 3;
pub const ERR_HANGUP: i32 = 4;
pub const ERR_INJECTED: i32 = 5;

/// Default bytes the peer may leave unread before sends stop.
pub const DEFAULT_CAPACITY_BYTES: usize = 64 * 1024;

/// Host calls that can have a fault injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostCall {
    Abort,
    Finish,
    Free,
    Recv,
    Send,
    AddCallback,
    UpdateCallback,
    RemoveCallback,
}

/// Shape of a stream created by [`MemoryHost::create_stream_with`].
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    pub flags: StreamFlags,
    /// Outbound bytes buffered before sends block.
    pub capacity_bytes: usize,
    /// Largest transfer a single send or receive performs.
    pub max_transfer_bytes: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            flags: StreamFlags::NONE,
            capacity_bytes: DEFAULT_CAPACITY_BYTES,
            max_transfer_bytes: usize::MAX,
        }
    }
}

/// Per-stream call accounting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamCalls {
    pub recv: u64,
    pub send: u64,
    pub would_block: u64,
    pub finish: u64,
    pub abort: u64,
    pub free: u64,
    pub add_callback: u64,
    pub update_callback: u64,
    pub remove_callback: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

struct Registration {
    events: StreamEvents,
    callback: EventCallback,
}

struct StreamSlot {
    options: StreamOptions,
    /// Bytes written by the peer, waiting for `stream_recv`.
    inbound: VecDeque<u8>,
    /// Peer finished writing; receives return end-of-stream once drained.
    inbound_closed: bool,
    /// Bytes accepted by `stream_send`, waiting for the peer.
    outbound: VecDeque<u8>,
    /// Every byte ever accepted by `stream_send`, in order.
    sent_log: Vec<u8>,
    finished: bool,
    aborted: bool,
    hung_up: bool,
    freed: bool,
    registration: Option<Registration>,
    faults: HashMap<HostCall, HostError>,
    calls: StreamCalls,
}

impl StreamSlot {
    fn new(options: StreamOptions) -> Self {
        Self {
            options,
            inbound: VecDeque::new(),
            inbound_closed: false,
            outbound: VecDeque::new(),
            sent_log: Vec::new(),
            finished: false,
            aborted: false,
            hung_up: false,
            freed: false,
            registration: None,
            faults: HashMap::new(),
            calls: StreamCalls::default(),
        }
    }

    fn take_fault(&mut self, call: HostCall) -> HostResult<()> {
        match self.faults.remove(&call) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn check_transfer(&self) -> HostResult<()> {
        if self.aborted {
            return Err(HostError::new(ERR_STREAM_CLOSED, "stream aborted"));
        }
        if self.hung_up {
            return Err(HostError::new(ERR_HANGUP, "stream hung up by peer"));
        }
        Ok(())
    }

    fn readiness(&self) -> StreamEvents {
        let mut ready = StreamEvents::NONE;
        if self.hung_up {
            return StreamEvents::ERROR | StreamEvents::HANGUP;
        }
        if !self.inbound.is_empty() || self.inbound_closed {
            ready |= StreamEvents::READABLE;
        }
        if !self.finished && self.outbound.len() < self.options.capacity_bytes {
            ready |= StreamEvents::WRITABLE;
        }
        ready
    }

    fn recv_available(&mut self, buf: &mut [u8]) -> usize {
        let n = buf
            .len()
            .min(self.inbound.len())
            .min(self.options.max_transfer_bytes);
        for (dst, src) in buf.iter_mut().zip(self.inbound.drain(..n)) {
            *dst = src;
        }
        n
    }

    fn send_room(&self) -> usize {
        self.options
            .capacity_bytes
            .saturating_sub(self.outbound.len())
            .min(self.options.max_transfer_bytes)
    }
}

/// Hypervisor control API backed by in-memory queues.
pub struct MemoryHost {
    state: Mutex<HashMap<NativeStream, StreamSlot>>,
    changed: Condvar,
    next_id: AtomicU64,
}

impl MemoryHost {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            changed: Condvar::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Allocate a native stream with default options and the given flags.
    pub fn create_stream(&self, flags: StreamFlags) -> NativeStream {
        self.create_stream_with(StreamOptions {
            flags,
            ..Default::default()
        })
    }

    pub fn create_stream_with(&self, options: StreamOptions) -> NativeStream {
        let stream = NativeStream(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.state.lock().insert(stream, StreamSlot::new(options));
        stream
    }

    /// Fail the next `call` on `stream` with `error`.
    pub fn inject_fault(&self, stream: NativeStream, call: HostCall, error: HostError) {
        if let Some(slot) = self.state.lock().get_mut(&stream) {
            slot.faults.insert(call, error);
        }
    }

    /// Peer writes bytes the local side will receive.
    pub fn peer_write(&self, stream: NativeStream, data: &[u8]) {
        if let Some(slot) = self.state.lock().get_mut(&stream) {
            slot.inbound.extend(data.iter().copied());
        }
        self.changed.notify_all();
    }

    /// Peer finishes writing; the local side sees end-of-stream after draining.
    pub fn peer_finish(&self, stream: NativeStream) {
        if let Some(slot) = self.state.lock().get_mut(&stream) {
            slot.inbound_closed = true;
        }
        self.changed.notify_all();
    }

    /// Peer reads up to `max` bytes the local side sent.
    pub fn peer_read(&self, stream: NativeStream, max: usize) -> Vec<u8> {
        let data = match self.state.lock().get_mut(&stream) {
            Some(slot) => {
                let n = max.min(slot.outbound.len());
                slot.outbound.drain(..n).collect()
            }
            None => Vec::new(),
        };
        self.changed.notify_all();
        data
    }

    /// Peer drops the connection: pending and future transfers fail.
    pub fn peer_hangup(&self, stream: NativeStream) {
        if let Some(slot) = self.state.lock().get_mut(&stream) {
            slot.hung_up = true;
        }
        self.changed.notify_all();
    }

    /// Every byte accepted by `stream_send` so far.
    pub fn sent(&self, stream: NativeStream) -> Vec<u8> {
        self.state
            .lock()
            .get(&stream)
            .map(|slot| slot.sent_log.clone())
            .unwrap_or_default()
    }

    pub fn calls(&self, stream: NativeStream) -> Option<StreamCalls> {
        self.state.lock().get(&stream).map(|slot| slot.calls.clone())
    }

    pub fn is_freed(&self, stream: NativeStream) -> bool {
        self.state.lock().get(&stream).is_some_and(|slot| slot.freed)
    }

    /// Current event mask of the stream's callback, if one is registered.
    pub fn registered_events(&self, stream: NativeStream) -> Option<StreamEvents> {
        self.state
            .lock()
            .get(&stream)
            .and_then(|slot| slot.registration.as_ref().map(|r| r.events))
    }

    /// Run one pass of the host event loop.
    ///
    /// Fires every registered callback whose mask intersects the stream's
    /// readiness, outside the host lock. Returns the number of callbacks fired.
    pub fn dispatch_events(&self) -> usize {
        let ready: Vec<(EventCallback, StreamEvents)> = {
            let state = self.state.lock();
            state
                .values()
                .filter(|slot| !slot.freed)
                .filter_map(|slot| {
                    let registration = slot.registration.as_ref()?;
                    let events = slot.readiness() & registration.events;
                    (!events.is_empty()).then(|| (registration.callback.clone(), events))
                })
                .collect()
        };

        for (callback, events) in &ready {
            callback(*events);
        }
        ready.len()
    }

    fn with_slot<T>(
        &self,
        stream: NativeStream,
        f: impl FnOnce(&mut StreamSlot) -> HostResult<T>,
    ) -> HostResult<T> {
        let mut state = self.state.lock();
        let slot = live_slot(&mut state, stream)?;
        f(slot)
    }
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new()
    }
}

fn live_slot(
    state: &mut HashMap<NativeStream, StreamSlot>,
    stream: NativeStream,
) -> HostResult<&mut StreamSlot> {
    match state.get_mut(&stream) {
        Some(slot) if !slot.freed => Ok(slot),
        _ => Err(HostError::new(
            ERR_INVALID_STREAM,
            format!("invalid stream pointer: {stream}"),
        )),
    }
}

impl HostApi for MemoryHost {
    fn stream_abort(&self, stream: NativeStream) -> HostResult<()> {
        self.with_slot(stream, |slot| {
            slot.calls.abort += 1;
            slot.take_fault(HostCall::Abort)?;
            slot.aborted = true;
            slot.outbound.clear();
            Ok(())
        })?;
        self.changed.notify_all();
        Ok(())
    }

    fn stream_finish(&self, stream: NativeStream) -> HostResult<()> {
        self.with_slot(stream, |slot| {
            slot.calls.finish += 1;
            slot.take_fault(HostCall::Finish)?;
            slot.check_transfer()?;
            slot.finished = true;
            Ok(())
        })
    }

    fn stream_free(&self, stream: NativeStream) -> HostResult<()> {
        let mut state = self.state.lock();
        let slot = live_slot(&mut state, stream)?;
        slot.calls.free += 1;
        // The reference is dropped even when the fault reports failure.
        slot.freed = true;
        slot.registration = None;
        slot.take_fault(HostCall::Free)
    }

    fn stream_recv(&self, stream: NativeStream, buf: &mut [u8]) -> HostResult<IoOutcome> {
        let mut state = self.state.lock();
        {
            let slot = live_slot(&mut state, stream)?;
            slot.calls.recv += 1;
            slot.take_fault(HostCall::Recv)?;
        }
        loop {
            let slot = live_slot(&mut state, stream)?;
            slot.check_transfer()?;
            if buf.is_empty() {
                return Ok(IoOutcome::Bytes(0));
            }
            if !slot.inbound.is_empty() {
                let n = slot.recv_available(buf);
                slot.calls.bytes_received += n as u64;
                trace!(%stream, n, "memory host recv");
                drop(state);
                self.changed.notify_all();
                return Ok(IoOutcome::Bytes(n));
            }
            if slot.inbound_closed {
                return Ok(IoOutcome::Bytes(0));
            }
            if slot.options.flags.is_nonblocking() {
                slot.calls.would_block += 1;
                return Ok(IoOutcome::WouldBlock);
            }
            self.changed.wait(&mut state);
        }
    }

    fn stream_send(&self, stream: NativeStream, data: &[u8]) -> HostResult<IoOutcome> {
        let mut state = self.state.lock();
        {
            let slot = live_slot(&mut state, stream)?;
            slot.calls.send += 1;
            slot.take_fault(HostCall::Send)?;
        }
        loop {
            let slot = live_slot(&mut state, stream)?;
            slot.check_transfer()?;
            if slot.finished {
                return Err(HostError::new(ERR_STREAM_CLOSED, "stream already finished"));
            }
            if data.is_empty() {
                return Ok(IoOutcome::Bytes(0));
            }
            let room = slot.send_room();
            if room > 0 {
                let n = room.min(data.len());
                slot.outbound.extend(data[..n].iter().copied());
                slot.sent_log.extend_from_slice(&data[..n]);
                slot.calls.bytes_sent += n as u64;
                trace!(%stream, n, "memory host send");
                return Ok(IoOutcome::Bytes(n));
            }
            if slot.options.flags.is_nonblocking() {
                slot.calls.would_block += 1;
                return Ok(IoOutcome::WouldBlock);
            }
            self.changed.wait(&mut state);
        }
    }

    fn stream_event_add_callback(
        &self,
        stream: NativeStream,
        events: StreamEvents,
        callback: EventCallback,
    ) -> HostResult<()> {
        self.with_slot(stream, |slot| {
            slot.calls.add_callback += 1;
            slot.take_fault(HostCall::AddCallback)?;
            if slot.registration.is_some() {
                return Err(HostError::new(
                    ERR_CALLBACK,
                    "stream event callback already registered",
                ));
            }
            slot.registration = Some(Registration { events, callback });
            Ok(())
        })
    }

    fn stream_event_update_callback(
        &self,
        stream: NativeStream,
        events: StreamEvents,
    ) -> HostResult<()> {
        self.with_slot(stream, |slot| {
            slot.calls.update_callback += 1;
            slot.take_fault(HostCall::UpdateCallback)?;
            match slot.registration.as_mut() {
                Some(registration) => {
                    registration.events = events;
                    Ok(())
                }
                None => Err(HostError::new(
                    ERR_CALLBACK,
                    "no stream event callback registered",
                )),
            }
        })
    }

    fn stream_event_remove_callback(&self, stream: NativeStream) -> HostResult<()> {
        self.with_slot(stream, |slot| {
            slot.calls.remove_callback += 1;
            slot.take_fault(HostCall::RemoveCallback)?;
            match slot.registration.take() {
                Some(_) => Ok(()),
                None => Err(HostError::new(
                    ERR_CALLBACK,
                    "no stream event callback registered",
                )),
            }
        })
    }
}
