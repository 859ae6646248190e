//! Stream session simulation harness.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tracing::debug;
use virtstream::memory::ERR_INJECTED;
use virtstream::{
    HostCall, HostConnection, HostError, MemoryHost, NativeStream, Progress, Pump,
    ReceiveAll, SendAll, StreamChannel, StreamError, StreamEvents, StreamFlags, StreamOptions,
    StreamState, TransferStats,
};

use super::SimulationError;
use crate::config::{Config, SimulationConfig};

/// Peer steps allowed before a blocked channel must report readiness.
const MAX_PEER_STEPS: usize = 1024;

/// How a transfer session drives its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveMode {
    /// Blocking channel; the peer side is arranged so no call ever waits.
    Blocking,
    /// Non-blocking channel pumped by the harness acting as the host event loop.
    EventLoop,
    /// Non-blocking channel driven by the async batch drivers.
    Async,
}

/// Sessions that can be performed in simulation.
#[derive(Debug, Clone)]
pub enum StreamAction {
    Upload {
        payload: Vec<u8>,
        mode: DriveMode,
        options: StreamOptions,
    },
    Download {
        payload: Vec<u8>,
        mode: DriveMode,
        options: StreamOptions,
        chunk_size: usize,
    },
    /// Send part of a payload, then abort.
    AbortEarly {
        payload: Vec<u8>,
        options: StreamOptions,
    },
    /// Register, retarget and remove an event callback.
    CallbackChurn,
    /// Drop an open channel without releasing it.
    DropUnreleased { register_callback: bool },
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    Aborted,
    /// Released without finish or abort.
    Released,
}

struct Expectation {
    /// Payload of an upload session, `None` when nothing should be sent.
    uploaded: Option<Vec<u8>>,
    outcome: Outcome,
}

/// Expected host-side effects of every session.
pub struct StreamOracle {
    streams: HashMap<NativeStream, Expectation>,
}

impl StreamOracle {
    pub fn new() -> Self {
        Self {
            streams: HashMap::new(),
        }
    }

    pub fn record(&mut self, stream: NativeStream, uploaded: Option<Vec<u8>>, outcome: Outcome) {
        self.streams.insert(stream, Expectation { uploaded, outcome });
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Check one recorded session against the host's accounting.
    pub fn verify_stream(
        &self,
        host: &MemoryHost,
        stream: NativeStream,
    ) -> Result<(), SimulationError> {
        let expected = self
            .streams
            .get(&stream)
            .ok_or(SimulationError::Untracked {
                stream,
                side: "oracle",
            })?;
        let calls = host
            .calls(stream)
            .ok_or(SimulationError::Untracked {
                stream,
                side: "host",
            })?;

        if !host.is_freed(stream) || calls.free != 1 {
            return Err(SimulationError::Mismatch {
                stream,
                context: format!("expected exactly one free, got {}", calls.free),
            });
        }
        if host.registered_events(stream).is_some() {
            return Err(SimulationError::Mismatch {
                stream,
                context: "event callback outlived release".to_string(),
            });
        }

        let finishes = u64::from(expected.outcome == Outcome::Finished);
        if calls.finish != finishes {
            return Err(SimulationError::Mismatch {
                stream,
                context: format!(
                    "expected {finishes} finish calls, got {}",
                    calls.finish
                ),
            });
        }
        let aborts = u64::from(expected.outcome == Outcome::Aborted);
        if calls.abort != aborts {
            return Err(SimulationError::Mismatch {
                stream,
                context: format!("expected {aborts} abort calls, got {}", calls.abort),
            });
        }

        let sent = host.sent(stream);
        let sent_ok = match (&expected.uploaded, expected.outcome) {
            (Some(payload), Outcome::Finished) => sent == *payload,
            (Some(payload), _) => payload.starts_with(&sent),
            (None, _) => sent.is_empty(),
        };
        if !sent_ok {
            return Err(SimulationError::Mismatch {
                stream,
                context: format!(
                    "host received {} bytes inconsistent with {:?} session",
                    sent.len(),
                    expected.outcome
                ),
            });
        }
        Ok(())
    }

    pub fn verify_all(&self, host: &MemoryHost) -> Result<(), SimulationError> {
        for stream in self.streams.keys() {
            self.verify_stream(host, *stream)?;
        }
        Ok(())
    }
}

impl Default for StreamOracle {
    fn default() -> Self {
        Self::new()
    }
}

/// Simulation statistics.
#[derive(Debug, Default, Clone)]
pub struct StreamStats {
    pub sessions: u64,
    pub uploads: u64,
    pub downloads: u64,
    pub bytes: u64,
    pub waits: u64,
    pub faults: u64,
    pub aborts: u64,
    pub callbacks_fired: u64,
}

/// Remote end of a pumped transfer.
enum Peer {
    /// Drains what the channel sends.
    Reader {
        stream: NativeStream,
        max_read: usize,
    },
    /// Feeds what the channel receives, then finishes.
    Writer {
        stream: NativeStream,
        pieces: VecDeque<Vec<u8>>,
        finished: bool,
    },
}

impl Peer {
    fn stream(&self) -> NativeStream {
        match self {
            Self::Reader { stream, .. } | Self::Writer { stream, .. } => *stream,
        }
    }

    fn fault_call(&self) -> HostCall {
        match self {
            Self::Reader { .. } => HostCall::Send,
            Self::Writer { .. } => HostCall::Recv,
        }
    }

    fn step(&mut self, host: &MemoryHost, rng: &mut SmallRng) {
        match self {
            Self::Reader { stream, max_read } => {
                host.peer_read(*stream, rng.random_range(1..=*max_read));
            }
            Self::Writer {
                stream,
                pieces,
                finished,
            } => match pieces.pop_front() {
                Some(piece) => host.peer_write(*stream, &piece),
                None if !*finished => {
                    host.peer_finish(*stream);
                    *finished = true;
                }
                None => {}
            },
        }
    }
}

/// Stream channel simulation harness.
pub struct StreamHarness {
    rng: SmallRng,
    host: Arc<MemoryHost>,
    connection: Arc<HostConnection>,
    oracle: StreamOracle,
    config: SimulationConfig,
    max_chunk_size: usize,
    stats: StreamStats,
}

impl StreamHarness {
    pub fn new(seed: u64, config: &Config) -> Self {
        let host = Arc::new(MemoryHost::new());
        let connection = HostConnection::with_config(host.clone(), config.transfer.clone());
        Self {
            rng: SmallRng::seed_from_u64(seed),
            host,
            connection,
            oracle: StreamOracle::new(),
            config: config.simulation.clone(),
            max_chunk_size: config.transfer.chunk_size_bytes,
            stats: StreamStats::default(),
        }
    }

    /// Run the simulation for a given number of sessions.
    pub async fn run(&mut self, sessions: u64) -> Result<(), SimulationError> {
        for _ in 0..sessions {
            let action = self.sample_action();
            self.execute(action).await?;
            self.stats.sessions += 1;
        }
        self.oracle.verify_all(&self.host)
    }

    fn sample_action(&mut self) -> StreamAction {
        let choice = self.rng.random_range(0..100);
        match choice {
            0..40 => {
                let payload = self.sample_payload();
                let mode = self.sample_mode();
                let options = self.sample_options(mode, payload.len());
                StreamAction::Upload {
                    payload,
                    mode,
                    options,
                }
            }
            40..80 => {
                let payload = self.sample_payload();
                let mode = self.sample_mode();
                let options = self.sample_options(mode, payload.len());
                let chunk_size = self
                    .rng
                    .random_range(1..=self.max_chunk_size.min(payload.len().max(1)));
                StreamAction::Download {
                    payload,
                    mode,
                    options,
                    chunk_size,
                }
            }
            80..88 => {
                let payload = self.sample_payload();
                let options = self.sample_options(DriveMode::EventLoop, payload.len());
                StreamAction::AbortEarly { payload, options }
            }
            88..95 => StreamAction::CallbackChurn,
            _ => StreamAction::DropUnreleased {
                register_callback: self.rng.random_bool(0.5),
            },
        }
    }

    fn sample_payload(&mut self) -> Vec<u8> {
        let len = self
            .rng
            .random_range(self.config.min_stream_bytes..=self.config.max_stream_bytes);
        let mut payload = vec![0u8; len];
        self.rng.fill(&mut payload[..]);
        payload
    }

    fn sample_mode(&mut self) -> DriveMode {
        match self.rng.random_range(0..3) {
            0 => DriveMode::Blocking,
            1 => DriveMode::EventLoop,
            _ => DriveMode::Async,
        }
    }

    fn sample_options(&mut self, mode: DriveMode, len: usize) -> StreamOptions {
        let max_transfer_bytes = self.rng.random_range(1..=self.config.max_transfer_bytes);
        match mode {
            // Nothing drains a blocking upload until it returns.
            DriveMode::Blocking => StreamOptions {
                flags: StreamFlags::NONE,
                capacity_bytes: len.max(1),
                max_transfer_bytes,
            },
            DriveMode::EventLoop | DriveMode::Async => StreamOptions {
                flags: StreamFlags::NONBLOCK,
                capacity_bytes: self.rng.random_range(1..=self.config.max_capacity_bytes),
                max_transfer_bytes,
            },
        }
    }

    /// Source chunks for an upload: random sizes, occasionally an empty one.
    fn sample_chunks(&mut self, payload: &[u8]) -> VecDeque<Bytes> {
        let max_piece = self
            .rng
            .random_range(1..=self.config.max_transfer_bytes.saturating_mul(2));
        let mut chunks: VecDeque<Bytes> = split_payload(&mut self.rng, payload, max_piece)
            .into_iter()
            .map(Bytes::from)
            .collect();
        if self.rng.random_ratio(1, 8) {
            let at = self.rng.random_range(0..=chunks.len());
            chunks.insert(at, Bytes::new());
        }
        chunks
    }

    fn maybe_inject(&mut self, stream: NativeStream, call: HostCall) {
        if self.rng.random_bool(self.config.fault_rate) {
            debug!(%stream, ?call, "injecting host fault");
            self.host.inject_fault(
                stream,
                call,
                HostError::new(ERR_INJECTED, "simulated host fault"),
            );
            self.stats.faults += 1;
        }
    }

    /// Execute a single action (public for harness testing).
    pub async fn execute(&mut self, action: StreamAction) -> Result<(), SimulationError> {
        match action {
            StreamAction::Upload {
                payload,
                mode,
                options,
            } => self.upload(payload, mode, options).await,
            StreamAction::Download {
                payload,
                mode,
                options,
                chunk_size,
            } => self.download(payload, mode, options, chunk_size).await,
            StreamAction::AbortEarly { payload, options } => self.abort_early(payload, options),
            StreamAction::CallbackChurn => self.callback_churn(),
            StreamAction::DropUnreleased { register_callback } => {
                self.drop_unreleased(register_callback)
            }
        }
    }

    async fn upload(
        &mut self,
        payload: Vec<u8>,
        mode: DriveMode,
        options: StreamOptions,
    ) -> Result<(), SimulationError> {
        self.stats.uploads += 1;
        let stream = self.host.create_stream_with(options);
        let mut channel = self.connection.open_stream_with(stream, options.flags);
        let source = chunk_source(self.sample_chunks(&payload));

        let result = match mode {
            DriveMode::Blocking => {
                self.maybe_inject(stream, HostCall::Send);
                channel.send_all(source)
            }
            DriveMode::EventLoop => {
                let mut pump = SendAll::new(source);
                let mut peer = Peer::Reader {
                    stream,
                    max_read: options.capacity_bytes,
                };
                self.drive_event_loop(&mut channel, &mut pump, &mut peer)?
            }
            DriveMode::Async => {
                self.maybe_inject(stream, HostCall::Send);
                let reads: Vec<usize> = (0..8)
                    .map(|_| self.rng.random_range(1..=options.capacity_bytes))
                    .collect();
                let done = Arc::new(AtomicBool::new(false));
                let reader = tokio::spawn(async_reader(
                    Arc::clone(&self.host),
                    stream,
                    reads,
                    Arc::clone(&done),
                ));
                let result = channel.send_all_async(source).await;
                done.store(true, Ordering::SeqCst);
                reader
                    .await
                    .map_err(|source| SimulationError::Peer { stream, source })?;
                result
            }
        };

        self.settle(channel, stream, payload, None, result)
    }

    async fn download(
        &mut self,
        payload: Vec<u8>,
        mode: DriveMode,
        options: StreamOptions,
        chunk_size: usize,
    ) -> Result<(), SimulationError> {
        self.stats.downloads += 1;
        let stream = self.host.create_stream_with(options);
        let mut channel = self
            .connection
            .open_stream_with(stream, options.flags)
            .with_chunk_size(chunk_size);
        let max_piece = self.rng.random_range(1..=chunk_size.saturating_mul(2));
        let pieces = split_payload(&mut self.rng, &payload, max_piece);
        let sink_limit = self.rng.random_range(1..=chunk_size);
        let mut received = Vec::new();

        let result = match mode {
            DriveMode::Blocking => {
                for piece in &pieces {
                    self.host.peer_write(stream, piece);
                }
                self.host.peer_finish(stream);
                self.maybe_inject(stream, HostCall::Recv);
                channel.receive_all(limited_sink(&mut received, sink_limit))
            }
            DriveMode::EventLoop => {
                let mut pump = ReceiveAll::new(limited_sink(&mut received, sink_limit), chunk_size);
                let mut peer = Peer::Writer {
                    stream,
                    pieces,
                    finished: false,
                };
                self.drive_event_loop(&mut channel, &mut pump, &mut peer)?
            }
            DriveMode::Async => {
                self.maybe_inject(stream, HostCall::Recv);
                let done = Arc::new(AtomicBool::new(false));
                let writer = tokio::spawn(async_writer(
                    Arc::clone(&self.host),
                    stream,
                    pieces,
                    Arc::clone(&done),
                ));
                let result = channel
                    .receive_all_async(limited_sink(&mut received, sink_limit))
                    .await;
                done.store(true, Ordering::SeqCst);
                writer
                    .await
                    .map_err(|source| SimulationError::Peer { stream, source })?;
                result
            }
        };

        self.settle(channel, stream, payload, Some(received), result)
    }

    /// Pump a transfer with the harness acting as peer and host event loop.
    fn drive_event_loop<P: Pump>(
        &mut self,
        channel: &mut StreamChannel,
        pump: &mut P,
        peer: &mut Peer,
    ) -> Result<Result<TransferStats, StreamError>, SimulationError> {
        let stream = peer.stream();
        let woken = Arc::new(AtomicBool::new(false));

        let result = loop {
            let interest = match pump.pump(channel) {
                Ok(Progress::Complete(stats)) => break Ok(stats),
                Ok(Progress::Blocked(interest)) => interest,
                Err(e) => break Err(e),
            };
            if channel.callback_events() != Some(interest) {
                let flag = Arc::clone(&woken);
                channel
                    .add_callback(interest, move |_| flag.store(true, Ordering::SeqCst))
                    .map_err(SimulationError::channel(stream, "add_callback"))?;
            }
            self.maybe_inject(stream, peer.fault_call());
            self.wait_ready(peer, &woken, interest)?;
            pump.record_wait();
        };

        channel
            .remove_callback()
            .map_err(SimulationError::channel(stream, "remove_callback"))?;
        Ok(result)
    }

    fn wait_ready(
        &mut self,
        peer: &mut Peer,
        woken: &AtomicBool,
        interest: StreamEvents,
    ) -> Result<(), SimulationError> {
        for _ in 0..MAX_PEER_STEPS {
            peer.step(&self.host, &mut self.rng);
            self.host.dispatch_events();
            if woken.swap(false, Ordering::SeqCst) {
                return Ok(());
            }
        }
        Err(SimulationError::mismatch(
            peer.stream(),
            format!("never reported {interest} after {MAX_PEER_STEPS} peer steps"),
        ))
    }

    /// Check a transfer result, clean the channel up and verify the host side.
    fn settle(
        &mut self,
        mut channel: StreamChannel,
        stream: NativeStream,
        payload: Vec<u8>,
        received: Option<Vec<u8>>,
        result: Result<TransferStats, StreamError>,
    ) -> Result<(), SimulationError> {
        let outcome = match result {
            Ok(stats) => {
                if stats.bytes != payload.len() as u64 {
                    return Err(SimulationError::Mismatch {
                        stream,
                        context: format!(
                            "transferred {} of {} bytes",
                            stats.bytes,
                            payload.len()
                        ),
                    });
                }
                if channel.state() != StreamState::Finished {
                    return Err(SimulationError::Mismatch {
                        stream,
                        context: format!("completed batch left channel {}", channel.state()),
                    });
                }
                if received.as_ref().is_some_and(|received| *received != payload) {
                    return Err(SimulationError::Mismatch {
                        stream,
                        context: "received bytes differ from payload".to_string(),
                    });
                }
                self.stats.bytes += stats.bytes;
                self.stats.waits += stats.waits;
                Outcome::Finished
            }
            Err(e) if e.is_transfer() => {
                if channel.state() != StreamState::Open {
                    return Err(SimulationError::Mismatch {
                        stream,
                        context: format!("failed batch left channel {}", channel.state()),
                    });
                }
                if received
                    .as_ref()
                    .is_some_and(|received| !payload.starts_with(received))
                {
                    return Err(SimulationError::Mismatch {
                        stream,
                        context: "received bytes are not a payload prefix".to_string(),
                    });
                }
                channel
                    .abort()
                    .map_err(SimulationError::channel(stream, "abort"))?;
                self.stats.aborts += 1;
                Outcome::Aborted
            }
            Err(e) => return Err(SimulationError::channel(stream, "batch transfer")(e)),
        };

        channel
            .release()
            .map_err(SimulationError::channel(stream, "release"))?;
        let uploaded = received.is_none().then_some(payload);
        self.oracle.record(stream, uploaded, outcome);
        self.oracle.verify_stream(&self.host, stream)
    }

    fn abort_early(
        &mut self,
        payload: Vec<u8>,
        options: StreamOptions,
    ) -> Result<(), SimulationError> {
        let stream = self.host.create_stream_with(options);
        let mut channel = self.connection.open_stream_with(stream, options.flags);

        let cut = self.rng.random_range(0..=payload.len());
        if cut > 0 {
            let outcome = channel
                .send(&payload[..cut])
                .map_err(SimulationError::channel(stream, "send"))?;
            if outcome.bytes().is_some_and(|n| n > cut) {
                return Err(SimulationError::Mismatch {
                    stream,
                    context: format!("send reported {outcome:?} for {cut} bytes"),
                });
            }
        }
        channel
            .abort()
            .map_err(SimulationError::channel(stream, "abort"))?;

        match channel.send(&payload) {
            Err(e) if e.is_invalid_state() => {}
            other => {
                return Err(SimulationError::Mismatch {
                    stream,
                    context: format!("send after abort returned {other:?}"),
                });
            }
        }

        channel
            .release()
            .map_err(SimulationError::channel(stream, "release"))?;
        self.stats.aborts += 1;
        self.oracle.record(stream, Some(payload), Outcome::Aborted);
        self.oracle.verify_stream(&self.host, stream)
    }

    fn callback_churn(&mut self) -> Result<(), SimulationError> {
        let stream = self.host.create_stream(StreamFlags::NONBLOCK);
        let mut channel = self.connection.open_stream_with(stream, StreamFlags::NONBLOCK);
        let fired = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&fired);
        channel
            .add_callback(StreamEvents::READABLE, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .map_err(SimulationError::channel(stream, "add_callback"))?;

        // Writable but not readable yet.
        self.dispatch_expecting(stream, &fired, 0, "readable mask on idle stream")?;
        self.host.peer_write(stream, b"x");
        self.dispatch_expecting(stream, &fired, 1, "readable mask after peer write")?;

        channel
            .update_callback(StreamEvents::WRITABLE)
            .map_err(SimulationError::channel(stream, "update_callback"))?;
        self.dispatch_expecting(stream, &fired, 2, "writable mask")?;

        channel
            .remove_callback()
            .map_err(SimulationError::channel(stream, "remove_callback"))?;
        self.dispatch_expecting(stream, &fired, 2, "removed callback")?;

        channel
            .release()
            .map_err(SimulationError::channel(stream, "release"))?;
        self.stats.callbacks_fired += u64::from(fired.load(Ordering::SeqCst));
        self.oracle.record(stream, None, Outcome::Released);
        self.oracle.verify_stream(&self.host, stream)
    }

    fn dispatch_expecting(
        &self,
        stream: NativeStream,
        fired: &AtomicU32,
        expected: u32,
        step: &str,
    ) -> Result<(), SimulationError> {
        self.host.dispatch_events();
        let actual = fired.load(Ordering::SeqCst);
        if actual != expected {
            return Err(SimulationError::mismatch(
                stream,
                format!("{step}: expected {expected} callbacks, got {actual}"),
            ));
        }
        Ok(())
    }

    fn drop_unreleased(&mut self, register_callback: bool) -> Result<(), SimulationError> {
        // Opened with the connection's configured defaults.
        let stream = self
            .host
            .create_stream(self.connection.config().stream_flags());
        let mut channel = self.connection.open_stream(stream);
        if register_callback {
            channel
                .add_callback(StreamEvents::ALL, |_| {})
                .map_err(SimulationError::channel(stream, "add_callback"))?;
        }
        drop(channel);

        self.oracle.record(stream, None, Outcome::Released);
        self.oracle.verify_stream(&self.host, stream)
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    pub fn oracle(&self) -> &StreamOracle {
        &self.oracle
    }
}

fn split_payload(rng: &mut SmallRng, payload: &[u8], max_piece: usize) -> VecDeque<Vec<u8>> {
    let mut pieces = VecDeque::new();
    let mut rest = payload;
    while !rest.is_empty() {
        let n = rng.random_range(1..=max_piece.min(rest.len()));
        let (piece, tail) = rest.split_at(n);
        pieces.push_back(piece.to_vec());
        rest = tail;
    }
    pieces
}

fn chunk_source(mut chunks: VecDeque<Bytes>) -> impl FnMut() -> io::Result<Option<Bytes>> {
    move || Ok(chunks.pop_front())
}

/// Sink that consumes at most `limit` bytes per call.
fn limited_sink(out: &mut Vec<u8>, limit: usize) -> impl FnMut(&[u8]) -> io::Result<usize> + '_ {
    move |chunk| {
        let n = chunk.len().min(limit);
        out.extend_from_slice(&chunk[..n]);
        Ok(n)
    }
}

async fn async_reader(
    host: Arc<MemoryHost>,
    stream: NativeStream,
    reads: Vec<usize>,
    done: Arc<AtomicBool>,
) {
    for max in reads.iter().cycle() {
        if done.load(Ordering::SeqCst) {
            break;
        }
        host.peer_read(stream, *max);
        host.dispatch_events();
        tokio::task::yield_now().await;
    }
}

async fn async_writer(
    host: Arc<MemoryHost>,
    stream: NativeStream,
    pieces: VecDeque<Vec<u8>>,
    done: Arc<AtomicBool>,
) {
    for piece in pieces {
        if done.load(Ordering::SeqCst) {
            return;
        }
        host.peer_write(stream, &piece);
        host.dispatch_events();
        tokio::task::yield_now().await;
    }
    host.peer_finish(stream);
    while !done.load(Ordering::SeqCst) {
        host.dispatch_events();
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtstream::HostApi;

    fn quiet_config() -> Config {
        let mut config = Config::default();
        config.simulation.fault_rate = 0.0;
        config
    }

    fn nonblocking(capacity_bytes: usize, max_transfer_bytes: usize) -> StreamOptions {
        StreamOptions {
            flags: StreamFlags::NONBLOCK,
            capacity_bytes,
            max_transfer_bytes,
        }
    }

    #[test]
    fn split_payload_preserves_bytes() {
        let mut rng = SmallRng::seed_from_u64(3);
        let payload: Vec<u8> = (0..=255u8).collect();
        let pieces = split_payload(&mut rng, &payload, 17);
        assert!(pieces.iter().all(|p| !p.is_empty() && p.len() <= 17));
        let joined: Vec<u8> = pieces.iter().flatten().copied().collect();
        assert_eq!(joined, payload);
    }

    #[test]
    fn oracle_flags_missing_finish() {
        let host = MemoryHost::new();
        let stream = host.create_stream(StreamFlags::NONE);
        host.stream_free(stream).unwrap();

        let mut oracle = StreamOracle::new();
        oracle.record(stream, Some(Vec::new()), Outcome::Finished);
        let err = oracle.verify_stream(&host, stream).unwrap_err();
        assert!(matches!(err, SimulationError::Mismatch { .. }));
        assert_eq!(err.stream(), stream);
        assert!(err.to_string().starts_with(&format!("{stream}: ")));
        assert!(err.to_string().contains("finish"));
    }

    #[test]
    fn oracle_names_unrecorded_stream() {
        let host = MemoryHost::new();
        let stream = host.create_stream(StreamFlags::NONE);
        let err = StreamOracle::new().verify_stream(&host, stream).unwrap_err();
        assert!(matches!(
            err,
            SimulationError::Untracked { side: "oracle", .. }
        ));
        assert_eq!(err.stream(), stream);
    }

    #[test]
    fn oracle_flags_unreleased_stream() {
        let host = MemoryHost::new();
        let stream = host.create_stream(StreamFlags::NONE);
        let mut oracle = StreamOracle::new();
        oracle.record(stream, None, Outcome::Released);
        assert!(oracle.verify_stream(&host, stream).is_err());
    }

    #[tokio::test]
    async fn every_action_satisfies_oracle() {
        let mut harness = StreamHarness::new(7, &quiet_config());
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();

        for mode in [DriveMode::Blocking, DriveMode::EventLoop, DriveMode::Async] {
            let options = match mode {
                DriveMode::Blocking => StreamOptions {
                    flags: StreamFlags::NONE,
                    capacity_bytes: payload.len(),
                    max_transfer_bytes: 300,
                },
                _ => nonblocking(512, 300),
            };
            harness
                .execute(StreamAction::Upload {
                    payload: payload.clone(),
                    mode,
                    options,
                })
                .await
                .unwrap();
            harness
                .execute(StreamAction::Download {
                    payload: payload.clone(),
                    mode,
                    options,
                    chunk_size: 256,
                })
                .await
                .unwrap();
        }
        harness
            .execute(StreamAction::AbortEarly {
                payload: payload.clone(),
                options: nonblocking(64, 64),
            })
            .await
            .unwrap();
        harness.execute(StreamAction::CallbackChurn).await.unwrap();
        harness
            .execute(StreamAction::DropUnreleased {
                register_callback: true,
            })
            .await
            .unwrap();

        let stats = harness.stats();
        assert_eq!(stats.uploads, 3);
        assert_eq!(stats.downloads, 3);
        assert_eq!(stats.bytes, 6 * payload.len() as u64);
        assert!(stats.waits > 0);
        assert_eq!(stats.callbacks_fired, 2);
        assert_eq!(harness.oracle().len(), 9);
    }

    #[tokio::test]
    async fn empty_streams_finish_cleanly() {
        let mut harness = StreamHarness::new(11, &quiet_config());
        for mode in [DriveMode::Blocking, DriveMode::EventLoop, DriveMode::Async] {
            let flags = if mode == DriveMode::Blocking {
                StreamFlags::NONE
            } else {
                StreamFlags::NONBLOCK
            };
            let options = StreamOptions {
                flags,
                capacity_bytes: 1,
                max_transfer_bytes: 1,
            };
            harness
                .execute(StreamAction::Upload {
                    payload: Vec::new(),
                    mode,
                    options,
                })
                .await
                .unwrap();
            harness
                .execute(StreamAction::Download {
                    payload: Vec::new(),
                    mode,
                    options,
                    chunk_size: 1,
                })
                .await
                .unwrap();
        }
        assert_eq!(harness.stats().bytes, 0);
    }

    #[tokio::test]
    async fn injected_faults_abort_pumped_transfers() {
        let mut config = Config::default();
        config.simulation.fault_rate = 1.0;
        let mut harness = StreamHarness::new(5, &config);
        let payload = vec![0xAB; 256];

        harness
            .execute(StreamAction::Upload {
                payload: payload.clone(),
                mode: DriveMode::EventLoop,
                options: nonblocking(16, 8),
            })
            .await
            .unwrap();
        harness
            .execute(StreamAction::Download {
                payload,
                mode: DriveMode::EventLoop,
                options: nonblocking(16, 8),
                chunk_size: 8,
            })
            .await
            .unwrap();

        let stats = harness.stats();
        assert_eq!(stats.aborts, 2);
        assert_eq!(stats.faults, 2);
        assert_eq!(stats.bytes, 0);
    }

    #[tokio::test]
    async fn random_sessions_pass() {
        let mut config = quiet_config();
        config.simulation.max_stream_bytes = 2048;
        config.simulation.max_capacity_bytes = 256;
        config.simulation.max_transfer_bytes = 64;
        config.simulation.fault_rate = 0.1;
        let mut harness = StreamHarness::new(1234, &config);
        harness.run(50).await.unwrap();
        assert_eq!(harness.stats().sessions, 50);
    }
}
