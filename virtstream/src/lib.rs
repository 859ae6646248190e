//! virtstream: data-transfer channels over hypervisor stream handles.
//!
//! A [`StreamChannel`] wraps one native stream allocated by the hypervisor
//! control API. It moves bytes in either direction, reports readiness through
//! a single event callback, and owns the native handle until it is released.
//!
//! # Library Usage
//!
//! ```ignore
//! use virtstream::{HostConnection, StreamFlags};
//!
//! let connection = HostConnection::new(api);
//! let mut channel = connection.open_stream_with(stream, StreamFlags::NONE);
//! let stats = channel.send_all(source)?;
//! channel.release()?;
//! ```
//!
//! [`MemoryHost`] is an in-process control API used by the tests and by the
//! `virtstream-sim` simulation crate.

pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod host;
pub mod memory;
pub mod transfer;

pub use channel::{StreamChannel, StreamState};
pub use config::{CHUNK_SIZE_MAX_BYTES, DEFAULT_CHUNK_SIZE_BYTES, TransferConfig};
pub use error::{ConfigError, HostError, HostResult, InvalidReason, Result, StreamError};
pub use events::{StreamEvents, StreamFlags};
pub use host::{EventCallback, HostApi, HostConnection, IoOutcome, NativeStream};
pub use memory::{HostCall, MemoryHost, StreamCalls, StreamOptions};
pub use transfer::{
    Progress, Pump, ReceiveAll, SendAll, StreamSink, StreamSource, TransferStats,
};
