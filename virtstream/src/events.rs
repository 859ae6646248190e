//! Stream flags and readiness event masks.
//!
//! Bit values match the hypervisor control API so masks can be passed through
//! unchanged.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

// Stream creation flags
pub const VIR_STREAM_NONBLOCK: u32 = 1 << 0;

// Stream event bits
pub const VIR_STREAM_EVENT_READABLE: u32 = 1 << 0;
pub const VIR_STREAM_EVENT_WRITABLE: u32 = 1 << 1;
pub const VIR_STREAM_EVENT_ERROR: u32 = 1 << 2;
pub const VIR_STREAM_EVENT_HANGUP: u32 = 1 << 3;

/// Flags fixed when a stream is created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StreamFlags(u32);

impl StreamFlags {
    pub const NONE: Self = Self(0);
    pub const NONBLOCK: Self = Self(VIR_STREAM_NONBLOCK);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_nonblocking(self) -> bool {
        (self.0 & VIR_STREAM_NONBLOCK) != 0
    }
}

/// Readiness conditions a callback can subscribe to.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StreamEvents(u32);

impl StreamEvents {
    pub const NONE: Self = Self(0);
    pub const READABLE: Self = Self(VIR_STREAM_EVENT_READABLE);
    pub const WRITABLE: Self = Self(VIR_STREAM_EVENT_WRITABLE);
    pub const ERROR: Self = Self(VIR_STREAM_EVENT_ERROR);
    pub const HANGUP: Self = Self(VIR_STREAM_EVENT_HANGUP);
    pub const ALL: Self = Self(
        VIR_STREAM_EVENT_READABLE
            | VIR_STREAM_EVENT_WRITABLE
            | VIR_STREAM_EVENT_ERROR
            | VIR_STREAM_EVENT_HANGUP,
    );

    /// Unknown bits are dropped.
    pub fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn intersects(self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }
}

impl BitOr for StreamEvents {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for StreamEvents {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for StreamEvents {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl fmt::Display for StreamEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names = [
            (Self::READABLE, "readable"),
            (Self::WRITABLE, "writable"),
            (Self::ERROR, "error"),
            (Self::HANGUP, "hangup"),
        ];
        let mut first = true;
        for (event, name) in names {
            if self.contains(event) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for StreamEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamEvents({self})")
    }
}
