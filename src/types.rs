//! Shared scalar types and the per-frame-type flag bitsets, kept from the
//! teacher's `types.rs`/`flags.rs` (RFC 7540 wire flags don't change shape
//! across this rewrite, only what carries them).

use bitflags::bitflags;
use bytes::Bytes;

/// Stream identifier. `0` denotes the connection itself (used by SETTINGS,
/// PING, GOAWAY, and the connection-scope half of WINDOW_UPDATE).
pub type StreamId = u32;

/// The stream id reserved for connection-scoped frames.
pub const CONNECTION_STREAM_ID: StreamId = 0;

/// Largest legal 31-bit value a stream id or window size may take.
pub const U31_MAX: u32 = u32::MAX >> 1;

#[must_use]
pub fn is_client_initiated(id: StreamId) -> bool {
    id % 2 == 1
}

#[must_use]
pub fn is_server_initiated(id: StreamId) -> bool {
    id != 0 && id % 2 == 0
}

/// A single decoded header field: an already-lowercased name and its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Bytes,
    pub value: Bytes,
}

impl HeaderField {
    #[must_use]
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    #[must_use]
    pub fn is_pseudo(&self) -> bool {
        self.name.first() == Some(&b':')
    }

    /// RFC 7541 §4.1 "header list size" accounting unit.
    #[must_use]
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + 32
    }
}

/// An ordered header list, preserving arrival order (spec §3 Stream invariant).
pub type HeaderList = Vec<HeaderField>;

bitflags! {
    /// https://httpwg.org/specs/rfc7540.html#DATA
    #[repr(transparent)]
    pub struct DataFlags: u8 {
        const END_STREAM = 0x1;
        const PADDED = 0x8;
    }

    /// https://httpwg.org/specs/rfc7540.html#HEADERS
    #[repr(transparent)]
    pub struct HeadersFlags: u8 {
        const END_STREAM = 0x1;
        const END_HEADERS = 0x4;
        const PADDED = 0x8;
        const PRIORITY = 0x20;
    }

    /// https://httpwg.org/specs/rfc7540.html#SETTINGS
    #[repr(transparent)]
    pub struct SettingsFlags: u8 {
        const ACK = 0x1;
    }

    /// https://httpwg.org/specs/rfc7540.html#PUSH_PROMISE
    #[repr(transparent)]
    pub struct PushPromiseFlags: u8 {
        const END_HEADERS = 0x4;
        const PADDED = 0x8;
    }

    /// https://httpwg.org/specs/rfc7540.html#PING
    #[repr(transparent)]
    pub struct PingFlags: u8 {
        const ACK = 0x1;
    }

    /// https://httpwg.org/specs/rfc7540.html#CONTINUATION
    #[repr(transparent)]
    pub struct ContinuationFlags: u8 {
        const END_HEADERS = 0x4;
    }
}
