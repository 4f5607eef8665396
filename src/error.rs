//! Error taxonomy for the core: connection errors, stream errors, and local
//! programming errors, per https://httpwg.org/specs/rfc7540.html#ErrorCodes

use crate::types::StreamId;
use num_derive::{FromPrimitive, ToPrimitive};

/// https://httpwg.org/specs/rfc7540.html#ErrorCodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Unknown codes are coerced to INTERNAL_ERROR rather than rejected, per
    /// RFC 7540's "treat as" guidance for forward compatibility.
    #[must_use]
    pub fn from_wire(value: u32) -> Self {
        use num_traits::FromPrimitive;
        Self::from_u32(value).unwrap_or(ErrorCode::InternalError)
    }

    #[must_use]
    pub fn to_wire(self) -> u32 {
        use num_traits::ToPrimitive;
        self.to_u32().expect("ErrorCode is repr(u32)")
    }
}

/// Where an [`Error`] is scoped: the whole connection, or a single stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Connection,
    Stream(StreamId),
}

/// A protocol-level fault. Connection-scoped errors are surfaced to the peer as
/// GOAWAY; stream-scoped errors as RST_STREAM. See spec §7.
#[derive(thiserror::Error, Debug, Clone)]
#[error("{scope:?} error {code:?}: {message}")]
pub struct Error {
    pub code: ErrorCode,
    pub scope: Scope,
    pub message: String,
}

impl Error {
    #[must_use]
    pub fn connection(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            scope: Scope::Connection,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn stream(stream_id: StreamId, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            scope: Scope::Stream(stream_id),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_connection_scoped(&self) -> bool {
        matches!(self.scope, Scope::Connection)
    }

    /// Escalate a stream-scoped error to connection scope (used when the RFC
    /// requires a connection-level failure for what would otherwise be a
    /// per-stream fault, e.g. HPACK violations).
    #[must_use]
    pub fn escalate(mut self) -> Self {
        self.scope = Scope::Connection;
        self
    }
}

/// A fault in how the caller is using the API, never transmitted on the wire.
/// Distinct from [`Error`] per spec §7's "local programming errors" category.
#[derive(thiserror::Error, Debug, Clone)]
pub enum UsageError {
    #[error("frame payload {0} exceeds configured MAX_FRAME_SIZE")]
    PayloadTooLarge(usize),
    #[error("cannot construct a frame of this type for sending: {0}")]
    NotConstructible(&'static str),
    #[error("stream {0} does not exist on this connection")]
    UnknownStream(StreamId),
}

pub type Result<T> = std::result::Result<T, Error>;
