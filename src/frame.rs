//! Byte-level frame codec. Spec §4.1.
//!
//! The wire format is a 9-byte header (24-bit length, 8-bit type, 8-bit
//! flags, 1 reserved bit + 31-bit stream id) followed by `length` bytes of
//! payload. Decoding is split into a pure, sans-io step (`decode`, operating
//! on an already-read header + payload) and a thin async wrapper
//! (`read_frame`/`write_frame`) so the codec itself is unit-testable without
//! a real transport — the teacher's own `hpack.rs` tests took the same
//! "test the pure logic directly" approach.

use crate::error::{Error, ErrorCode};
use crate::settings::SettingsParameter;
use crate::types::*;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive as _, ToPrimitive as _};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FRAME_HEADER_LEN: usize = 9;

/// https://httpwg.org/specs/rfc7540.html#FrameTypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    ResetStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

/// Stream-dependency fields shared by PRIORITY and the priority-flagged
/// portion of HEADERS. Weight is stored as the wire byte (0..=255); add 1 to
/// get the RFC 7540 §5.3.2 weight (1..=256).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityParams {
    pub exclusive: bool,
    pub dependency: StreamId,
    pub weight: u8,
}

impl PriorityParams {
    const WIRE_LEN: usize = 5;

    fn decode(buf: &[u8]) -> Self {
        let raw = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        Self {
            exclusive: raw & 0x8000_0000 != 0,
            dependency: raw & U31_MAX,
            weight: buf[4],
        }
    }

    fn encode(self, out: &mut BytesMut) {
        let mut raw = self.dependency & U31_MAX;
        if self.exclusive {
            raw |= 0x8000_0000;
        }
        out.put_u32(raw);
        out.put_u8(self.weight);
    }
}

/// A fully decoded HTTP/2 frame. Unknown frame types are preserved as
/// `Unknown` rather than rejected outright, per RFC 7540 §5.5 — the
/// connection driver decides whether the context (inside vs. outside a
/// header block) makes that tolerable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream_id: StreamId,
        end_stream: bool,
        data: Bytes,
        padded: Option<u8>,
    },
    Headers {
        stream_id: StreamId,
        end_stream: bool,
        end_headers: bool,
        priority: Option<PriorityParams>,
        padded: Option<u8>,
        header_block_fragment: Bytes,
    },
    Priority {
        stream_id: StreamId,
        priority: PriorityParams,
    },
    RstStream {
        stream_id: StreamId,
        error_code: ErrorCode,
    },
    Settings {
        ack: bool,
        params: Vec<(SettingsParameter, u32)>,
    },
    PushPromise {
        stream_id: StreamId,
        end_headers: bool,
        padded: Option<u8>,
        promised_stream_id: StreamId,
        header_block_fragment: Bytes,
    },
    Ping {
        ack: bool,
        data: [u8; 8],
    },
    GoAway {
        last_stream_id: StreamId,
        error_code: ErrorCode,
        debug_data: Bytes,
    },
    WindowUpdate {
        stream_id: StreamId,
        increment: u32,
    },
    Continuation {
        stream_id: StreamId,
        end_headers: bool,
        header_block_fragment: Bytes,
    },
    Unknown {
        frame_type: u8,
        flags: u8,
        stream_id: StreamId,
        payload: Bytes,
    },
}

impl Frame {
    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::Headers { stream_id, .. }
            | Frame::Priority { stream_id, .. }
            | Frame::RstStream { stream_id, .. }
            | Frame::PushPromise { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Continuation { stream_id, .. }
            | Frame::Unknown { stream_id, .. } => *stream_id,
            Frame::Settings { .. } | Frame::Ping { .. } | Frame::GoAway { .. } => {
                CONNECTION_STREAM_ID
            }
        }
    }

    #[must_use]
    pub fn frame_type_name(&self) -> &'static str {
        match self {
            Frame::Data { .. } => "DATA",
            Frame::Headers { .. } => "HEADERS",
            Frame::Priority { .. } => "PRIORITY",
            Frame::RstStream { .. } => "RST_STREAM",
            Frame::Settings { .. } => "SETTINGS",
            Frame::PushPromise { .. } => "PUSH_PROMISE",
            Frame::Ping { .. } => "PING",
            Frame::GoAway { .. } => "GOAWAY",
            Frame::WindowUpdate { .. } => "WINDOW_UPDATE",
            Frame::Continuation { .. } => "CONTINUATION",
            Frame::Unknown { .. } => "UNKNOWN",
        }
    }

    /// Does this frame carry (or terminate) a header block, per spec §4.4
    /// "header-block atomicity"?
    #[must_use]
    pub fn is_header_block_frame(&self) -> bool {
        matches!(
            self,
            Frame::Headers { .. } | Frame::PushPromise { .. } | Frame::Continuation { .. }
        )
    }

    #[must_use]
    pub fn ends_header_block(&self) -> bool {
        match self {
            Frame::Headers { end_headers, .. }
            | Frame::PushPromise { end_headers, .. }
            | Frame::Continuation { end_headers, .. } => *end_headers,
            _ => false,
        }
    }

    /// Decode a frame from an already-read 9-byte header and its payload.
    /// `max_frame_size` is the *local* `MAX_FRAME_SIZE`, enforced before any
    /// type-specific parsing (spec §4.1 decode contracts).
    pub fn decode(
        frame_type: u8,
        flags: u8,
        stream_id: StreamId,
        payload: Bytes,
        max_frame_size: u32,
    ) -> Result<Self, Error> {
        if payload.len() as u32 > max_frame_size {
            return Err(Error::connection(
                ErrorCode::FrameSizeError,
                format!("frame payload {} exceeds MAX_FRAME_SIZE", payload.len()),
            ));
        }

        let Some(ty) = FrameType::from_u8(frame_type) else {
            return Ok(Frame::Unknown {
                frame_type,
                flags,
                stream_id,
                payload,
            });
        };

        match ty {
            FrameType::Data => Self::decode_data(flags, stream_id, payload),
            FrameType::Headers => Self::decode_headers(flags, stream_id, payload),
            FrameType::Priority => Self::decode_priority(stream_id, payload),
            FrameType::ResetStream => Self::decode_rst_stream(stream_id, payload),
            FrameType::Settings => Self::decode_settings(flags, stream_id, payload),
            FrameType::PushPromise => Self::decode_push_promise(flags, stream_id, payload),
            FrameType::Ping => Self::decode_ping(flags, stream_id, payload),
            FrameType::GoAway => Self::decode_goaway(stream_id, payload),
            FrameType::WindowUpdate => Self::decode_window_update(stream_id, payload),
            FrameType::Continuation => Self::decode_continuation(flags, stream_id, payload),
        }
    }

    fn require_stream_scoped(stream_id: StreamId, name: &str) -> Result<(), Error> {
        if stream_id == CONNECTION_STREAM_ID {
            return Err(Error::connection(
                ErrorCode::ProtocolError,
                format!("{name} must not use stream id 0"),
            ));
        }
        Ok(())
    }

    fn require_connection_scoped(stream_id: StreamId, name: &str) -> Result<(), Error> {
        if stream_id != CONNECTION_STREAM_ID {
            return Err(Error::connection(
                ErrorCode::ProtocolError,
                format!("{name} must use stream id 0"),
            ));
        }
        Ok(())
    }

    /// Strip the PADDED flag's leading pad-length byte and trailing padding,
    /// per spec §4.1 ("the first payload byte is pad length").
    fn strip_padding(mut payload: Bytes, padded: bool) -> Result<(Bytes, Option<u8>), Error> {
        if !padded {
            return Ok((payload, None));
        }
        if payload.is_empty() {
            return Err(Error::connection(
                ErrorCode::ProtocolError,
                "PADDED flag set but payload is empty",
            ));
        }
        let pad_len = payload.get_u8();
        if pad_len as usize >= payload.len() {
            return Err(Error::connection(
                ErrorCode::ProtocolError,
                "pad length exceeds remaining payload",
            ));
        }
        let content_len = payload.len() - pad_len as usize;
        let content = payload.split_to(content_len);
        Ok((content, Some(pad_len)))
    }

    fn decode_data(flags: u8, stream_id: StreamId, payload: Bytes) -> Result<Self, Error> {
        Self::require_stream_scoped(stream_id, "DATA")?;
        let flags = DataFlags::from_bits_truncate(flags);
        let (data, padded) = Self::strip_padding(payload, flags.contains(DataFlags::PADDED))?;
        Ok(Frame::Data {
            stream_id,
            end_stream: flags.contains(DataFlags::END_STREAM),
            data,
            padded,
        })
    }

    fn decode_headers(flags: u8, stream_id: StreamId, payload: Bytes) -> Result<Self, Error> {
        Self::require_stream_scoped(stream_id, "HEADERS")?;
        let flags = HeadersFlags::from_bits_truncate(flags);
        let (mut rest, padded) =
            Self::strip_padding(payload, flags.contains(HeadersFlags::PADDED))?;

        let priority = if flags.contains(HeadersFlags::PRIORITY) {
            if rest.len() < PriorityParams::WIRE_LEN {
                return Err(Error::connection(
                    ErrorCode::FrameSizeError,
                    "HEADERS priority fields truncated",
                ));
            }
            let params = PriorityParams::decode(&rest[..PriorityParams::WIRE_LEN]);
            rest.advance(PriorityParams::WIRE_LEN);
            if params.dependency == stream_id {
                return Err(Error::stream(
                    stream_id,
                    ErrorCode::ProtocolError,
                    "stream cannot depend on itself",
                ));
            }
            Some(params)
        } else {
            None
        };

        Ok(Frame::Headers {
            stream_id,
            end_stream: flags.contains(HeadersFlags::END_STREAM),
            end_headers: flags.contains(HeadersFlags::END_HEADERS),
            priority,
            padded,
            header_block_fragment: rest,
        })
    }

    fn decode_priority(stream_id: StreamId, payload: Bytes) -> Result<Self, Error> {
        Self::require_stream_scoped(stream_id, "PRIORITY")?;
        if payload.len() != PriorityParams::WIRE_LEN {
            return Err(Error::connection(
                ErrorCode::FrameSizeError,
                "PRIORITY frame must be exactly 5 octets",
            ));
        }
        let priority = PriorityParams::decode(&payload);
        if priority.dependency == stream_id {
            return Err(Error::stream(
                stream_id,
                ErrorCode::ProtocolError,
                "stream cannot depend on itself",
            ));
        }
        Ok(Frame::Priority {
            stream_id,
            priority,
        })
    }

    fn decode_rst_stream(stream_id: StreamId, payload: Bytes) -> Result<Self, Error> {
        Self::require_stream_scoped(stream_id, "RST_STREAM")?;
        if payload.len() != 4 {
            return Err(Error::connection(
                ErrorCode::FrameSizeError,
                "RST_STREAM frame must be exactly 4 octets",
            ));
        }
        let error_code = ErrorCode::from_wire(u32::from_be_bytes(payload[..4].try_into().unwrap()));
        Ok(Frame::RstStream {
            stream_id,
            error_code,
        })
    }

    fn decode_settings(flags: u8, stream_id: StreamId, payload: Bytes) -> Result<Self, Error> {
        Self::require_connection_scoped(stream_id, "SETTINGS")?;
        let flags = SettingsFlags::from_bits_truncate(flags);
        let ack = flags.contains(SettingsFlags::ACK);
        if ack && !payload.is_empty() {
            return Err(Error::connection(
                ErrorCode::FrameSizeError,
                "SETTINGS ACK must have an empty payload",
            ));
        }
        if payload.len() % 6 != 0 {
            return Err(Error::connection(
                ErrorCode::FrameSizeError,
                "SETTINGS payload length must be a multiple of 6",
            ));
        }
        let mut params = Vec::with_capacity(payload.len() / 6);
        for chunk in payload.chunks(6) {
            let id = u16::from_be_bytes([chunk[0], chunk[1]]);
            let value = u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]);
            // unrecognized identifiers are ignored, per spec §3 Settings.
            if let Some(param) = SettingsParameter::from_wire(id) {
                params.push((param, value));
            }
        }
        Ok(Frame::Settings { ack, params })
    }

    fn decode_push_promise(flags: u8, stream_id: StreamId, payload: Bytes) -> Result<Self, Error> {
        Self::require_stream_scoped(stream_id, "PUSH_PROMISE")?;
        let flags = PushPromiseFlags::from_bits_truncate(flags);
        let (mut rest, padded) =
            Self::strip_padding(payload, flags.contains(PushPromiseFlags::PADDED))?;
        if rest.len() < 4 {
            return Err(Error::connection(
                ErrorCode::FrameSizeError,
                "PUSH_PROMISE truncated before promised stream id",
            ));
        }
        let promised_stream_id = rest.get_u32() & U31_MAX;
        Ok(Frame::PushPromise {
            stream_id,
            end_headers: flags.contains(PushPromiseFlags::END_HEADERS),
            padded,
            promised_stream_id,
            header_block_fragment: rest,
        })
    }

    fn decode_ping(flags: u8, stream_id: StreamId, payload: Bytes) -> Result<Self, Error> {
        Self::require_connection_scoped(stream_id, "PING")?;
        if payload.len() != 8 {
            return Err(Error::connection(
                ErrorCode::FrameSizeError,
                "PING frame must be exactly 8 octets",
            ));
        }
        let flags = PingFlags::from_bits_truncate(flags);
        let mut data = [0u8; 8];
        data.copy_from_slice(&payload);
        Ok(Frame::Ping {
            ack: flags.contains(PingFlags::ACK),
            data,
        })
    }

    fn decode_goaway(stream_id: StreamId, mut payload: Bytes) -> Result<Self, Error> {
        Self::require_connection_scoped(stream_id, "GOAWAY")?;
        if payload.len() < 8 {
            return Err(Error::connection(
                ErrorCode::FrameSizeError,
                "GOAWAY truncated",
            ));
        }
        let last_stream_id = payload.get_u32() & U31_MAX;
        let error_code = ErrorCode::from_wire(payload.get_u32());
        Ok(Frame::GoAway {
            last_stream_id,
            error_code,
            debug_data: payload,
        })
    }

    fn decode_window_update(stream_id: StreamId, payload: Bytes) -> Result<Self, Error> {
        if payload.len() != 4 {
            return Err(Error::connection(
                ErrorCode::FrameSizeError,
                "WINDOW_UPDATE frame must be exactly 4 octets",
            ));
        }
        let increment = u32::from_be_bytes(payload[..4].try_into().unwrap()) & U31_MAX;
        if increment == 0 {
            let scope = if stream_id == CONNECTION_STREAM_ID {
                Error::connection(ErrorCode::ProtocolError, "WINDOW_UPDATE increment of 0")
            } else {
                Error::stream(
                    stream_id,
                    ErrorCode::ProtocolError,
                    "WINDOW_UPDATE increment of 0",
                )
            };
            return Err(scope);
        }
        Ok(Frame::WindowUpdate {
            stream_id,
            increment,
        })
    }

    fn decode_continuation(flags: u8, stream_id: StreamId, payload: Bytes) -> Result<Self, Error> {
        Self::require_stream_scoped(stream_id, "CONTINUATION")?;
        let flags = ContinuationFlags::from_bits_truncate(flags);
        Ok(Frame::Continuation {
            stream_id,
            end_headers: flags.contains(ContinuationFlags::END_HEADERS),
            header_block_fragment: payload,
        })
    }

    /// Serialize this frame to wire bytes (9-byte header + payload). Pure,
    /// synchronous, and infallible for any `Frame` this codec itself
    /// produced — callers constructing frames by hand get a `UsageError`-style
    /// invariant instead (e.g. header-block fragments are never split here;
    /// that's the writer's job, see `connection::Writer`).
    #[must_use]
    pub fn encode(&self) -> BytesMut {
        let (frame_type, flags, stream_id, payload) = match self.clone() {
            Frame::Data {
                stream_id,
                end_stream,
                data,
                padded,
            } => {
                let mut flags = DataFlags::empty();
                if end_stream {
                    flags |= DataFlags::END_STREAM;
                }
                let (payload, is_padded) = Self::pad_payload(data, padded);
                if is_padded {
                    flags |= DataFlags::PADDED;
                }
                (FrameType::Data, flags.bits(), stream_id, payload)
            }
            Frame::Headers {
                stream_id,
                end_stream,
                end_headers,
                priority,
                padded,
                header_block_fragment,
            } => {
                let mut flags = HeadersFlags::empty();
                if end_stream {
                    flags |= HeadersFlags::END_STREAM;
                }
                if end_headers {
                    flags |= HeadersFlags::END_HEADERS;
                }
                let mut body = BytesMut::new();
                if let Some(p) = priority {
                    flags |= HeadersFlags::PRIORITY;
                    p.encode(&mut body);
                }
                body.extend_from_slice(&header_block_fragment);
                let (payload, is_padded) = Self::pad_payload(body.freeze(), padded);
                if is_padded {
                    flags |= HeadersFlags::PADDED;
                }
                (FrameType::Headers, flags.bits(), stream_id, payload)
            }
            Frame::Priority {
                stream_id,
                priority,
            } => {
                let mut body = BytesMut::with_capacity(PriorityParams::WIRE_LEN);
                priority.encode(&mut body);
                (FrameType::Priority, 0, stream_id, body.freeze())
            }
            Frame::RstStream {
                stream_id,
                error_code,
            } => {
                let mut body = BytesMut::with_capacity(4);
                body.put_u32(error_code.to_wire());
                (FrameType::ResetStream, 0, stream_id, body.freeze())
            }
            Frame::Settings { ack, params } => {
                let mut body = BytesMut::with_capacity(params.len() * 6);
                for (param, value) in params {
                    body.put_u16(param as u16);
                    body.put_u32(value);
                }
                let flags = if ack { SettingsFlags::ACK.bits() } else { 0 };
                (FrameType::Settings, flags, CONNECTION_STREAM_ID, body.freeze())
            }
            Frame::PushPromise {
                stream_id,
                end_headers,
                padded,
                promised_stream_id,
                header_block_fragment,
            } => {
                let mut flags = PushPromiseFlags::empty();
                if end_headers {
                    flags |= PushPromiseFlags::END_HEADERS;
                }
                let mut body = BytesMut::with_capacity(4 + header_block_fragment.len());
                body.put_u32(promised_stream_id & U31_MAX);
                body.extend_from_slice(&header_block_fragment);
                let (payload, is_padded) = Self::pad_payload(body.freeze(), padded);
                if is_padded {
                    flags |= PushPromiseFlags::PADDED;
                }
                (FrameType::PushPromise, flags.bits(), stream_id, payload)
            }
            Frame::Ping { ack, data } => {
                let flags = if ack { PingFlags::ACK.bits() } else { 0 };
                (
                    FrameType::Ping,
                    flags,
                    CONNECTION_STREAM_ID,
                    Bytes::copy_from_slice(&data),
                )
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                let mut body = BytesMut::with_capacity(8 + debug_data.len());
                body.put_u32(last_stream_id & U31_MAX);
                body.put_u32(error_code.to_wire());
                body.extend_from_slice(&debug_data);
                (FrameType::GoAway, 0, CONNECTION_STREAM_ID, body.freeze())
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                let mut body = BytesMut::with_capacity(4);
                body.put_u32(increment & U31_MAX);
                (FrameType::WindowUpdate, 0, stream_id, body.freeze())
            }
            Frame::Continuation {
                stream_id,
                end_headers,
                header_block_fragment,
            } => {
                let flags = if end_headers {
                    ContinuationFlags::END_HEADERS.bits()
                } else {
                    0
                };
                (
                    FrameType::Continuation,
                    flags,
                    stream_id,
                    header_block_fragment,
                )
            }
            Frame::Unknown {
                frame_type,
                flags,
                stream_id,
                payload,
            } => {
                let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
                Self::write_header(&mut out, payload.len(), frame_type, flags, stream_id);
                out.extend_from_slice(&payload);
                return out;
            }
        };

        let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
        Self::write_header(
            &mut out,
            payload.len(),
            frame_type.to_u8().expect("FrameType is repr(u8)"),
            flags,
            stream_id,
        );
        out.extend_from_slice(&payload);
        out
    }

    fn write_header(out: &mut BytesMut, length: usize, frame_type: u8, flags: u8, stream_id: StreamId) {
        let len_bytes = (length as u32).to_be_bytes();
        out.extend_from_slice(&len_bytes[1..]); // 24-bit length
        out.put_u8(frame_type);
        out.put_u8(flags);
        out.put_u32(stream_id & U31_MAX);
    }

    /// Validate constructor-level invariants before a frame is sent,
    /// mirroring the decode-side stream-id scoping rule of spec §4.1:
    /// stream-scoped frame types must not target the connection stream.
    /// (The converse — a connection-scoped type on a nonzero stream — can't
    /// be constructed at all, since `Settings`/`Ping`/`GoAway` carry no
    /// `stream_id` field.) A violation here is a bug in the caller
    /// assembling the frame, not a wire condition — never transmitted.
    pub fn validate_for_send(&self) -> Result<(), crate::error::UsageError> {
        use crate::error::UsageError;
        let stream_scoped = matches!(
            self,
            Frame::Data { .. }
                | Frame::Headers { .. }
                | Frame::Priority { .. }
                | Frame::RstStream { .. }
                | Frame::PushPromise { .. }
                | Frame::Continuation { .. }
        );
        if stream_scoped && self.stream_id() == CONNECTION_STREAM_ID {
            return Err(UsageError::NotConstructible("stream-scoped frame sent with stream id 0"));
        }
        Ok(())
    }

    /// Returns the (possibly) padding-wrapped payload and whether the PADDED
    /// flag should be set.
    fn pad_payload(content: Bytes, padded: Option<u8>) -> (Bytes, bool) {
        match padded {
            Some(pad_len) => {
                let mut body = BytesMut::with_capacity(1 + content.len() + pad_len as usize);
                body.put_u8(pad_len);
                body.extend_from_slice(&content);
                body.resize(body.len() + pad_len as usize, 0);
                (body.freeze(), true)
            }
            None => (content, false),
        }
    }
}

/// Read one frame from `reader`, decoding against `max_frame_size`. Returns
/// `Ok(None)` on clean EOF before any header bytes arrive.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_frame_size: u32,
) -> std::io::Result<Option<Result<Frame, Error>>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header[..1]).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    reader.read_exact(&mut header[1..]).await?;
    let length = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
    let frame_type = header[3];
    let flags = header[4];
    let stream_id = u32::from_be_bytes(header[5..9].try_into().unwrap()) & U31_MAX;

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Some(Frame::decode(
        frame_type,
        flags,
        stream_id,
        Bytes::from(payload),
        max_frame_size,
    )))
}

/// Write one frame to `writer`. Fragmentation to respect a peer's
/// `MAX_FRAME_SIZE` is the writer task's job (spec §4.5), not the codec's —
/// by the time a `Frame` reaches here its payload is assumed to already fit.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> std::io::Result<()> {
    frame
        .validate_for_send()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
    let bytes = frame.encode();
    writer.write_all(&bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) {
        let encoded = frame.encode();
        let frame_type = encoded[3];
        let flags = encoded[4];
        let stream_id = u32::from_be_bytes(encoded[5..9].try_into().unwrap());
        let payload = Bytes::copy_from_slice(&encoded[9..]);
        let decoded = Frame::decode(frame_type, flags, stream_id, payload, MAX_MAX_FRAME_SIZE_FOR_TESTS)
            .expect("decode of our own encoding must succeed");
        assert_eq!(decoded, frame);
    }

    const MAX_MAX_FRAME_SIZE_FOR_TESTS: u32 = 16_777_215;

    #[test]
    fn data_frame_roundtrip() {
        roundtrip(Frame::Data {
            stream_id: 1,
            end_stream: true,
            data: Bytes::from_static(b"hello"),
            padded: None,
        });
    }

    #[test]
    fn headers_frame_roundtrip_with_priority() {
        roundtrip(Frame::Headers {
            stream_id: 3,
            end_stream: false,
            end_headers: true,
            priority: Some(PriorityParams {
                exclusive: true,
                dependency: 1,
                weight: 15,
            }),
            padded: None,
            header_block_fragment: Bytes::from_static(b"\x82\x84"),
        });
    }

    #[test]
    fn settings_frame_roundtrip() {
        roundtrip(Frame::Settings {
            ack: false,
            params: vec![
                (SettingsParameter::InitialWindowSize, 1024),
                (SettingsParameter::MaxConcurrentStreams, 50),
            ],
        });
    }

    #[test]
    fn ping_roundtrip() {
        roundtrip(Frame::Ping {
            ack: true,
            data: *b"12345678",
        });
    }

    #[test]
    fn rst_stream_must_not_use_stream_zero() {
        let err = Frame::decode(FrameType::ResetStream as u8, 0, 0, Bytes::from_static(&[0, 0, 0, 0]), 16_384)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolError);
    }

    #[test]
    fn settings_must_use_stream_zero() {
        let err = Frame::decode(FrameType::Settings as u8, 0, 1, Bytes::new(), 16_384).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolError);
    }

    #[test]
    fn settings_payload_must_be_multiple_of_six() {
        let err = Frame::decode(
            FrameType::Settings as u8,
            0,
            0,
            Bytes::from_static(&[0, 1, 0, 0]),
            16_384,
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::FrameSizeError);
    }

    #[test]
    fn settings_ack_must_be_empty() {
        let err = Frame::decode(
            FrameType::Settings as u8,
            SettingsFlags::ACK.bits(),
            0,
            Bytes::from_static(&[0, 1, 0, 0, 0, 1]),
            16_384,
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::FrameSizeError);
    }

    #[test]
    fn priority_frame_rejects_wrong_length() {
        let err = Frame::decode(FrameType::Priority as u8, 0, 1, Bytes::from_static(&[0; 4]), 16_384)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::FrameSizeError);
    }

    #[test]
    fn window_update_zero_increment_is_protocol_error() {
        let err = Frame::decode(
            FrameType::WindowUpdate as u8,
            0,
            0,
            Bytes::from_static(&[0, 0, 0, 0]),
            16_384,
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolError);
    }

    #[test]
    fn oversized_payload_is_frame_size_error() {
        let err = Frame::decode(FrameType::Data as u8, 0, 1, Bytes::from(vec![0u8; 100]), 16)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::FrameSizeError);
    }

    #[test]
    fn padding_longer_than_payload_is_protocol_error() {
        // pad length byte says 10 but only 2 bytes of payload remain.
        let payload = Bytes::from_static(&[10, 1, 2]);
        let err = Frame::decode(
            FrameType::Data as u8,
            DataFlags::PADDED.bits(),
            1,
            payload,
            16_384,
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolError);
    }

    #[test]
    fn send_validation_rejects_stream_scoped_frame_on_stream_zero() {
        let frame = Frame::Data {
            stream_id: 0,
            end_stream: true,
            data: Bytes::new(),
            padded: None,
        };
        assert!(frame.validate_for_send().is_err());
    }

    #[test]
    fn send_validation_accepts_a_well_formed_frame() {
        let frame = Frame::Ping {
            ack: false,
            data: [0; 8],
        };
        assert!(frame.validate_for_send().is_ok());
    }

    #[test]
    fn unknown_frame_type_is_tolerated() {
        let frame = Frame::decode(0xFF, 0, 1, Bytes::from_static(b"x"), 16_384).unwrap();
        assert!(matches!(frame, Frame::Unknown { frame_type: 0xFF, .. }));
    }
}
