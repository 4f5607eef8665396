//! Per-stream lifecycle: state machine, header validation, header-block
//! assembly. Spec §4.4 (replaces the teacher's `stream.rs`, which mixed a
//! blocking-thread response model with this state table — kept only the
//! state table, rewritten around `tokio::sync` primitives).

use crate::error::{Error, ErrorCode, Scope};
use crate::flow_control::StreamWindow;
use crate::frame::{Frame, PriorityParams};
use crate::types::{HeaderField, HeaderList, StreamId};
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

/// https://httpwg.org/specs/rfc7540.html#StreamStates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamState {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            StreamState::Open | StreamState::HalfClosedLocal | StreamState::HalfClosedRemote
        )
    }
}

/// Which kind of header block is currently being assembled across
/// CONTINUATION frames, per spec §4.4 "header-block atomicity".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Continuing {
    Headers,
    PushPromise,
}

/// A frame's role in the state-transition table, stripped of payload.
#[derive(Debug, Clone, Copy)]
pub struct TransitionEvent {
    pub is_headers: bool,
    pub is_push_promise: bool,
    pub is_continuation: bool,
    pub is_rst_stream: bool,
    pub is_data: bool,
    pub end_stream: bool,
    pub end_headers: bool,
}

pub struct Stream {
    pub id: StreamId,
    state: StreamState,
    continuing: Option<Continuing>,
    header_block: BytesMut,

    pub priority_exclusive: bool,
    pub priority_dependency: StreamId,
    pub priority_weight: u8,

    pub window: StreamWindow,

    pub request_headers: HeaderList,
    pub trailing_headers: Option<HeaderList>,
    pub content_length: Option<u64>,
    received_data_len: u64,

    /// Sending end of the inbound body channel; the application-facing
    /// receiving end is handed out once, at stream creation. Unbounded: the
    /// real bound on buffered bytes is the flow-control receive window, not
    /// channel capacity (spec §9 "circular byte buffer" — the window *is*
    /// the bound, so the channel itself doesn't need to apply backpressure
    /// that would otherwise stall the single reader task across streams).
    pub body_tx: Option<mpsc::UnboundedSender<Bytes>>,
}

impl Stream {
    #[must_use]
    pub fn new(id: StreamId, initial_send: u32, initial_recv: u32, body_tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            continuing: None,
            header_block: BytesMut::new(),
            priority_exclusive: false,
            priority_dependency: 0,
            priority_weight: crate::priority::DEFAULT_WEIGHT,
            window: StreamWindow::new(id, initial_send, initial_recv),
            request_headers: HeaderList::new(),
            trailing_headers: None,
            content_length: None,
            received_data_len: 0,
            body_tx: Some(body_tx),
        }
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        self.state
    }

    #[must_use]
    pub fn is_assembling_header_block(&self) -> bool {
        self.continuing.is_some()
    }

    pub fn begin_header_block(&mut self, kind_is_push_promise: bool, fragment: &[u8], end_headers: bool) {
        self.header_block.clear();
        self.header_block.extend_from_slice(fragment);
        self.continuing = if end_headers {
            None
        } else {
            Some(if kind_is_push_promise {
                Continuing::PushPromise
            } else {
                Continuing::Headers
            })
        };
    }

    /// Append a CONTINUATION fragment; returns `true` once `end_headers`
    /// completes the block.
    pub fn append_continuation(&mut self, fragment: &[u8], end_headers: bool) -> bool {
        self.header_block.extend_from_slice(fragment);
        if end_headers {
            self.continuing = None;
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn take_header_block(&mut self) -> Bytes {
        self.header_block.split().freeze()
    }

    /// RFC 7540 §5.1 transition table, applied identically for frames we
    /// send (`recv = false`) and frames we receive (`recv = true`).
    pub fn transition(&mut self, recv: bool, event: TransitionEvent) -> Result<(), Error> {
        let send = !recv;

        if event.is_rst_stream {
            if self.state == StreamState::Idle {
                return Err(Error::connection(
                    ErrorCode::ProtocolError,
                    "RST_STREAM received for an idle stream",
                ));
            }
            self.state = StreamState::Closed;
            return Ok(());
        }

        if self.state == StreamState::Closed {
            if event.is_data || event.is_headers || event.is_continuation {
                return Err(Error::stream(
                    self.id,
                    ErrorCode::StreamClosed,
                    "frame received for a closed stream",
                ));
            }
            return Ok(());
        }

        if matches!(self.state, StreamState::HalfClosedRemote)
            && recv
            && (event.is_data || event.is_headers || event.is_continuation)
        {
            return Err(Error::stream(
                self.id,
                ErrorCode::StreamClosed,
                "frame received on a half-closed(remote) stream",
            ));
        }

        match self.state {
            StreamState::Idle => {
                if send && event.is_push_promise {
                    self.state = StreamState::ReservedLocal;
                } else if recv && event.is_push_promise {
                    self.state = StreamState::ReservedRemote;
                } else if event.is_headers {
                    self.state = if event.end_stream {
                        if recv {
                            StreamState::HalfClosedRemote
                        } else {
                            StreamState::HalfClosedLocal
                        }
                    } else {
                        StreamState::Open
                    };
                } else if !event.is_continuation {
                    return Err(Error::connection(
                        ErrorCode::ProtocolError,
                        "unexpected frame for an idle stream",
                    ));
                }
            }
            StreamState::ReservedLocal if send && event.is_headers => {
                self.state = StreamState::HalfClosedRemote;
            }
            StreamState::ReservedRemote if recv && event.is_headers => {
                self.state = StreamState::HalfClosedLocal;
            }
            StreamState::Open => {
                if event.end_stream {
                    self.state = if recv {
                        StreamState::HalfClosedRemote
                    } else {
                        StreamState::HalfClosedLocal
                    };
                }
            }
            StreamState::HalfClosedLocal if recv && event.end_stream => {
                self.state = StreamState::Closed;
            }
            StreamState::HalfClosedRemote if send && event.end_stream => {
                self.state = StreamState::Closed;
            }
            _ => {}
        }

        Ok(())
    }

    pub fn record_data_received(&mut self, len: u64) {
        self.received_data_len += len;
    }

    /// Validate total received DATA against an advertised `content-length`
    /// once END_STREAM has arrived (spec §4.4).
    pub fn check_content_length(&self) -> Result<(), Error> {
        if let Some(expected) = self.content_length {
            if expected != self.received_data_len {
                return Err(Error::stream(
                    self.id,
                    ErrorCode::ProtocolError,
                    format!(
                        "content-length {expected} did not match {} received bytes",
                        self.received_data_len
                    ),
                ));
            }
        }
        Ok(())
    }

    pub fn apply_priority(&mut self, params: PriorityParams) {
        self.priority_exclusive = params.exclusive;
        self.priority_dependency = params.dependency;
        self.priority_weight = params.weight;
    }
}

impl TransitionEvent {
    #[must_use]
    pub fn from_frame(frame: &Frame, continuing_headers: bool) -> Self {
        let is_continuation = matches!(frame, Frame::Continuation { .. });
        Self {
            is_headers: matches!(frame, Frame::Headers { .. }),
            is_push_promise: matches!(frame, Frame::PushPromise { .. }),
            is_continuation,
            is_rst_stream: matches!(frame, Frame::RstStream { .. }),
            is_data: matches!(frame, Frame::Data { .. }),
            end_stream: match frame {
                Frame::Data { end_stream, .. } | Frame::Headers { end_stream, .. } => *end_stream,
                _ => false,
            },
            end_headers: match frame {
                Frame::Headers { end_headers, .. }
                | Frame::PushPromise { end_headers, .. }
                | Frame::Continuation { end_headers, .. } => *end_headers,
                _ => false,
            } && (!is_continuation || continuing_headers),
        }
    }
}

const REQUEST_PSEUDO_HEADERS: &[&[u8]] = &[b":method", b":scheme", b":authority", b":path"];
const RESPONSE_PSEUDO_HEADERS: &[&[u8]] = &[b":status"];

/// Header validation: lowercase names, pseudo-header ordering/set/
/// duplicates, forbidden `connection`, `te` must be `trailers`, exactly one
/// `:method` (and for non-CONNECT requests, `:scheme`/non-empty `:path`).
/// Spec §4.4 "Header validation". Failures are scoped per spec §7: stream
/// errors in general (`scope` is normally `Scope::Stream(id)`), except a
/// caller's own not-yet-assigned-a-peer-visible-id outbound request, which
/// passes `Scope::Connection` since there is no stream to reset yet.
pub fn validate_headers(headers: &HeaderList, is_request: bool, is_trailers: bool, scope: Scope) -> Result<(), Error> {
    let mut seen_regular_header = false;
    let mut method_count = 0;
    let mut scheme_count = 0;
    let mut authority_count = 0;
    let mut path_count = 0;
    let mut status_count = 0;
    let mut path_nonempty = false;
    let mut method_is_connect = false;

    let allowed_pseudo = if is_request {
        REQUEST_PSEUDO_HEADERS
    } else {
        RESPONSE_PSEUDO_HEADERS
    };

    let fail = |message: &'static str| protocol_error(scope, message);

    for field in headers {
        if field.name.iter().any(u8::is_ascii_uppercase) {
            return fail("uppercase header name");
        }

        if field.is_pseudo() {
            if is_trailers {
                return fail("pseudo-header in trailing headers");
            }
            if seen_regular_header {
                return fail("pseudo-header after regular header");
            }
            if !allowed_pseudo.contains(&&field.name[..]) {
                return fail("unknown or misplaced pseudo-header");
            }
            match &field.name[..] {
                b":method" => {
                    method_count += 1;
                    method_is_connect = field.value.as_ref() == b"CONNECT";
                }
                b":scheme" => scheme_count += 1,
                b":authority" => authority_count += 1,
                b":path" => {
                    path_count += 1;
                    path_nonempty = !field.value.is_empty();
                }
                b":status" => status_count += 1,
                _ => {}
            }
            if method_count > 1 || scheme_count > 1 || authority_count > 1 || path_count > 1 || status_count > 1 {
                return fail("duplicate pseudo-header");
            }
        } else {
            seen_regular_header = true;
            if field.name.as_ref() == b"connection" {
                return fail("connection header is forbidden in HTTP/2");
            }
            if field.name.as_ref() == b"te" && field.value.as_ref() != b"trailers" {
                return fail("te header must be exactly \"trailers\"");
            }
        }
    }

    if is_trailers {
        return Ok(());
    }

    if is_request {
        if method_count != 1 {
            return fail("exactly one :method pseudo-header is required");
        }
        if !method_is_connect {
            if scheme_count != 1 {
                return fail("exactly one :scheme pseudo-header is required");
            }
            if path_count != 1 || !path_nonempty {
                return fail("exactly one non-empty :path pseudo-header is required");
            }
        }
    }

    Ok(())
}

fn protocol_error(scope: Scope, message: &'static str) -> Result<(), Error> {
    match scope {
        Scope::Connection => Err(Error::connection(ErrorCode::ProtocolError, message)),
        Scope::Stream(id) => Err(Error::stream(id, ErrorCode::ProtocolError, message)),
    }
}

/// Parse a decoded `content-length` header value, if present.
#[must_use]
pub fn parse_content_length(headers: &HeaderList) -> Option<u64> {
    headers
        .iter()
        .find(|f| f.name.as_ref() == b"content-length")
        .and_then(|f| std::str::from_utf8(&f.value).ok())
        .and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &'static str, value: &'static str) -> HeaderField {
        HeaderField::new(Bytes::from_static(name.as_bytes()), Bytes::from_static(value.as_bytes()))
    }

    fn new_stream(id: StreamId) -> Stream {
        let (tx, _rx) = mpsc::unbounded_channel();
        Stream::new(id, 65_535, 65_535, tx)
    }

    fn headers_event(end_stream: bool) -> TransitionEvent {
        TransitionEvent {
            is_headers: true,
            is_push_promise: false,
            is_continuation: false,
            is_rst_stream: false,
            is_data: false,
            end_stream,
            end_headers: true,
        }
    }

    fn data_event() -> TransitionEvent {
        TransitionEvent {
            is_headers: false,
            is_push_promise: false,
            is_continuation: false,
            is_rst_stream: false,
            is_data: true,
            end_stream: false,
            end_headers: false,
        }
    }

    fn rst_stream_event() -> TransitionEvent {
        TransitionEvent {
            is_headers: false,
            is_push_promise: false,
            is_continuation: false,
            is_rst_stream: true,
            is_data: false,
            end_stream: false,
            end_headers: false,
        }
    }

    #[test]
    fn idle_to_open_on_headers_without_end_stream() {
        let mut s = new_stream(1);
        s.transition(true, headers_event(false)).unwrap();
        assert_eq!(s.state(), StreamState::Open);
    }

    #[test]
    fn idle_to_half_closed_remote_on_headers_with_end_stream() {
        let mut s = new_stream(1);
        s.transition(true, headers_event(true)).unwrap();
        assert_eq!(s.state(), StreamState::HalfClosedRemote);
    }

    #[test]
    fn half_closed_remote_rejects_further_data() {
        let mut s = new_stream(1);
        s.transition(true, headers_event(true)).unwrap();
        let err = s.transition(true, data_event()).unwrap_err();
        assert_eq!(err.code, ErrorCode::StreamClosed);
    }

    #[test]
    fn rst_stream_on_idle_is_protocol_error() {
        let mut s = new_stream(1);
        let err = s.transition(true, rst_stream_event()).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolError);
    }

    #[test]
    fn open_to_closed_on_both_sides_end_stream() {
        let mut s = new_stream(1);
        s.transition(true, headers_event(false)).unwrap();
        assert_eq!(s.state(), StreamState::Open);
        s.transition(true, headers_event(true)).unwrap();
        assert_eq!(s.state(), StreamState::HalfClosedRemote);
        s.transition(false, headers_event(true)).unwrap();
        assert_eq!(s.state(), StreamState::Closed);
    }

    #[test]
    fn uppercase_header_name_is_rejected() {
        let headers = vec![field(":method", "GET"), field("Content-Type", "text/plain")];
        let err = validate_headers(&headers, true, false, Scope::Stream(1)).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolError);
    }

    #[test]
    fn duplicate_method_is_rejected() {
        let headers = vec![
            field(":method", "GET"),
            field(":method", "GET"),
            field(":scheme", "https"),
            field(":path", "/"),
        ];
        let err = validate_headers(&headers, true, false, Scope::Stream(1)).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolError);
    }

    #[test]
    fn duplicate_authority_is_rejected() {
        let headers = vec![
            field(":method", "GET"),
            field(":scheme", "https"),
            field(":authority", "example.com"),
            field(":authority", "other.com"),
            field(":path", "/"),
        ];
        let err = validate_headers(&headers, true, false, Scope::Stream(1)).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolError);
    }

    #[test]
    fn duplicate_status_is_rejected() {
        let headers = vec![field(":status", "200"), field(":status", "200")];
        let err = validate_headers(&headers, false, false, Scope::Stream(1)).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolError);
    }

    #[test]
    fn connection_header_is_forbidden() {
        let headers = vec![
            field(":method", "GET"),
            field(":scheme", "https"),
            field(":path", "/"),
            field("connection", "keep-alive"),
        ];
        let err = validate_headers(&headers, true, false, Scope::Stream(1)).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolError);
    }

    #[test]
    fn te_other_than_trailers_is_rejected() {
        let headers = vec![
            field(":method", "GET"),
            field(":scheme", "https"),
            field(":path", "/"),
            field("te", "gzip"),
        ];
        let err = validate_headers(&headers, true, false, Scope::Stream(1)).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolError);
    }

    #[test]
    fn connect_method_does_not_require_scheme_or_path() {
        let headers = vec![field(":method", "CONNECT"), field(":authority", "example.com:443")];
        validate_headers(&headers, true, false, Scope::Stream(1)).unwrap();
    }

    #[test]
    fn valid_request_headers_pass() {
        let headers = vec![
            field(":method", "GET"),
            field(":scheme", "https"),
            field(":authority", "example.com"),
            field(":path", "/"),
        ];
        validate_headers(&headers, true, false, Scope::Stream(1)).unwrap();
    }

    #[test]
    fn trailers_reject_pseudo_headers() {
        let headers = vec![field(":status", "200")];
        let err = validate_headers(&headers, false, true, Scope::Stream(1)).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolError);
    }
}
