//! Connection driver, replacing the teacher's thread-and-`Condvar`
//! `connection.rs` with a reader task / writer task split over
//! `tokio::io::AsyncRead + AsyncWrite`. Spec §4.5, §5.
//!
//! The two tasks never touch the same half of HPACK: the writer task owns
//! the [`hpack::Encoder`] and the reader task owns the [`hpack::Decoder`],
//! matching RFC 7541's single-writer/single-reader requirement on each
//! table without a lock. Everything the tasks must share (stream table,
//! connection-scope flow-control windows, GOAWAY state) lives in
//! [`Shared`], handed to both as an `Arc`.

use crate::config::Config;
use crate::error::{Error, ErrorCode, Scope};
use crate::flow_control::{ConnectionWindow, WindowAccount};
use crate::frame::{self, Frame, PriorityParams};
use crate::hpack;
use crate::priority::PriorityTree;
use crate::registry::{Registry, Role};
use crate::settings::{Settings, SettingsParameter};
use crate::stream::{parse_content_length, validate_headers, StreamState, TransitionEvent};
use crate::types::{is_server_initiated, HeaderField, HeaderList, StreamId, CONNECTION_STREAM_ID};
use bytes::Bytes;
use dashmap::DashMap;
use log::{debug, error, trace, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{split, AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// RFC 7540 §3.5 connection preface, sent by the client before anything
/// else and expected verbatim by the server.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// A fully decoded request (or pushed request), handed to the application
/// once its header block completes. Spec §6.
pub struct IncomingRequest {
    pub stream_id: StreamId,
    pub headers: HeaderList,
    pub body: BodyReader,
    pub handle: StreamHandle,
}

/// A server push delivered to a client that left push enabled.
pub struct IncomingPush {
    pub promised_stream_id: StreamId,
    pub request_headers: HeaderList,
    pub response_headers: HeaderList,
    pub body: BodyReader,
}

/// A response delivered to a client's [`Connection::request`] caller.
pub struct ClientResponse {
    pub headers: HeaderList,
    pub body: BodyReader,
}

/// The application-facing handle for receiving one stream's DATA frames
/// and (if any) its trailing headers. Spec §6.
pub struct BodyReader {
    stream_id: StreamId,
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    trailers: Option<oneshot::Receiver<HeaderList>>,
}

impl BodyReader {
    /// Await the next chunk of the body, or `None` once the peer has sent
    /// END_STREAM and every buffered chunk has been delivered.
    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        let chunk = self.rx.recv().await?;
        self.credit(chunk.len() as u32);
        Some(chunk)
    }

    /// Drain the whole body into one buffer, for callers who don't need
    /// streaming.
    pub async fn read_to_end(&mut self) -> Bytes {
        let mut buf = Vec::new();
        while let Some(chunk) = self.next_chunk().await {
            buf.extend_from_slice(&chunk);
        }
        Bytes::from(buf)
    }

    /// Resolve once trailing headers arrive, or with an empty list if the
    /// stream ended without any.
    pub async fn trailers(&mut self) -> HeaderList {
        match self.trailers.take() {
            Some(rx) => rx.await.unwrap_or_default(),
            None => HeaderList::new(),
        }
    }

    /// Replenish this stream's (and, eagerly, the connection's) receive
    /// window for `len` bytes the application just consumed. Half-threshold
    /// policy, spec §4.3 "Window maintenance".
    fn credit(&self, len: u32) {
        let initial = self.shared.config.local_settings.initial_window_size();
        let threshold = i64::from(initial) / 2;
        let mut emit = None;
        self.shared.registry.with_stream(self.stream_id, |s| {
            s.window.replenish_recv(len);
            if s.window.recv_window() <= i64::from(initial) - threshold {
                emit = Some((i64::from(initial) - s.window.recv_window()) as u32);
            }
        });
        if let Some(amount) = emit {
            let _ = self.shared.writer_tx.send(WriteCommand::WindowUpdate {
                stream_id: self.stream_id,
                increment: amount,
            });
        }
        self.shared.maybe_emit_connection_window_update();
    }
}

/// A caller-facing send handle for one stream: headers, data, trailers,
/// reset, and (for the initiator) pushed requests. Spec §6.
#[derive(Clone)]
pub struct StreamHandle {
    stream_id: StreamId,
    shared: Arc<Shared>,
}

impl StreamHandle {
    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn send_headers(&self, headers: HeaderList, end_stream: bool) -> Result<(), Error> {
        validate_headers(&headers, false, false, Scope::Stream(self.stream_id))?;
        self.shared
            .writer_tx
            .send(WriteCommand::Headers {
                stream_id: self.stream_id,
                headers,
                end_stream,
                priority: None,
            })
            .map_err(|_| writer_gone())
    }

    pub fn send_trailers(&self, trailers: HeaderList) -> Result<(), Error> {
        validate_headers(&trailers, false, true, Scope::Stream(self.stream_id))?;
        self.shared
            .writer_tx
            .send(WriteCommand::Headers {
                stream_id: self.stream_id,
                headers: trailers,
                end_stream: true,
                priority: None,
            })
            .map_err(|_| writer_gone())
    }

    /// Queue one body chunk with the writer's priority scheduler and
    /// suspend until it has actually been written, fragmented to respect
    /// MAX_FRAME_SIZE and send-window budget (at both stream and connection
    /// scope) and interleaved with other streams' DATA by priority weight —
    /// spec §4.4 "Priority", §5 "suspension is per writer, not global".
    /// Backpressure and weighted scheduling both live in the writer task
    /// now; this call only enqueues and waits, so one stalled stream can
    /// never block another's DATA and no stream can claim more than its
    /// share of a shared window just by winning a race to consume it.
    pub async fn send_data(&self, data: Bytes, end_stream: bool) -> Result<(), Error> {
        if self.shared.peer_goaway.load(Ordering::SeqCst) {
            return Err(Error::connection(ErrorCode::Cancel, "connection is going away"));
        }
        if !self.shared.registry.contains(self.stream_id) {
            return Err(stream_gone());
        }

        let (done_tx, done_rx) = oneshot::channel();
        self.shared
            .pending_data
            .entry(self.stream_id)
            .or_default()
            .push_back(DataJob {
                remaining: data,
                end_stream,
                done: done_tx,
            });
        self.shared.data_ready.notify_waiters();

        match done_rx.await {
            Ok(result) => result,
            Err(_) => Err(writer_gone()),
        }
    }

    pub fn reset(&self, error_code: ErrorCode) -> Result<(), Error> {
        self.shared
            .writer_tx
            .send(WriteCommand::RstStream {
                stream_id: self.stream_id,
                error_code,
            })
            .map_err(|_| writer_gone())
    }

    /// Promise a server push associated with this (request) stream, then
    /// hand back a handle for sending its response. The caller decides
    /// whether/what to push (spec §1 Non-goal); we only enforce the wire
    /// protocol around it.
    pub fn push_promise(&self, request_headers: HeaderList) -> Result<StreamHandle, Error> {
        if !self.shared.remote_enable_push.load(Ordering::SeqCst) {
            return Err(Error::connection(ErrorCode::ProtocolError, "peer disabled server push"));
        }
        validate_headers(&request_headers, true, false, Scope::Stream(self.stream_id))?;
        let initial_send = self.shared.remote_initial_window();
        let initial_recv = self.shared.local_initial_window();
        let (promised_id, rx) = self.shared.registry.open_local_stream(initial_send, initial_recv)?;
        self.shared.pending_body_rxs.insert(promised_id, rx);
        self.shared
            .registry
            .with_stream(promised_id, |s| s.request_headers = request_headers.clone());
        self.shared
            .writer_tx
            .send(WriteCommand::PushPromise {
                stream_id: self.stream_id,
                promised_stream_id: promised_id,
                headers: request_headers,
            })
            .map_err(|_| writer_gone())?;
        Ok(StreamHandle {
            stream_id: promised_id,
            shared: self.shared.clone(),
        })
    }
}

/// A caller-built outbound request, spec §6's client entry point.
pub struct ClientRequest {
    pub headers: HeaderList,
    pub body: Option<Bytes>,
    pub end_stream_after_headers: bool,
}

fn writer_gone() -> Error {
    Error::connection(ErrorCode::InternalError, "writer task is gone")
}

fn stream_gone() -> Error {
    Error::connection(ErrorCode::InternalError, "stream removed from registry mid-send")
}

/// Commands the reader task (and application-facing handles) hand to the
/// single writer task. One task draining one channel gives header-block
/// atomicity "for free": no other command can be dequeued while a
/// HEADERS/CONTINUATION sequence is mid-emission (spec §4.5 "Writer").
enum WriteCommand {
    Headers {
        stream_id: StreamId,
        headers: HeaderList,
        end_stream: bool,
        priority: Option<PriorityParams>,
    },
    PushPromise {
        stream_id: StreamId,
        promised_stream_id: StreamId,
        headers: HeaderList,
    },
    RstStream {
        stream_id: StreamId,
        error_code: ErrorCode,
    },
    WindowUpdate {
        stream_id: StreamId,
        increment: u32,
    },
    ConnectionWindowUpdate {
        increment: u32,
    },
    SettingsAck,
    PingAck {
        data: [u8; 8],
    },
    GoAway {
        last_stream_id: StreamId,
        error_code: ErrorCode,
        debug_data: Bytes,
    },
    /// The peer lowered (or raised) `SETTINGS_HEADER_TABLE_SIZE`; our
    /// encoder's dynamic table is bounded by what the peer's decoder
    /// advertised it will hold, so it must track this on every change, not
    /// just at connection startup (RFC 7541 §6.3).
    ResizeDynamicTable {
        new_max_size: usize,
    },
    Shutdown,
}

/// Which kind of header block the reader task is currently assembling
/// across CONTINUATION frames, at connection scope. Distinct from each
/// [`crate::stream::Stream`]'s own per-stream assembly state: this one
/// enforces that no other stream's frames may interleave while a block is
/// open, per RFC 7540 §6.10 / spec §4.2 "header-block atomicity".
#[derive(Clone, Copy)]
enum HeaderBlockKind {
    Request { is_trailers: bool, end_stream: bool },
    Push { promised_stream_id: StreamId },
}

/// One application-submitted `send_data` call waiting for the writer's
/// priority scheduler to drain it, possibly across several wire frames.
/// Spec §4.4 "Priority" / §4.5 "Writer".
struct DataJob {
    remaining: Bytes,
    end_stream: bool,
    done: oneshot::Sender<Result<(), Error>>,
}

/// State shared between the reader task, the writer task, and every
/// application-facing handle. Spec §4.5, §5.
struct Shared {
    role: Role,
    config: Config,
    registry: Registry,
    priority: PriorityTree,
    conn_window: Mutex<ConnectionWindow>,
    /// Wakes the writer task's scheduler whenever something it should
    /// re-examine has changed: new data queued, a send window credited, or
    /// the peer's GOAWAY/INITIAL_WINDOW_SIZE arriving. A single signal
    /// shared by every stream, since only the one writer task ever waits
    /// on it — no per-stream fan-out is needed.
    data_ready: Notify,
    peer_goaway: AtomicBool,
    remote_enable_push: AtomicBool,
    remote_initial_window_size: AtomicU32,
    remote_max_frame_size: AtomicU32,
    writer_tx: mpsc::UnboundedSender<WriteCommand>,
    incoming_tx: mpsc::UnboundedSender<IncomingRequest>,
    push_tx: mpsc::UnboundedSender<IncomingPush>,
    response_waiters: DashMap<StreamId, oneshot::Sender<Result<ClientResponse, Error>>>,
    pending_trailers: DashMap<StreamId, oneshot::Sender<HeaderList>>,
    /// Body receivers created by `Registry::accept_remote_stream` (or
    /// `open_local_stream`, for a push) before the owning `IncomingRequest`/
    /// `IncomingPush`/`ClientResponse` can be built — the header block may
    /// still be spanning CONTINUATION frames when the stream is registered.
    pending_body_rxs: DashMap<StreamId, mpsc::UnboundedReceiver<Bytes>>,
    /// Outbound DATA queued by `StreamHandle::send_data`, per stream, and
    /// each stream's accumulated scheduling credit — the writer's priority
    /// scheduler consults both (spec §4.4 "Priority"; deficit-round-robin
    /// weighting grounded on `SeleniaProject-Selenia-Web-Server-SWS`'s
    /// `PriorityTree`/`Scheduler`, which the teacher never implemented at
    /// all — PRIORITY frames only updated bookkeeping, never influenced
    /// write order).
    pending_data: DashMap<StreamId, VecDeque<DataJob>>,
    sched_credit: DashMap<StreamId, i64>,
}

impl Shared {
    fn remote_initial_window(&self) -> u32 {
        self.remote_initial_window_size.load(Ordering::SeqCst)
    }

    fn local_initial_window(&self) -> u32 {
        self.config.local_settings.initial_window_size()
    }

    /// Eagerly top up the connection receive window once it's drained past
    /// half, scaled by how many streams are sharing it (spec §4.3).
    fn maybe_emit_connection_window_update(&self) {
        let active = self.registry.active_count().max(1) as i64;
        let initial = i64::from(self.local_initial_window());
        let threshold = active * initial / 2;
        let mut window = self.conn_window.lock().unwrap();
        if window.recv_window() <= initial - threshold {
            let amount = (initial - window.recv_window()).max(0) as u32;
            window.replenish_recv(amount);
            drop(window);
            let _ = self.writer_tx.send(WriteCommand::ConnectionWindowUpdate { increment: amount });
        }
    }

    /// Drop a stream's registry entry once both directions have closed it.
    /// The RST_STREAM write path has always done this; normal completion
    /// (each side sends its own END_STREAM) reaches `Closed` the same way
    /// and needs the same cleanup, or the registry would hold every
    /// completed stream for the life of the connection (spec §4.4/§5).
    fn recycle_if_closed(&self, stream_id: StreamId) {
        if self.registry.with_stream(stream_id, |s| s.state()) == Some(StreamState::Closed) {
            self.registry.remove(stream_id);
            self.pending_data.remove(&stream_id);
            self.sched_credit.remove(&stream_id);
        }
    }
}

/// A live HTTP/2 connection over any `AsyncRead + AsyncWrite` transport (a
/// TLS stream in production, `tokio::io::duplex` in tests). Spec §4.5.
pub struct Connection {
    shared: Arc<Shared>,
    incoming_rx: mpsc::UnboundedReceiver<IncomingRequest>,
    push_rx: mpsc::UnboundedReceiver<IncomingPush>,
    reader_task: Option<JoinHandle<()>>,
    writer_task: Option<JoinHandle<()>>,
}

impl Connection {
    /// Perform the server half of the startup handshake (spec §4.5
    /// "Startup") and spawn the driver tasks.
    pub async fn open_server<S>(transport: S, config: Config) -> Result<Self, Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::open(transport, config, Role::Server).await
    }

    /// Perform the client half of the startup handshake and spawn the
    /// driver tasks.
    pub async fn open_client<S>(transport: S, config: Config) -> Result<Self, Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::open(transport, config, Role::Client).await
    }

    async fn open<S>(transport: S, config: Config, role: Role) -> Result<Self, Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, mut writer) = split(transport);

        if role == Role::Server {
            let mut preface = [0u8; 24];
            timeout(
                config.settings_ack_timeout,
                tokio::io::AsyncReadExt::read_exact(&mut reader, &mut preface),
            )
            .await
            .map_err(|_| Error::connection(ErrorCode::SettingsTimeout, "timed out waiting for client preface"))?
            .map_err(|e| Error::connection(ErrorCode::ProtocolError, format!("failed reading preface: {e}")))?;
            if preface != PREFACE {
                return Err(Error::connection(ErrorCode::ProtocolError, "bad HTTP/2 connection preface"));
            }
        } else {
            tokio::io::AsyncWriteExt::write_all(&mut writer, PREFACE)
                .await
                .map_err(|e| Error::connection(ErrorCode::InternalError, format!("failed writing preface: {e}")))?;
        }

        let local_settings = config.local_settings;
        let our_settings_frame = Frame::Settings {
            ack: false,
            params: vec![
                (SettingsParameter::HeaderTableSize, local_settings.header_table_size()),
                (SettingsParameter::EnablePush, u32::from(local_settings.enable_push())),
                (SettingsParameter::MaxConcurrentStreams, local_settings.max_concurrent_streams()),
                (SettingsParameter::InitialWindowSize, local_settings.initial_window_size()),
                (SettingsParameter::MaxFrameSize, local_settings.max_frame_size()),
                (SettingsParameter::MaxHeaderListSize, local_settings.max_header_list_size()),
            ],
        };
        frame::write_frame(&mut writer, &our_settings_frame)
            .await
            .map_err(|e| Error::connection(ErrorCode::InternalError, format!("failed writing SETTINGS: {e}")))?;

        // RFC 7540 §3.5: the very first frame from the peer must be SETTINGS.
        let first = timeout(
            config.settings_ack_timeout,
            frame::read_frame(&mut reader, local_settings.max_frame_size()),
        )
        .await
        .map_err(|_| Error::connection(ErrorCode::SettingsTimeout, "timed out waiting for peer's initial SETTINGS"))?
        .map_err(|e| Error::connection(ErrorCode::InternalError, format!("transport error: {e}")))?
        .ok_or_else(|| Error::connection(ErrorCode::ProtocolError, "connection closed before initial SETTINGS"))?
        .map_err(Error::escalate)?;

        let Frame::Settings { ack: false, params } = first else {
            return Err(Error::connection(ErrorCode::ProtocolError, "first frame from peer was not SETTINGS"));
        };

        let mut remote = Settings::default();
        for (param, value) in &params {
            if !Settings::validate(*param, *value) {
                return Err(Error::connection(ErrorCode::ProtocolError, "invalid SETTINGS value from peer"));
            }
            remote.set(*param, *value);
        }

        // Acknowledge the peer's SETTINGS immediately; our own remains
        // unacknowledged on the wire until the peer's ACK arrives, which the
        // reader task simply logs (spec leaves the ack timeout unenforced
        // past startup, since a caller can always `close()` a stalled peer).
        frame::write_frame(&mut writer, &Frame::Settings { ack: true, params: vec![] })
            .await
            .map_err(|e| Error::connection(ErrorCode::InternalError, format!("failed writing SETTINGS ack: {e}")))?;

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (push_tx, push_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            role,
            config: config.clone(),
            registry: Registry::new(role, local_settings.max_concurrent_streams()),
            priority: PriorityTree::new(),
            conn_window: Mutex::new(ConnectionWindow::new(
                crate::settings::DEFAULT_INITIAL_WINDOW_SIZE,
                crate::settings::DEFAULT_INITIAL_WINDOW_SIZE,
            )),
            data_ready: Notify::new(),
            peer_goaway: AtomicBool::new(false),
            remote_enable_push: AtomicBool::new(remote.enable_push()),
            remote_initial_window_size: AtomicU32::new(remote.initial_window_size()),
            remote_max_frame_size: AtomicU32::new(remote.max_frame_size()),
            writer_tx,
            incoming_tx,
            push_tx,
            response_waiters: DashMap::new(),
            pending_trailers: DashMap::new(),
            pending_body_rxs: DashMap::new(),
            pending_data: DashMap::new(),
            sched_credit: DashMap::new(),
        });
        shared.registry.set_peer_max_concurrent_streams(remote.max_concurrent_streams());

        let writer_task = tokio::spawn(run_writer(
            writer,
            shared.clone(),
            writer_rx,
            remote.header_table_size() as usize,
        ));
        let reader_task = tokio::spawn(run_reader(
            reader,
            shared.clone(),
            local_settings.max_frame_size(),
            local_settings.header_table_size() as usize,
        ));

        Ok(Self {
            shared,
            incoming_rx,
            push_rx,
            reader_task: Some(reader_task),
            writer_task: Some(writer_task),
        })
    }

    /// Accept the next inbound request (server role). Resolves to `None`
    /// once the reader task has shut down.
    pub async fn accept(&mut self) -> Option<IncomingRequest> {
        self.incoming_rx.recv().await
    }

    /// Accept the next pushed response (client role, opted into pushes).
    pub async fn accept_push(&mut self) -> Option<IncomingPush> {
        self.push_rx.recv().await
    }

    /// Issue a request (client role) and await its response headers. The
    /// response body then streams through the returned [`BodyReader`].
    pub async fn request(&self, req: ClientRequest) -> Result<ClientResponse, Error> {
        validate_headers(&req.headers, true, false, Scope::Connection)?;
        let initial_send = self.shared.remote_initial_window();
        let initial_recv = self.shared.local_initial_window();
        let (stream_id, body_rx) = self.shared.registry.open_local_stream(initial_send, initial_recv)?;
        self.shared.pending_body_rxs.insert(stream_id, body_rx);

        let (resp_tx, resp_rx) = oneshot::channel();
        self.shared.response_waiters.insert(stream_id, resp_tx);

        let end_stream_at_headers = req.body.is_none() && req.end_stream_after_headers;
        self.shared
            .writer_tx
            .send(WriteCommand::Headers {
                stream_id,
                headers: req.headers,
                end_stream: end_stream_at_headers,
                priority: None,
            })
            .map_err(|_| writer_gone())?;

        if let Some(body) = req.body {
            let handle = StreamHandle {
                stream_id,
                shared: self.shared.clone(),
            };
            handle.send_data(body, req.end_stream_after_headers).await?;
        }

        match resp_rx.await {
            Ok(result) => result,
            Err(_) => Err(Error::connection(ErrorCode::InternalError, "connection closed before response arrived")),
        }
    }

    /// Serve inbound requests with `handler` until the connection closes.
    /// A thin convenience loop over [`Connection::accept`] matching spec
    /// §6's server entry point, sparing callers the channel plumbing.
    pub async fn serve<F, Fut>(&mut self, mut handler: F)
    where
        F: FnMut(IncomingRequest) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        while let Some(req) = self.accept().await {
            tokio::spawn(handler(req));
        }
    }

    /// Get a send handle for a stream already known to the registry
    /// (typically the one carried by an [`IncomingRequest`]).
    #[must_use]
    pub fn stream_handle(&self, stream_id: StreamId) -> StreamHandle {
        StreamHandle {
            stream_id,
            shared: self.shared.clone(),
        }
    }

    /// Send GOAWAY and stop accepting new streams; already-open streams may
    /// finish (spec §5 "graceful shutdown").
    pub fn close(&self, error_code: ErrorCode, debug_data: Bytes) -> Result<(), Error> {
        let last_stream_id = self.shared.registry.highest_remote_id();
        self.shared
            .writer_tx
            .send(WriteCommand::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            })
            .map_err(|_| writer_gone())
    }

    #[must_use]
    pub fn peer_went_away(&self) -> bool {
        self.shared.peer_goaway.load(Ordering::SeqCst)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.shared.writer_tx.send(WriteCommand::Shutdown);
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        if let Some(task) = self.writer_task.take() {
            task.abort();
        }
    }
}

/// Everything the reader task needs on hand while walking frames, kept out
/// of [`Shared`] because it's exclusively owned by this one task — the
/// HPACK decoder chief among them, since only the reader task ever calls it.
struct ReaderState {
    decoder: hpack::Decoder,
    current_header_block: Option<(StreamId, HeaderBlockKind)>,
}

async fn run_reader<R>(mut reader: ReadHalf<R>, shared: Arc<Shared>, max_frame_size: u32, header_table_size: usize)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut state = ReaderState {
        decoder: hpack::Decoder::with_size(header_table_size),
        current_header_block: None,
    };

    loop {
        let frame = match frame::read_frame(&mut reader, max_frame_size).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(err))) => {
                let fatal = err.is_connection_scoped();
                handle_fault(&shared, err);
                if fatal {
                    break;
                }
                continue;
            }
            Ok(None) => {
                debug!("peer closed the connection");
                break;
            }
            Err(err) => {
                error!("transport read error: {err}");
                break;
            }
        };

        trace!("received {}", frame.frame_type_name());

        if let Err(err) = dispatch_frame(&shared, &mut state, frame) {
            let fatal = err.is_connection_scoped();
            handle_fault(&shared, err);
            if fatal {
                break;
            }
        }
    }

    shared.peer_goaway.store(true, Ordering::SeqCst);
    shared.data_ready.notify_waiters();
}

fn handle_fault(shared: &Arc<Shared>, err: Error) {
    match err.scope {
        crate::error::Scope::Connection => {
            warn!("connection error: {err}");
            let _ = shared.writer_tx.send(WriteCommand::GoAway {
                last_stream_id: shared.registry.highest_remote_id(),
                error_code: err.code,
                debug_data: Bytes::from(err.message.clone()),
            });
        }
        crate::error::Scope::Stream(stream_id) => {
            warn!("stream {stream_id} error: {err}");
            let _ = shared.writer_tx.send(WriteCommand::RstStream {
                stream_id,
                error_code: err.code,
            });
            shared.registry.with_stream(stream_id, |s| s.body_tx = None);
            // Wake any waiters for this stream with the actual fault instead
            // of leaving them to hang forever on a stream that will never
            // produce the response/trailers it was promised.
            if let Some((_, tx)) = shared.response_waiters.remove(&stream_id) {
                let _ = tx.send(Err(err.clone()));
            }
            shared.pending_trailers.remove(&stream_id);
            shared.pending_body_rxs.remove(&stream_id);
            // Any DATA the application already queued for this stream will
            // never be written now that it's being reset — fail it instead
            // of silently dropping the caller's `send_data` forever.
            if let Some((_, mut jobs)) = shared.pending_data.remove(&stream_id) {
                for job in jobs.drain(..) {
                    let _ = job.done.send(Err(err.clone()));
                }
            }
            shared.sched_credit.remove(&stream_id);
        }
    }
}

/// Decide whether an unrecognized stream id belongs to a stream that was
/// never opened (a protocol error, RFC 7540 §5.1) or one that has already
/// been closed and removed from the registry. `tolerate_closed` picks the
/// benign outcome for frame types the RFC allows to arrive late
/// (WINDOW_UPDATE, RST_STREAM); everything else is a stream error. Spec §4.4.
fn classify_unknown_stream(shared: &Shared, stream_id: StreamId, tolerate_closed: bool) -> Result<(), Error> {
    if stream_id != CONNECTION_STREAM_ID && stream_id <= shared.registry.highest_remote_id() {
        if tolerate_closed {
            Ok(())
        } else {
            Err(Error::stream(stream_id, ErrorCode::StreamClosed, "frame received for a closed stream"))
        }
    } else {
        Err(Error::connection(ErrorCode::ProtocolError, "frame referenced a stream that was never opened"))
    }
}

fn dispatch_frame(shared: &Arc<Shared>, state: &mut ReaderState, frame: Frame) -> Result<(), Error> {
    if let Some((expected_id, _)) = state.current_header_block {
        let ok = matches!(&frame, Frame::Continuation { stream_id, .. } if *stream_id == expected_id);
        if !ok {
            return Err(Error::connection(
                ErrorCode::ProtocolError,
                "frame interleaved with an in-progress header block",
            ));
        }
    }

    match frame {
        Frame::Data {
            stream_id,
            end_stream,
            data,
            ..
        } => dispatch_data(shared, stream_id, end_stream, data),

        Frame::Headers {
            stream_id,
            end_stream,
            end_headers,
            priority,
            header_block_fragment,
            ..
        } => dispatch_headers(shared, state, stream_id, end_stream, end_headers, priority, header_block_fragment),

        Frame::Priority { stream_id, priority } => {
            shared
                .priority
                .reprioritize(stream_id, priority.dependency, priority.exclusive, priority.weight)?;
            shared.registry.with_stream(stream_id, |s| s.apply_priority(priority));
            Ok(())
        }

        Frame::RstStream { stream_id, error_code } => {
            if !shared.registry.contains(stream_id) {
                return classify_unknown_stream(shared, stream_id, true);
            }
            let result = shared
                .registry
                .with_stream(stream_id, |s| s.transition(true, rst_stream_event()))
                .unwrap_or(Ok(()));
            shared.registry.with_stream(stream_id, |s| s.body_tx = None);
            debug!("stream {stream_id} reset by peer: {error_code:?}");
            // A pending `Connection::request` for this stream would otherwise
            // hang forever: the peer has just told us no response is coming.
            if let Some((_, tx)) = shared.response_waiters.remove(&stream_id) {
                let _ = tx.send(Err(Error::stream(stream_id, error_code, "stream reset by peer")));
            }
            shared.pending_trailers.remove(&stream_id);
            if let Some((_, mut jobs)) = shared.pending_data.remove(&stream_id) {
                let err = Error::stream(stream_id, error_code, "stream reset by peer");
                for job in jobs.drain(..) {
                    let _ = job.done.send(Err(err.clone()));
                }
            }
            shared.sched_credit.remove(&stream_id);
            result
        }

        Frame::Settings { ack, params } => dispatch_settings(shared, ack, params),

        Frame::PushPromise {
            stream_id,
            end_headers,
            promised_stream_id,
            header_block_fragment,
            ..
        } => dispatch_push_promise(shared, state, stream_id, end_headers, promised_stream_id, header_block_fragment),

        Frame::Ping { ack, data } => {
            if !ack {
                let _ = shared.writer_tx.send(WriteCommand::PingAck { data });
            }
            Ok(())
        }

        Frame::GoAway {
            last_stream_id,
            error_code,
            ..
        } => {
            debug!("peer sent GOAWAY: last_stream_id={last_stream_id} error={error_code:?}");
            shared.peer_goaway.store(true, Ordering::SeqCst);
            shared.data_ready.notify_waiters();
            Ok(())
        }

        Frame::WindowUpdate { stream_id, increment } => dispatch_window_update(shared, stream_id, increment),

        Frame::Continuation {
            stream_id,
            end_headers,
            header_block_fragment,
        } => dispatch_continuation(shared, state, stream_id, end_headers, header_block_fragment),

        Frame::Unknown { frame_type, .. } => {
            trace!("ignoring unknown frame type {frame_type:#x}");
            Ok(())
        }
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

fn reserved_remote_event() -> TransitionEvent {
    TransitionEvent {
        is_headers: false,
        is_push_promise: true,
        is_continuation: false,
        is_rst_stream: false,
        is_data: false,
        end_stream: false,
        end_headers: false,
    }
}

/// Event for a HEADERS frame we are about to put on the wire — the send-side
/// mirror of the event `dispatch_headers` builds for a received one.
fn headers_send_event(end_stream: bool) -> TransitionEvent {
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

/// Event for a DATA frame we are about to put on the wire.
fn data_send_event(end_stream: bool) -> TransitionEvent {
    TransitionEvent {
        is_headers: false,
        is_push_promise: false,
        is_continuation: false,
        is_rst_stream: false,
        is_data: true,
        end_stream,
        end_headers: false,
    }
}

/// Event for a PUSH_PROMISE frame we are about to send, applied to the
/// promised stream (moves it `Idle` -> `ReservedLocal`).
fn push_promise_send_event() -> TransitionEvent {
    TransitionEvent {
        is_headers: false,
        is_push_promise: true,
        is_continuation: false,
        is_rst_stream: false,
        is_data: false,
        end_stream: false,
        end_headers: false,
    }
}

fn dispatch_data(shared: &Arc<Shared>, stream_id: StreamId, end_stream: bool, data: Bytes) -> Result<(), Error> {
    if !shared.registry.contains(stream_id) {
        return classify_unknown_stream(shared, stream_id, false);
    }

    let len = data.len() as u32;
    shared.conn_window.lock().unwrap().consume_recv(len)?;

    let event = TransitionEvent {
        is_headers: false,
        is_push_promise: false,
        is_continuation: false,
        is_rst_stream: false,
        is_data: true,
        end_stream,
        end_headers: false,
    };

    let outcome = shared.registry.with_stream(stream_id, |s| -> Result<(), Error> {
        s.window.consume_recv(len)?;
        s.transition(true, event)?;
        s.record_data_received(u64::from(len));
        if let Some(tx) = &s.body_tx {
            let _ = tx.send(data.clone());
        }
        if end_stream {
            s.check_content_length()?;
            s.body_tx = None;
            if let Some((_, tx)) = shared.pending_trailers.remove(&stream_id) {
                let _ = tx.send(HeaderList::new());
            }
        }
        Ok(())
    });

    shared.maybe_emit_connection_window_update();

    match outcome {
        Some(result) => result,
        None => classify_unknown_stream(shared, stream_id, false),
    }
}

fn dispatch_headers(
    shared: &Arc<Shared>,
    state: &mut ReaderState,
    stream_id: StreamId,
    end_stream: bool,
    end_headers: bool,
    priority: Option<PriorityParams>,
    header_block_fragment: Bytes,
) -> Result<(), Error> {
    if let Some(priority) = priority {
        shared
            .priority
            .reprioritize(stream_id, priority.dependency, priority.exclusive, priority.weight)?;
    }

    // A second HEADERS frame on an already-open stream carries trailers; the
    // first carries the request (server), the response (client), or, for a
    // stream the peer reserved with PUSH_PROMISE, the pushed response. Keyed
    // on the stream's state rather than whether `request_headers` has been
    // recorded yet, since a push's promised request headers are stored on
    // the stream before its response ever arrives (spec §4.4).
    let prev_state = shared.registry.with_stream(stream_id, |s| s.state());
    let is_trailers = !matches!(prev_state, None | Some(StreamState::Idle) | Some(StreamState::ReservedRemote));

    if !shared.registry.contains(stream_id) {
        let initial_send = shared.remote_initial_window();
        let initial_recv = shared.local_initial_window();
        let rx = shared.registry.accept_remote_stream(stream_id, initial_send, initial_recv)?;
        shared.pending_body_rxs.insert(stream_id, rx);
    }

    let event = TransitionEvent {
        is_headers: true,
        is_push_promise: false,
        is_continuation: false,
        is_rst_stream: false,
        is_data: false,
        end_stream,
        end_headers,
    };
    match shared.registry.with_stream(stream_id, |s| s.transition(true, event)) {
        Some(Ok(())) => {}
        Some(Err(e)) => return Err(e),
        None => return classify_unknown_stream(shared, stream_id, false),
    }

    shared
        .registry
        .with_stream(stream_id, |s| s.begin_header_block(false, &header_block_fragment, end_headers));

    let kind = HeaderBlockKind::Request { is_trailers, end_stream };
    if end_headers {
        finish_header_block(shared, state, stream_id, kind)
    } else {
        state.current_header_block = Some((stream_id, kind));
        Ok(())
    }
}

fn dispatch_push_promise(
    shared: &Arc<Shared>,
    state: &mut ReaderState,
    stream_id: StreamId,
    end_headers: bool,
    promised_stream_id: StreamId,
    header_block_fragment: Bytes,
) -> Result<(), Error> {
    if !shared.config.local_settings.enable_push() {
        return Err(Error::connection(ErrorCode::ProtocolError, "received PUSH_PROMISE after disabling push"));
    }
    if !shared.registry.contains(stream_id) {
        return classify_unknown_stream(shared, stream_id, false);
    }

    let initial_send = shared.remote_initial_window();
    let initial_recv = shared.local_initial_window();
    let rx = shared.registry.accept_remote_stream(promised_stream_id, initial_send, initial_recv)?;
    if let Some(result) = shared
        .registry
        .with_stream(promised_stream_id, |s| s.transition(true, reserved_remote_event()))
    {
        result?;
    }
    shared.pending_body_rxs.insert(promised_stream_id, rx);

    shared
        .registry
        .with_stream(promised_stream_id, |s| s.begin_header_block(true, &header_block_fragment, end_headers));

    let kind = HeaderBlockKind::Push { promised_stream_id };
    if end_headers {
        finish_header_block(shared, state, promised_stream_id, kind)
    } else {
        state.current_header_block = Some((promised_stream_id, kind));
        Ok(())
    }
}

fn dispatch_continuation(
    shared: &Arc<Shared>,
    state: &mut ReaderState,
    stream_id: StreamId,
    end_headers: bool,
    header_block_fragment: Bytes,
) -> Result<(), Error> {
    let Some((expected_id, kind)) = state.current_header_block else {
        return Err(Error::connection(ErrorCode::ProtocolError, "CONTINUATION with no preceding header block"));
    };
    if expected_id != stream_id {
        return Err(Error::connection(ErrorCode::ProtocolError, "CONTINUATION for the wrong stream"));
    }

    let completed = shared
        .registry
        .with_stream(stream_id, |s| s.append_continuation(&header_block_fragment, end_headers))
        .ok_or_else(|| Error::connection(ErrorCode::ProtocolError, "CONTINUATION for an unknown stream"))?;

    if completed {
        state.current_header_block = None;
        finish_header_block(shared, state, stream_id, kind)
    } else {
        Ok(())
    }
}

/// Decode the assembled header block and deliver it, per spec §6's
/// role-dependent destinations: server → `incoming_tx`, client → fulfill
/// the matching `response_waiters` oneshot, push → `push_tx`.
fn finish_header_block(
    shared: &Arc<Shared>,
    state: &mut ReaderState,
    stream_id: StreamId,
    kind: HeaderBlockKind,
) -> Result<(), Error> {
    let block = shared
        .registry
        .with_stream(stream_id, |s| s.take_header_block())
        .ok_or_else(|| Error::connection(ErrorCode::InternalError, "stream vanished before its header block completed"))?;

    let headers = state.decoder.decode(&block).map_err(Error::escalate)?;

    let list_size: usize = headers.iter().map(HeaderField::size).sum();
    if list_size as u32 > shared.config.local_settings.max_header_list_size() {
        return Err(Error::stream(
            stream_id,
            ErrorCode::ProtocolError,
            "decoded header list exceeds MAX_HEADER_LIST_SIZE",
        ));
    }

    match kind {
        HeaderBlockKind::Request { is_trailers, end_stream } => {
            let is_request = shared.role == Role::Server;
            validate_headers(&headers, is_request && !is_trailers, is_trailers, Scope::Stream(stream_id))?;

            if is_trailers {
                shared.registry.with_stream(stream_id, |s| s.trailing_headers = Some(headers.clone()));
                if let Some((_, tx)) = shared.pending_trailers.remove(&stream_id) {
                    let _ = tx.send(headers);
                }
                return Ok(());
            }

            let is_push_response = shared.role == Role::Client && is_server_initiated(stream_id);
            let content_length_check = shared.registry.with_stream(stream_id, |s| {
                s.content_length = parse_content_length(&headers);
                // For a push stream this HEADERS frame is the response, and
                // `request_headers` already holds the promised request
                // captured off the PUSH_PROMISE; don't clobber it.
                if !is_push_response {
                    s.request_headers = headers.clone();
                }
                if end_stream {
                    Some(s.check_content_length())
                } else {
                    None
                }
            });
            if let Some(Some(Err(e))) = content_length_check {
                return Err(e);
            }

            let body_rx = shared.pending_body_rxs.remove(&stream_id).map(|(_, rx)| rx);
            let (trailer_tx, trailer_rx) = oneshot::channel();
            shared.pending_trailers.insert(stream_id, trailer_tx);

            let Some(rx) = body_rx else {
                return Ok(());
            };
            let body = BodyReader {
                stream_id,
                shared: shared.clone(),
                rx,
                trailers: Some(trailer_rx),
            };

            if shared.role == Role::Server {
                let _ = shared.incoming_tx.send(IncomingRequest {
                    stream_id,
                    headers,
                    body,
                    handle: StreamHandle {
                        stream_id,
                        shared: shared.clone(),
                    },
                });
            } else if is_push_response {
                // This HEADERS frame is the actual response for a stream the
                // peer reserved with PUSH_PROMISE; the promised request
                // headers were captured on the `Push` branch below when the
                // PUSH_PROMISE itself arrived.
                let request_headers = shared
                    .registry
                    .with_stream(stream_id, |s| s.request_headers.clone())
                    .unwrap_or_default();
                let _ = shared.push_tx.send(IncomingPush {
                    promised_stream_id: stream_id,
                    request_headers,
                    response_headers: headers,
                    body,
                });
            } else if let Some((_, tx)) = shared.response_waiters.remove(&stream_id) {
                let _ = tx.send(Ok(ClientResponse { headers, body }));
            }
            Ok(())
        }
        HeaderBlockKind::Push { promised_stream_id } => {
            // The PUSH_PROMISE header block carries the promised *request*,
            // not a response (spec §4.4); stash it on the reserved stream
            // and wait for the real response to arrive as an ordinary
            // HEADERS frame, handled by the `Request` branch above.
            validate_headers(&headers, true, false, Scope::Stream(promised_stream_id))?;
            shared.registry.with_stream(promised_stream_id, |s| s.request_headers = headers.clone());
            Ok(())
        }
    }
}

fn dispatch_settings(shared: &Arc<Shared>, ack: bool, params: Vec<(SettingsParameter, u32)>) -> Result<(), Error> {
    if ack {
        trace!("peer acknowledged our SETTINGS");
        return Ok(());
    }
    for (param, value) in &params {
        if !Settings::validate(*param, *value) {
            return Err(Error::connection(ErrorCode::ProtocolError, "invalid SETTINGS value from peer"));
        }
    }
    for (param, value) in params.iter().copied() {
        match param {
            SettingsParameter::EnablePush => shared.remote_enable_push.store(value != 0, Ordering::SeqCst),
            SettingsParameter::MaxConcurrentStreams => shared.registry.set_peer_max_concurrent_streams(value),
            SettingsParameter::MaxFrameSize => shared.remote_max_frame_size.store(value, Ordering::SeqCst),
            SettingsParameter::InitialWindowSize => {
                let previous = shared.remote_initial_window_size.swap(value, Ordering::SeqCst);
                let delta = i64::from(value) - i64::from(previous);
                shared.registry.apply_initial_window_delta(delta);
                shared.data_ready.notify_waiters();
            }
            SettingsParameter::HeaderTableSize => {
                let _ = shared.writer_tx.send(WriteCommand::ResizeDynamicTable {
                    new_max_size: value as usize,
                });
            }
            SettingsParameter::MaxHeaderListSize => {}
        }
    }
    shared.writer_tx.send(WriteCommand::SettingsAck).map_err(|_| writer_gone())
}

fn dispatch_window_update(shared: &Arc<Shared>, stream_id: StreamId, increment: u32) -> Result<(), Error> {
    if stream_id == CONNECTION_STREAM_ID {
        let mut window = shared.conn_window.lock().unwrap();
        window.credit_send(increment)?;
        drop(window);
        shared.data_ready.notify_waiters();
        return Ok(());
    }

    if !shared.registry.contains(stream_id) {
        return classify_unknown_stream(shared, stream_id, true);
    }

    let result = shared
        .registry
        .with_stream(stream_id, |s| s.window.credit_send(increment))
        .unwrap_or(Ok(()));
    if result.is_ok() {
        shared.data_ready.notify_waiters();
    }
    result
}

/// Owns the HPACK encoder and every outbound frame, draining one
/// [`WriteCommand`] to completion before dequeuing the next (the mechanism
/// behind header-block atomicity on the send side — spec §4.5 "Writer").
async fn run_writer<W>(
    mut writer: WriteHalf<W>,
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<WriteCommand>,
    initial_dynamic_table_size: usize,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut encoder = hpack::Encoder::with_size(initial_dynamic_table_size);

    loop {
        // Control frames (headers, resets, window updates, GOAWAY, ...)
        // always take priority over scheduling another DATA frame, and
        // draining one to completion before the next `try_recv` is what
        // gives header-block atomicity "for free" on the send side.
        match rx.try_recv() {
            Ok(command) => {
                if matches!(command, WriteCommand::Shutdown) {
                    break;
                }
                if !run_write_command(&mut writer, &mut encoder, &shared, command).await {
                    break;
                }
                continue;
            }
            Err(mpsc::error::TryRecvError::Disconnected) => break,
            Err(mpsc::error::TryRecvError::Empty) => {}
        }

        match write_one_scheduled_data_frame(&mut writer, &shared).await {
            Some(Ok(())) => continue,
            Some(Err(err)) => {
                error!("transport write error: {err}");
                break;
            }
            None => {}
        }

        // Nothing immediately writable: block until either a control
        // command arrives or something the scheduler should re-examine
        // changes (spec §5 "suspension points" — writing, here).
        tokio::select! {
            biased;
            maybe_command = rx.recv() => {
                match maybe_command {
                    Some(WriteCommand::Shutdown) | None => break,
                    Some(command) => {
                        if !run_write_command(&mut writer, &mut encoder, &shared, command).await {
                            break;
                        }
                    }
                }
            }
            () = shared.data_ready.notified() => {}
        }
    }
}

/// Execute one non-DATA [`WriteCommand`]; returns `false` on a transport
/// error (caller should stop the writer task).
async fn run_write_command<W>(writer: &mut W, encoder: &mut hpack::Encoder, shared: &Arc<Shared>, command: WriteCommand) -> bool
where
    W: AsyncWrite + Unpin,
{
    let result: std::io::Result<()> = match command {
        WriteCommand::Headers {
            stream_id,
            headers,
            end_stream,
            priority,
        } => write_header_block(writer, encoder, shared, stream_id, &headers, end_stream, priority).await,

        WriteCommand::PushPromise {
            stream_id,
            promised_stream_id,
            headers,
        } => write_push_promise(writer, encoder, shared, stream_id, promised_stream_id, &headers).await,

        WriteCommand::RstStream { stream_id, error_code } => {
            shared.registry.remove(stream_id);
            if let Some((_, mut jobs)) = shared.pending_data.remove(&stream_id) {
                let err = Error::stream(stream_id, error_code, "stream reset locally");
                for job in jobs.drain(..) {
                    let _ = job.done.send(Err(err.clone()));
                }
            }
            shared.sched_credit.remove(&stream_id);
            frame::write_frame(writer, &Frame::RstStream { stream_id, error_code }).await
        }

        WriteCommand::WindowUpdate { stream_id, increment } => {
            frame::write_frame(writer, &Frame::WindowUpdate { stream_id, increment }).await
        }

        WriteCommand::ConnectionWindowUpdate { increment } => {
            frame::write_frame(
                writer,
                &Frame::WindowUpdate {
                    stream_id: CONNECTION_STREAM_ID,
                    increment,
                },
            )
            .await
        }

        WriteCommand::SettingsAck => frame::write_frame(writer, &Frame::Settings { ack: true, params: vec![] }).await,

        WriteCommand::PingAck { data } => frame::write_frame(writer, &Frame::Ping { ack: true, data }).await,

        WriteCommand::GoAway {
            last_stream_id,
            error_code,
            debug_data,
        } => {
            let outcome = frame::write_frame(
                writer,
                &Frame::GoAway {
                    last_stream_id,
                    error_code,
                    debug_data,
                },
            )
            .await;
            shared.peer_goaway.store(true, Ordering::SeqCst);
            outcome
        }

        WriteCommand::ResizeDynamicTable { new_max_size } => {
            encoder.set_max_dynamic_table_size(new_max_size);
            Ok(())
        }

        WriteCommand::Shutdown => unreachable!("Shutdown is handled by the caller before dispatch"),
    };

    if let Err(err) = result {
        error!("transport write error: {err}");
        false
    } else {
        true
    }
}

/// Fallback chunk size for HEADERS/PUSH_PROMISE/DATA fragmentation before
/// the peer's MAX_FRAME_SIZE is known to be any larger than the RFC floor.
const MIN_FRAME_SIZE: usize = 16_384;

/// Weighted deficit-round-robin quantum subtracted from the winning
/// stream's credit each time it's picked — RFC 7540 weights range 1..256,
/// so one quantum roughly amortizes to "served in proportion to weight"
/// over repeated rounds without tracking fractional credit.
const SCHEDULER_QUANTUM: i64 = 256;

/// Pick the next stream with sendable DATA, honoring RFC 7540 §5.3:
/// a stream with an ancestor that itself has sendable data yields to that
/// ancestor first ("parent blocks children"), and among the rest, streams
/// accumulate scheduling credit proportional to their weight each round
/// (deficit round-robin) so higher-weighted streams are picked more often
/// without starving lighter ones. Grounded on
/// `SeleniaProject-Selenia-Web-Server-SWS`'s `PriorityTree`/`Scheduler`
/// (the teacher never scheduled DATA by priority at all — PRIORITY frames
/// only updated bookkeeping that nothing else consulted).
fn pick_next_data_stream(shared: &Shared) -> Option<StreamId> {
    let ready: Vec<StreamId> = shared
        .pending_data
        .iter()
        .filter(|e| e.value().front().is_some())
        .map(|e| *e.key())
        .collect();
    if ready.is_empty() {
        return None;
    }
    let ready_set: std::collections::HashSet<StreamId> = ready.iter().copied().collect();

    let conn_budget = shared.conn_window.lock().unwrap().send_window();
    let eligible: Vec<StreamId> = ready
        .into_iter()
        .filter(|&id| {
            let needs_window = shared
                .pending_data
                .get(&id)
                .and_then(|q| q.front().map(|j| !j.remaining.is_empty()))
                .unwrap_or(false);
            if needs_window {
                let stream_budget = shared.registry.with_stream(id, |s| s.window.send_window()).unwrap_or(0);
                if stream_budget <= 0 || conn_budget <= 0 {
                    return false;
                }
            }
            !shared.priority.is_blocked(id, |ancestor| ready_set.contains(&ancestor))
        })
        .collect();
    if eligible.is_empty() {
        return None;
    }

    for &id in &eligible {
        let weight = i64::from(shared.priority.weight(id)) + 1;
        *shared.sched_credit.entry(id).or_insert(0) += weight;
    }
    let winner = *eligible.iter().max_by_key(|id| *shared.sched_credit.get(id).unwrap())?;
    if let Some(mut credit) = shared.sched_credit.get_mut(&winner) {
        *credit -= SCHEDULER_QUANTUM;
    }
    Some(winner)
}

/// Drain and send exactly one DATA frame's worth of work from whichever
/// stream the scheduler currently favors. Returns `None` if nothing is
/// presently schedulable (caller should wait for a wake-up), `Some(Ok(()))`
/// after writing a frame, `Some(Err(_))` on a transport failure.
async fn write_one_scheduled_data_frame<W>(writer: &mut W, shared: &Arc<Shared>) -> Option<std::io::Result<()>>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let stream_id = pick_next_data_stream(shared)?;
        let max_frame_size = shared.remote_max_frame_size.load(Ordering::SeqCst).max(MIN_FRAME_SIZE as u32) as usize;

        let Some(mut entry) = shared.pending_data.get_mut(&stream_id) else {
            continue;
        };
        let Some(job) = entry.front_mut() else {
            drop(entry);
            continue;
        };

        if job.done.is_closed() {
            // The caller cancelled this send_data before it went out; drop
            // whatever of it was never written and move on (spec §4.3
            // "Suspended writes are cancellation-aware").
            entry.pop_front();
            continue;
        }

        if job.remaining.is_empty() {
            let end_stream = job.end_stream;
            let done = entry.pop_front().unwrap().done;
            drop(entry);
            let result = frame::write_frame(
                writer,
                &Frame::Data {
                    stream_id,
                    end_stream,
                    data: Bytes::new(),
                    padded: None,
                },
            )
            .await;
            if end_stream && result.is_ok() {
                finalize_data_send(shared, stream_id);
            }
            let _ = done.send(translate_write_result(&result, stream_id));
            return Some(result);
        }

        let stream_budget = shared.registry.with_stream(stream_id, |s| s.window.send_window()).unwrap_or(0).max(0) as usize;
        let conn_budget = shared.conn_window.lock().unwrap().send_window().max(0) as usize;
        let budget = stream_budget.min(conn_budget).min(max_frame_size);
        if budget == 0 {
            // The scheduler's eligibility check raced with a concurrent
            // consumer of the same budget; retry on the next wake-up.
            drop(entry);
            return None;
        }

        let chunk_len = budget.min(job.remaining.len());
        let chunk = job.remaining.split_to(chunk_len);
        let is_last_chunk = job.remaining.is_empty();
        let end_stream_this_frame = is_last_chunk && job.end_stream;
        let done = if is_last_chunk { Some(entry.pop_front().unwrap().done) } else { None };
        drop(entry);

        shared.registry.with_stream(stream_id, |s| s.window.consume_send(chunk_len as u32));
        shared.conn_window.lock().unwrap().consume_send(chunk_len as u32);

        let result = frame::write_frame(
            writer,
            &Frame::Data {
                stream_id,
                end_stream: end_stream_this_frame,
                data: chunk,
                padded: None,
            },
        )
        .await;

        if end_stream_this_frame && result.is_ok() {
            finalize_data_send(shared, stream_id);
        }
        if let Some(done_tx) = done {
            let _ = done_tx.send(translate_write_result(&result, stream_id));
        }
        return Some(result);
    }
}

fn translate_write_result(result: &std::io::Result<()>, stream_id: StreamId) -> Result<(), Error> {
    match result {
        Ok(()) => Ok(()),
        Err(e) => Err(Error::stream(stream_id, ErrorCode::InternalError, format!("transport write error: {e}"))),
    }
}

/// Apply the local END_STREAM transition once a DATA frame carrying it has
/// actually gone out, and recycle the stream if that closed it — the
/// send-side mirror of what `dispatch_data` does for an inbound frame.
fn finalize_data_send(shared: &Arc<Shared>, stream_id: StreamId) {
    if let Some(Err(e)) = shared
        .registry
        .with_stream(stream_id, |s| s.transition(false, data_send_event(true)))
    {
        warn!("local DATA on stream {stream_id} violated its own state machine: {e}");
    }
    shared.recycle_if_closed(stream_id);
}

async fn write_header_block<W>(
    writer: &mut W,
    encoder: &mut hpack::Encoder,
    shared: &Arc<Shared>,
    stream_id: StreamId,
    headers: &HeaderList,
    end_stream: bool,
    priority: Option<PriorityParams>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if let Some(Err(e)) = shared
        .registry
        .with_stream(stream_id, |s| s.transition(false, headers_send_event(end_stream)))
    {
        warn!("local HEADERS on stream {stream_id} violated its own state machine: {e}");
    }
    shared.recycle_if_closed(stream_id);

    let encoded = encoder.encode(headers);
    let max_frame_size = shared.remote_max_frame_size.load(Ordering::SeqCst).max(MIN_FRAME_SIZE as u32) as usize;

    let first_len = encoded.len().min(max_frame_size);
    let end_headers = encoded.len() <= max_frame_size;
    frame::write_frame(
        writer,
        &Frame::Headers {
            stream_id,
            end_stream,
            end_headers,
            priority,
            padded: None,
            header_block_fragment: encoded.slice(0..first_len),
        },
    )
    .await?;

    let mut offset = first_len;
    while offset < encoded.len() {
        let chunk_len = (encoded.len() - offset).min(max_frame_size);
        let last = offset + chunk_len == encoded.len();
        frame::write_frame(
            writer,
            &Frame::Continuation {
                stream_id,
                end_headers: last,
                header_block_fragment: encoded.slice(offset..offset + chunk_len),
            },
        )
        .await?;
        offset += chunk_len;
    }
    Ok(())
}

async fn write_push_promise<W>(
    writer: &mut W,
    encoder: &mut hpack::Encoder,
    shared: &Arc<Shared>,
    stream_id: StreamId,
    promised_stream_id: StreamId,
    headers: &HeaderList,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if let Some(Err(e)) = shared
        .registry
        .with_stream(promised_stream_id, |s| s.transition(false, push_promise_send_event()))
    {
        warn!("local PUSH_PROMISE for stream {promised_stream_id} violated its own state machine: {e}");
    }

    let encoded = encoder.encode(headers);
    let max_frame_size = shared.remote_max_frame_size.load(Ordering::SeqCst).max(MIN_FRAME_SIZE as u32) as usize;

    let first_len = encoded.len().min(max_frame_size);
    let end_headers = encoded.len() <= max_frame_size;
    frame::write_frame(
        writer,
        &Frame::PushPromise {
            stream_id,
            end_headers,
            padded: None,
            promised_stream_id,
            header_block_fragment: encoded.slice(0..first_len),
        },
    )
    .await?;

    let mut offset = first_len;
    while offset < encoded.len() {
        let chunk_len = (encoded.len() - offset).min(max_frame_size);
        let last = offset + chunk_len == encoded.len();
        frame::write_frame(
            writer,
            &Frame::Continuation {
                stream_id,
                end_headers: last,
                header_block_fragment: encoded.slice(offset..offset + chunk_len),
            },
        )
        .await?;
        offset += chunk_len;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HeaderField;

    fn req_headers() -> HeaderList {
        vec![
            HeaderField::new(Bytes::from_static(b":method"), Bytes::from_static(b"GET")),
            HeaderField::new(Bytes::from_static(b":scheme"), Bytes::from_static(b"https")),
            HeaderField::new(Bytes::from_static(b":authority"), Bytes::from_static(b"example.com")),
            HeaderField::new(Bytes::from_static(b":path"), Bytes::from_static(b"/")),
        ]
    }

    #[tokio::test]
    async fn handshake_completes_over_a_duplex_pipe() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let client = tokio::spawn(Connection::open_client(client_io, Config::client()));
        let server = tokio::spawn(Connection::open_server(server_io, Config::server()));
        let (client, server) = tokio::join!(client, server);
        client.unwrap().unwrap();
        server.unwrap().unwrap();
    }

    #[tokio::test]
    async fn simple_get_round_trip() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_res, server_res) = tokio::join!(
            Connection::open_client(client_io, Config::client()),
            Connection::open_server(server_io, Config::server()),
        );
        let client = client_res.unwrap();
        let mut server = server_res.unwrap();

        let server_task = tokio::spawn(async move {
            let mut req = server.accept().await.expect("request arrives");
            let _ = req.body.read_to_end().await;
            req.handle
                .send_headers(
                    vec![HeaderField::new(Bytes::from_static(b":status"), Bytes::from_static(b"200"))],
                    true,
                )
                .unwrap();
            server
        });

        let response = client
            .request(ClientRequest {
                headers: req_headers(),
                body: None,
                end_stream_after_headers: true,
            })
            .await
            .expect("response arrives");

        assert_eq!(response.headers[0].name.as_ref(), b":status");
        assert_eq!(response.headers[0].value.as_ref(), b"200");

        let _server = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn post_with_body_round_trip() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_res, server_res) = tokio::join!(
            Connection::open_client(client_io, Config::client()),
            Connection::open_server(server_io, Config::server()),
        );
        let client = client_res.unwrap();
        let mut server = server_res.unwrap();

        let server_task = tokio::spawn(async move {
            let mut req = server.accept().await.expect("request arrives");
            let body = req.body.read_to_end().await;
            assert_eq!(body.as_ref(), b"hello world");
            req.handle
                .send_headers(
                    vec![HeaderField::new(Bytes::from_static(b":status"), Bytes::from_static(b"201"))],
                    false,
                )
                .unwrap();
            req.handle.send_data(Bytes::from_static(b"created"), true).await.unwrap();
            server
        });

        let mut headers = vec![
            HeaderField::new(Bytes::from_static(b":method"), Bytes::from_static(b"POST")),
            HeaderField::new(Bytes::from_static(b":scheme"), Bytes::from_static(b"https")),
            HeaderField::new(Bytes::from_static(b":authority"), Bytes::from_static(b"example.com")),
            HeaderField::new(Bytes::from_static(b":path"), Bytes::from_static(b"/items")),
        ];
        headers.push(HeaderField::new(Bytes::from_static(b"content-length"), Bytes::from_static(b"11")));

        let mut response = client
            .request(ClientRequest {
                headers,
                body: Some(Bytes::from_static(b"hello world")),
                end_stream_after_headers: true,
            })
            .await
            .expect("response arrives");

        let body = response.body.read_to_end().await;
        assert_eq!(body.as_ref(), b"created");

        let _server = server_task.await.unwrap();
    }

    /// A request whose `content-length` promises a body but whose HEADERS
    /// frame carries END_STREAM (no DATA ever follows) must still fail the
    /// content-length check, not just the DATA-then-END_STREAM path.
    #[tokio::test]
    async fn content_length_mismatch_with_no_body_resets_the_stream() {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (client_res, server_res) = tokio::join!(
            Connection::open_client(client_io, Config::client()),
            Connection::open_server(server_io, Config::server()),
        );
        let client = client_res.unwrap();
        let server = server_res.unwrap();

        let mut headers = req_headers();
        headers.push(HeaderField::new(Bytes::from_static(b"content-length"), Bytes::from_static(b"5")));

        let err = client
            .request(ClientRequest {
                headers,
                body: None,
                end_stream_after_headers: true,
            })
            .await
            .expect_err("peer must reject the mismatched content-length");
        assert_eq!(err.code, ErrorCode::ProtocolError);

        drop(server);
    }

    /// A zero-length WINDOW_UPDATE on a stream is a stream-scoped
    /// PROTOCOL_ERROR (RFC 7540 §6.9): the reader must RST_STREAM that one
    /// stream and keep serving the rest of the connection, not GOAWAY.
    #[tokio::test]
    async fn zero_length_stream_window_update_resets_only_its_stream() {
        use tokio::io::AsyncWriteExt;

        let (mut client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server_task = tokio::spawn(Connection::open_server(server_io, Config::server()));

        client_io.write_all(PREFACE).await.unwrap();
        frame::write_frame(&mut client_io, &Frame::Settings { ack: false, params: vec![] })
            .await
            .unwrap();
        frame::read_frame(&mut client_io, 16_384).await.unwrap().unwrap().unwrap();
        let ack = frame::read_frame(&mut client_io, 16_384).await.unwrap().unwrap().unwrap();
        assert!(matches!(ack, Frame::Settings { ack: true, .. }));

        let mut encoder = hpack::Encoder::default();
        let block = encoder.encode(&req_headers());
        frame::write_frame(
            &mut client_io,
            &Frame::Headers {
                stream_id: 1,
                end_stream: true,
                end_headers: true,
                priority: None,
                padded: None,
                header_block_fragment: block,
            },
        )
        .await
        .unwrap();

        frame::write_frame(&mut client_io, &Frame::WindowUpdate { stream_id: 1, increment: 0 })
            .await
            .unwrap();

        let reset = loop {
            match frame::read_frame(&mut client_io, 16_384).await.unwrap().unwrap().unwrap() {
                Frame::RstStream { stream_id, error_code } => break (stream_id, error_code),
                Frame::GoAway { .. } => panic!("connection went away on a stream-scoped fault"),
                _ => continue,
            }
        };
        assert_eq!(reset, (1, ErrorCode::ProtocolError));

        let mut encoder2 = hpack::Encoder::default();
        let block2 = encoder2.encode(&req_headers());
        frame::write_frame(
            &mut client_io,
            &Frame::Headers {
                stream_id: 3,
                end_stream: true,
                end_headers: true,
                priority: None,
                padded: None,
                header_block_fragment: block2,
            },
        )
        .await
        .unwrap();

        let mut server = server_task.await.unwrap().unwrap();
        let req = server.accept().await.expect("the second stream still arrives despite the first's reset");
        assert_eq!(req.stream_id, 3);
    }
}
