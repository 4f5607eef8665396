//! Concurrent stream table, replacing the teacher's `stream_coordinator.rs`.
//! Spec §4.4 id-allocation and concurrency-limit rules.

use crate::error::{Error, ErrorCode};
use crate::stream::Stream;
use crate::types::{is_client_initiated, is_server_initiated, StreamId};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::mpsc;

/// Which side of the connection this endpoint plays; determines which half
/// of the id space we allocate from and which half the peer allocates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    fn first_local_id(self) -> StreamId {
        match self {
            Role::Client => 1,
            Role::Server => 2,
        }
    }

    fn is_remote_initiated(self, id: StreamId) -> bool {
        match self {
            Role::Client => is_server_initiated(id),
            Role::Server => is_client_initiated(id),
        }
    }
}

/// The stream table plus the id-allocation and concurrency bookkeeping
/// spec §4.4 describes as belonging to the "Stream Registry". Backed by
/// `DashMap`, the same shape the teacher's `stream_coordinator.rs` already
/// used for concurrent reader/writer/application access.
pub struct Registry {
    role: Role,
    next_local_id: AtomicU32,
    highest_remote_id: AtomicU32,
    local_max_concurrent_streams: AtomicU32,
    peer_max_concurrent_streams: AtomicU32,
    streams: DashMap<StreamId, Stream>,
}

impl Registry {
    #[must_use]
    pub fn new(role: Role, local_max_concurrent_streams: u32) -> Self {
        Self {
            role,
            next_local_id: AtomicU32::new(role.first_local_id()),
            highest_remote_id: AtomicU32::new(0),
            local_max_concurrent_streams: AtomicU32::new(local_max_concurrent_streams),
            peer_max_concurrent_streams: AtomicU32::new(u32::MAX),
            streams: DashMap::new(),
        }
    }

    pub fn set_peer_max_concurrent_streams(&self, value: u32) {
        self.peer_max_concurrent_streams.store(value, Ordering::SeqCst);
    }

    pub fn set_local_max_concurrent_streams(&self, value: u32) {
        self.local_max_concurrent_streams.store(value, Ordering::SeqCst);
    }

    #[must_use]
    pub fn highest_remote_id(&self) -> StreamId {
        self.highest_remote_id.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn active_count(&self) -> usize {
        self.streams.iter().filter(|e| e.state().is_active()).count()
    }

    /// Allocate and register a stream id this endpoint initiates (an
    /// outbound request on a client, a server push on a server). Rejected
    /// locally (no wire interaction) once the peer's advertised
    /// `MAX_CONCURRENT_STREAMS` would be exceeded.
    pub fn open_local_stream(
        &self,
        initial_send: u32,
        initial_recv: u32,
    ) -> Result<(StreamId, mpsc::UnboundedReceiver<Bytes>), Error> {
        if self.active_count() as u32 >= self.peer_max_concurrent_streams.load(Ordering::SeqCst) {
            return Err(Error::connection(
                ErrorCode::RefusedStream,
                "peer's MAX_CONCURRENT_STREAMS limit reached",
            ));
        }
        let id = self.next_local_id.fetch_add(2, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.insert(id, Stream::new(id, initial_send, initial_recv, tx));
        Ok((id, rx))
    }

    /// Register a stream the peer just opened by sending HEADERS or
    /// PUSH_PROMISE for an id we have not seen before. Enforces strictly
    /// increasing ids and our own `MAX_CONCURRENT_STREAMS` (refused with
    /// `RST_STREAM(REFUSED_STREAM)`, a stream error, per spec §4.4).
    pub fn accept_remote_stream(
        &self,
        stream_id: StreamId,
        initial_send: u32,
        initial_recv: u32,
    ) -> Result<mpsc::UnboundedReceiver<Bytes>, Error> {
        if !self.role.is_remote_initiated(stream_id) {
            return Err(Error::connection(
                ErrorCode::ProtocolError,
                "peer used a stream id reserved for this endpoint",
            ));
        }
        if stream_id <= self.highest_remote_id.load(Ordering::SeqCst) {
            return Err(Error::connection(
                ErrorCode::ProtocolError,
                "stream id is not strictly increasing",
            ));
        }
        if self.active_count() as u32 >= self.local_max_concurrent_streams.load(Ordering::SeqCst) {
            return Err(Error::stream(
                stream_id,
                ErrorCode::RefusedStream,
                "local MAX_CONCURRENT_STREAMS limit reached",
            ));
        }
        self.highest_remote_id.store(stream_id, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams
            .insert(stream_id, Stream::new(stream_id, initial_send, initial_recv, tx));
        Ok(rx)
    }

    pub fn with_stream<T>(&self, id: StreamId, f: impl FnOnce(&mut Stream) -> T) -> Option<T> {
        self.streams.get_mut(&id).map(|mut s| f(&mut s))
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.streams.contains_key(&id)
    }

    pub fn remove(&self, id: StreamId) {
        self.streams.remove(&id);
    }

    /// Apply a SETTINGS_INITIAL_WINDOW_SIZE change to every currently open
    /// stream's send window (RFC 7540 §6.9.2). Callers are responsible for
    /// waking the writer's scheduler afterward, since this type has no
    /// notion of the connection-wide wake signal.
    pub fn apply_initial_window_delta(&self, delta: i64) {
        for mut entry in self.streams.iter_mut() {
            if entry.state().is_active() {
                entry.window.apply_initial_window_delta(delta);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_allocates_odd_ids_starting_at_one() {
        let registry = Registry::new(Role::Client, 100);
        let (first, _rx1) = registry.open_local_stream(65_535, 65_535).unwrap();
        let (second, _rx2) = registry.open_local_stream(65_535, 65_535).unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 3);
    }

    #[test]
    fn server_allocates_even_ids_starting_at_two() {
        let registry = Registry::new(Role::Server, 100);
        let (first, _rx) = registry.open_local_stream(65_535, 65_535).unwrap();
        assert_eq!(first, 2);
    }

    #[test]
    fn remote_stream_must_use_the_opposite_parity() {
        let registry = Registry::new(Role::Server, 100);
        let err = registry.accept_remote_stream(2, 65_535, 65_535).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolError);
    }

    #[test]
    fn remote_stream_ids_must_strictly_increase() {
        let registry = Registry::new(Role::Server, 100);
        registry.accept_remote_stream(1, 65_535, 65_535).unwrap();
        let err = registry.accept_remote_stream(1, 65_535, 65_535).unwrap_err();
        assert_eq!(err.code, ErrorCode::ProtocolError);
    }

    #[test]
    fn local_concurrency_limit_refuses_incoming_stream() {
        let registry = Registry::new(Role::Server, 1);
        registry.accept_remote_stream(1, 65_535, 65_535).unwrap();
        let err = registry.accept_remote_stream(3, 65_535, 65_535).unwrap_err();
        assert_eq!(err.code, ErrorCode::RefusedStream);
    }

    #[test]
    fn peer_concurrency_limit_refuses_outgoing_stream() {
        let registry = Registry::new(Role::Client, 100);
        registry.set_peer_max_concurrent_streams(0);
        let err = registry.open_local_stream(65_535, 65_535).unwrap_err();
        assert_eq!(err.code, ErrorCode::RefusedStream);
    }
}
