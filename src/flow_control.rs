//! Flow-control windows, RFC 7540 §6.9. Spec §4.3.
//!
//! Both the connection and each stream carry one send window (how much we
//! may write before the peer must top it up) and one receive window (how
//! much the peer may write before *we* must top it up). Windows are signed
//! so that a SETTINGS_INITIAL_WINDOW_SIZE decrease can legally drive an
//! open stream's send window negative (RFC 7540 §6.9.2) without that being
//! an error by itself.

use crate::error::{Error, ErrorCode};
use crate::types::{StreamId, CONNECTION_STREAM_ID, U31_MAX};

/// A single flow-control window, shared in spirit by connection- and
/// stream-scope accounting. Kept as a plain `i64` rather than `u32` so a
/// SETTINGS-driven initial-window-size decrease can take it negative
/// without wrapping, per RFC 7540 §6.9.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    value: i64,
}

impl Window {
    #[must_use]
    pub fn new(initial: u32) -> Self {
        Self {
            value: i64::from(initial),
        }
    }

    #[must_use]
    pub fn available(&self) -> i64 {
        self.value
    }

    /// Account for data we (or the peer) sent, consuming window.
    pub fn consume(&mut self, amount: u32) {
        self.value -= i64::from(amount);
    }

    /// Apply a WINDOW_UPDATE increment. Rejects the zero increment (RFC
    /// 7540 §6.9) and overflow past 2^31-1 (RFC 7540 §6.9.1). Both error
    /// constructors are supplied by the caller so the scope (connection vs.
    /// stream) matches whichever window this is.
    pub fn increment(
        &mut self,
        increment: u32,
        zero: impl FnOnce() -> Error,
        overflow: impl FnOnce() -> Error,
    ) -> Result<(), Error> {
        if increment == 0 {
            return Err(zero());
        }
        self.value += i64::from(increment);
        if self.value > i64::from(U31_MAX) {
            return Err(overflow());
        }
        Ok(())
    }

    /// Applied when SETTINGS_INITIAL_WINDOW_SIZE changes: every open
    /// stream's send window shifts by the same delta (RFC 7540 §6.9.2).
    pub fn shift(&mut self, delta: i64) {
        self.value += delta;
    }
}

/// Capability exposed by anything that tracks a flow-control budget: a
/// connection, or a single stream. Kept as a trait (rather than exposing
/// `Window` directly) so callers write `account.consume_send(n)` without
/// caring whether the bookkeeping is connection- or stream-scoped, matching
/// spec §4.3's "windows accessed uniformly" invariant.
pub trait WindowAccount {
    fn send_window(&self) -> i64;
    fn recv_window(&self) -> i64;
    fn consume_send(&mut self, amount: u32);
    fn consume_recv(&mut self, amount: u32) -> Result<(), Error>;
    fn credit_send(&mut self, increment: u32) -> Result<(), Error>;
}

/// Connection-scope flow control: one send and one receive window, with no
/// stream id attached (spec calls this the "session window").
#[derive(Debug, Clone, Copy)]
pub struct ConnectionWindow {
    send: Window,
    recv: Window,
}

impl ConnectionWindow {
    #[must_use]
    pub fn new(initial_send: u32, initial_recv: u32) -> Self {
        Self {
            send: Window::new(initial_send),
            recv: Window::new(initial_recv),
        }
    }
}

impl WindowAccount for ConnectionWindow {
    fn send_window(&self) -> i64 {
        self.send.available()
    }

    fn recv_window(&self) -> i64 {
        self.recv.available()
    }

    fn consume_send(&mut self, amount: u32) {
        self.send.consume(amount);
    }

    fn consume_recv(&mut self, amount: u32) -> Result<(), Error> {
        if i64::from(amount) > self.recv.available() {
            return Err(Error::connection(
                ErrorCode::FlowControlError,
                "peer exceeded the connection receive window",
            ));
        }
        self.recv.consume(amount);
        Ok(())
    }

    fn credit_send(&mut self, increment: u32) -> Result<(), Error> {
        self.send.increment(
            increment,
            || Error::connection(ErrorCode::ProtocolError, "zero-length connection WINDOW_UPDATE"),
            || Error::connection(ErrorCode::FlowControlError, "connection flow-control window overflowed 2^31-1"),
        )
    }
}

impl ConnectionWindow {
    pub fn replenish_recv(&mut self, amount: u32) {
        self.recv.shift(i64::from(amount));
    }
}

/// Per-stream flow control (spec §4.3).
#[derive(Debug, Clone, Copy)]
pub struct StreamWindow {
    stream_id: StreamId,
    send: Window,
    recv: Window,
}

impl StreamWindow {
    #[must_use]
    pub fn new(stream_id: StreamId, initial_send: u32, initial_recv: u32) -> Self {
        Self {
            stream_id,
            send: Window::new(initial_send),
            recv: Window::new(initial_recv),
        }
    }

    /// Apply a SETTINGS_INITIAL_WINDOW_SIZE change to this (already open)
    /// stream's send window, per RFC 7540 §6.9.2.
    pub fn apply_initial_window_delta(&mut self, delta: i64) {
        self.send.shift(delta);
    }

    /// Replenish our own receive window after emitting a WINDOW_UPDATE to
    /// the peer for bytes we've since consumed from the stream's body
    /// channel.
    pub fn replenish_recv(&mut self, amount: u32) {
        self.recv.shift(i64::from(amount));
    }
}

impl WindowAccount for StreamWindow {
    fn send_window(&self) -> i64 {
        self.send.available()
    }

    fn recv_window(&self) -> i64 {
        self.recv.available()
    }

    fn consume_send(&mut self, amount: u32) {
        self.send.consume(amount);
    }

    fn consume_recv(&mut self, amount: u32) -> Result<(), Error> {
        if i64::from(amount) > self.recv.available() {
            return Err(Error::stream(
                self.stream_id,
                ErrorCode::FlowControlError,
                "peer exceeded this stream's receive window",
            ));
        }
        self.recv.consume(amount);
        Ok(())
    }

    fn credit_send(&mut self, increment: u32) -> Result<(), Error> {
        let stream_id = self.stream_id;
        self.send.increment(
            increment,
            move || Error::stream(stream_id, ErrorCode::ProtocolError, "zero-length stream WINDOW_UPDATE"),
            move || Error::stream(stream_id, ErrorCode::FlowControlError, "stream flow-control window overflowed 2^31-1"),
        )
    }
}
