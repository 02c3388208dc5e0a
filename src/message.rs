//! The user-facing message API boundary.
//!
//! The concrete message layout is treated as an external SDK contract,
//! described only as needed. This module is that minimal description:
//! enough of a message shape for the session/connection state machine to
//! correlate requests with responses and hand payloads to user callbacks,
//! without dictating how a real SDK lays out scatter-gather buffers.

use std::fmt;

/// One side (in or out) of a user message: an opaque payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VMsg {
    pub payload: Vec<u8>,
}

impl VMsg {
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }
}

/// A user message flowing through the core.
///
/// `out` is populated by the caller before a send; `in_` is populated by the
/// core on receive. `request` is filled in on the response side once the
/// final (`LAST`-flagged) segment of a response arrives, carrying the
/// original request's echoed `in_`.
#[derive(Debug, Clone, Default)]
pub struct Msg {
    /// Caller-visible serial number, stamped by the connection on send.
    pub sn: u64,
    pub in_: VMsg,
    pub out: VMsg,
    pub request: Option<Box<VMsg>>,
    /// Non-zero means a negative receipt (mirrors [`crate::header::SessionHeader::receipt_result`]).
    pub receipt_res: i32,
    /// Whether this message was sent with `REQUEST_READ_RECEIPT`.
    pub request_read_receipt: bool,
}

impl Msg {
    pub fn with_payload(payload: Vec<u8>) -> Self {
        Self { out: VMsg::new(payload), ..Default::default() }
    }
}

/// Session-level lifecycle/error events surfaced to [`SessionOps`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Reject,
    Teardown,
    NewConnection,
    ConnectionEstablished,
    ConnectionClosed,
    ConnectionDisconnected,
    ConnectionRefused,
    ConnectionTeardown,
    ConnectionError,
    SessionError,
}

impl SessionEvent {
    /// Human-readable name for this event.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reject => "session reject",
            Self::Teardown => "session teardown",
            Self::NewConnection => "new connection",
            Self::ConnectionEstablished => "connection established",
            Self::ConnectionClosed => "connection closed",
            Self::ConnectionDisconnected => "connection disconnected",
            Self::ConnectionRefused => "connection refused",
            Self::ConnectionTeardown => "connection teardown",
            Self::ConnectionError => "connection error",
            Self::SessionError => "session error",
        }
    }
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason a cancellation could not be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    MsgNotFound,
    Rejected,
}

/// The user ops vtable a session is created with.
///
/// Every method has a default no-op (or conservative) implementation so
/// implementors only override the callbacks they actually care about,
/// rather than demanding every hook be filled in.
pub trait SessionOps {
    /// A session-level lifecycle or error event occurred, optionally scoped
    /// to one connection (`None` means session-wide, e.g. `SessionError`).
    fn on_session_event(&self, _event: SessionEvent, _connection_index: Option<usize>) {}

    /// A request or one-way message was fully received.
    ///
    /// Returning a non-zero status causes the caller to treat this as
    /// delivery failure for accounting purposes; the default always succeeds.
    fn on_msg(&self, _connection_index: usize, _msg: &Msg) -> i32 {
        0
    }

    /// Delivery of a previously sent message failed or was rejected.
    fn on_msg_error(&self, _connection_index: usize, _msg: &Msg, _status: i32) {}

    /// A standalone or piggybacked delivery receipt arrived for a message
    /// sent with `REQUEST_READ_RECEIPT`.
    fn on_msg_delivered(&self, _connection_index: usize, _msg: &Msg, _receipt_res: i32) {}

    /// The response to a previously sent request finished transmitting.
    fn on_msg_send_complete(&self, _connection_index: usize, _msg: &Msg) {}

    /// A one-way message finished transmitting (no receipt requested).
    fn on_ow_msg_send_complete(&self, _connection_index: usize, _msg: &Msg) {}

    /// The peer asked to cancel an in-flight request this side is still
    /// processing. Return `true` to accept cancellation.
    fn on_cancel_request(&self, _connection_index: usize, _sn: u64) -> bool {
        false
    }

    /// The peer's response to our own cancel request arrived.
    fn on_cancel_response(&self, _connection_index: usize, _sn: u64) {}

    /// The core is requesting an inbound buffer for an about-to-arrive
    /// message. Returning `None` leaves the core to allocate its own buffer.
    fn assign_in_buf(&self, _connection_index: usize, _size_hint: usize) -> Option<Vec<u8>> {
        None
    }
}
