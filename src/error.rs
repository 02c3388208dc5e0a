//! Crate-wide error kinds.
//!
//! Each subsystem keeps its own enum: [`ConnectionError`] for per-flow
//! bookkeeping, [`SessionError`] for the session/cache layer, [`TaskError`]
//! for the task pool, [`TransportError`] for the stream transport and wire
//! codec. [`CoreError`] only composes them at the public session boundary.

use std::error::Error;
use std::fmt;
use std::io::Error as IoError;

/// Failures raised by a single [`crate::connection::Connection`].
#[derive(Debug)]
pub enum ConnectionError {
    /// The connection is not in a state that can send (e.g. not yet online).
    NotOnline,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotOnline => write!(f, "connection is not online"),
        }
    }
}

impl Error for ConnectionError {}

/// Failures raised by [`crate::session::Session`] and [`crate::session::SessionsCache`].
#[derive(Debug)]
pub enum SessionError {
    /// The session still has open connections and cannot be destroyed.
    Busy,
    /// A session, connection index, or cache entry was not found.
    NotFound(&'static str),
    /// The sessions cache could not allocate a fresh session id.
    OutOfMemory,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "session is busy"),
            Self::NotFound(what) => write!(f, "not found: {}", what),
            Self::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

impl Error for SessionError {}

/// Failures raised by [`crate::task::TaskPool`] and task lookups.
#[derive(Debug)]
pub enum TaskError {
    /// No task matches the requested correlation (e.g. an sn with no
    /// matching entry in a connection's io queue).
    NotFound(&'static str),
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(what) => write!(f, "task not found: {}", what),
        }
    }
}

impl Error for TaskError {}

/// Failures raised by the stream transport and its wire codec (header, TLV
/// framing, handshake).
#[derive(Debug)]
pub enum TransportError {
    /// An argument was outside its valid range (e.g. `trans_buf_threshold`).
    InvalidArgument(&'static str),
    /// A URI could not be resolved to a socket address.
    AddressResolution(IoError),
    /// The transport failed to establish a connection.
    Connect(IoError),
    /// The peer violated the wire protocol (bad tag, length, or flags).
    ProtocolViolation(&'static str),
    /// The peer disconnected or the underlying stream was closed.
    PeerDisconnected,
    /// The requested operation is not supported in the current configuration.
    Unsupported(&'static str),
    /// An underlying I/O error occurred.
    Io(IoError),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(what) => write!(f, "invalid argument: {}", what),
            Self::AddressResolution(err) => write!(f, "address resolution failed: {}", err),
            Self::Connect(err) => write!(f, "connect failed: {}", err),
            Self::ProtocolViolation(what) => write!(f, "protocol violation: {}", what),
            Self::PeerDisconnected => write!(f, "peer disconnected"),
            Self::Unsupported(what) => write!(f, "operation not supported: {}", what),
            Self::Io(err) => err.fmt(f),
        }
    }
}

impl Error for TransportError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::AddressResolution(err) | Self::Connect(err) | Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<IoError> for TransportError {
    fn from(err: IoError) -> Self {
        Self::Io(err)
    }
}

/// Crate-level error composed from each subsystem's own enum, used at the
/// public session API boundary.
#[derive(Debug)]
pub enum CoreError {
    Connection(ConnectionError),
    Session(SessionError),
    Task(TaskError),
    Transport(TransportError),
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(err) => err.fmt(f),
            Self::Session(err) => err.fmt(f),
            Self::Task(err) => err.fmt(f),
            Self::Transport(err) => err.fmt(f),
        }
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Connection(err) => Some(err),
            Self::Session(err) => Some(err),
            Self::Task(err) => Some(err),
            Self::Transport(err) => Some(err),
        }
    }
}

impl From<ConnectionError> for CoreError {
    fn from(err: ConnectionError) -> Self {
        Self::Connection(err)
    }
}

impl From<SessionError> for CoreError {
    fn from(err: SessionError) -> Self {
        Self::Session(err)
    }
}

impl From<TaskError> for CoreError {
    fn from(err: TaskError) -> Self {
        Self::Task(err)
    }
}

impl From<TransportError> for CoreError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}
