//! Message-oriented RPC transport core: sessions, connections and a TCP
//! stream transport, modeled on the Accelio/XIO request/response protocol.
//!
//! The crate is split the way the wire protocol itself is layered:
//!
//! - [`session`] / [`connection`] / [`task`] / [`message`] / [`nexus`] —
//!   transport-independent core: session and connection state machines,
//!   the task pool, and the observer bus that connects a transport's I/O
//!   events to the sessions multiplexed over it.
//! - [`transport`] — the concrete TCP stream provider: socket creation,
//!   accept/connect, the dual-socket handshake, and non-blocking framed I/O.
//! - [`header`] — the on-wire session header and TLV framing.
//! - [`context`] — the reactor interface the core is driven through.
//! - [`config`], [`mempool`], [`id`], [`error`] — shared configuration,
//!   buffer pool contract, session id allocation, and error types.

pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod header;
pub mod id;
pub mod mempool;
pub mod message;
pub mod nexus;
pub mod session;
pub mod task;
pub mod transport;

pub use config::TcpOptions;
pub use connection::{Connection, ConnectionStatus};
pub use context::{Context, PollContext};
pub use error::{ConnectionError, CoreError, SessionError, TaskError, TransportError};
pub use header::{MsgFlags, SessionHeader, TlvFrame, TlvType};
pub use id::SessionId;
pub use mempool::{BufferPool, HeapBufferPool};
pub use message::{CancelReason, Msg, SessionEvent, SessionOps, VMsg};
pub use nexus::{Nexus, NexusEvent, NexusObserver};
pub use session::{find_session, find_session_by_id, Session, SessionLifecycle, SessionType, SessionsCache};
pub use task::{Task, TaskHandle, TaskPool};
pub use transport::{HandshakeMessage, PendingConnection, SockType, TcpListenerTransport, TcpTransport, TransportState};
