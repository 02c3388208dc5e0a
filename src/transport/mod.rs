//! The stream transport: handshake framing, pending-accept staging, and the
//! TCP provider.

pub mod handshake;
pub mod pending;
pub mod tcp;

pub use handshake::{HandshakeMessage, SockType, HANDSHAKE_WIRE_SIZE};
pub use pending::PendingConnection;
pub use tcp::{TcpListenerTransport, TcpTransport, TransportState};
