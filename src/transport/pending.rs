//! A freshly accepted fd still reading its fixed-size handshake message.

use std::io::Read;
use std::net::{SocketAddr, TcpStream};

use crate::error::TransportError;
use crate::transport::handshake::{HandshakeMessage, HANDSHAKE_WIRE_SIZE};

pub struct PendingConnection {
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
    buf: Vec<u8>,
}

impl PendingConnection {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self { stream, peer_addr, buf: Vec::with_capacity(HANDSHAKE_WIRE_SIZE) }
    }

    /// Non-blocking read attempt: reads until the fixed-size handshake
    /// message is fully in; on a partial read it returns `Ok(None)`; on EOF
    /// it reports the entry as dead.
    pub fn try_read_handshake(&mut self) -> Result<Option<HandshakeMessage>, TransportError> {
        if self.buf.len() >= HANDSHAKE_WIRE_SIZE {
            return Ok(Some(HandshakeMessage::unpack(&self.buf)?));
        }
        let mut chunk = [0u8; HANDSHAKE_WIRE_SIZE];
        loop {
            let remaining = HANDSHAKE_WIRE_SIZE - self.buf.len();
            match self.stream.read(&mut chunk[..remaining]) {
                Ok(0) => return Err(TransportError::PeerDisconnected),
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    if self.buf.len() >= HANDSHAKE_WIRE_SIZE {
                        return Ok(Some(HandshakeMessage::unpack(&self.buf)?));
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }
}
