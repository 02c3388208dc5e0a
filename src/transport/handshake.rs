//! The fixed-size dual-socket handshake message.

use byteorder::{BigEndian, ByteOrder};

use crate::error::TransportError;

/// Size in bytes of [`HandshakeMessage`] on the wire.
pub const HANDSHAKE_WIRE_SIZE: usize = 4 + 2 + 2;

/// Which half of a dual-socket pair a freshly accepted fd represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    /// Single-socket mode: this fd carries everything.
    Single,
    /// Dual-socket mode: this fd is the control channel.
    Ctl,
    /// Dual-socket mode: this fd is the data channel.
    Data,
}

impl SockType {
    fn to_u32(self) -> u32 {
        match self {
            Self::Single => 1,
            Self::Ctl => 2,
            Self::Data => 3,
        }
    }

    fn from_u32(value: u32) -> Result<Self, TransportError> {
        Ok(match value {
            1 => Self::Single,
            2 => Self::Ctl,
            3 => Self::Data,
            _ => return Err(TransportError::ProtocolViolation("unknown handshake sock_type")),
        })
    }
}

/// The handshake message exchanged immediately after a dual-socket accept or
/// connect: announces which half this fd is, and (for the non-single modes)
/// the local port bound on the *other* fd, so the peer can pair the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeMessage {
    pub sock_type: SockType,
    /// Peer's second port; `0` for [`SockType::Single`].
    pub second_port: u16,
}

impl HandshakeMessage {
    pub fn pack(&self, bytes: &mut [u8]) -> Result<(), TransportError> {
        if bytes.len() < HANDSHAKE_WIRE_SIZE {
            return Err(TransportError::InvalidArgument("buffer too small for handshake message"));
        }
        BigEndian::write_u32(&mut bytes[0..4], self.sock_type.to_u32());
        BigEndian::write_u16(&mut bytes[4..6], self.second_port);
        bytes[6] = 0;
        bytes[7] = 0;
        Ok(())
    }

    pub fn unpack(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.len() < HANDSHAKE_WIRE_SIZE {
            return Err(TransportError::InvalidArgument("buffer too small for handshake message"));
        }
        Ok(Self {
            sock_type: SockType::from_u32(BigEndian::read_u32(&bytes[0..4]))?,
            second_port: BigEndian::read_u16(&bytes[4..6]),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn handshake_round_trips() {
        let msg = HandshakeMessage { sock_type: SockType::Data, second_port: 4433 };
        let mut bytes = [0u8; HANDSHAKE_WIRE_SIZE];
        msg.pack(&mut bytes).unwrap();
        assert_eq!(HandshakeMessage::unpack(&bytes).unwrap(), msg);
    }

    #[test]
    fn unknown_sock_type_is_rejected() {
        let mut bytes = [0u8; HANDSHAKE_WIRE_SIZE];
        BigEndian::write_u32(&mut bytes[0..4], 99);
        assert!(HandshakeMessage::unpack(&bytes).is_err());
    }
}
