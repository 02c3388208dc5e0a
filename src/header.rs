//! On-wire session header and TLV type tags.
//!
//! The header is fixed-layout, big-endian. `pack`/`unpack` are a lossless
//! round-trip pair: packing a header and unpacking the result always
//! yields the original field values.

use byteorder::{BigEndian, ByteOrder};
use bitflags::bitflags;

use crate::error::TransportError;

/// Size in bytes of [`SessionHeader`] on the wire.
pub const HEADER_WIRE_SIZE: usize = 8 + 4 + 4 + 4 + 2 + 2 + 2;

bitflags! {
    /// Flags carried in the session header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MsgFlags: u32 {
        /// Request asks for a standalone delivery receipt.
        const REQUEST_READ_RECEIPT = 1 << 0;
        /// Set on the first (and, on a normal response, only) segment of a response.
        const RSP_FLAG_FIRST = 1 << 1;
        /// Set on the last segment of a response; absent on a standalone receipt.
        const RSP_FLAG_LAST = 1 << 2;
        /// This message is the last one in a send batch.
        const MSG_FLAG_LAST_IN_BATCH = 1 << 3;
    }
}

/// TLV message types multiplexed over one session/connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlvType {
    MsgReq,
    MsgRsp,
    OneWayReq,
    OneWayRsp,
    AckReq,
    FinReq,
    FinRsp,
    SessionSetupReq,
    SessionSetupRsp,
    ConnectionHelloReq,
    ConnectionHelloRsp,
    CancelReq,
    CancelRsp,
}

impl TlvType {
    fn to_u16(self) -> u16 {
        match self {
            Self::MsgReq => 1,
            Self::MsgRsp => 2,
            Self::OneWayReq => 3,
            Self::OneWayRsp => 4,
            Self::AckReq => 5,
            Self::FinReq => 6,
            Self::FinRsp => 7,
            Self::SessionSetupReq => 8,
            Self::SessionSetupRsp => 9,
            Self::ConnectionHelloReq => 10,
            Self::ConnectionHelloRsp => 11,
            Self::CancelReq => 12,
            Self::CancelRsp => 13,
        }
    }

    fn from_u16(value: u16) -> Result<Self, TransportError> {
        Ok(match value {
            1 => Self::MsgReq,
            2 => Self::MsgRsp,
            3 => Self::OneWayReq,
            4 => Self::OneWayRsp,
            5 => Self::AckReq,
            6 => Self::FinReq,
            7 => Self::FinRsp,
            8 => Self::SessionSetupReq,
            9 => Self::SessionSetupRsp,
            10 => Self::ConnectionHelloReq,
            11 => Self::ConnectionHelloRsp,
            12 => Self::CancelReq,
            13 => Self::CancelRsp,
            _ => return Err(TransportError::ProtocolViolation("unknown tlv type")),
        })
    }
}

/// The fixed-layout session header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHeader {
    /// Caller-visible message serial number.
    pub serial_num: u64,
    /// Routes the message to a session.
    pub dest_session_id: u32,
    /// See [`MsgFlags`].
    pub flags: MsgFlags,
    /// Non-zero means a negative receipt.
    pub receipt_result: i32,
    /// Connection-local sequence number.
    pub sn: u16,
    /// Cumulative ack.
    pub ack_sn: u16,
    /// Credits granted with this message.
    pub credits: u16,
}

impl SessionHeader {
    /// Serialize `self` into `bytes`, which must be at least
    /// [`HEADER_WIRE_SIZE`] long.
    pub fn pack(&self, bytes: &mut [u8]) -> Result<(), TransportError> {
        if bytes.len() < HEADER_WIRE_SIZE {
            return Err(TransportError::InvalidArgument("buffer too small for session header"));
        }
        BigEndian::write_u64(&mut bytes[0..8], self.serial_num);
        BigEndian::write_u32(&mut bytes[8..12], self.dest_session_id);
        BigEndian::write_u32(&mut bytes[12..16], self.flags.bits());
        BigEndian::write_i32(&mut bytes[16..20], self.receipt_result);
        BigEndian::write_u16(&mut bytes[20..22], self.sn);
        BigEndian::write_u16(&mut bytes[22..24], self.ack_sn);
        BigEndian::write_u16(&mut bytes[24..26], self.credits);
        Ok(())
    }

    /// Deserialize a [`SessionHeader`] from the front of `bytes`.
    pub fn unpack(bytes: &[u8]) -> Result<Self, TransportError> {
        if bytes.len() < HEADER_WIRE_SIZE {
            return Err(TransportError::InvalidArgument("buffer too small for session header"));
        }
        Ok(Self {
            serial_num: BigEndian::read_u64(&bytes[0..8]),
            dest_session_id: BigEndian::read_u32(&bytes[8..12]),
            flags: MsgFlags::from_bits_truncate(BigEndian::read_u32(&bytes[12..16])),
            receipt_result: BigEndian::read_i32(&bytes[16..20]),
            sn: BigEndian::read_u16(&bytes[20..22]),
            ack_sn: BigEndian::read_u16(&bytes[22..24]),
            credits: BigEndian::read_u16(&bytes[24..26]),
        })
    }

    /// Peek `dest_session_id` only, without validating the rest of the
    /// header. Used by [`find_session`](crate::session::find_session) which
    /// must not advance the read cursor for the first packet of a new
    /// connection.
    pub fn peek_dest_session_id(bytes: &[u8]) -> Result<u32, TransportError> {
        if bytes.len() < 12 {
            return Err(TransportError::InvalidArgument("buffer too small for session header"));
        }
        Ok(BigEndian::read_u32(&bytes[8..12]))
    }
}

/// A full TLV frame: type tag plus session header plus opaque payload.
#[derive(Debug, Clone)]
pub struct TlvFrame {
    pub tlv_type: TlvType,
    pub header: SessionHeader,
    pub payload: Vec<u8>,
}

impl TlvFrame {
    /// Wire length of the TLV prefix (type tag + payload length) that
    /// precedes the session header and payload.
    pub const PREFIX_LEN: usize = 2 + 4;

    /// Encode this frame as it would appear on the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::PREFIX_LEN + HEADER_WIRE_SIZE + self.payload.len());
        let mut prefix = [0u8; Self::PREFIX_LEN];
        BigEndian::write_u16(&mut prefix[0..2], self.tlv_type.to_u16());
        BigEndian::write_u32(&mut prefix[2..6], (HEADER_WIRE_SIZE + self.payload.len()) as u32);
        out.extend_from_slice(&prefix);
        let mut header_bytes = [0u8; HEADER_WIRE_SIZE];
        self.header.pack(&mut header_bytes).expect("fixed-size buffer");
        out.extend_from_slice(&header_bytes);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Attempt to decode a single frame from the front of `bytes`.
    ///
    /// Returns `Ok(None)` if `bytes` does not yet hold a complete frame.
    pub fn try_decode(bytes: &[u8]) -> Result<Option<(Self, usize)>, TransportError> {
        if bytes.len() < Self::PREFIX_LEN {
            return Ok(None);
        }
        let tlv_type = TlvType::from_u16(BigEndian::read_u16(&bytes[0..2]))?;
        let body_len = BigEndian::read_u32(&bytes[2..6]) as usize;
        let total_len = Self::PREFIX_LEN + body_len;
        if bytes.len() < total_len {
            return Ok(None);
        }
        if body_len < HEADER_WIRE_SIZE {
            return Err(TransportError::ProtocolViolation("tlv body shorter than session header"));
        }
        let header = SessionHeader::unpack(&bytes[Self::PREFIX_LEN..])?;
        let payload = bytes[Self::PREFIX_LEN + HEADER_WIRE_SIZE..total_len].to_vec();
        Ok(Some((Self { tlv_type, header, payload }, total_len)))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_header() -> SessionHeader {
        SessionHeader {
            serial_num: 0xDEAD_BEEF_CAFE_0001,
            dest_session_id: 42,
            flags: MsgFlags::REQUEST_READ_RECEIPT | MsgFlags::MSG_FLAG_LAST_IN_BATCH,
            receipt_result: -7,
            sn: 17,
            ack_sn: 16,
            credits: 3,
        }
    }

    #[test]
    fn header_round_trips() {
        let header = sample_header();
        let mut bytes = [0u8; HEADER_WIRE_SIZE];
        header.pack(&mut bytes).unwrap();
        let decoded = SessionHeader::unpack(&bytes).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn peek_dest_session_id_does_not_require_full_header() {
        let header = sample_header();
        let mut bytes = [0u8; HEADER_WIRE_SIZE];
        header.pack(&mut bytes).unwrap();
        assert_eq!(SessionHeader::peek_dest_session_id(&bytes).unwrap(), 42);
    }

    #[test]
    fn tlv_frame_round_trips() {
        let frame = TlvFrame {
            tlv_type: TlvType::MsgReq,
            header: sample_header(),
            payload: b"ping".to_vec(),
        };
        let encoded = frame.encode();
        let (decoded, consumed) = TlvFrame::try_decode(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.tlv_type, TlvType::MsgReq);
        assert_eq!(decoded.header, frame.header);
        assert_eq!(decoded.payload, b"ping");
    }

    #[test]
    fn partial_frame_is_not_decoded() {
        let frame = TlvFrame {
            tlv_type: TlvType::OneWayReq,
            header: sample_header(),
            payload: b"hello world".to_vec(),
        };
        let encoded = frame.encode();
        assert!(TlvFrame::try_decode(&encoded[..encoded.len() - 1]).unwrap().is_none());
    }
}
