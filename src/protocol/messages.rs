//! Wire message formats
//!
//! Every datagram starts with a 1-byte type and 3 reserved zero bytes:
//!
//! | Type | Value | Size  |
//! |------|-------|-------|
//! | Initiation | 1 | 148 |
//! | Response | 2 | 92 |
//! | Cookie reply | 3 | 64 |
//! | Transport | 4 | ≥32 |
//!
//! Multi-byte indices and the transport counter are little-endian.

use crate::error::ProtocolError;

/// First byte of every datagram.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Initiation = 1,
    Response = 2,
    CookieReply = 3,
    Transport = 4,
}

/// Classify a datagram by its first byte.
pub fn message_type(data: &[u8]) -> Result<MessageType, ProtocolError> {
    match data.first() {
        Some(1) => Ok(MessageType::Initiation),
        Some(2) => Ok(MessageType::Response),
        Some(3) => Ok(MessageType::CookieReply),
        Some(4) => Ok(MessageType::Transport),
        Some(&t) => Err(ProtocolError::InvalidMessageType { msg_type: t }),
        None => Err(ProtocolError::InvalidMessageLength {
            expected: 1,
            got: 0,
        }),
    }
}

fn read_u32_le(data: &[u8]) -> u32 {
    u32::from_le_bytes(data.try_into().expect("4-byte slice"))
}

fn copy<const N: usize>(data: &[u8]) -> [u8; N] {
    data.try_into().expect("fixed-size slice")
}

/// Handshake initiation (type 1, 148 bytes)
///
/// ```text
/// type(1) reserved(3) sender_index(4) ephemeral(32)
/// encrypted_static(32+16) encrypted_timestamp(12+16) mac1(16) mac2(16)
/// ```
#[derive(Debug, Clone)]
pub struct Initiation {
    pub sender_index: u32,
    pub ephemeral: [u8; 32],
    pub encrypted_static: [u8; 48],
    pub encrypted_timestamp: [u8; 28],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl Initiation {
    pub const SIZE: usize = 148;
    /// Offset of mac1; everything before it is covered by mac1.
    pub const MAC1_OFFSET: usize = 116;
    /// Offset of mac2; everything before it is covered by mac2.
    pub const MAC2_OFFSET: usize = 132;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = MessageType::Initiation as u8;
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..40].copy_from_slice(&self.ephemeral);
        buf[40..88].copy_from_slice(&self.encrypted_static);
        buf[88..116].copy_from_slice(&self.encrypted_timestamp);
        buf[116..132].copy_from_slice(&self.mac1);
        buf[132..148].copy_from_slice(&self.mac2);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() != Self::SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::SIZE,
                got: data.len(),
            });
        }
        if data[0] != MessageType::Initiation as u8 {
            return Err(ProtocolError::InvalidMessageType { msg_type: data[0] });
        }
        Ok(Self {
            sender_index: read_u32_le(&data[4..8]),
            ephemeral: copy(&data[8..40]),
            encrypted_static: copy(&data[40..88]),
            encrypted_timestamp: copy(&data[88..116]),
            mac1: copy(&data[116..132]),
            mac2: copy(&data[132..148]),
        })
    }
}

/// Handshake response (type 2, 92 bytes)
///
/// ```text
/// type(1) reserved(3) sender_index(4) receiver_index(4) ephemeral(32)
/// encrypted_nothing(0+16) mac1(16) mac2(16)
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    pub sender_index: u32,
    pub receiver_index: u32,
    pub ephemeral: [u8; 32],
    pub encrypted_nothing: [u8; 16],
    pub mac1: [u8; 16],
    pub mac2: [u8; 16],
}

impl Response {
    pub const SIZE: usize = 92;
    pub const MAC1_OFFSET: usize = 60;
    pub const MAC2_OFFSET: usize = 76;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = MessageType::Response as u8;
        buf[4..8].copy_from_slice(&self.sender_index.to_le_bytes());
        buf[8..12].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[12..44].copy_from_slice(&self.ephemeral);
        buf[44..60].copy_from_slice(&self.encrypted_nothing);
        buf[60..76].copy_from_slice(&self.mac1);
        buf[76..92].copy_from_slice(&self.mac2);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() != Self::SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::SIZE,
                got: data.len(),
            });
        }
        if data[0] != MessageType::Response as u8 {
            return Err(ProtocolError::InvalidMessageType { msg_type: data[0] });
        }
        Ok(Self {
            sender_index: read_u32_le(&data[4..8]),
            receiver_index: read_u32_le(&data[8..12]),
            ephemeral: copy(&data[12..44]),
            encrypted_nothing: copy(&data[44..60]),
            mac1: copy(&data[60..76]),
            mac2: copy(&data[76..92]),
        })
    }
}

/// Cookie reply (type 3, 64 bytes)
///
/// ```text
/// type(1) reserved(3) receiver_index(4) nonce(24) encrypted_cookie(16+16)
/// ```
#[derive(Debug, Clone)]
pub struct CookieReply {
    pub receiver_index: u32,
    pub nonce: [u8; 24],
    pub encrypted_cookie: [u8; 32],
}

impl CookieReply {
    pub const SIZE: usize = 64;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = MessageType::CookieReply as u8;
        buf[4..8].copy_from_slice(&self.receiver_index.to_le_bytes());
        buf[8..32].copy_from_slice(&self.nonce);
        buf[32..64].copy_from_slice(&self.encrypted_cookie);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() != Self::SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::SIZE,
                got: data.len(),
            });
        }
        if data[0] != MessageType::CookieReply as u8 {
            return Err(ProtocolError::InvalidMessageType { msg_type: data[0] });
        }
        Ok(Self {
            receiver_index: read_u32_le(&data[4..8]),
            nonce: copy(&data[8..32]),
            encrypted_cookie: copy(&data[32..64]),
        })
    }
}

/// Transport data header (type 4, 16 bytes, followed by ciphertext‖tag)
///
/// ```text
/// type(1) reserved(3) receiver_index(4) counter(8 LE) ciphertext tag(16)
/// ```
#[derive(Debug, Clone, Copy)]
pub struct TransportHeader {
    pub receiver_index: u32,
    pub counter: u64,
}

impl TransportHeader {
    pub const SIZE: usize = 16;
    /// Header plus at least the tag of an empty (keepalive) payload.
    pub const MIN_SIZE: usize = Self::SIZE + 16;

    /// Assemble a full transport datagram around an already-sealed payload.
    pub fn assemble(receiver_index: u32, counter: u64, sealed: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE + sealed.len());
        buf.push(MessageType::Transport as u8);
        buf.extend_from_slice(&[0, 0, 0]);
        buf.extend_from_slice(&receiver_index.to_le_bytes());
        buf.extend_from_slice(&counter.to_le_bytes());
        buf.extend_from_slice(sealed);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < Self::MIN_SIZE {
            return Err(ProtocolError::InvalidMessageLength {
                expected: Self::MIN_SIZE,
                got: data.len(),
            });
        }
        if data[0] != MessageType::Transport as u8 {
            return Err(ProtocolError::InvalidMessageType { msg_type: data[0] });
        }
        Ok(Self {
            receiver_index: read_u32_le(&data[4..8]),
            counter: u64::from_le_bytes(data[8..16].try_into().expect("8-byte slice")),
        })
    }

    /// The sealed payload following the header.
    pub fn payload(data: &[u8]) -> &[u8] {
        &data[Self::SIZE..]
    }
}

/// Plaintext length after padding to the 16-byte block size.
///
/// Keepalives stay empty; everything else rounds up.
pub fn padded_len(len: usize) -> usize {
    (len + 15) & !15
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initiation_roundtrip() {
        let msg = Initiation {
            sender_index: 0xA1B2C3D4,
            ephemeral: [1u8; 32],
            encrypted_static: [2u8; 48],
            encrypted_timestamp: [3u8; 28],
            mac1: [4u8; 16],
            mac2: [5u8; 16],
        };
        let bytes = msg.to_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..4], &[0, 0, 0]);

        let parsed = Initiation::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.sender_index, msg.sender_index);
        assert_eq!(parsed.encrypted_timestamp, msg.encrypted_timestamp);
        assert_eq!(parsed.mac2, msg.mac2);
    }

    #[test]
    fn response_roundtrip() {
        let msg = Response {
            sender_index: 1,
            receiver_index: 2,
            ephemeral: [7u8; 32],
            encrypted_nothing: [8u8; 16],
            mac1: [9u8; 16],
            mac2: [0u8; 16],
        };
        let parsed = Response::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(parsed.sender_index, 1);
        assert_eq!(parsed.receiver_index, 2);
        assert_eq!(parsed.ephemeral, [7u8; 32]);
    }

    #[test]
    fn cookie_reply_roundtrip() {
        let msg = CookieReply {
            receiver_index: 77,
            nonce: [6u8; 24],
            encrypted_cookie: [5u8; 32],
        };
        let parsed = CookieReply::from_bytes(&msg.to_bytes()).unwrap();
        assert_eq!(parsed.receiver_index, 77);
        assert_eq!(parsed.nonce, msg.nonce);
    }

    #[test]
    fn transport_assembly() {
        let datagram = TransportHeader::assemble(42, 9000, &[0xEE; 32]);
        assert_eq!(datagram[0], 4);
        let header = TransportHeader::from_bytes(&datagram).unwrap();
        assert_eq!(header.receiver_index, 42);
        assert_eq!(header.counter, 9000);
        assert_eq!(TransportHeader::payload(&datagram), &[0xEE; 32][..]);
    }

    #[test]
    fn truncated_messages_are_rejected() {
        assert!(Initiation::from_bytes(&[1u8; 100]).is_err());
        assert!(Response::from_bytes(&[2u8; 91]).is_err());
        assert!(CookieReply::from_bytes(&[3u8; 63]).is_err());
        assert!(TransportHeader::from_bytes(&[4u8; 20]).is_err());
    }

    #[test]
    fn wrong_type_byte_is_rejected() {
        let init = Initiation {
            sender_index: 0,
            ephemeral: [0; 32],
            encrypted_static: [0; 48],
            encrypted_timestamp: [0; 28],
            mac1: [0; 16],
            mac2: [0; 16],
        };
        let mut bytes = init.to_bytes();
        bytes[0] = 2;
        assert!(Initiation::from_bytes(&bytes).is_err());
        assert!(message_type(&[9]).is_err());
        assert!(message_type(&[]).is_err());
    }

    #[test]
    fn padding_rounds_to_block_size() {
        assert_eq!(padded_len(0), 0);
        for len in 1..=16 {
            assert_eq!(padded_len(len), 16);
        }
        assert_eq!(padded_len(17), 32);
        assert_eq!(padded_len(1280), 1280);
    }
}
