//! UDP packet encoding and decoding.
//!
//! All multi-byte fields are little-endian. Header layout (36 bytes):
//!
//! ```text
//! magic u32 | payload_size u16 | packet_type u8 | flags u8
//! source_conn_id u32 | dest_conn_id u32
//! seq_this u32 | seq_ack u32
//! packets_in_msg u32 | msg_start_seq u32 | msg_size u32
//! ```

use crate::error::PacketError;

/// Packet magic, "VS01" read as a little-endian u32
pub const PACKET_MAGIC: u32 = 0x3130_5356;

/// Encoded header size
pub const HEADER_SIZE: usize = 36;

/// Largest payload a single packet may carry
pub const MAX_PAYLOAD: usize = 0x4DC;

/// XOR mask applied to the server challenge before echoing it back
pub const CHALLENGE_MASK: u32 = 0xA426_DF2B;

/// Connection ID a fresh client starts with
pub const INITIAL_CONN_ID: u32 = 512;

/// Packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Reserved (invalid)
    Invalid = 0,
    /// Client asks for a challenge
    ChallengeReq = 1,
    /// Server challenge
    Challenge = 2,
    /// Client answers the challenge
    Connect = 3,
    /// Server accepts the connection
    Accept = 4,
    /// Either side ends the connection
    Disconnect = 5,
    /// Sequenced message fragment
    Data = 6,
    /// Unsequenced packet, used for bare acknowledgements
    Datagram = 7,
}

impl TryFrom<u8> for PacketType {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Invalid),
            1 => Ok(Self::ChallengeReq),
            2 => Ok(Self::Challenge),
            3 => Ok(Self::Connect),
            4 => Ok(Self::Accept),
            5 => Ok(Self::Disconnect),
            6 => Ok(Self::Data),
            7 => Ok(Self::Datagram),
            _ => Err(PacketError::InvalidPacketType(value)),
        }
    }
}

/// Packet header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader {
    /// Packet type
    pub packet_type: PacketType,
    /// Flags (unused, carried through)
    pub flags: u8,
    /// Sender connection ID
    pub source_conn_id: u32,
    /// Receiver connection ID
    pub dest_conn_id: u32,
    /// Sequence number of this packet (0 for unsequenced packets)
    pub seq_this: u32,
    /// Highest contiguous sequence number the sender has received
    pub seq_ack: u32,
    /// Number of packets in the logical message
    pub packets_in_msg: u32,
    /// Sequence number of the message's first packet
    pub msg_start_seq: u32,
    /// Total size of the logical message
    pub msg_size: u32,
}

impl UdpHeader {
    /// Header for a packet of the given type with default fields
    #[must_use]
    pub fn new(packet_type: PacketType) -> Self {
        Self {
            packet_type,
            flags: 0,
            source_conn_id: INITIAL_CONN_ID,
            dest_conn_id: 0,
            seq_this: 0,
            seq_ack: 0,
            packets_in_msg: 0,
            msg_start_seq: 0,
            msg_size: 0,
        }
    }
}

/// One UDP datagram: header plus payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpPacket {
    /// Header fields
    pub header: UdpHeader,
    payload: Vec<u8>,
}

impl UdpPacket {
    /// Create a packet with an empty payload
    #[must_use]
    pub fn new(packet_type: PacketType) -> Self {
        Self {
            header: UdpHeader::new(packet_type),
            payload: Vec::new(),
        }
    }

    /// Create a packet carrying `payload`
    ///
    /// `msg_size` defaults to the payload length.
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::PayloadTooLarge`] if `payload` exceeds [`MAX_PAYLOAD`].
    pub fn with_payload(packet_type: PacketType, payload: Vec<u8>) -> Result<Self, PacketError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge(payload.len()));
        }
        let mut packet = Self::new(packet_type);
        packet.header.msg_size = payload.len() as u32;
        packet.payload = payload;
        Ok(packet)
    }

    /// Packet payload
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Packet type
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        self.header.packet_type
    }

    /// Serialize header and payload
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let h = &self.header;
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&PACKET_MAGIC.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        buf.push(h.packet_type as u8);
        buf.push(h.flags);
        buf.extend_from_slice(&h.source_conn_id.to_le_bytes());
        buf.extend_from_slice(&h.dest_conn_id.to_le_bytes());
        buf.extend_from_slice(&h.seq_this.to_le_bytes());
        buf.extend_from_slice(&h.seq_ack.to_le_bytes());
        buf.extend_from_slice(&h.packets_in_msg.to_le_bytes());
        buf.extend_from_slice(&h.msg_start_seq.to_le_bytes());
        buf.extend_from_slice(&h.msg_size.to_le_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parse a datagram
    ///
    /// # Errors
    ///
    /// Returns an error if the datagram is truncated, has the wrong magic,
    /// declares an oversized payload, or carries an unknown packet type.
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < HEADER_SIZE {
            return Err(PacketError::TooShort {
                expected: HEADER_SIZE,
                actual: data.len(),
            });
        }

        let u32_at = |at: usize| u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);

        let magic = u32_at(0);
        if magic != PACKET_MAGIC {
            return Err(PacketError::BadMagic(magic));
        }

        let payload_size = u16::from_le_bytes([data[4], data[5]]) as usize;
        if payload_size > MAX_PAYLOAD {
            return Err(PacketError::PayloadTooLarge(payload_size));
        }
        if data.len() < HEADER_SIZE + payload_size {
            return Err(PacketError::TooShort {
                expected: HEADER_SIZE + payload_size,
                actual: data.len(),
            });
        }

        let header = UdpHeader {
            packet_type: PacketType::try_from(data[6])?,
            flags: data[7],
            source_conn_id: u32_at(8),
            dest_conn_id: u32_at(12),
            seq_this: u32_at(16),
            seq_ack: u32_at(20),
            packets_in_msg: u32_at(24),
            msg_start_seq: u32_at(28),
            msg_size: u32_at(32),
        };

        Ok(Self {
            header,
            payload: data[HEADER_SIZE..HEADER_SIZE + payload_size].to_vec(),
        })
    }
}

/// Body of a [`PacketType::Challenge`] packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChallengeData {
    /// Server-chosen challenge value
    pub challenge_value: u32,
    /// Server load hint
    pub server_load: u32,
}

impl ChallengeData {
    /// Encoded size
    pub const SIZE: usize = 8;

    /// Serialize
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(&self.challenge_value.to_le_bytes());
        buf.extend_from_slice(&self.server_load.to_le_bytes());
        buf
    }

    /// Parse from a packet payload
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::TooShort`] if fewer than 8 bytes are given.
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < Self::SIZE {
            return Err(PacketError::TooShort {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        Ok(Self {
            challenge_value: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            server_load: u32::from_le_bytes([data[4], data[5], data[6], data[7]]),
        })
    }
}

/// Body of a [`PacketType::Connect`] packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectData {
    /// Challenge value XORed with [`CHALLENGE_MASK`]
    pub challenge_value: u32,
}

impl ConnectData {
    /// Encoded size
    pub const SIZE: usize = 4;

    /// Answer for a server challenge
    #[must_use]
    pub fn answer(challenge: &ChallengeData) -> Self {
        Self {
            challenge_value: challenge.challenge_value ^ CHALLENGE_MASK,
        }
    }

    /// Serialize
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.challenge_value.to_le_bytes().to_vec()
    }

    /// Parse from a packet payload
    ///
    /// # Errors
    ///
    /// Returns [`PacketError::TooShort`] if fewer than 4 bytes are given.
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < Self::SIZE {
            return Err(PacketError::TooShort {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        Ok(Self {
            challenge_value: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut packet = UdpPacket::with_payload(PacketType::Data, vec![0xAA; 3]).unwrap();
        packet.header.seq_this = 7;
        packet.header.seq_ack = 6;
        packet.header.dest_conn_id = 0x0102_0304;

        let wire = packet.encode();
        assert_eq!(wire.len(), HEADER_SIZE + 3);
        assert_eq!(&wire[..4], b"VS01");
        assert_eq!(&wire[4..6], &3u16.to_le_bytes());
        assert_eq!(wire[6], PacketType::Data as u8);
        assert_eq!(&wire[8..12], &INITIAL_CONN_ID.to_le_bytes());
        assert_eq!(&wire[12..16], &[4, 3, 2, 1]);
        assert_eq!(&wire[16..20], &7u32.to_le_bytes());
        assert_eq!(&wire[32..36], &3u32.to_le_bytes());

        assert_eq!(UdpPacket::decode(&wire).unwrap(), packet);
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let mut wire = UdpPacket::new(PacketType::Datagram).encode();
        wire[0] ^= 0xFF;
        assert!(matches!(UdpPacket::decode(&wire), Err(PacketError::BadMagic(_))));
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let wire = UdpPacket::with_payload(PacketType::Data, vec![1; 10]).unwrap().encode();
        assert!(matches!(
            UdpPacket::decode(&wire[..wire.len() - 1]),
            Err(PacketError::TooShort { .. })
        ));
        assert!(UdpPacket::decode(&wire[..10]).is_err());
    }

    #[test]
    fn test_decode_rejects_oversized_payload_field() {
        let mut wire = UdpPacket::new(PacketType::Data).encode();
        wire[4..6].copy_from_slice(&((MAX_PAYLOAD + 1) as u16).to_le_bytes());
        assert!(matches!(
            UdpPacket::decode(&wire),
            Err(PacketError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn test_payload_cap() {
        assert!(UdpPacket::with_payload(PacketType::Data, vec![0; MAX_PAYLOAD]).is_ok());
        assert!(UdpPacket::with_payload(PacketType::Data, vec![0; MAX_PAYLOAD + 1]).is_err());
    }

    #[test]
    fn test_challenge_answer() {
        let challenge = ChallengeData {
            challenge_value: 0x1234_5678,
            server_load: 9,
        };
        let decoded = ChallengeData::decode(&challenge.encode()).unwrap();
        assert_eq!(decoded, challenge);

        let answer = ConnectData::answer(&challenge);
        assert_eq!(answer.challenge_value, 0x1234_5678 ^ 0xA426_DF2B);
        assert_eq!(ConnectData::decode(&answer.encode()).unwrap(), answer);
    }
}
