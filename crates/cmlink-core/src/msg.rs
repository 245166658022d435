//! Channel handshake messages.
//!
//! The handshake runs before any encryption and uses the fixed, non-protobuf
//! message header. All fields are little-endian:
//!
//! ```text
//! emsg u32 | target_job_id u64 | source_job_id u64 | body
//! ```
//!
//! | Message | EMsg | Body |
//! |---------|------|------|
//! | `ChannelEncryptRequest` | 1303 | `protocol_version u32, universe u32, challenge..` |
//! | `ChannelEncryptResponse` | 1304 | `protocol_version u32, key_size u32, key.., crc u32, 0u32` |
//! | `ChannelEncryptResult` | 1305 | `result i32` |

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::HandshakeError;

/// Bit set on the EMsg of protobuf-framed messages
pub const PROTO_MASK: u32 = 0x8000_0000;

/// Size of [`MsgHdr`] on the wire
pub const MSG_HDR_SIZE: usize = 20;

/// Handshake version this client speaks
pub const PROTOCOL_VERSION: u32 = 1;

/// `key_size` value sent in the response
pub const ENCRYPTED_KEY_SIZE: u32 = 128;

/// `EResult::OK`
pub const RESULT_OK: i32 = 1;

/// Job ID meaning "no job"
const NO_JOB: u64 = u64::MAX;

/// Message types used by the channel handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EMsg {
    /// Server asks the client to set up encryption
    ChannelEncryptRequest = 1303,
    /// Client returns the wrapped session key
    ChannelEncryptResponse = 1304,
    /// Server reports whether the channel is usable
    ChannelEncryptResult = 1305,
}

impl EMsg {
    /// Raw value, proto bit cleared
    #[must_use]
    pub fn raw(self) -> u32 {
        self as u32
    }

    /// Map a raw header value, ignoring the proto bit
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw & !PROTO_MASK {
            1303 => Some(Self::ChannelEncryptRequest),
            1304 => Some(Self::ChannelEncryptResponse),
            1305 => Some(Self::ChannelEncryptResult),
            _ => None,
        }
    }
}

/// Steam universes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum Universe {
    /// Invalid
    Invalid = 0,
    /// Public
    #[default]
    Public = 1,
    /// Beta
    Beta = 2,
    /// Internal
    Internal = 3,
    /// Dev
    Dev = 4,
}

impl Universe {
    /// Wire value
    #[must_use]
    pub fn raw(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for Universe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Invalid => "invalid",
            Self::Public => "public",
            Self::Beta => "beta",
            Self::Internal => "internal",
            Self::Dev => "dev",
        };
        f.write_str(name)
    }
}

impl FromStr for Universe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "invalid" => Ok(Self::Invalid),
            "public" => Ok(Self::Public),
            "beta" => Ok(Self::Beta),
            "internal" => Ok(Self::Internal),
            "dev" => Ok(Self::Dev),
            other => Err(format!("unknown universe: {other}")),
        }
    }
}

/// Fixed message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHdr {
    /// Raw message type
    pub emsg: u32,
    /// Target job ID
    pub target_job_id: u64,
    /// Source job ID
    pub source_job_id: u64,
}

impl MsgHdr {
    /// Header for `emsg` with no jobs attached
    #[must_use]
    pub fn new(emsg: EMsg) -> Self {
        Self {
            emsg: emsg.raw(),
            target_job_id: NO_JOB,
            source_job_id: NO_JOB,
        }
    }

    /// Append the encoded header to `buf`
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.emsg.to_le_bytes());
        buf.extend_from_slice(&self.target_job_id.to_le_bytes());
        buf.extend_from_slice(&self.source_job_id.to_le_bytes());
    }

    /// Parse a header, returning it with the remaining body
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError::TooShort`] if `data` is shorter than the header.
    pub fn decode(data: &[u8]) -> Result<(Self, &[u8]), HandshakeError> {
        if data.len() < MSG_HDR_SIZE {
            return Err(HandshakeError::TooShort {
                expected: MSG_HDR_SIZE,
                actual: data.len(),
            });
        }
        let hdr = Self {
            emsg: read_u32(data, 0),
            target_job_id: read_u64(data, 4),
            source_job_id: read_u64(data, 12),
        };
        Ok((hdr, &data[MSG_HDR_SIZE..]))
    }

    /// Message type, if it is one the handshake knows
    #[must_use]
    pub fn msg_type(&self) -> Option<EMsg> {
        EMsg::from_raw(self.emsg)
    }
}

/// Server's request to begin channel encryption
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEncryptRequest {
    /// Handshake version
    pub protocol_version: u32,
    /// Raw universe
    pub universe: u32,
    /// Random challenge to echo inside the wrapped key (may be empty)
    pub challenge: Vec<u8>,
}

impl ChannelEncryptRequest {
    const BODY_SIZE: usize = 8;

    /// Serialize with header
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MSG_HDR_SIZE + Self::BODY_SIZE + self.challenge.len());
        MsgHdr::new(EMsg::ChannelEncryptRequest).encode_into(&mut buf);
        buf.extend_from_slice(&self.protocol_version.to_le_bytes());
        buf.extend_from_slice(&self.universe.to_le_bytes());
        buf.extend_from_slice(&self.challenge);
        buf
    }

    /// Parse a full message
    ///
    /// # Errors
    ///
    /// Returns an error if the message is truncated or of another type.
    pub fn decode(data: &[u8]) -> Result<Self, HandshakeError> {
        let body = expect_body(data, EMsg::ChannelEncryptRequest, Self::BODY_SIZE)?;
        Ok(Self {
            protocol_version: read_u32(body, 0),
            universe: read_u32(body, 4),
            challenge: body[Self::BODY_SIZE..].to_vec(),
        })
    }
}

/// Client's reply carrying the RSA-wrapped session key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEncryptResponse {
    /// Handshake version
    pub protocol_version: u32,
    /// Wrapped key size field
    pub key_size: u32,
    /// RSA-OAEP encrypted session key (and challenge)
    pub encrypted_key: Vec<u8>,
    /// CRC32 of `encrypted_key`
    pub key_crc: u32,
}

impl ChannelEncryptResponse {
    /// Serialize with header
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MSG_HDR_SIZE + 16 + self.encrypted_key.len());
        MsgHdr::new(EMsg::ChannelEncryptResponse).encode_into(&mut buf);
        buf.extend_from_slice(&self.protocol_version.to_le_bytes());
        buf.extend_from_slice(&self.key_size.to_le_bytes());
        buf.extend_from_slice(&self.encrypted_key);
        buf.extend_from_slice(&self.key_crc.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf
    }

    /// Parse a full message; the key is `key_size` bytes long
    ///
    /// # Errors
    ///
    /// Returns an error if the message is truncated or of another type.
    pub fn decode(data: &[u8]) -> Result<Self, HandshakeError> {
        let body = expect_body(data, EMsg::ChannelEncryptResponse, 8)?;
        let key_size = read_u32(body, 4);
        let key_end = 8 + key_size as usize;
        if body.len() < key_end + 8 {
            return Err(HandshakeError::TooShort {
                expected: MSG_HDR_SIZE + key_end + 8,
                actual: data.len(),
            });
        }
        Ok(Self {
            protocol_version: read_u32(body, 0),
            key_size,
            encrypted_key: body[8..key_end].to_vec(),
            key_crc: read_u32(body, key_end),
        })
    }
}

/// Server's verdict on the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEncryptResult {
    /// `EResult` value; [`RESULT_OK`] on success
    pub result: i32,
}

impl ChannelEncryptResult {
    /// Serialize with header
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MSG_HDR_SIZE + 4);
        MsgHdr::new(EMsg::ChannelEncryptResult).encode_into(&mut buf);
        buf.extend_from_slice(&self.result.to_le_bytes());
        buf
    }

    /// Parse a full message
    ///
    /// # Errors
    ///
    /// Returns an error if the message is truncated or of another type.
    pub fn decode(data: &[u8]) -> Result<Self, HandshakeError> {
        let body = expect_body(data, EMsg::ChannelEncryptResult, 4)?;
        Ok(Self {
            result: read_u32(body, 0) as i32,
        })
    }

    /// Whether the server accepted the channel
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.result == RESULT_OK
    }
}

fn expect_body(data: &[u8], emsg: EMsg, min_body: usize) -> Result<&[u8], HandshakeError> {
    let (hdr, body) = MsgHdr::decode(data)?;
    if hdr.msg_type() != Some(emsg) {
        return Err(HandshakeError::UnexpectedMessage {
            expected: emsg.raw(),
            actual: hdr.emsg,
        });
    }
    if body.len() < min_body {
        return Err(HandshakeError::TooShort {
            expected: MSG_HDR_SIZE + min_body,
            actual: data.len(),
        });
    }
    Ok(body)
}

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn read_u64(data: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(bytes)
}
