//! Error types for the carrier layer.

use std::io;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Peer closed the connection
    #[error("connection closed by peer")]
    Closed,

    /// Endpoint could not be resolved to a socket address
    #[error("failed to resolve {0}")]
    Resolve(String),

    /// Connection attempt failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection timed out
    #[error("connection timed out")]
    Timeout,

    /// Malformed TCP frame
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Malformed UDP packet
    #[error("packet error: {0}")]
    Packet(#[from] PacketError),

    /// WebSocket protocol error
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Endpoint string could not be parsed
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// TCP frame errors
#[derive(Debug, Error)]
pub enum FrameError {
    /// Frame header carried the wrong magic
    #[error("bad frame magic: 0x{0:08X}")]
    BadMagic(u32),

    /// Frame length exceeds the allowed maximum
    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge {
        /// Declared or requested size
        size: usize,
        /// Maximum accepted size
        max: usize,
    },
}

/// UDP packet errors
#[derive(Debug, Error)]
pub enum PacketError {
    /// Datagram too short to parse
    #[error("packet too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Header carried the wrong magic
    #[error("bad packet magic: 0x{0:08X}")]
    BadMagic(u32),

    /// Unknown packet type byte
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),

    /// Payload larger than a single packet may carry
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}
