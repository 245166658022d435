//! Error types for the envelope layer.

use thiserror::Error;

use crate::msg::Universe;

/// Envelope layer errors
#[derive(Debug, Error)]
pub enum Error {
    /// Channel handshake failed
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    /// Cryptographic error
    #[error("crypto error: {0}")]
    Crypto(#[from] cmlink_crypto::CryptoError),

    /// Transport error
    #[error("transport error: {0}")]
    Transport(#[from] cmlink_transport::TransportError),

    /// I/O error (thread spawn)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Handshake-level errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Message too short to parse
    #[error("message too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Message type does not match what was being decoded
    #[error("unexpected message type {actual} (expected {expected})")]
    UnexpectedMessage {
        /// Expected EMsg
        expected: u32,
        /// EMsg found in the header
        actual: u32,
    },

    /// Server speaks a different handshake version
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersion {
        /// Version this client implements
        expected: u32,
        /// Version the server sent
        actual: u32,
    },

    /// Server belongs to a different universe
    #[error("universe mismatch: expected {expected}, got {actual}")]
    UniverseMismatch {
        /// Configured universe
        expected: Universe,
        /// Raw universe the server sent
        actual: u32,
    },

    /// Server refused the channel
    #[error("channel encryption rejected with result {0}")]
    Rejected(i32),
}

/// Result type for envelope operations
pub type Result<T> = std::result::Result<T, Error>;
