//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// Decryption failed (bad key or corrupted padding)
    #[error("decryption failed")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Ciphertext cannot hold an IV block plus at least one data block
    #[error("invalid ciphertext length: {0}")]
    InvalidCiphertextLength(usize),

    /// HMAC embedded in the IV does not match the decrypted payload
    #[error("hmac mismatch")]
    HmacMismatch,

    /// Public key could not be parsed
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// RSA operation failed
    #[error("rsa error: {0}")]
    Rsa(String),

    /// Random number generation failed
    #[error("random number generation failed")]
    RandomFailed,
}
