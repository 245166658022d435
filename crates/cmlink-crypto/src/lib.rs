//! # cmlink Crypto
//!
//! Cryptographic primitives for the envelope-encrypted CM channel.
//!
//! This crate provides:
//! - Session key generation
//! - RSA-OAEP (SHA-1) wrapping of the session key for the server
//! - CRC32 checksums of the wrapped key blob
//! - AES-256 channel filters (random IV and HMAC-authenticated IV)
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm |
//! |----------|-----------|
//! | Key wrapping | RSA-OAEP, SHA-1 |
//! | Channel cipher | AES-256-CBC, PKCS#7, ECB-encrypted IV |
//! | Payload authentication | HMAC-SHA1, truncated to 13 bytes |
//! | Blob checksum | CRC32 |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod filter;
pub mod random;
pub mod session;

pub use error::CryptoError;
pub use filter::{FilterKind, HmacFilter, PlainFilter, SessionFilter};
pub use session::{ServerPublicKey, SessionKey, blob_checksum};

/// Symmetric session key size
pub const SESSION_KEY_SIZE: usize = 32;

/// Minimum challenge length that switches the channel to the HMAC filter
pub const MIN_CHALLENGE_SIZE: usize = 16;
