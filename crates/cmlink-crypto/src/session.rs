//! Session key generation and RSA key wrapping.
//!
//! The client invents a random 32-byte session key and wraps it for the
//! server with RSA-OAEP (SHA-1) under the universe public key. When the server
//! supplied a challenge, the challenge is appended to the key before wrapping
//! so the server can tell the blob was produced for this connection.

use rand_core::OsRng;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPublicKey};
use sha1::Sha1;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::filter::{HmacFilter, PlainFilter, SessionFilter};
use crate::random::random_32;
use crate::{CryptoError, SESSION_KEY_SIZE};

/// Random symmetric key for one encrypted channel
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_SIZE]);

impl SessionKey {
    /// Generate a fresh key from the OS CSPRNG
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the CSPRNG fails.
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self(random_32()?))
    }

    /// Wrap existing key bytes
    #[must_use]
    pub fn from_bytes(bytes: [u8; SESSION_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }

    /// Plaintext that gets RSA-wrapped: the key, followed by the challenge if any
    #[must_use]
    pub fn blob(&self, challenge: Option<&[u8]>) -> Zeroizing<Vec<u8>> {
        let challenge = challenge.unwrap_or_default();
        let mut blob = Zeroizing::new(Vec::with_capacity(SESSION_KEY_SIZE + challenge.len()));
        blob.extend_from_slice(&self.0);
        blob.extend_from_slice(challenge);
        blob
    }

    /// Build the channel filter for this key
    ///
    /// Challenged handshakes authenticate payloads through the IV; plain ones do not.
    #[must_use]
    pub fn into_filter(self, challenged: bool) -> SessionFilter {
        if challenged {
            SessionFilter::Hmac(HmacFilter::new(self.0))
        } else {
            SessionFilter::Plain(PlainFilter::new(self.0))
        }
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// RSA public key of a server universe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPublicKey(RsaPublicKey);

impl ServerPublicKey {
    /// Parse a DER key, either SubjectPublicKeyInfo or bare PKCS#1
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if neither encoding parses.
    pub fn from_der(der: &[u8]) -> Result<Self, CryptoError> {
        RsaPublicKey::from_public_key_der(der)
            .or_else(|_| RsaPublicKey::from_pkcs1_der(der))
            .map(Self)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
    }

    /// Parse a PEM key (`PUBLIC KEY` or `RSA PUBLIC KEY`)
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if neither encoding parses.
    pub fn from_pem(pem: &str) -> Result<Self, CryptoError> {
        RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map(Self)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
    }

    /// Parse key file contents, detecting PEM armor
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the contents are not a key.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        match std::str::from_utf8(bytes) {
            Ok(text) if text.trim_start().starts_with("-----BEGIN") => Self::from_pem(text),
            _ => Self::from_der(bytes),
        }
    }

    /// Modulus size in bits
    #[must_use]
    pub fn bits(&self) -> usize {
        self.0.size() * 8
    }

    /// Encrypt `data` with RSA-OAEP using SHA-1
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Rsa`] if `data` is too long for the modulus.
    pub fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.0
            .encrypt(&mut OsRng, Oaep::new::<Sha1>(), data)
            .map_err(|e| CryptoError::Rsa(e.to_string()))
    }
}

impl From<RsaPublicKey> for ServerPublicKey {
    fn from(key: RsaPublicKey) -> Self {
        Self(key)
    }
}

/// CRC32 of an encrypted key blob, as carried in the handshake response
#[must_use]
pub fn blob_checksum(blob: &[u8]) -> u32 {
    crc32fast::hash(blob)
}
