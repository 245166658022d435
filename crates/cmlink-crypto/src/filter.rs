//! Symmetric channel filters.
//!
//! Once the envelope handshake has negotiated a session key, every payload
//! crossing the channel goes through one of two AES-256 filters. Both emit the
//! same layout:
//!
//! ```text
//! +------------------------+----------------------------------+
//! | AES-256-ECB(IV) (16 B) | AES-256-CBC-PKCS7(payload, IV)   |
//! +------------------------+----------------------------------+
//! ```
//!
//! They differ in how the IV is chosen. The plain filter draws 16 random
//! bytes. The HMAC filter derives the first 13 bytes from
//! `HMAC-SHA1(key[..16], random3 || payload)` and appends the 3 random bytes,
//! so the receiver can authenticate the payload after decryption.

use aes::Aes256;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::random::{fill_random, random_16};
use crate::{CryptoError, SESSION_KEY_SIZE};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha1 = Hmac<Sha1>;

/// AES block / IV size
pub const IV_SIZE: usize = 16;

/// Bytes of the session key used as the HMAC secret
const HMAC_SECRET_SIZE: usize = 16;

/// Bytes of the HMAC digest carried in the IV
const HMAC_IV_DIGEST_LEN: usize = 13;

/// Random bytes appended to the HMAC IV
const HMAC_IV_RANDOM_LEN: usize = IV_SIZE - HMAC_IV_DIGEST_LEN;

/// Which filter variant protects a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// Random IV, no payload authentication
    Plain,
    /// IV carries a truncated HMAC-SHA1 of the payload
    Hmac,
}

/// Symmetric filter applied to every payload of an encrypted channel
pub enum SessionFilter {
    /// Random-IV filter (server sent no challenge)
    Plain(PlainFilter),
    /// HMAC-IV filter (server sent a challenge)
    Hmac(HmacFilter),
}

impl SessionFilter {
    /// Which variant this is
    #[must_use]
    pub fn kind(&self) -> FilterKind {
        match self {
            Self::Plain(_) => FilterKind::Plain,
            Self::Hmac(_) => FilterKind::Hmac,
        }
    }

    /// Encrypt an outbound payload
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the IV cannot be generated.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Self::Plain(f) => f.encrypt(plaintext),
            Self::Hmac(f) => f.encrypt(plaintext),
        }
    }

    /// Decrypt an inbound payload
    ///
    /// # Errors
    ///
    /// Returns an error if the ciphertext is malformed, the padding is
    /// invalid, or (HMAC variant) the payload fails authentication.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            Self::Plain(f) => f.decrypt(ciphertext),
            Self::Hmac(f) => f.decrypt(ciphertext),
        }
    }
}

impl std::fmt::Debug for SessionFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFilter")
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

/// AES-256 filter with a random IV
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PlainFilter {
    key: [u8; SESSION_KEY_SIZE],
}

impl PlainFilter {
    /// Create a filter over a 32-byte session key
    #[must_use]
    pub fn new(key: [u8; SESSION_KEY_SIZE]) -> Self {
        Self { key }
    }

    /// Encrypt with a fresh random IV
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the IV cannot be generated.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let iv = random_16()?;
        encrypt_with_iv(&self.key, &iv, plaintext)
    }

    /// Decrypt a payload produced by [`PlainFilter::encrypt`]
    ///
    /// # Errors
    ///
    /// Returns an error on malformed ciphertext or bad padding.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        decrypt_with_iv(&self.key, ciphertext).map(|(_, plaintext)| plaintext)
    }
}

/// AES-256 filter whose IV authenticates the payload
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct HmacFilter {
    key: [u8; SESSION_KEY_SIZE],
    hmac_secret: [u8; HMAC_SECRET_SIZE],
}

impl HmacFilter {
    /// Create a filter over a 32-byte session key
    ///
    /// The first 16 key bytes double as the HMAC secret.
    #[must_use]
    pub fn new(key: [u8; SESSION_KEY_SIZE]) -> Self {
        let mut hmac_secret = [0u8; HMAC_SECRET_SIZE];
        hmac_secret.copy_from_slice(&key[..HMAC_SECRET_SIZE]);
        Self { key, hmac_secret }
    }

    /// Encrypt with an HMAC-derived IV
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the IV suffix cannot be generated.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut iv = [0u8; IV_SIZE];
        fill_random(&mut iv[HMAC_IV_DIGEST_LEN..])?;

        let digest = self.digest(&iv[HMAC_IV_DIGEST_LEN..], plaintext)?;
        iv[..HMAC_IV_DIGEST_LEN].copy_from_slice(&digest[..HMAC_IV_DIGEST_LEN]);

        encrypt_with_iv(&self.key, &iv, plaintext)
    }

    /// Decrypt and authenticate a payload produced by [`HmacFilter::encrypt`]
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::HmacMismatch`] if the payload does not match the
    /// digest carried in its IV, or a decryption error on malformed input.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (iv, plaintext) = decrypt_with_iv(&self.key, ciphertext)?;

        let mut mac = self.mac()?;
        mac.update(&iv[HMAC_IV_DIGEST_LEN..]);
        mac.update(&plaintext);
        mac.verify_truncated_left(&iv[..HMAC_IV_DIGEST_LEN])
            .map_err(|_| CryptoError::HmacMismatch)?;

        Ok(plaintext)
    }

    fn mac(&self) -> Result<HmacSha1, CryptoError> {
        <HmacSha1 as Mac>::new_from_slice(&self.hmac_secret).map_err(|_| {
            CryptoError::InvalidKeyLength {
                expected: HMAC_SECRET_SIZE,
                actual: self.hmac_secret.len(),
            }
        })
    }

    fn digest(&self, random: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut mac = self.mac()?;
        mac.update(random);
        mac.update(plaintext);
        Ok(mac.finalize().into_bytes().to_vec())
    }
}

fn invalid_key(actual: usize) -> CryptoError {
    CryptoError::InvalidKeyLength {
        expected: SESSION_KEY_SIZE,
        actual,
    }
}

/// Encrypt `plaintext` under `key` with an explicit IV.
fn encrypt_with_iv(
    key: &[u8; SESSION_KEY_SIZE],
    iv: &[u8; IV_SIZE],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let ecb = Aes256::new_from_slice(key).map_err(|_| invalid_key(key.len()))?;
    let mut iv_block = aes::Block::clone_from_slice(iv);
    ecb.encrypt_block(&mut iv_block);

    let body = Aes256CbcEnc::new_from_slices(key, iv)
        .map_err(|_| CryptoError::EncryptionFailed)?
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(IV_SIZE + body.len());
    out.extend_from_slice(&iv_block);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decrypt a filter payload, returning the recovered IV and plaintext.
fn decrypt_with_iv(
    key: &[u8; SESSION_KEY_SIZE],
    ciphertext: &[u8],
) -> Result<([u8; IV_SIZE], Vec<u8>), CryptoError> {
    if ciphertext.len() < 2 * IV_SIZE || ciphertext.len() % IV_SIZE != 0 {
        return Err(CryptoError::InvalidCiphertextLength(ciphertext.len()));
    }

    let ecb = Aes256::new_from_slice(key).map_err(|_| invalid_key(key.len()))?;
    let mut iv_block = aes::Block::clone_from_slice(&ciphertext[..IV_SIZE]);
    ecb.decrypt_block(&mut iv_block);

    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&iv_block);

    let plaintext = Aes256CbcDec::new_from_slices(key, &iv)
        .map_err(|_| CryptoError::DecryptionFailed)?
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext[IV_SIZE..])
        .map_err(|_| CryptoError::DecryptionFailed)?;

    Ok((iv, plaintext))
}
