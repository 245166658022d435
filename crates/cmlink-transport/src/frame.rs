//! TCP stream framing.
//!
//! Every payload on a TCP carrier is prefixed with an 8-byte header. Both
//! fields are little-endian:
//!
//! ```text
//! +-------------+----------------------+-----------------+
//! | length: u32 | magic: u32 ("VT01")  | payload[length] |
//! +-------------+----------------------+-----------------+
//! ```

use crate::error::FrameError;

/// Frame magic, "VT01" read as a little-endian u32
pub const FRAME_MAGIC: u32 = 0x3130_5456;

/// Frame header size (length + magic)
pub const FRAME_HEADER_SIZE: usize = 8;

/// Largest payload accepted from or written to the wire
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame a payload for the wire
///
/// # Errors
///
/// Returns [`FrameError::TooLarge`] if the payload exceeds [`MAX_FRAME_SIZE`].
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Incremental frame decoder
///
/// Bytes arrive from the socket in arbitrary chunks; the decoder buffers them
/// and hands out complete payloads in order. The magic is checked as soon as a
/// header is available, before the payload has arrived.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the socket
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet returned
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete payload, if one is buffered
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::BadMagic`] or [`FrameError::TooLarge`] when the
    /// next header is invalid. The stream cannot be resynchronised after that.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        let magic = u32::from_le_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]);

        if magic != FRAME_MAGIC {
            return Err(FrameError::BadMagic(magic));
        }
        if len > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge {
                size: len,
                max: MAX_FRAME_SIZE,
            });
        }

        let total = FRAME_HEADER_SIZE + len;
        if self.buf.len() < total {
            return Ok(None);
        }

        let payload = self.buf[FRAME_HEADER_SIZE..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(payload))
    }
}
