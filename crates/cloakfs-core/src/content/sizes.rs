//! Pure size mapping between plaintext and ciphertext file lengths.
//!
//! Used by stat: the dispatcher reports plaintext sizes computed from the
//! backing file's length without reading any content.

use thiserror::Error;

use super::header::HEADER_LEN;
use super::ContentCrypter;
use crate::crypto::BLOCK_OVERHEAD;

/// A ciphertext length that cannot result from any plaintext.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SizeError {
    /// The final partial block is shorter than nonce + tag.
    #[error("ciphertext size {size} has an impossible {tail}-byte tail block")]
    InvalidTail { size: u64, tail: u64 },
}

impl ContentCrypter {
    /// Plaintext size of a file whose backing store is `cipher_size` bytes.
    ///
    /// Sizes up to the header length map to zero (an empty file has no
    /// header at all; a header-only file holds no content yet).
    pub fn plain_size(&self, cipher_size: u64) -> Result<u64, SizeError> {
        if cipher_size <= HEADER_LEN as u64 {
            return Ok(0);
        }
        let body = cipher_size - HEADER_LEN as u64;
        let cipher_bs = self.cipher_bs() as u64;
        let full_blocks = body / cipher_bs;
        let tail = body % cipher_bs;
        if tail > 0 && tail < BLOCK_OVERHEAD as u64 {
            return Err(SizeError::InvalidTail {
                size: cipher_size,
                tail,
            });
        }
        Ok(full_blocks * self.plain_bs() as u64 + tail.saturating_sub(BLOCK_OVERHEAD as u64))
    }

    /// Backing-store size of a file holding `plain_size` plaintext bytes.
    /// Inverse of [`ContentCrypter::plain_size`] for all valid sizes.
    pub fn cipher_size(&self, plain_size: u64) -> u64 {
        if plain_size == 0 {
            return 0;
        }
        let plain_bs = self.plain_bs() as u64;
        let full_blocks = plain_size / plain_bs;
        let tail = plain_size % plain_bs;
        let mut size = HEADER_LEN as u64 + full_blocks * self.cipher_bs() as u64;
        if tail > 0 {
            size += BLOCK_OVERHEAD as u64 + tail;
        }
        size
    }
}
