//! File header: format version and per-file identifier.
//!
//! Every non-empty ciphertext file starts with an 18-byte header:
//! ```text
//! [2 bytes: format version, big-endian][16 bytes: random file ID]
//! ```
//! The file ID is bound into every block's AAD, so ciphertext blocks
//! cannot be transplanted between files. The header is written once at
//! file creation and never rewritten.

use rand::RngCore;
use thiserror::Error;

/// Current on-disk format version.
pub const HEADER_CURRENT_VERSION: u16 = 2;

/// Length of the random per-file identifier, in bytes.
pub const FILE_ID_LEN: usize = 16;

/// Total header length, in bytes.
pub const HEADER_LEN: usize = 2 + FILE_ID_LEN;

/// Header corruption errors.
///
/// A ciphertext file is either empty or starts with a full header; any
/// file shorter than [`HEADER_LEN`] but not empty is corrupt.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("file header too short: {len} bytes (want {HEADER_LEN})")]
    TooShort { len: usize },

    #[error("unsupported file format version {version}")]
    BadVersion { version: u16 },
}

/// Parsed file header.
#[derive(Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u16,
    pub file_id: [u8; FILE_ID_LEN],
}

impl FileHeader {
    /// A fresh header with the current version and a random file ID.
    pub fn random() -> Self {
        let mut file_id = [0u8; FILE_ID_LEN];
        rand::rng().fill_bytes(&mut file_id);
        Self {
            version: HEADER_CURRENT_VERSION,
            file_id,
        }
    }

    /// Serialize for writing at offset zero of the backing file.
    pub fn pack(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..2].copy_from_slice(&self.version.to_be_bytes());
        out[2..].copy_from_slice(&self.file_id);
        out
    }

    /// Parse the header from the start of a ciphertext file.
    pub fn unpack(buf: &[u8]) -> Result<Self, HeaderError> {
        if buf.len() < HEADER_LEN {
            return Err(HeaderError::TooShort { len: buf.len() });
        }
        let version = u16::from_be_bytes([buf[0], buf[1]]);
        if version != HEADER_CURRENT_VERSION {
            return Err(HeaderError::BadVersion { version });
        }
        let mut file_id = [0u8; FILE_ID_LEN];
        file_id.copy_from_slice(&buf[2..HEADER_LEN]);
        Ok(Self { version, file_id })
    }
}

impl std::fmt::Debug for FileHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // File IDs are not secret, but keep them short in logs.
        f.debug_struct("FileHeader")
            .field("version", &self.version)
            .field("file_id", &format_args!("{:02x}{:02x}..", self.file_id[0], self.file_id[1]))
            .finish()
    }
}
