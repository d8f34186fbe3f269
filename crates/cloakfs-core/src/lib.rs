#![forbid(unsafe_code)]

//! cloakfs-core: the cryptographic content and name layer of the cloakfs
//! encrypted overlay filesystem.
//!
//! Plaintext operations issued by users are mapped onto a backing
//! directory holding only ciphertext blocks, encrypted filenames and
//! per-directory IVs. This crate owns the on-disk format and everything
//! cryptographic about it:
//!
//! - [`crypto`] — AEAD backends (AES-256-GCM / AES-SIV) and key material
//! - [`content`] — block codec, buffer pools, size mapping, file header
//! - [`fs`] — file handles (read-modify-write), filename encryption,
//!   directory IVs, symlink targets
//! - [`vault`] — the reserved config file with the wrapped master key
//!
//! The filesystem dispatcher (FUSE loop, POSIX metadata operations,
//! CLI) lives outside this crate and calls in here.

pub mod content;
pub mod crypto;
pub mod error;
pub mod fs;
pub mod vault;

// Re-export the types nearly every caller needs at crate root.
pub use content::{ContentCrypter, FileHeader, DEFAULT_PLAIN_BS, MAX_KERNEL_WRITE};
pub use crypto::{AeadKind, CryptoCore, MasterKey};
pub use fs::{DirIvStore, EncryptedFile, NameCodec};
pub use vault::{ConfFile, FeatureFlag};
