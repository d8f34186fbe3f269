use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use cloakfs_core::{AeadKind, ContentCrypter, CryptoCore, MasterKey, DEFAULT_PLAIN_BS};

/// Create a deterministic MasterKey for testing
#[allow(dead_code)] // Used in name and concurrency tests
pub fn create_test_master_key() -> MasterKey {
    MasterKey::new([0x01; 32], [0x02; 32])
}

/// A content crypter over the test master key.
#[allow(dead_code)] // Not every test binary uses it
pub fn test_crypter(kind: AeadKind, force_decode: bool) -> Arc<ContentCrypter> {
    let core = CryptoCore::new(&create_test_master_key(), kind);
    Arc::new(ContentCrypter::new(core, DEFAULT_PLAIN_BS, force_decode))
}

/// Open (or create) a backing file the way the dispatcher does:
/// read-write regardless of the caller's mode, so sub-block writes can
/// read the old block back.
#[allow(dead_code)] // Used in file-handle and concurrency tests
pub fn open_backing(path: &Path) -> File {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .expect("failed to open backing file")
}

/// Create content of exactly the specified size
#[allow(dead_code)] // Not every test binary uses it
pub fn create_sized_content(size: usize) -> Vec<u8> {
    let pattern = b"0123456789ABCDEF";
    (0..size).map(|i| pattern[i % pattern.len()]).collect()
}
