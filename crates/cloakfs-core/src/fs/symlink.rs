//! Symlink target encryption.
//!
//! A symlink target is encrypted like file content: one block with block
//! number 0 and an empty file ID (symlinks have no header to bind to),
//! then base64-encoded so it survives as a path string in the backing
//! store. The AEAD tag still protects the target from tampering.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use thiserror::Error;

use crate::content::{BlockDecryptError, ContentCrypter};

#[derive(Debug, Error)]
pub enum SymlinkError {
    #[error("invalid base64 in symlink target: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error(transparent)]
    Block(#[from] BlockDecryptError),

    #[error("decrypted symlink target is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Encrypt a symlink target for storage in the backing store.
pub fn encrypt_symlink_target(crypter: &ContentCrypter, target: &str) -> String {
    let block = crypter.encrypt_block(target.as_bytes(), 0, &[]);
    URL_SAFE_NO_PAD.encode(block)
}

/// Decrypt a symlink target read from the backing store.
pub fn decrypt_symlink_target(
    crypter: &ContentCrypter,
    encrypted_target: &str,
) -> Result<String, SymlinkError> {
    let block = URL_SAFE_NO_PAD.decode(encrypted_target.as_bytes())?;
    let plaintext = crypter.decrypt_block(&block, 0, &[])?;
    Ok(String::from_utf8(plaintext)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::DEFAULT_PLAIN_BS;
    use crate::crypto::{AeadKind, CryptoCore, MasterKey};

    fn crypter() -> ContentCrypter {
        let core = CryptoCore::new(&MasterKey::random(), AeadKind::Gcm);
        ContentCrypter::new(core, DEFAULT_PLAIN_BS, false)
    }

    #[test]
    fn test_symlink_target_roundtrip() {
        let c = crypter();
        for target in ["/etc/passwd", "../relative/path", "just-a-name"] {
            let encrypted = encrypt_symlink_target(&c, target);
            assert_ne!(encrypted, target);
            assert_eq!(decrypt_symlink_target(&c, &encrypted).unwrap(), target);
        }
    }

    #[test]
    fn test_tampered_target_fails() {
        let c = crypter();
        let encrypted = encrypt_symlink_target(&c, "/some/target");
        let mut block = URL_SAFE_NO_PAD.decode(encrypted.as_bytes()).unwrap();
        let mid = block.len() / 2;
        block[mid] ^= 0x01;
        let tampered = URL_SAFE_NO_PAD.encode(block);
        assert!(matches!(
            decrypt_symlink_target(&c, &tampered),
            Err(SymlinkError::Block(_))
        ));
    }

    #[test]
    fn test_garbage_base64_fails() {
        let c = crypter();
        assert!(matches!(
            decrypt_symlink_target(&c, "!!!"),
            Err(SymlinkError::Base64(_))
        ));
    }
}
