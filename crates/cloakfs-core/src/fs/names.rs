//! Filename encryption.
//!
//! Each path component is encrypted with AES-SIV using the containing
//! directory's IV as the SIV nonce, then encoded as unpadded URL-safe
//! base64. The same name encrypts identically within one directory
//! (lookups need that), but differently across directories, so encrypted
//! trees leak no name equality between directories.
//!
//! Names whose encoded form exceeds 255 bytes cannot be stored directly;
//! they become `cloakfs.longname.<hash>` placeholder entries with a
//! `.name` sidecar holding the full encrypted name.

use aes_siv::{siv::Aes256Siv, KeyInit};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use ring::digest;
use secrecy::{ExposeSecret, SecretBox};
use thiserror::Error;

use crate::crypto::{MasterKey, MASTER_KEY_LEN};
use crate::fs::diriv::DIRIV_LEN;

/// Sidecar holding a directory's IV, present in every encrypted directory.
pub const DIRIV_NAME: &str = "cloakfs.diriv";

/// The configuration file in the root of the backing directory.
pub const CONFIG_NAME: &str = "cloakfs.conf";

/// Prefix of long-name placeholder entries and their sidecars.
pub const LONGNAME_PREFIX: &str = "cloakfs.longname.";

/// Suffix of the sidecar holding a long name's full encrypted form.
pub const LONGNAME_SUFFIX: &str = ".name";

/// Prefix of the temporary name a directory IV is parked under during rmdir.
pub const DIRIV_RESCUE_PREFIX: &str = "cloakfs.diriv.rmdir.";

/// Longest name most backing filesystems accept.
pub const MAX_NAME_LEN: usize = 255;

/// Errors from filename encryption and decryption.
#[derive(Debug, Error)]
pub enum NameError {
    /// The encrypted name is not valid base64.
    #[error("invalid base64 in encrypted name: {0}")]
    Base64(#[from] base64::DecodeError),

    /// SIV authentication failed: tampering, wrong key, or an entry moved
    /// between directories (wrong directory IV).
    #[error("failed to decrypt name: tampering, wrong key, or wrong directory IV")]
    DecryptionFailed,

    /// The decrypted bytes are not UTF-8.
    #[error("decrypted name is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// Empty, `.`, `..`, or containing `/` or NUL.
    #[error("{name:?} is not a valid filename")]
    InvalidName { name: String },

    /// The name collides with a reserved cloakfs name.
    #[error("{name:?} uses a reserved name")]
    Filtered { name: String },

    /// SIV encryption failed; cannot happen with valid inputs.
    #[error("unexpected encryption failure for {name:?}")]
    EncryptionFailed { name: String },
}

/// Encrypts and decrypts path components.
///
/// Construction is deterministic per (directory IV, name) pair, which the
/// dispatcher relies on for lookups.
pub struct NameCodec {
    siv_key: SecretBox<[u8; MASTER_KEY_LEN]>,
    plaintext_names: bool,
}

impl NameCodec {
    pub fn new(master_key: &MasterKey, plaintext_names: bool) -> Self {
        Self {
            siv_key: master_key.with_siv_key(|key| SecretBox::new(Box::new(*key))),
            plaintext_names,
        }
    }

    /// Whether names pass through unencrypted (legacy mode).
    pub fn plaintext_names(&self) -> bool {
        self.plaintext_names
    }

    fn cipher(&self) -> Aes256Siv {
        Aes256Siv::new(self.siv_key.expose_secret().into())
    }

    /// Encrypt one path component under the directory's IV.
    pub fn encrypt_name(
        &self,
        name: &str,
        dir_iv: &[u8; DIRIV_LEN],
    ) -> Result<String, NameError> {
        validate_name(name)?;
        if self.plaintext_names {
            return Ok(name.to_string());
        }
        let ciphertext = self
            .cipher()
            .encrypt([&dir_iv[..]], name.as_bytes())
            .map_err(|_| NameError::EncryptionFailed {
                name: name.to_string(),
            })?;
        Ok(URL_SAFE_NO_PAD.encode(ciphertext))
    }

    /// Decrypt one encrypted path component under the directory's IV.
    pub fn decrypt_name(
        &self,
        encrypted_name: &str,
        dir_iv: &[u8; DIRIV_LEN],
    ) -> Result<String, NameError> {
        if self.plaintext_names {
            validate_name(encrypted_name)?;
            return Ok(encrypted_name.to_string());
        }
        let ciphertext = URL_SAFE_NO_PAD.decode(encrypted_name.as_bytes())?;
        let plaintext = self
            .cipher()
            .decrypt([&dir_iv[..]], &ciphertext)
            .map_err(|_| NameError::DecryptionFailed)?;
        let name = String::from_utf8(plaintext)?;
        // An attacker moving valid ciphertext around must not produce "..".
        validate_name(&name)?;
        Ok(name)
    }

    /// Whether an encrypted name overflows the backing name limit and
    /// needs the long-name placeholder treatment.
    pub fn is_long_name(encrypted_name: &str) -> bool {
        encrypted_name.len() > MAX_NAME_LEN
    }

    /// Placeholder entry name for an over-long encrypted name:
    /// `cloakfs.longname.<base64url(sha256(encrypted_name))>`.
    pub fn hash_long_name(encrypted_name: &str) -> String {
        let hash = digest::digest(&digest::SHA256, encrypted_name.as_bytes());
        format!("{LONGNAME_PREFIX}{}", URL_SAFE_NO_PAD.encode(hash.as_ref()))
    }

    /// The sidecar that stores the full encrypted name for a placeholder.
    pub fn long_name_sidecar(placeholder: &str) -> String {
        format!("{placeholder}{LONGNAME_SUFFIX}")
    }
}

impl std::fmt::Debug for NameCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NameCodec")
            .field("plaintext_names", &self.plaintext_names)
            .finish_non_exhaustive()
    }
}

/// Reject names no filesystem entry may carry.
fn validate_name(name: &str) -> Result<(), NameError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(NameError::InvalidName {
            name: name.to_string(),
        });
    }
    if is_reserved_name(name) {
        return Err(NameError::Filtered {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Whether a single name collides with cloakfs' reserved names.
pub fn is_reserved_name(name: &str) -> bool {
    name == CONFIG_NAME
        || name == DIRIV_NAME
        || name.starts_with(LONGNAME_PREFIX)
        || name.starts_with(DIRIV_RESCUE_PREFIX)
}

/// Whether any component of a relative plaintext path is reserved.
///
/// The dispatcher rejects such paths with a permission error before any
/// backing-store access.
pub fn is_filtered(rel_path: &str) -> bool {
    rel_path.split('/').any(is_reserved_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> NameCodec {
        NameCodec::new(&MasterKey::new([1u8; 32], [2u8; 32]), false)
    }

    const IV_A: [u8; DIRIV_LEN] = [0x11; DIRIV_LEN];
    const IV_B: [u8; DIRIV_LEN] = [0x22; DIRIV_LEN];

    #[test]
    fn test_name_roundtrip() {
        let codec = codec();
        for name in [
            "simple.txt",
            "file with spaces.doc",
            "unicode-café.txt",
            ".hidden",
            "file.with.multiple.dots",
        ] {
            let encrypted = codec.encrypt_name(name, &IV_A).unwrap();
            assert_ne!(encrypted, name);
            let decrypted = codec.decrypt_name(&encrypted, &IV_A).unwrap();
            assert_eq!(decrypted, name, "roundtrip failed for {name:?}");
        }
    }

    #[test]
    fn test_encryption_is_deterministic_per_directory() {
        let codec = codec();
        let a = codec.encrypt_name("report.pdf", &IV_A).unwrap();
        let b = codec.encrypt_name("report.pdf", &IV_A).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_same_name_differs_across_directories() {
        let codec = codec();
        let a = codec.encrypt_name("report.pdf", &IV_A).unwrap();
        let b = codec.encrypt_name("report.pdf", &IV_B).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_with_wrong_iv_fails() {
        let codec = codec();
        let encrypted = codec.encrypt_name("report.pdf", &IV_A).unwrap();
        assert!(matches!(
            codec.decrypt_name(&encrypted, &IV_B),
            Err(NameError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let codec = codec();
        let other = NameCodec::new(&MasterKey::new([9u8; 32], [9u8; 32]), false);
        let encrypted = codec.encrypt_name("report.pdf", &IV_A).unwrap();
        assert!(other.decrypt_name(&encrypted, &IV_A).is_err());
    }

    #[test]
    fn test_encrypted_names_are_base64url_without_padding() {
        let codec = codec();
        for name in ["a", "ab", "abc", "abcd", "document.pdf"] {
            let encrypted = codec.encrypt_name(name, &IV_A).unwrap();
            assert!(!encrypted.contains('='), "no padding expected");
            assert!(!encrypted.contains('+') && !encrypted.contains('/'));
            assert!(URL_SAFE_NO_PAD.decode(encrypted.as_bytes()).is_ok());
        }
    }

    #[test]
    fn test_invalid_plaintext_names_rejected() {
        let codec = codec();
        for name in ["", ".", "..", "a/b", "nul\0byte"] {
            assert!(
                matches!(
                    codec.encrypt_name(name, &IV_A),
                    Err(NameError::InvalidName { .. })
                ),
                "{name:?} must be rejected"
            );
        }
    }

    #[test]
    fn test_reserved_names_rejected_for_encryption() {
        let codec = codec();
        for name in [CONFIG_NAME, DIRIV_NAME, "cloakfs.longname.xyz"] {
            assert!(matches!(
                codec.encrypt_name(name, &IV_A),
                Err(NameError::Filtered { .. })
            ));
        }
    }

    #[test]
    fn test_garbage_base64_rejected() {
        let codec = codec();
        assert!(matches!(
            codec.decrypt_name("not!valid!base64", &IV_A),
            Err(NameError::Base64(_))
        ));
    }

    #[test]
    fn test_plaintext_names_mode_is_identity() {
        let codec = NameCodec::new(&MasterKey::random(), true);
        assert_eq!(codec.encrypt_name("notes.txt", &IV_A).unwrap(), "notes.txt");
        assert_eq!(codec.decrypt_name("notes.txt", &IV_A).unwrap(), "notes.txt");
        // Reserved names stay off limits even without encryption.
        assert!(codec.encrypt_name(CONFIG_NAME, &IV_A).is_err());
    }

    #[test]
    fn test_long_name_detection_and_hashing() {
        let codec = codec();
        // 200 chars of plaintext blow past 255 bytes once encrypted.
        let long = "x".repeat(200);
        let encrypted = codec.encrypt_name(&long, &IV_A).unwrap();
        assert!(NameCodec::is_long_name(&encrypted));

        let placeholder = NameCodec::hash_long_name(&encrypted);
        assert!(placeholder.starts_with(LONGNAME_PREFIX));
        assert!(placeholder.len() <= MAX_NAME_LEN);
        assert_eq!(placeholder, NameCodec::hash_long_name(&encrypted));

        let sidecar = NameCodec::long_name_sidecar(&placeholder);
        assert!(sidecar.ends_with(LONGNAME_SUFFIX));

        // Short names stay as-is.
        let short = codec.encrypt_name("short.txt", &IV_A).unwrap();
        assert!(!NameCodec::is_long_name(&short));
    }

    #[test]
    fn test_path_filtering() {
        assert!(is_filtered(CONFIG_NAME));
        assert!(is_filtered("subdir/cloakfs.diriv"));
        assert!(is_filtered("a/cloakfs.longname.abc/b"));
        assert!(is_filtered("cloakfs.diriv.rmdir.1234"));
        assert!(!is_filtered("regular/path/file.txt"));
        assert!(!is_filtered("cloakfs"));
    }
}
