//! Master key material.
//!
//! cloakfs uses a 512-bit master key split into two 256-bit halves: an
//! encryption key and a MAC key. AES-256-GCM uses the encryption half;
//! AES-SIV consumes both halves as a single 512-bit key in the order
//! MAC key first, then encryption key (the key order the `aes-siv`
//! crate expects).

use rand::RngCore;
use secrecy::{ExposeSecret, SecretBox};
use zeroize::Zeroizing;

/// Length of one key half in bytes (256-bit).
pub const KEY_HALF_LEN: usize = 32;

/// Length of the full master key in bytes (512-bit).
pub const MASTER_KEY_LEN: usize = 2 * KEY_HALF_LEN;

/// The vault's 512-bit master key pair.
///
/// Both halves live in [`secrecy::SecretBox`] containers, zeroized on
/// drop. The halves are intentionally private and there are no getters:
/// key material is only reachable through the scoped `with_*` accessors,
/// so a caller cannot casually retain a reference to it, and the key
/// layout for each cipher is fixed in one place.
pub struct MasterKey {
    enc_key: SecretBox<[u8; KEY_HALF_LEN]>,
    mac_key: SecretBox<[u8; KEY_HALF_LEN]>,
}

impl MasterKey {
    /// Construct from the two 256-bit halves.
    ///
    /// The caller keeps responsibility for zeroizing its own copies.
    pub fn new(enc_key: [u8; KEY_HALF_LEN], mac_key: [u8; KEY_HALF_LEN]) -> Self {
        Self {
            enc_key: SecretBox::new(Box::new(enc_key)),
            mac_key: SecretBox::new(Box::new(mac_key)),
        }
    }

    /// Generate a fresh random master key pair.
    pub fn random() -> Self {
        let mut enc_key = Box::new([0u8; KEY_HALF_LEN]);
        let mut mac_key = Box::new([0u8; KEY_HALF_LEN]);
        rand::rng().fill_bytes(&mut *enc_key);
        rand::rng().fill_bytes(&mut *mac_key);
        Self {
            enc_key: SecretBox::new(enc_key),
            mac_key: SecretBox::new(mac_key),
        }
    }

    /// Reconstruct from the serialized 64-byte form (enc key ‖ MAC key),
    /// as stored wrapped inside the config file.
    pub fn from_bytes(bytes: &[u8; MASTER_KEY_LEN]) -> Self {
        let mut enc_key = Box::new([0u8; KEY_HALF_LEN]);
        let mut mac_key = Box::new([0u8; KEY_HALF_LEN]);
        enc_key.copy_from_slice(&bytes[..KEY_HALF_LEN]);
        mac_key.copy_from_slice(&bytes[KEY_HALF_LEN..]);
        Self {
            enc_key: SecretBox::new(enc_key),
            mac_key: SecretBox::new(mac_key),
        }
    }

    /// Run `f` with the 256-bit key for the GCM content backend.
    pub fn with_gcm_key<R>(&self, f: impl FnOnce(&[u8; KEY_HALF_LEN]) -> R) -> R {
        f(self.enc_key.expose_secret())
    }

    /// Run `f` with the 512-bit AES-SIV key: MAC key ‖ encryption key.
    pub fn with_siv_key<R>(&self, f: impl FnOnce(&[u8; MASTER_KEY_LEN]) -> R) -> R {
        let mut key = Zeroizing::new([0u8; MASTER_KEY_LEN]);
        key[..KEY_HALF_LEN].copy_from_slice(self.mac_key.expose_secret());
        key[KEY_HALF_LEN..].copy_from_slice(self.enc_key.expose_secret());
        f(&key)
    }

    /// Run `f` with the serialized 64-byte form (enc key ‖ MAC key),
    /// the layout the config file wraps.
    pub fn with_raw_key<R>(&self, f: impl FnOnce(&[u8; MASTER_KEY_LEN]) -> R) -> R {
        let mut key = Zeroizing::new([0u8; MASTER_KEY_LEN]);
        key[..KEY_HALF_LEN].copy_from_slice(self.enc_key.expose_secret());
        key[KEY_HALF_LEN..].copy_from_slice(self.mac_key.expose_secret());
        f(&key)
    }
}

impl Clone for MasterKey {
    fn clone(&self) -> Self {
        Self {
            enc_key: SecretBox::new(Box::new(*self.enc_key.expose_secret())),
            mac_key: SecretBox::new(Box::new(*self.mac_key.expose_secret())),
        }
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("enc_key", &"[REDACTED]")
            .field("mac_key", &"[REDACTED]")
            .finish()
    }
}
