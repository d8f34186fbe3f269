//! The `cloakfs.conf` configuration file.
//!
//! Lives under a reserved name in the root of the backing directory and
//! holds everything needed to unlock the tree: scrypt KDF parameters, the
//! master key wrapped with AES-256-GCM under the derived key-encryption
//! key, and the feature flags the tree was created with.
//!
//! Key wrapping uses the legacy 96-bit GCM nonce; the 128-bit nonces are
//! reserved for file content.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_with::{base64::Base64, serde_as};
use thiserror::Error;
use tracing::debug;
use unicode_normalization::UnicodeNormalization;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{MasterKey, MASTER_KEY_LEN};
use crate::fs::names::CONFIG_NAME;

/// Current config file format version.
pub const CONFIG_CURRENT_VERSION: u16 = 2;

/// Default scrypt cost: N = 2^16.
pub const SCRYPT_DEFAULT_LOG_N: u8 = 16;

/// GCM nonce length for the master-key wrap.
const WRAP_IV_LEN: usize = 12;

/// Length of the wrapped key blob: nonce + key + tag.
const WRAPPED_KEY_LEN: usize = WRAP_IV_LEN + MASTER_KEY_LEN + 16;

/// Features a tree can be created with. Unknown flags in a config file
/// fail deserialization, so an old build never half-understands a newer
/// tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureFlag {
    /// Per-directory IVs for filename encryption.
    DirIV,
    /// Long-name placeholder entries for over-long encrypted names.
    LongNames,
    /// AES-SIV content encryption instead of AES-GCM.
    AESSIV,
    /// Legacy mode: filenames stored unencrypted.
    PlaintextNames,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("config file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid scrypt parameters: {0}")]
    KdfParams(String),

    #[error("key derivation failed: {0}")]
    Kdf(String),

    /// Wrong passphrase and a tampered config file are
    /// cryptographically indistinguishable.
    #[error("wrong passphrase or corrupted config file")]
    Unlock,

    #[error("unsupported config file version {0}")]
    Version(u16),

    #[error("wrapped master key has wrong size {0} (want {WRAPPED_KEY_LEN})")]
    WrappedKeySize(usize),
}

/// scrypt parameters as stored in the config file.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScryptKdf {
    #[serde_as(as = "Base64")]
    pub salt: Vec<u8>,
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
    pub key_len: usize,
}

impl ScryptKdf {
    fn random(log_n: u8) -> Self {
        let mut salt = vec![0u8; 32];
        rand::rng().fill_bytes(&mut salt);
        Self {
            salt,
            log_n,
            r: 8,
            p: 1,
            key_len: 32,
        }
    }

    /// Derive the key-encryption key from the passphrase.
    ///
    /// The passphrase is NFC-normalized first so the same password typed
    /// on macOS and Linux derives the same key.
    fn derive_kek(&self, passphrase: &SecretString) -> Result<Zeroizing<[u8; 32]>, ConfigError> {
        // Reject degenerate cost parameters from a tampered file before
        // they turn the KDF into a no-op or an OOM.
        if !(10..=30).contains(&self.log_n) || self.r == 0 || self.p == 0 || self.key_len != 32 {
            return Err(ConfigError::KdfParams(format!(
                "log_n={} r={} p={} key_len={}",
                self.log_n, self.r, self.p, self.key_len
            )));
        }
        let params = scrypt::Params::new(self.log_n, self.r, self.p, self.key_len)
            .map_err(|err| ConfigError::KdfParams(err.to_string()))?;

        let normalized = Zeroizing::new(passphrase.expose_secret().nfc().collect::<String>());
        let mut kek = Zeroizing::new([0u8; 32]);
        scrypt::scrypt(normalized.as_bytes(), &self.salt, &params, &mut kek[..])
            .map_err(|err| ConfigError::Kdf(err.to_string()))?;
        Ok(kek)
    }
}

/// The parsed configuration file.
#[serde_as]
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConfFile {
    pub creator: String,
    /// Master key wrapped with AES-256-GCM under the scrypt-derived KEK:
    /// `[12-byte nonce][64-byte key][16-byte tag]`.
    #[serde_as(as = "Base64")]
    pub encrypted_key: Vec<u8>,
    pub scrypt_object: ScryptKdf,
    pub version: u16,
    pub feature_flags: Vec<FeatureFlag>,
}

impl ConfFile {
    /// The config file's location inside a backing directory.
    pub fn path(cipherdir: &Path) -> PathBuf {
        cipherdir.join(CONFIG_NAME)
    }

    /// Create a fresh config file with a random master key.
    ///
    /// Refuses to overwrite an existing file; clobbering a config file
    /// loses the only copy of the master key.
    pub fn create(
        path: &Path,
        passphrase: &SecretString,
        log_n: u8,
        feature_flags: Vec<FeatureFlag>,
    ) -> Result<MasterKey, ConfigError> {
        let master_key = MasterKey::random();
        let kdf = ScryptKdf::random(log_n);
        let kek = kdf.derive_kek(passphrase)?;
        let encrypted_key = wrap_master_key(&kek, &master_key);

        let conf = ConfFile {
            creator: format!("cloakfs {}", env!("CARGO_PKG_VERSION")),
            encrypted_key,
            scrypt_object: kdf,
            version: CONFIG_CURRENT_VERSION,
            feature_flags,
        };
        let json = serde_json::to_string_pretty(&conf)?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        debug!(path = %path.display(), "config file created");
        Ok(master_key)
    }

    /// Load the config file and unwrap the master key.
    pub fn load(
        path: &Path,
        passphrase: &SecretString,
    ) -> Result<(MasterKey, ConfFile), ConfigError> {
        let json = fs::read_to_string(path)?;
        let conf: ConfFile = serde_json::from_str(&json)?;
        if conf.version != CONFIG_CURRENT_VERSION {
            return Err(ConfigError::Version(conf.version));
        }
        let kek = conf.scrypt_object.derive_kek(passphrase)?;
        let master_key = unwrap_master_key(&kek, &conf.encrypted_key)?;
        debug!(path = %path.display(), flags = ?conf.feature_flags, "config file unlocked");
        Ok((master_key, conf))
    }

    pub fn has_flag(&self, flag: FeatureFlag) -> bool {
        self.feature_flags.contains(&flag)
    }
}

fn wrap_master_key(kek: &[u8; 32], master_key: &MasterKey) -> Vec<u8> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(kek));
    let mut nonce = [0u8; WRAP_IV_LEN];
    rand::rng().fill_bytes(&mut nonce);

    let ciphertext = master_key
        .with_raw_key(|key_bytes| cipher.encrypt(Nonce::from_slice(&nonce), key_bytes.as_slice()))
        .unwrap_or_else(|_| panic!("master key wrap failed"));

    let mut out = Vec::with_capacity(WRAPPED_KEY_LEN);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    out
}

fn unwrap_master_key(kek: &[u8; 32], wrapped: &[u8]) -> Result<MasterKey, ConfigError> {
    if wrapped.len() != WRAPPED_KEY_LEN {
        return Err(ConfigError::WrappedKeySize(wrapped.len()));
    }
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(kek));
    let (nonce, ciphertext) = wrapped.split_at(WRAP_IV_LEN);

    let mut plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| ConfigError::Unlock)?;
    if plaintext.len() != MASTER_KEY_LEN {
        plaintext.zeroize();
        return Err(ConfigError::WrappedKeySize(wrapped.len()));
    }

    let mut key_bytes = Zeroizing::new([0u8; MASTER_KEY_LEN]);
    key_bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();
    Ok(MasterKey::from_bytes(&key_bytes))
}
