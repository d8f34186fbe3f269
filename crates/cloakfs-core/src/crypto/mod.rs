//! Cryptographic primitives: AEAD backends and master key material.

pub mod aead;
pub mod keys;

pub use aead::{
    Aes256Gcm16, AeadError, AeadKind, CryptoCore, BLOCK_OVERHEAD, CONTENT_IV_LEN, TAG_LEN,
};
pub use keys::{MasterKey, KEY_HALF_LEN, MASTER_KEY_LEN};
