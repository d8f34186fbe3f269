//! AEAD backends for file content.
//!
//! Encrypted block format (binary):
//! ```text
//! [16 bytes: nonce][N bytes: ciphertext][16 bytes: tag]
//! AAD = block_no (8 bytes, big-endian) || file_id (16 bytes)
//! ```
//!
//! Two backends are supported, chosen at construction time:
//!
//! - **GCM**: AES-256-GCM with a 128-bit nonce. The standard 96-bit nonce
//!   is reserved for the legacy master-key wrap in the config file; file
//!   content always uses 128-bit nonces.
//! - **SIV**: AES-SIV with a 512-bit key (deterministic authenticated
//!   encryption). Only this backend accepts caller-chosen nonces; the
//!   deterministic reverse mode depends on that property.
//!
//! Both backends produce a detached 16-byte tag, so the on-disk layout is
//! identical regardless of backend.

use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher, StreamCipherSeek};
use aes::Aes256;
use aes_gcm::aead::generic_array::typenum::U16;
use aes_gcm::aead::AeadInPlace;
use aes_gcm::{AesGcm, Key, Nonce, Tag};
use aes_siv::Aes256SivAead;
use ghash::universal_hash::UniversalHash;
use ghash::GHash;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroizing;

use super::keys::MasterKey;

/// AES-256-GCM with a 128-bit nonce.
pub type Aes256Gcm16 = AesGcm<Aes256, U16>;

type Ctr32 = ctr::Ctr32BE<Aes256>;

/// Nonce length for file content, in bytes.
pub const CONTENT_IV_LEN: usize = 16;

/// Authentication tag length, in bytes.
pub const TAG_LEN: usize = 16;

/// Per-block overhead: nonce plus tag.
pub const BLOCK_OVERHEAD: usize = CONTENT_IV_LEN + TAG_LEN;

/// Which AEAD construction a [`CryptoCore`] uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadKind {
    /// AES-256-GCM, random nonces only.
    Gcm,
    /// AES-SIV (512-bit key), deterministic; caller-chosen nonces allowed.
    Siv,
}

/// Errors surfaced by the AEAD layer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AeadError {
    /// The tag did not verify: tampering, wrong key, or wrong AAD.
    #[error("ciphertext authentication failed")]
    Authentication,

    /// Unverified (force-decode) decryption is a GCM-only escape hatch.
    #[error("unverified decryption requires the GCM backend")]
    UnverifiedUnsupported,
}

enum Backend {
    Gcm {
        cipher: Aes256Gcm16,
        // Raw key retained for the unverified CTR path.
        key: Zeroizing<[u8; 32]>,
    },
    Siv {
        cipher: Aes256SivAead,
    },
}

/// Cryptographic core: one AEAD backend plus the nonce source.
///
/// Safe for concurrent use; nonces come from the calling thread's CSPRNG.
pub struct CryptoCore {
    backend: Backend,
    kind: AeadKind,
}

impl CryptoCore {
    /// Build a core for the given backend from the master key.
    ///
    /// GCM is keyed with the 256-bit encryption half, SIV with the full
    /// 512-bit key (MAC half first).
    pub fn new(master_key: &MasterKey, kind: AeadKind) -> Self {
        let backend = match kind {
            AeadKind::Gcm => {
                let key = master_key.with_gcm_key(|key| Zeroizing::new(*key));
                let cipher = Aes256Gcm16::new(Key::<Aes256Gcm16>::from_slice(&*key));
                Backend::Gcm { cipher, key }
            }
            AeadKind::Siv => {
                let cipher = master_key
                    .with_siv_key(|key| Aes256SivAead::new(Key::<Aes256SivAead>::from_slice(key)));
                Backend::Siv { cipher }
            }
        };
        Self { backend, kind }
    }

    /// The backend this core was constructed with.
    pub fn kind(&self) -> AeadKind {
        self.kind
    }

    /// Whether caller-chosen (deterministic) nonces are acceptable.
    /// True only for SIV, where the synthetic IV makes them safe.
    pub fn deterministic_nonces_allowed(&self) -> bool {
        self.kind == AeadKind::Siv
    }

    /// A fresh random 128-bit nonce.
    pub fn fresh_nonce(&self) -> [u8; CONTENT_IV_LEN] {
        let mut nonce = [0u8; CONTENT_IV_LEN];
        rand::rng().fill_bytes(&mut nonce);
        nonce
    }

    /// Encrypt `buf` in place, returning the detached tag.
    ///
    /// A seal failure with valid parameters cannot happen for block-sized
    /// inputs and is treated as a programmer error.
    pub fn seal_detached(&self, nonce: &[u8], aad: &[u8], buf: &mut [u8]) -> [u8; TAG_LEN] {
        assert_eq!(nonce.len(), CONTENT_IV_LEN, "wrong nonce length");
        let nonce = Nonce::<U16>::from_slice(nonce);
        let tag = match &self.backend {
            Backend::Gcm { cipher, .. } => cipher
                .encrypt_in_place_detached(nonce, aad, buf)
                .unwrap_or_else(|_| panic!("AEAD seal failed for {} bytes", buf.len())),
            Backend::Siv { cipher } => cipher
                .encrypt_in_place_detached(nonce, aad, buf)
                .unwrap_or_else(|_| panic!("AEAD seal failed for {} bytes", buf.len())),
        };
        tag.into()
    }

    /// Verify the tag and decrypt `buf` in place.
    pub fn open_detached(
        &self,
        nonce: &[u8],
        aad: &[u8],
        buf: &mut [u8],
        tag: &[u8; TAG_LEN],
    ) -> Result<(), AeadError> {
        assert_eq!(nonce.len(), CONTENT_IV_LEN, "wrong nonce length");
        let nonce = Nonce::<U16>::from_slice(nonce);
        let tag = Tag::from_slice(tag);
        let result = match &self.backend {
            Backend::Gcm { cipher, .. } => cipher.decrypt_in_place_detached(nonce, aad, buf, tag),
            Backend::Siv { cipher } => cipher.decrypt_in_place_detached(nonce, aad, buf, tag),
        };
        result.map_err(|_| AeadError::Authentication)
    }

    /// Decrypt `buf` in place WITHOUT verifying the tag.
    ///
    /// This is the force-decode escape hatch for salvaging data from a
    /// damaged backing store. GCM ciphertext is a CTR keystream, so the
    /// unverified plaintext is well defined; it is recomputed here from
    /// the same primitives GCM is built from (AES + GHASH-derived J0 +
    /// 32-bit big-endian CTR). SIV has no meaningful unverified
    /// decryption, so the SIV backend refuses.
    pub fn open_detached_unverified(&self, nonce: &[u8], buf: &mut [u8]) -> Result<(), AeadError> {
        assert_eq!(nonce.len(), CONTENT_IV_LEN, "wrong nonce length");
        let Backend::Gcm { key, .. } = &self.backend else {
            return Err(AeadError::UnverifiedUnsupported);
        };
        let aes = Aes256::new(Key::<Aes256>::from_slice(&**key));

        // H = AES_K(0^128), J0 = GHASH_H(nonce || pad || len64(0) || len64(nonce)).
        // The 128-bit nonce path of NIST SP 800-38D.
        let mut h = ghash::Block::default();
        aes.encrypt_block(&mut h);
        let mut gh = GHash::new(&h);
        gh.update_padded(nonce);
        let mut len_block = ghash::Block::default();
        len_block[8..].copy_from_slice(&((nonce.len() as u64) * 8).to_be_bytes());
        gh.update(&[len_block]);
        let j0 = gh.finalize();

        let mut ctr = Ctr32::new(Key::<Ctr32>::from_slice(&**key), &j0);
        // The block at J0 masks the tag; payload keystream starts at J0+1.
        ctr.seek(16u64);
        ctr.apply_keystream(buf);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> MasterKey {
        MasterKey::new([7u8; 32], [13u8; 32])
    }

    #[test]
    fn test_seal_open_roundtrip_gcm() {
        let core = CryptoCore::new(&test_key(), AeadKind::Gcm);
        let nonce = core.fresh_nonce();
        let mut buf = b"attack at dawn".to_vec();
        let tag = core.seal_detached(&nonce, b"aad", &mut buf);
        core.open_detached(&nonce, b"aad", &mut buf, &tag).unwrap();
        assert_eq!(buf, b"attack at dawn");
    }

    #[test]
    fn test_seal_open_roundtrip_siv() {
        let core = CryptoCore::new(&test_key(), AeadKind::Siv);
        let nonce = core.fresh_nonce();
        let mut buf = b"attack at dawn".to_vec();
        let tag = core.seal_detached(&nonce, b"aad", &mut buf);
        core.open_detached(&nonce, b"aad", &mut buf, &tag).unwrap();
        assert_eq!(buf, b"attack at dawn");
    }

    #[test]
    fn test_open_rejects_wrong_aad() {
        for kind in [AeadKind::Gcm, AeadKind::Siv] {
            let core = CryptoCore::new(&test_key(), kind);
            let nonce = core.fresh_nonce();
            let mut buf = b"payload".to_vec();
            let tag = core.seal_detached(&nonce, b"aad-1", &mut buf);
            let err = core
                .open_detached(&nonce, b"aad-2", &mut buf, &tag)
                .unwrap_err();
            assert_eq!(err, AeadError::Authentication);
        }
    }

    #[test]
    fn test_open_rejects_flipped_tag_bit() {
        let core = CryptoCore::new(&test_key(), AeadKind::Gcm);
        let nonce = core.fresh_nonce();
        let mut buf = b"payload".to_vec();
        let mut tag = core.seal_detached(&nonce, b"", &mut buf);
        tag[0] ^= 0x01;
        assert!(core.open_detached(&nonce, b"", &mut buf, &tag).is_err());
    }

    #[test]
    fn test_unverified_open_matches_verified_plaintext() {
        let core = CryptoCore::new(&test_key(), AeadKind::Gcm);
        let nonce = core.fresh_nonce();
        let plaintext = b"recoverable even with a bad tag".to_vec();
        let mut buf = plaintext.clone();
        let _tag = core.seal_detached(&nonce, b"aad", &mut buf);

        // Ignore the tag entirely; keystream must still line up.
        core.open_detached_unverified(&nonce, &mut buf).unwrap();
        assert_eq!(buf, plaintext);
    }

    #[test]
    fn test_unverified_open_refused_for_siv() {
        let core = CryptoCore::new(&test_key(), AeadKind::Siv);
        let nonce = core.fresh_nonce();
        let mut buf = vec![0u8; 16];
        assert_eq!(
            core.open_detached_unverified(&nonce, &mut buf).unwrap_err(),
            AeadError::UnverifiedUnsupported
        );
    }

    #[test]
    fn test_siv_is_deterministic_gcm_is_not() {
        let key = test_key();
        let nonce = [9u8; CONTENT_IV_LEN];

        let siv = CryptoCore::new(&key, AeadKind::Siv);
        let mut a = b"same input".to_vec();
        let mut b = b"same input".to_vec();
        let tag_a = siv.seal_detached(&nonce, b"", &mut a);
        let tag_b = siv.seal_detached(&nonce, b"", &mut b);
        assert_eq!((a.clone(), tag_a), (b.clone(), tag_b), "SIV is deterministic");

        assert!(siv.deterministic_nonces_allowed());
        assert!(!CryptoCore::new(&key, AeadKind::Gcm).deterministic_nonces_allowed());
    }

    #[test]
    fn test_fresh_nonces_are_distinct() {
        let core = CryptoCore::new(&test_key(), AeadKind::Gcm);
        assert_ne!(core.fresh_nonce(), core.fresh_nonce());
    }
}
