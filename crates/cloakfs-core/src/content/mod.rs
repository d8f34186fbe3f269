//! Block-level content encryption.
//!
//! Plaintext files are carved into fixed-size blocks (4096 bytes by
//! default); each block is sealed independently with a fresh nonce and an
//! AAD binding of `block_no || file_id`, which defeats block reordering
//! within a file and block transplants across files.
//!
//! Ciphertext block layout: `[16-byte nonce][payload][16-byte tag]`.

pub mod header;
pub mod pool;
mod sizes;

use std::thread;

use thiserror::Error;
use tracing::{trace, warn};

use crate::crypto::{AeadError, AeadKind, CryptoCore, BLOCK_OVERHEAD, CONTENT_IV_LEN, TAG_LEN};
pub use header::{FileHeader, HeaderError, FILE_ID_LEN, HEADER_CURRENT_VERSION, HEADER_LEN};
pub use pool::BufferPool;
pub use sizes::SizeError;

/// Default plaintext block size in bytes.
pub const DEFAULT_PLAIN_BS: usize = 4096;

/// Largest write request the kernel will hand the dispatcher.
/// Must be a multiple of the plaintext block size.
pub const MAX_KERNEL_WRITE: usize = 128 * 1024;

/// Batch size from which encryption is split across worker threads.
const ENCRYPT_SPLIT_THRESHOLD: usize = 32;

/// AEAD throughput saturates memory bandwidth quickly; more than two
/// workers has not measured faster.
const ENCRYPT_MAX_SPLIT: usize = 2;

/// Why a ciphertext block failed to decrypt.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockDecryptError {
    /// Shorter than the nonce; no valid block has this length.
    #[error("ciphertext block {block_no} too short: {len} bytes")]
    TooShort { block_no: u64, len: usize },

    /// An all-zero nonce never leaves the nonce generator. Seen in the
    /// wild when tmpfs hands back zero pages for written data.
    #[error("all-zero nonce in block {block_no}")]
    ZeroNonce { block_no: u64 },

    /// Tag mismatch: tampering, or the wrong block number / file ID.
    #[error("authentication failure in block {block_no}")]
    Authentication { block_no: u64 },
}

/// Encrypts and decrypts file content block by block.
///
/// Shared by all open file handles; safe for concurrent use.
pub struct ContentCrypter {
    crypto: CryptoCore,
    plain_bs: usize,
    cipher_bs: usize,
    force_decode: bool,
    /// Ciphertext block buffers (`cipher_bs` each).
    cblock_pool: BufferPool,
    /// Plaintext block buffers (`plain_bs` each).
    pblock_pool: BufferPool,
    /// Whole-request ciphertext buffers, sized for `MAX_KERNEL_WRITE`
    /// worth of blocks plus per-block overhead.
    pub creq_pool: BufferPool,
    /// Whole-request plaintext buffers (`MAX_KERNEL_WRITE`).
    pub preq_pool: BufferPool,
}

impl ContentCrypter {
    /// Build a crypter over `crypto` with the given plaintext block size.
    ///
    /// With `force_decode`, authentication failures on read are demoted to
    /// warnings and the unverified plaintext is passed through; this is a
    /// data-recovery mode and requires the GCM backend.
    pub fn new(crypto: CryptoCore, plain_bs: usize, force_decode: bool) -> Self {
        assert!(
            plain_bs > 0 && MAX_KERNEL_WRITE % plain_bs == 0,
            "unaligned plaintext block size {plain_bs}"
        );
        assert!(
            !force_decode || crypto.kind() == AeadKind::Gcm,
            "force-decode requires the GCM backend"
        );
        let cipher_bs = plain_bs + BLOCK_OVERHEAD;
        let creq_size = MAX_KERNEL_WRITE / plain_bs * cipher_bs;
        Self {
            crypto,
            plain_bs,
            cipher_bs,
            force_decode,
            cblock_pool: BufferPool::new(cipher_bs),
            pblock_pool: BufferPool::new(plain_bs),
            creq_pool: BufferPool::new(creq_size),
            preq_pool: BufferPool::new(MAX_KERNEL_WRITE),
        }
    }

    /// Plaintext block size in bytes.
    pub fn plain_bs(&self) -> usize {
        self.plain_bs
    }

    /// Ciphertext block size in bytes (plaintext size plus overhead).
    pub fn cipher_bs(&self) -> usize {
        self.cipher_bs
    }

    /// Whether authentication failures are demoted to warnings.
    pub fn force_decode(&self) -> bool {
        self.force_decode
    }

    /// Return a plaintext block buffer obtained from [`Self::decrypt_block`].
    pub fn recycle_plain_block(&self, buf: Vec<u8>) {
        self.pblock_pool.put(buf);
    }

    /// Encrypt one block with a fresh random nonce.
    ///
    /// Empty plaintext encrypts to empty ciphertext (an empty file stores
    /// nothing, not even a tag).
    pub fn encrypt_block(&self, plaintext: &[u8], block_no: u64, file_id: &[u8]) -> Vec<u8> {
        if plaintext.is_empty() {
            return Vec::new();
        }
        let nonce = self.crypto.fresh_nonce();
        self.do_encrypt_block(plaintext, block_no, file_id, &nonce)
    }

    /// Encrypt one block with a caller-chosen nonce. SIV mode only; the
    /// deterministic reverse mode derives its nonces externally.
    pub fn encrypt_block_with_nonce(
        &self,
        plaintext: &[u8],
        block_no: u64,
        file_id: &[u8],
        nonce: &[u8; CONTENT_IV_LEN],
    ) -> Vec<u8> {
        assert!(
            self.crypto.deterministic_nonces_allowed(),
            "deterministic nonces are only secure in SIV mode"
        );
        if plaintext.is_empty() {
            return Vec::new();
        }
        self.do_encrypt_block(plaintext, block_no, file_id, nonce)
    }

    fn do_encrypt_block(
        &self,
        plaintext: &[u8],
        block_no: u64,
        file_id: &[u8],
        nonce: &[u8; CONTENT_IV_LEN],
    ) -> Vec<u8> {
        let aad = build_aad(block_no, file_id);
        let mut block = self.cblock_pool.get();
        block.extend_from_slice(nonce);
        block.extend_from_slice(plaintext);
        let tag = self
            .crypto
            .seal_detached(nonce, &aad, &mut block[CONTENT_IV_LEN..]);
        block.extend_from_slice(&tag);
        assert_eq!(
            block.len(),
            plaintext.len() + BLOCK_OVERHEAD,
            "unexpected ciphertext length for block {block_no}"
        );
        block
    }

    /// Encrypt a run of consecutive blocks starting at `first_block_no`,
    /// returning their concatenated ciphertext in a request-pool buffer.
    /// Return the buffer with `creq_pool.put()` once written out.
    ///
    /// Large batches are split across at most two worker threads, each
    /// owning a contiguous range of blocks and output slots.
    pub fn encrypt_blocks(
        &self,
        blocks: &[Vec<u8>],
        first_block_no: u64,
        file_id: &[u8],
    ) -> Vec<u8> {
        let mut cblocks: Vec<Vec<u8>> = vec![Vec::new(); blocks.len()];

        let workers = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(ENCRYPT_MAX_SPLIT);
        if blocks.len() >= ENCRYPT_SPLIT_THRESHOLD && workers > 1 {
            let group_size = blocks.len() / workers;
            thread::scope(|s| {
                let mut in_rest = blocks;
                let mut out_rest: &mut [Vec<u8>] = &mut cblocks;
                let mut block_no = first_block_no;
                for i in 0..workers {
                    let take = if i == workers - 1 {
                        in_rest.len()
                    } else {
                        group_size
                    };
                    let (input, in_next) = in_rest.split_at(take);
                    let (output, out_next) = std::mem::take(&mut out_rest).split_at_mut(take);
                    in_rest = in_next;
                    out_rest = out_next;
                    let first = block_no;
                    block_no += take as u64;
                    s.spawn(move || self.do_encrypt_blocks(input, output, first, file_id));
                }
            });
        } else {
            self.do_encrypt_blocks(blocks, &mut cblocks, first_block_no, file_id);
        }

        let mut out = self.creq_pool.get();
        for cblock in cblocks {
            out.extend_from_slice(&cblock);
            if !cblock.is_empty() {
                self.cblock_pool.put(cblock);
            }
        }
        out
    }

    fn do_encrypt_blocks(
        &self,
        input: &[Vec<u8>],
        output: &mut [Vec<u8>],
        first_block_no: u64,
        file_id: &[u8],
    ) {
        for (i, plaintext) in input.iter().enumerate() {
            output[i] = self.encrypt_block(plaintext, first_block_no + i as u64, file_id);
        }
    }

    /// Verify and decrypt one ciphertext block.
    ///
    /// | input | result |
    /// |---|---|
    /// | empty | empty |
    /// | all zeros, exactly `cipher_bs` long | `plain_bs` zero bytes (file hole) |
    /// | shorter than the nonce | [`BlockDecryptError::TooShort`] |
    /// | all-zero nonce | [`BlockDecryptError::ZeroNonce`] |
    /// | missing or mismatched tag | [`BlockDecryptError::Authentication`], or the unverified bytes under force-decode |
    ///
    /// The returned buffer comes from the plaintext block pool; hand it
    /// back with [`Self::recycle_plain_block`] when done.
    pub fn decrypt_block(
        &self,
        ciphertext: &[u8],
        block_no: u64,
        file_id: &[u8],
    ) -> Result<Vec<u8>, BlockDecryptError> {
        if ciphertext.is_empty() {
            return Ok(Vec::new());
        }

        // A hole in the backing file reads as zeros; translate it back to
        // a zero plaintext block without touching the AEAD.
        if ciphertext.len() == self.cipher_bs && ciphertext.iter().all(|&b| b == 0) {
            trace!(block_no, "file hole encountered");
            let mut out = self.pblock_pool.get();
            out.resize(self.plain_bs, 0);
            return Ok(out);
        }

        if ciphertext.len() < CONTENT_IV_LEN {
            warn!(block_no, len = ciphertext.len(), "block is too short");
            return Err(BlockDecryptError::TooShort {
                block_no,
                len: ciphertext.len(),
            });
        }

        let (nonce, rest) = ciphertext.split_at(CONTENT_IV_LEN);
        if nonce.iter().all(|&b| b == 0) {
            // Written data read back as a zero page: seen with a tmpfs
            // backing store. A real nonce is never all-zero.
            return Err(BlockDecryptError::ZeroNonce { block_no });
        }
        if rest.len() < TAG_LEN {
            // A nonce but no room for a tag: nothing here can verify.
            warn!(block_no, len = ciphertext.len(), "block decryption failed");
            return Err(BlockDecryptError::Authentication { block_no });
        }
        let (payload, tag) = rest.split_at(rest.len() - TAG_LEN);
        let tag: [u8; TAG_LEN] = tag.try_into().unwrap();
        let aad = build_aad(block_no, file_id);

        let mut out = self.pblock_pool.get();
        out.extend_from_slice(payload);
        match self.crypto.open_detached(nonce, &aad, &mut out, &tag) {
            Ok(()) => Ok(out),
            Err(AeadError::Authentication) if self.force_decode => {
                warn!(block_no, "authentication failure, overridden by force-decode");
                // Rebuild from the ciphertext; the failed open leaves the
                // buffer contents unspecified.
                out.clear();
                out.extend_from_slice(payload);
                match self.crypto.open_detached_unverified(nonce, &mut out) {
                    Ok(()) => Ok(out),
                    Err(_) => {
                        self.pblock_pool.put(out);
                        Err(BlockDecryptError::Authentication { block_no })
                    }
                }
            }
            Err(_) => {
                warn!(block_no, len = ciphertext.len(), "block decryption failed");
                self.pblock_pool.put(out);
                Err(BlockDecryptError::Authentication { block_no })
            }
        }
    }

    /// Decrypt a run of consecutive blocks, stopping at the first
    /// unrecoverable error. Returns a request-pool buffer; hand it back
    /// with `preq_pool.put()` after use.
    pub fn decrypt_blocks(
        &self,
        ciphertext: &[u8],
        first_block_no: u64,
        file_id: &[u8],
    ) -> Result<Vec<u8>, BlockDecryptError> {
        let mut out = self.preq_pool.get();
        let mut block_no = first_block_no;
        for chunk in ciphertext.chunks(self.cipher_bs) {
            match self.decrypt_block(chunk, block_no, file_id) {
                Ok(plaintext) => {
                    out.extend_from_slice(&plaintext);
                    if !plaintext.is_empty() {
                        self.pblock_pool.put(plaintext);
                    }
                }
                Err(err) => {
                    self.preq_pool.put(out);
                    return Err(err);
                }
            }
            block_no += 1;
        }
        Ok(out)
    }

    /// Overlay `new` onto `old` at `offset` within one plaintext block.
    ///
    /// The merged block is `max(|old|, offset + |new|)` bytes: bytes of
    /// `old` past the written range survive, and a gap between the end of
    /// `old` and `offset` is zero-filled (writing past EOF inside a
    /// block).
    pub fn merge_blocks(&self, old: &[u8], new: &[u8], offset: usize) -> Vec<u8> {
        // Fast path for freshly created files.
        if old.is_empty() && offset == 0 {
            return new.to_vec();
        }

        let merged_len = old.len().max(offset + new.len());
        assert!(
            merged_len <= self.plain_bs,
            "merge of {merged_len} bytes exceeds the block size"
        );
        let mut out = vec![0u8; merged_len];
        out[..old.len()].copy_from_slice(old);
        out[offset..offset + new.len()].copy_from_slice(new);
        out
    }
}

/// AAD layout: `block_no` (8 bytes, big-endian) followed by the file ID.
fn build_aad(block_no: u64, file_id: &[u8]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(8 + file_id.len());
    aad.extend_from_slice(&block_no.to_be_bytes());
    aad.extend_from_slice(file_id);
    aad
}
