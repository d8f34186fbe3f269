//! The read-modify-write file handle.
//!
//! An [`EncryptedFile`] wraps an open backing file and translates
//! plaintext offsets to ciphertext offsets. Reads fetch the covering
//! block range in one positional read and decrypt per block; sub-block
//! writes decrypt the old block, merge, re-encrypt and write back. All
//! backing I/O is positional (`pread`/`pwrite`) so concurrent handles on
//! the same file never race on a shared cursor.
//!
//! A per-handle mutex serializes operations: a partial-block write must
//! not let another in-handle write interleave between decrypting the old
//! block and writing the new one. Across distinct handles the backing
//! store's guarantees are all there is; concurrent writers interleave at
//! block granularity.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::content::{
    BlockDecryptError, ContentCrypter, FileHeader, HeaderError, SizeError, HEADER_LEN,
};

/// Errors surfaced by file-handle operations.
///
/// Corruption and authentication failures map to `EIO` at the dispatcher
/// boundary; backing-store errors pass through with their own status.
#[derive(Debug, Error)]
pub enum FileError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Header(#[from] HeaderError),

    #[error(transparent)]
    Block(#[from] BlockDecryptError),

    #[error(transparent)]
    Size(#[from] SizeError),
}

struct HandleState {
    /// Cached header; populated lazily, discarded by `truncate(0)`.
    header: Option<FileHeader>,
}

/// An open handle on one encrypted backing file.
///
/// The dispatcher opens the backing file read-write regardless of the
/// caller's requested mode, because sub-block writes need to read the old
/// block back. `write_only` records the caller's actual intent: decrypt
/// errors during read-modify-write are demoted for handles whose owner
/// could never read the data anyway.
pub struct EncryptedFile {
    file: File,
    crypter: Arc<ContentCrypter>,
    write_only: bool,
    state: Mutex<HandleState>,
}

impl EncryptedFile {
    pub fn new(file: File, crypter: Arc<ContentCrypter>, write_only: bool) -> Self {
        Self {
            file,
            crypter,
            write_only,
            state: Mutex::new(HandleState { header: None }),
        }
    }

    /// Current plaintext size, derived from the backing file length.
    pub fn plaintext_size(&self) -> Result<u64, FileError> {
        let backing_len = self.file.metadata()?.len();
        Ok(self.crypter.plain_size(backing_len)?)
    }

    /// Read up to `len` plaintext bytes at `offset`.
    ///
    /// Returns fewer bytes only at end of file.
    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>, FileError> {
        let mut state = self.state.lock();
        if len == 0 {
            return Ok(Vec::new());
        }
        let Some(header) = self.load_header(&mut state)? else {
            // Empty backing file, nothing to read.
            return Ok(Vec::new());
        };

        let plain_bs = self.crypter.plain_bs() as u64;
        let cipher_bs = self.crypter.cipher_bs() as u64;
        let first_block = offset / plain_bs;
        let last_block = (offset + len as u64 - 1) / plain_bs;
        let block_count = last_block - first_block + 1;

        let cipher_off = HEADER_LEN as u64 + first_block * cipher_bs;
        let mut ciphertext = self.crypter.creq_pool.get();
        ciphertext.resize((block_count * cipher_bs) as usize, 0);
        let n = read_full_at(&self.file, &mut ciphertext, cipher_off)?;
        ciphertext.truncate(n);
        trace!(offset, len, first_block, read = n, "block-aligned ciphertext read");

        let plaintext = match self
            .crypter
            .decrypt_blocks(&ciphertext, first_block, &header.file_id)
        {
            Ok(plaintext) => plaintext,
            Err(err) => {
                self.crypter.creq_pool.put(ciphertext);
                return Err(err.into());
            }
        };
        self.crypter.creq_pool.put(ciphertext);

        // Cut the request window out of the block-aligned plaintext.
        let skip = (offset % plain_bs) as usize;
        let out = if skip >= plaintext.len() {
            Vec::new()
        } else {
            plaintext[skip..plaintext.len().min(skip + len)].to_vec()
        };
        self.crypter.preq_pool.put(plaintext);
        Ok(out)
    }

    /// Write `data` at plaintext `offset`. Returns the number of bytes
    /// written (always all of `data`, or an error).
    ///
    /// A failure mid-range leaves earlier blocks persisted; POSIX does
    /// not require atomicity across blocks and neither do we.
    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<usize, FileError> {
        let mut state = self.state.lock();
        self.write_locked(&mut state, data, offset)
    }

    fn write_locked(
        &self,
        state: &mut HandleState,
        data: &[u8],
        offset: u64,
    ) -> Result<usize, FileError> {
        if data.is_empty() {
            return Ok(0);
        }
        let header = match self.load_header(state)? {
            Some(header) => header,
            None => self.create_header(state)?,
        };

        // Writing beyond EOF must not leave a short block in the
        // interior: pad the current tail block out to the block boundary
        // first. Holes between the old tail and the write target stay
        // holes.
        let old_plain_size = self.plaintext_size()?;
        if offset > old_plain_size {
            self.zero_pad(state, old_plain_size, offset)?;
        }

        let plain_bs = self.crypter.plain_bs();
        let cipher_bs = self.crypter.cipher_bs() as u64;
        let first_block = offset / plain_bs as u64;

        // Assemble the plaintext for every touched block. Only the first
        // and last can be partial; those go through read-modify-write.
        let mut blocks: Vec<Vec<u8>> = Vec::with_capacity(data.len() / plain_bs + 2);
        let mut block_no = first_block;
        let mut cursor = 0usize;
        while cursor < data.len() {
            let in_block = ((offset + cursor as u64) % plain_bs as u64) as usize;
            let take = (plain_bs - in_block).min(data.len() - cursor);
            let slice = &data[cursor..cursor + take];
            if in_block == 0 && take == plain_bs {
                blocks.push(slice.to_vec());
            } else {
                let full_overwrite_len = if in_block == 0 { take } else { 0 };
                let old = self.read_block_for_rmw(block_no, &header, full_overwrite_len)?;
                let merged = self.crypter.merge_blocks(&old, slice, in_block);
                if !old.is_empty() {
                    self.crypter.recycle_plain_block(old);
                }
                blocks.push(merged);
            }
            cursor += take;
            block_no += 1;
        }

        let ciphertext = self.crypter.encrypt_blocks(&blocks, first_block, &header.file_id);
        let write_off = HEADER_LEN as u64 + first_block * cipher_bs;
        let result = self.file.write_all_at(&ciphertext, write_off);
        self.crypter.creq_pool.put(ciphertext);
        result?;
        trace!(offset, len = data.len(), first_block, "write complete");
        Ok(data.len())
    }

    /// Change the plaintext size to `new_size`.
    pub fn truncate(&self, new_size: u64) -> Result<(), FileError> {
        let mut state = self.state.lock();

        if new_size == 0 {
            // Back to the empty state; the next write mints a new header
            // and with it a new file ID.
            self.file.set_len(0)?;
            state.header = None;
            debug!("truncated to zero, header discarded");
            return Ok(());
        }

        let old_size = {
            let backing_len = self.file.metadata()?.len();
            self.crypter.plain_size(backing_len)?
        };
        if new_size == old_size {
            return Ok(());
        }
        let header = match self.load_header(&mut state)? {
            Some(header) => header,
            None => self.create_header(&mut state)?,
        };

        let plain_bs = self.crypter.plain_bs() as u64;
        if new_size < old_size {
            let tail = new_size % plain_bs;
            if tail == 0 {
                self.file.set_len(self.crypter.cipher_size(new_size))?;
            } else {
                // The boundary falls inside a block: trim it via RMW,
                // then cut the backing file after the re-encrypted block.
                let last_block = new_size / plain_bs;
                let mut plain = self.read_block_for_rmw(last_block, &header, 0)?;
                plain.truncate(tail as usize);
                let block = self.crypter.encrypt_block(&plain, last_block, &header.file_id);
                let off = HEADER_LEN as u64 + last_block * self.crypter.cipher_bs() as u64;
                self.file.write_all_at(&block, off)?;
                self.file.set_len(off + block.len() as u64)?;
            }
            debug!(old_size, new_size, "file shrunk");
        } else {
            // Grow. Fill the old tail block with zeros, extend full
            // blocks as holes, and write a real (encrypted) tail block if
            // the new size is not block-aligned.
            if old_size % plain_bs != 0 {
                let block_end = (old_size / plain_bs + 1) * plain_bs;
                let pad_to = block_end.min(new_size);
                let zeros = vec![0u8; (pad_to - old_size) as usize];
                self.write_locked(&mut state, &zeros, old_size)?;
                if pad_to == new_size {
                    return Ok(());
                }
            }
            let aligned = new_size / plain_bs * plain_bs;
            if aligned > 0 {
                self.file.set_len(self.crypter.cipher_size(aligned))?;
            }
            let tail = new_size % plain_bs;
            if tail > 0 {
                let zeros = vec![0u8; tail as usize];
                self.write_locked(&mut state, &zeros, aligned)?;
            }
            debug!(old_size, new_size, "file grown");
        }
        Ok(())
    }

    /// Flush backing-file data and metadata to stable storage.
    pub fn sync(&self) -> Result<(), FileError> {
        Ok(self.file.sync_all()?)
    }

    fn load_header(&self, state: &mut HandleState) -> Result<Option<FileHeader>, FileError> {
        if let Some(header) = &state.header {
            return Ok(Some(header.clone()));
        }
        let backing_len = self.file.metadata()?.len();
        if backing_len == 0 {
            return Ok(None);
        }
        let mut buf = [0u8; HEADER_LEN];
        let n = read_full_at(&self.file, &mut buf, 0)?;
        // A non-empty file shorter than the header is corrupt; unpack
        // reports it.
        let header = FileHeader::unpack(&buf[..n])?;
        trace!(header = ?header, "file header loaded");
        state.header = Some(header.clone());
        Ok(Some(header))
    }

    fn create_header(&self, state: &mut HandleState) -> Result<FileHeader, FileError> {
        let header = FileHeader::random();
        self.file.write_all_at(&header.pack(), 0)?;
        debug!(header = ?header, "file header created");
        state.header = Some(header.clone());
        Ok(header)
    }

    /// Fetch and decrypt one block for a read-modify-write cycle.
    /// A block past EOF reads as empty.
    ///
    /// `full_overwrite_len` is how many bytes the pending write covers
    /// from the start of this block (0 if it starts mid-block). On a
    /// write-only handle, a decrypt failure is demoted when the write
    /// covers everything the block currently stores: none of the
    /// unreadable content survives, and the replacement block is at
    /// least as long as the stale one on disk.
    fn read_block_for_rmw(
        &self,
        block_no: u64,
        header: &FileHeader,
        full_overwrite_len: usize,
    ) -> Result<Vec<u8>, FileError> {
        let cipher_bs = self.crypter.cipher_bs();
        let off = HEADER_LEN as u64 + block_no * cipher_bs as u64;
        let mut buf = vec![0u8; cipher_bs];
        let n = read_full_at(&self.file, &mut buf, off)?;
        buf.truncate(n);
        match self.crypter.decrypt_block(&buf, block_no, &header.file_id) {
            Ok(plaintext) => Ok(plaintext),
            Err(err) => {
                let stale_plain_len = n.saturating_sub(crate::crypto::BLOCK_OVERHEAD);
                if self.write_only && full_overwrite_len >= stale_plain_len {
                    warn!(
                        block_no,
                        %err,
                        "ignoring decrypt error: write fully overwrites the block"
                    );
                    Ok(Vec::new())
                } else {
                    Err(err.into())
                }
            }
        }
    }

    fn zero_pad(
        &self,
        state: &mut HandleState,
        old_plain_size: u64,
        offset: u64,
    ) -> Result<(), FileError> {
        let plain_bs = self.crypter.plain_bs() as u64;
        let tail = old_plain_size % plain_bs;
        if tail == 0 {
            return Ok(());
        }
        if offset / plain_bs == old_plain_size / plain_bs {
            // Same block: merge_blocks zero-fills the gap.
            return Ok(());
        }
        let pad = (plain_bs - tail) as usize;
        trace!(old_plain_size, pad, "zero-padding tail block");
        let zeros = vec![0u8; pad];
        self.write_locked(state, &zeros, old_plain_size)?;
        Ok(())
    }
}

impl std::fmt::Debug for EncryptedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedFile")
            .field("write_only", &self.write_only)
            .finish_non_exhaustive()
    }
}

/// Positional read that retries partial reads; stops only at EOF.
fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(done)
}
