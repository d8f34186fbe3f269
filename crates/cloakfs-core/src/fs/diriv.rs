//! Per-directory IVs and their sidecar files.
//!
//! Every encrypted directory carries a `cloakfs.diriv` sidecar holding 16
//! random bytes. The IV tweaks filename encryption so identical names in
//! different directories encrypt differently. IVs are cached; any
//! operation that can replace a directory (mkdir, rmdir, rename) clears
//! the cache.
//!
//! rmdir needs a dance: the directory must be empty to be removed, but it
//! still contains the sidecar. The sidecar is parked in the parent under
//! `cloakfs.diriv.rmdir.<inode>`, the directory removed, and the parked
//! file deleted. Readers resolving names must never observe the
//! in-between state, so the dance runs under this store's writer lock
//! while name resolution holds the reader side.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use parking_lot::{RwLock, RwLockReadGuard};
use rand::RngCore;
use thiserror::Error;
use tracing::{debug, warn};

use super::names::{DIRIV_NAME, DIRIV_RESCUE_PREFIX};

/// Directory IV length in bytes.
pub const DIRIV_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum DirIvError {
    /// The sidecar exists but does not hold exactly 16 bytes.
    #[error("directory IV file in {dir:?} has wrong size {len}")]
    WrongSize { dir: PathBuf, len: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Read-through cache of directory IVs plus the sidecar-relocation lock.
///
/// One store is shared by all handles of a mount.
#[derive(Default)]
pub struct DirIvStore {
    cache: RwLock<HashMap<PathBuf, [u8; DIRIV_LEN]>>,
    /// Held shared by name resolution, exclusively by the rmdir dance and
    /// directory creation.
    sidecar_lock: RwLock<()>,
}

impl DirIvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold off sidecar relocation while resolving names in a directory.
    pub fn read_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.sidecar_lock.read()
    }

    /// Read (and cache) the IV of the encrypted directory `cdir`.
    pub fn read_dir_iv(&self, cdir: &Path) -> Result<[u8; DIRIV_LEN], DirIvError> {
        if let Some(iv) = self.cache.read().get(cdir) {
            return Ok(*iv);
        }
        let data = fs::read(cdir.join(DIRIV_NAME))?;
        if data.len() != DIRIV_LEN {
            return Err(DirIvError::WrongSize {
                dir: cdir.to_path_buf(),
                len: data.len(),
            });
        }
        let mut iv = [0u8; DIRIV_LEN];
        iv.copy_from_slice(&data);
        self.cache.write().insert(cdir.to_path_buf(), iv);
        Ok(iv)
    }

    /// Create the IV sidecar inside a just-created directory.
    ///
    /// Refuses to overwrite: an existing sidecar means the directory is
    /// already initialized and replacing its IV would orphan every
    /// encrypted name inside.
    pub fn write_dir_iv(cdir: &Path) -> Result<(), DirIvError> {
        let mut iv = [0u8; DIRIV_LEN];
        rand::rng().fill_bytes(&mut iv);
        let path = cdir.join(DIRIV_NAME);
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        file.write_all(&iv)?;
        file.sync_all()?;
        Ok(())
    }

    /// Create directory `cdir` together with its IV sidecar.
    ///
    /// The new directory may take the place of an older cached one, so the
    /// cache is cleared first. If the sidecar cannot be created the
    /// directory is rolled back.
    pub fn create_dir_with_iv(&self, cdir: &Path) -> Result<(), DirIvError> {
        self.clear_cache();
        let _exclusive = self.sidecar_lock.write();
        fs::create_dir(cdir)?;
        if let Err(err) = Self::write_dir_iv(cdir) {
            warn!(dir = %cdir.display(), %err, "creating {DIRIV_NAME} failed, rolling back mkdir");
            if let Err(rollback) = fs::remove_dir(cdir) {
                warn!(dir = %cdir.display(), %rollback, "mkdir rollback failed");
            }
            return Err(err);
        }
        debug!(dir = %cdir.display(), "directory created with fresh IV");
        Ok(())
    }

    /// Remove the encrypted directory `cdir`, which must be empty apart
    /// from its IV sidecar.
    ///
    /// The sidecar is renamed into the parent, the directory removed, and
    /// the parked sidecar unlinked. If the rmdir fails (an entry appeared
    /// concurrently) the rename is undone. The whole sequence runs under
    /// the exclusive sidecar lock.
    pub fn remove_dir_with_iv(&self, cdir: &Path) -> Result<(), DirIvError> {
        let parent = cdir
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "directory has no parent"))?;
        let inode = fs::metadata(cdir)?.ino();
        let sidecar = cdir.join(DIRIV_NAME);
        let rescue = parent.join(format!("{DIRIV_RESCUE_PREFIX}{inode}"));

        let exclusive = self.sidecar_lock.write();
        fs::rename(&sidecar, &rescue)?;
        if let Err(err) = fs::remove_dir(cdir) {
            // Another entry showed up between our emptiness check and the
            // rmdir; put the sidecar back.
            if let Err(rollback) = fs::rename(&rescue, &sidecar) {
                warn!(dir = %cdir.display(), %rollback, "rmdir rollback failed");
            }
            return Err(err.into());
        }
        if let Err(err) = fs::remove_file(&rescue) {
            warn!(rescue = %rescue.display(), %err, "could not clean up parked IV sidecar");
        }
        drop(exclusive);

        // The removed directory may have been cached.
        self.clear_cache();
        debug!(dir = %cdir.display(), "directory removed");
        Ok(())
    }

    /// Drop all cached IVs. Called around rmdir, mkdir and rename, where
    /// a directory can be replaced by another one under the same path.
    pub fn clear_cache(&self) {
        self.cache.write().clear();
    }

    /// Number of cached IVs, for tests and diagnostics.
    pub fn cached_len(&self) -> usize {
        self.cache.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_and_read_dir_iv() {
        let tmp = TempDir::new().unwrap();
        let cdir = tmp.path().join("subdir");
        let store = DirIvStore::new();

        store.create_dir_with_iv(&cdir).unwrap();
        let iv = store.read_dir_iv(&cdir).unwrap();
        assert_eq!(store.read_dir_iv(&cdir).unwrap(), iv, "cached read");
        assert_eq!(store.cached_len(), 1);
    }

    #[test]
    fn test_ivs_are_random_per_directory() {
        let tmp = TempDir::new().unwrap();
        let store = DirIvStore::new();
        let a = tmp.path().join("a");
        let b = tmp.path().join("b");
        store.create_dir_with_iv(&a).unwrap();
        store.create_dir_with_iv(&b).unwrap();
        assert_ne!(store.read_dir_iv(&a).unwrap(), store.read_dir_iv(&b).unwrap());
    }

    #[test]
    fn test_write_dir_iv_refuses_overwrite() {
        let tmp = TempDir::new().unwrap();
        let cdir = tmp.path().join("d");
        let store = DirIvStore::new();
        store.create_dir_with_iv(&cdir).unwrap();
        let before = store.read_dir_iv(&cdir).unwrap();
        assert!(DirIvStore::write_dir_iv(&cdir).is_err());
        store.clear_cache();
        assert_eq!(store.read_dir_iv(&cdir).unwrap(), before);
    }

    #[test]
    fn test_wrong_size_sidecar_rejected() {
        let tmp = TempDir::new().unwrap();
        let cdir = tmp.path().join("d");
        fs::create_dir(&cdir).unwrap();
        fs::write(cdir.join(DIRIV_NAME), b"short").unwrap();

        let store = DirIvStore::new();
        assert!(matches!(
            store.read_dir_iv(&cdir),
            Err(DirIvError::WrongSize { len: 5, .. })
        ));
    }

    #[test]
    fn test_missing_sidecar_is_io_error() {
        let tmp = TempDir::new().unwrap();
        let cdir = tmp.path().join("d");
        fs::create_dir(&cdir).unwrap();
        let store = DirIvStore::new();
        assert!(matches!(store.read_dir_iv(&cdir), Err(DirIvError::Io(_))));
    }

    #[test]
    fn test_remove_dir_with_iv() {
        let tmp = TempDir::new().unwrap();
        let cdir = tmp.path().join("doomed");
        let store = DirIvStore::new();
        store.create_dir_with_iv(&cdir).unwrap();
        store.read_dir_iv(&cdir).unwrap();

        store.remove_dir_with_iv(&cdir).unwrap();
        assert!(!cdir.exists());
        assert_eq!(store.cached_len(), 0, "cache cleared after rmdir");
        // No parked sidecar left behind.
        let leftovers: Vec<_> = fs::read_dir(tmp.path()).unwrap().collect();
        assert!(leftovers.is_empty(), "leftovers: {leftovers:?}");
    }

    #[test]
    fn test_remove_nonempty_dir_rolls_back() {
        let tmp = TempDir::new().unwrap();
        let cdir = tmp.path().join("busy");
        let store = DirIvStore::new();
        store.create_dir_with_iv(&cdir).unwrap();
        fs::write(cdir.join("entry"), b"x").unwrap();

        assert!(store.remove_dir_with_iv(&cdir).is_err());
        assert!(cdir.join(DIRIV_NAME).exists(), "sidecar restored");
    }
}
