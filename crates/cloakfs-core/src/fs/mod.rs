//! Filesystem-facing layer: file handles, filename encryption, directory
//! IVs and symlink targets. The dispatcher (FUSE loop, POSIX metadata
//! operations) lives outside this crate and calls in here.

pub mod diriv;
pub mod file;
pub mod names;
pub mod symlink;

pub use diriv::{DirIvError, DirIvStore, DIRIV_LEN};
pub use file::{EncryptedFile, FileError};
pub use names::{
    is_filtered, is_reserved_name, NameCodec, NameError, CONFIG_NAME, DIRIV_NAME,
    DIRIV_RESCUE_PREFIX, LONGNAME_PREFIX, LONGNAME_SUFFIX, MAX_NAME_LEN,
};
pub use symlink::{decrypt_symlink_target, encrypt_symlink_target, SymlinkError};
