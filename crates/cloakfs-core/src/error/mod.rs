//! Error types for the cloakfs core
//!
//! Re-exports every public error type so dispatcher code has one place
//! to import from when mapping errors to status codes: corruption and
//! authentication failures become EIO, filtered names EPERM, and
//! backing-store errors keep their own errno.

pub use crate::content::{BlockDecryptError, HeaderError, SizeError};
pub use crate::crypto::AeadError;
pub use crate::fs::diriv::DirIvError;
pub use crate::fs::file::FileError;
pub use crate::fs::names::NameError;
pub use crate::fs::symlink::SymlinkError;
pub use crate::vault::config::ConfigError;
