//! On-disk artifact store for mirrored editor binaries and extensions.
//!
//! This crate owns the bytes under the artifact root: the directory layout,
//! the atomic-write primitives every other component goes through, the
//! satisfaction probe used to skip already-downloaded payloads, tolerant
//! streaming scans for live readers, and an integrity verifier. Atomic
//! rename into place is the only mutation protocol; no partial file is ever
//! visible at a final path.

pub mod integrity;
pub mod layout;
pub mod probe;
pub mod records;
pub mod write;

pub use integrity::{verify_store, IntegrityFailure, IntegrityReport};
pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use probe::{file_sha256, satisfies};
pub use records::{BinaryStore, ExtensionStore, MaliciousList, SpecifiedList};
pub use write::{write_json_atomic, WriteHandle};

use std::path::Path;
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
///
/// On Linux with ext4 `data=ordered` (the default), renames are usually
/// durable without an explicit dir fsync, but POSIX does not guarantee this.
/// Calling `fsync()` on the parent directory makes the rename durable on
/// all filesystems and mount configurations.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Schema(#[from] vscmirror_schema::SchemaError),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("path '{0}' escapes the artifact root")]
    PathEscape(String),
    #[error("not found in store: {0}")]
    NotFound(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display_path_escape() {
        let e = StoreError::PathEscape("../../etc/passwd".to_owned());
        assert!(e.to_string().contains("escapes"));
    }

    #[test]
    fn store_error_display_version_mismatch() {
        let e = StoreError::VersionMismatch {
            expected: 1,
            found: 9,
        };
        let msg = e.to_string();
        assert!(msg.contains('1'));
        assert!(msg.contains('9'));
    }

    #[test]
    fn store_error_display_not_found() {
        let e = StoreError::NotFound("ms-python.python".to_owned());
        assert!(e.to_string().contains("ms-python.python"));
    }
}
