use crate::{fsync_dir, StoreError};
use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Streaming atomic write: bytes go into a sibling temporary and only an
/// explicit [`commit`](Self::commit) renames it over the final name. Dropping
/// the handle (or calling [`abort`](Self::abort)) removes the temporary, so
/// a crash mid-stream leaves nothing at the destination.
pub struct WriteHandle {
    tmp: NamedTempFile,
    dest: PathBuf,
}

impl WriteHandle {
    /// Open a write towards `dest`, creating its parent directory. The
    /// temporary lives in the same directory so the final rename stays on
    /// one filesystem.
    pub fn create(dest: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dest = dest.into();
        let parent = dest
            .parent()
            .ok_or_else(|| StoreError::PathEscape(dest.display().to_string()))?;
        fs::create_dir_all(parent)?;
        let tmp = NamedTempFile::new_in(parent)?;
        Ok(Self { tmp, dest })
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Bytes written so far.
    pub fn len(&self) -> Result<u64, StoreError> {
        Ok(self.tmp.as_file().metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Fsync the payload and atomically rename it into place.
    pub fn commit(self) -> Result<(), StoreError> {
        self.tmp.as_file().sync_all()?;
        let parent = self
            .dest
            .parent()
            .ok_or_else(|| StoreError::PathEscape(self.dest.display().to_string()))?
            .to_path_buf();
        self.tmp
            .persist(&self.dest)
            .map_err(|e| StoreError::Io(e.error))?;
        fsync_dir(&parent)?;
        Ok(())
    }

    /// Discard the temporary without touching the destination.
    pub fn abort(self) {
        drop(self.tmp);
    }
}

impl Write for WriteHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tmp.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.tmp.flush()
    }
}

/// Serialize a value as pretty JSON and atomically rename it into place.
pub fn write_json_atomic(dest: &Path, value: &impl Serialize) -> Result<(), StoreError> {
    let content = serde_json::to_vec_pretty(value)?;
    let mut handle = WriteHandle::create(dest)?;
    handle.write_all(&content)?;
    handle.commit()
}

/// Best-effort recursive removal; a missing target is not an error.
pub fn remove_recursive(path: &Path) -> Result<(), StoreError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(StoreError::Io(e)),
    }
    Ok(())
}
