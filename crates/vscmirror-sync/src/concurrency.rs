use crate::SyncError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

/// Advisory exclusive lock on the artifact root. Two sync passes must never
/// run concurrently against the same store, in-process or across processes.
pub struct StoreLock {
    lock_file: File,
}

impl StoreLock {
    pub fn acquire(lock_path: &Path) -> Result<Self, SyncError> {
        match Self::try_acquire(lock_path)? {
            Some(lock) => Ok(lock),
            None => Err(SyncError::LockHeld(lock_path.display().to_string())),
        }
    }

    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>, SyncError> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent).map_err(vscmirror_store::StoreError::Io)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)
            .map_err(vscmirror_store::StoreError::Io)?;

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { lock_file: file })),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.lock_file);
    }
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Install a Ctrl-C handler: first signal requests a cooperative stop, a
/// second one exits immediately.
pub fn install_signal_handler() {
    let _ = ctrlc::set_handler(move || {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            std::process::exit(1);
        }
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
        eprintln!("\nshutdown requested, finishing current operation...");
    });
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}
