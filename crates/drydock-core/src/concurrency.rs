use crate::CoreError;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

/// Exclusive advisory lock on the state lock file. Released on drop.
pub struct StoreLock {
    lock_file: File,
    path: PathBuf,
}

impl StoreLock {
    fn open(lock_path: &Path) -> Result<File, CoreError> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?)
    }

    /// Take the lock if it is free; `None` if another process holds it.
    pub fn try_acquire(lock_path: &Path) -> Result<Option<Self>, CoreError> {
        let file = Self::open(lock_path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self {
                lock_file: file,
                path: lock_path.to_path_buf(),
            })),
            Err(_) => Ok(None),
        }
    }

    /// Like [`StoreLock::try_acquire`], failing with [`CoreError::Locked`].
    pub fn acquire_or_fail(lock_path: &Path) -> Result<Self, CoreError> {
        Self::try_acquire(lock_path)?.ok_or_else(|| CoreError::Locked(lock_path.to_path_buf()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        let _ = self.lock_file.unlock();
    }
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Cancel `token` on the first Ctrl-C; exit 130 on the second.
pub fn install_signal_handler(token: CancellationToken) {
    let _ = ctrlc::set_handler(move || {
        if INTERRUPTED.swap(true, Ordering::SeqCst) {
            std::process::exit(i32::from(crate::EXIT_CANCELLED));
        }
        eprintln!("\ninterrupt received, waiting for in-flight operations (press again to abort)...");
        token.cancel();
    });
}
