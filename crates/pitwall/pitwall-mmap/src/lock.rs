//! Named advisory mutex shared between processes.
//!
//! The lock is a file next to the mapped regions held with `flock(2)`. Each
//! `AdvisoryLock` owns its own open file description, so two instances in the
//! same process contend exactly like two processes do.

use crate::MappingError;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Sleep between attempts while waiting with a timeout.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_micros(200);

pub struct AdvisoryLock {
    file: File,
    path: PathBuf,
    remove_on_drop: bool,
}

/// Holds the lock until dropped.
pub struct LockGuard<'a> {
    lock: &'a AdvisoryLock,
}

impl AdvisoryLock {
    /// Create the lock file (owner side). The file is removed on drop.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, MappingError> {
        Self::open_with(path.as_ref(), true)
    }

    /// Open a lock created by another process.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, MappingError> {
        Self::open_with(path.as_ref(), false)
    }

    fn open_with(path: &Path, owner: bool) -> Result<Self, MappingError> {
        let file = OpenOptions::new()
            .create(owner)
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| MappingError::LockFailed {
                path: path.display().to_string(),
                source,
            })?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            remove_on_drop: owner,
        })
    }

    /// Zero-wait acquire. `Ok(None)` means another holder has it.
    pub fn try_lock(&self) -> io::Result<Option<LockGuard<'_>>> {
        // SAFETY: the descriptor stays open for the lifetime of `self`.
        let rc = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(Some(LockGuard { lock: self }));
        }

        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            Ok(None)
        } else {
            Err(err)
        }
    }

    /// Poll for the lock until `timeout` elapses. `Ok(None)` on expiry.
    pub fn lock_timeout(&self, timeout: Duration) -> io::Result<Option<LockGuard<'_>>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(guard) = self.try_lock()? {
                return Ok(Some(guard));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(LOCK_RETRY_INTERVAL);
        }
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        if self.remove_on_drop {
            let _ = fs::remove_file(&self.path);
        }
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: see `try_lock`.
        let rc = unsafe { libc::flock(self.lock.file.as_raw_fd(), libc::LOCK_UN) };
        if rc != 0 {
            tracing::warn!(
                path = %self.lock.path.display(),
                error = %io::Error::last_os_error(),
                "failed to release advisory lock"
            );
        }
    }
}
