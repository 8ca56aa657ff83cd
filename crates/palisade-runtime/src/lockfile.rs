//! Project-scoped exclusive lock files.
//!
//! An advisory `flock(2)` lock keyed by project name guarantees at most
//! one active container creation (and, in foreground mode, supervised
//! lifetime) per project. Acquisition blocks until the current holder
//! releases; release also removes the lock file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use palisade_common::error::{Result, RuntimeError};

/// Applies a `flock(2)` operation to an open file.
pub(crate) fn flock(file: &File, operation: libc::c_int) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor is owned by `file` and stays open for the
    // duration of the call.
    let ret = unsafe { libc::flock(file.as_raw_fd(), operation) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// An acquired project lock.
///
/// Dropping the handle releases the lock and removes the lock file, so
/// every exit path of the holder — success or failure — releases it.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    file: Option<File>,
}

impl LockFile {
    /// Acquires the exclusive lock at `path`, blocking while another
    /// process holds it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be opened or locked.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| RuntimeError::io(&path, e))?;
        flock(&file, libc::LOCK_EX).map_err(|e| RuntimeError::io(&path, e))?;
        tracing::debug!(path = %path.display(), "exclusive lock acquired");
        Ok(Self {
            path,
            file: Some(file),
        })
    }

    /// The lock file's path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Releases the lock and removes the lock file.
    ///
    /// # Errors
    ///
    /// Returns an error if the unlock or the file removal fails.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
            .map_err(|e| RuntimeError::io(&self.path, e))
    }

    fn release_inner(&mut self) -> std::io::Result<()> {
        if let Some(file) = self.file.take() {
            flock(&file, libc::LOCK_UN)?;
            drop(file);
            if self.path.exists() {
                std::fs::remove_file(&self.path)?;
            }
            tracing::debug!(path = %self.path.display(), "exclusive lock released");
        }
        Ok(())
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if self.file.is_some() {
            if let Err(err) = self.release_inner() {
                tracing::warn!(path = %self.path.display(), %err, "lock release failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_creates_and_release_removes_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".web.palisadelock");

        let lock = LockFile::acquire(&path).expect("acquire");
        assert!(path.exists());
        lock.release().expect("release");
        assert!(!path.exists());
    }

    #[test]
    fn drop_releases_the_lock() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(".web.palisadelock");
        {
            let _lock = LockFile::acquire(&path).expect("acquire");
            assert!(path.exists());
        }
        assert!(!path.exists());

        // A second acquisition succeeds once the first holder is gone.
        let lock = LockFile::acquire(&path).expect("reacquire");
        lock.release().expect("release");
    }
}
