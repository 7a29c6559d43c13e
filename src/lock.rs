//! Cross-process advisory file locking.
//!
//! Guards both the first-time unpack of an extraction directory and an
//! instance's data directory. On Unix systems this uses `flock(2)` in
//! non-blocking mode; elsewhere exclusive creation of the lock file stands in
//! for the lock.

use camino::{Utf8Path, Utf8PathBuf};
use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use tracing::warn;

use crate::observability::CACHE_TARGET;

/// Name of the lock file placed inside guarded directories.
pub(crate) const LOCK_FILE_NAME: &str = "epg-lock";

/// Guard that holds an exclusive advisory lock until released or dropped.
///
/// Dropping the guard closes the file, which releases the lock but leaves
/// the file in place; [`FileLock::release`] also deletes it.
#[derive(Debug)]
pub(crate) struct FileLock {
    file: File,
    path: Utf8PathBuf,
}

impl FileLock {
    /// Attempts to take the lock at `path` without blocking.
    ///
    /// Returns `Ok(None)` when another holder owns the lock.
    ///
    /// # Errors
    /// Returns an error when the lock file cannot be opened or the lock call
    /// fails for a reason other than contention.
    #[cfg(unix)]
    pub(crate) fn try_acquire(path: &Utf8Path) -> io::Result<Option<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        // SAFETY: The file descriptor obtained from `file.as_raw_fd()` is valid
        // because `file` was opened via `OpenOptions::open` and remains owned by
        // this scope until after the `flock` call completes.
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }

        Ok(Some(Self {
            file,
            path: path.to_path_buf(),
        }))
    }

    /// Attempts to take the lock by creating `path` exclusively.
    #[cfg(not(unix))]
    pub(crate) fn try_acquire(path: &Utf8Path) -> io::Result<Option<Self>> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Returns the lock file path.
    #[cfg(test)]
    pub(crate) fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Releases the lock and deletes the lock file.
    ///
    /// Failures are logged rather than returned so callers on teardown paths
    /// always make progress.
    pub(crate) fn release(self) {
        let Self { file, path } = self;
        drop(file);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(
                target: CACHE_TARGET,
                path = %path,
                error = %err,
                "could not remove lock file"
            ),
        }
    }
}
