//! File locking for mutual exclusion between rebuild runs in different
//! processes.
//!
//! Uses flock() for advisory locking on the directory holding the store file.
//! The admin process and the `create-db` command both take the lock around
//! build and save, so their writes never interleave.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Lock file name placed next to the store file
const LOCK_FILE_NAME: &str = "facegate.lock";

/// A held file lock that releases on drop
pub struct FileLock {
    #[allow(dead_code)]
    file: File,
}

impl FileLock {
    /// Attempt to acquire an exclusive lock on `dir`.
    /// Returns `Ok(FileLock)` if acquired, or a `WouldBlock` error if another
    /// process holds it.
    pub fn try_acquire(dir: &Path) -> io::Result<Self> {
        let file = Self::open(dir)?;
        Self::try_lock_exclusive(&file)?;
        Ok(FileLock { file })
    }

    /// Acquire an exclusive lock, blocking until available.
    pub fn acquire_blocking(dir: &Path) -> io::Result<Self> {
        let file = Self::open(dir)?;
        Self::lock_exclusive(&file)?;
        Ok(FileLock { file })
    }

    fn open(dir: &Path) -> io::Result<File> {
        std::fs::create_dir_all(dir)?;
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE_NAME))
    }

    #[cfg(unix)]
    fn try_lock_exclusive(file: &File) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock
                || err.raw_os_error() == Some(libc::EWOULDBLOCK)
                || err.raw_os_error() == Some(libc::EAGAIN)
            {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "store is locked by another rebuild (admin or create-db)",
                ));
            }
            return Err(err);
        }
        Ok(())
    }

    #[cfg(unix)]
    fn lock_exclusive(file: &File) -> io::Result<()> {
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX) };
        if result != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock_exclusive(_file: &File) -> io::Result<()> {
        // no advisory locking outside unix
        Ok(())
    }

    #[cfg(not(unix))]
    fn lock_exclusive(_file: &File) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
impl Drop for FileLock {
    fn drop(&mut self) {
        let fd = self.file.as_raw_fd();
        // Release the lock - ignore errors on drop
        unsafe { libc::flock(fd, libc::LOCK_UN) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_acquire_and_release() {
        let tmp = tempfile::tempdir().unwrap();

        let lock1 = FileLock::try_acquire(tmp.path());
        assert!(lock1.is_ok(), "First lock should succeed");

        let lock2 = FileLock::try_acquire(tmp.path());
        assert!(
            matches!(&lock2, Err(e) if e.kind() == io::ErrorKind::WouldBlock),
            "Second lock should fail"
        );

        drop(lock1);

        let lock3 = FileLock::try_acquire(tmp.path());
        assert!(lock3.is_ok(), "Third lock should succeed after release");
    }

    #[test]
    fn test_creates_missing_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested").join("store");
        let _lock = FileLock::acquire_blocking(&dir).unwrap();
        assert!(dir.join(LOCK_FILE_NAME).exists());
    }
}
