//! Advisory file lock guarding the shared ledger
//!
//! Exclusive `flock` with a bounded wait; released when dropped.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out after {timeout:?} waiting for {path}")]
    Timeout { path: PathBuf, timeout: Duration },

    #[error("lock I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Held exclusive lock on `<dir>/ledger.lock`.
pub struct LedgerLock {
    path: PathBuf,
    file: File,
}

impl LedgerLock {
    const LOCK_FILENAME: &'static str = "ledger.lock";
    const POLL_INTERVAL: Duration = Duration::from_millis(20);
    const CONTENTION_WARNING: Duration = Duration::from_millis(500);

    /// Acquire the lock, creating `dir` if needed.
    pub fn acquire(dir: &Path, timeout: Duration) -> Result<Self, LockError> {
        let path = dir.join(Self::LOCK_FILENAME);
        let io_err = |source| LockError::Io {
            path: path.clone(),
            source,
        };
        fs::create_dir_all(dir).map_err(io_err)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        let start = Instant::now();
        let mut warned = false;
        loop {
            match try_lock_exclusive(&file) {
                Ok(()) => {
                    if warned {
                        debug!(
                            path = %path.display(),
                            waited_ms = start.elapsed().as_millis() as u64,
                            "ledger lock acquired after contention"
                        );
                    }
                    return Ok(Self { path, file });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !warned && start.elapsed() > Self::CONTENTION_WARNING {
                        warn!(path = %path.display(), "ledger lock contended, waiting");
                        warned = true;
                    }
                }
                Err(source) => return Err(LockError::Io { path, source }),
            }

            if start.elapsed() >= timeout {
                return Err(LockError::Timeout { path, timeout });
            }
            std::thread::sleep(Self::POLL_INTERVAL);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        unlock(&self.file);
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor is owned by `file` and stays open for the call.
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
    } else {
        Err(err)
    }
}

#[cfg(unix)]
fn unlock(file: &File) {
    use std::os::unix::io::AsRawFd;

    // SAFETY: as above.
    unsafe {
        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
    }
}

#[cfg(not(unix))]
fn try_lock_exclusive(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn unlock(_file: &File) {}
