//! Advisory lock on a sidecar file, shared by every process using a ledger.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// How long a writer waits for another process before giving up
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Exclusive lock on `path`, released on drop
pub struct LedgerLock {
    path: PathBuf,
    file: File,
}

impl LedgerLock {
    /// Acquire the lock, waiting up to `timeout`.
    ///
    /// Creates the lock file and its directory if needed. Fails with
    /// `TimedOut` if another holder keeps it longer.
    pub fn acquire(path: &Path, timeout: Duration) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let start = Instant::now();
        let mut warned = false;
        loop {
            match try_lock_exclusive(path) {
                Ok(file) => {
                    if warned {
                        tracing::debug!(
                            path = %path.display(),
                            waited_ms = start.elapsed().as_millis() as u64,
                            "Ledger lock acquired after contention"
                        );
                    }
                    return Ok(Self { path: path.to_path_buf(), file });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !warned && start.elapsed() > Duration::from_millis(500) {
                        tracing::warn!(path = %path.display(), "Ledger lock contended, waiting...");
                        warned = true;
                    }
                }
                Err(e) => return Err(e),
            }

            if start.elapsed() >= timeout {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("ledger lock {} held for over {timeout:?}", path.display()),
                ));
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn try_lock_exclusive(path: &Path) -> io::Result<File> {
    use std::os::unix::io::AsRawFd;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    // SAFETY: the descriptor is owned by `file` and open for this call
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if result == 0 {
        return Ok(file);
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
    } else {
        Err(err)
    }
}

/// Without `flock`, the lock file's existence is the lock
#[cfg(not(unix))]
fn try_lock_exclusive(path: &Path) -> io::Result<File> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "lock held"))
        }
        Err(e) => Err(e),
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            // SAFETY: `self.file` is still open
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = fs::remove_file(&self.path);
        }
    }
}
