use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use fs2::FileExt;
use log::debug;
use thiserror::Error;

use crate::RootPaths;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another update is already running for {root}")]
    Contended { root: String },
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl LockError {
    fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}

/// Exclusive per-root update lock.
///
/// The lock file is never unlinked: removing it while another process has
/// it open would let two holders lock different inodes. It is listed as a
/// control file so manifests and backups ignore it.
#[derive(Debug)]
pub struct UpdateLock {
    _file: File,
}

impl UpdateLock {
    /// Try to take the update lock for `root`, polling until `timeout`
    /// elapses.
    ///
    /// # Errors
    /// Returns [`LockError::Contended`] when another holder keeps the lock
    /// past the timeout, or an I/O error when the lock file cannot be opened.
    pub fn acquire(root: &Path, timeout: Duration) -> Result<Self, LockError> {
        let lock_path = RootPaths::new(root).lock_file();
        let mut lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|error| LockError::io("failed to open update lock file", error))?;

        let deadline = Instant::now() + timeout;
        loop {
            match lock_file.try_lock_exclusive() {
                Ok(()) => break,
                Err(error) if is_contention(&error) => {
                    if Instant::now() >= deadline {
                        debug!("Update lock for {} is held elsewhere", root.display());
                        return Err(LockError::Contended {
                            root: root.display().to_string(),
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(error) => {
                    return Err(LockError::io("failed to acquire update lock", error));
                }
            }
        }

        lock_file
            .set_len(0)
            .and_then(|()| lock_file.seek(SeekFrom::Start(0)).map(|_| ()))
            .and_then(|()| writeln!(lock_file, "{}", std::process::id()))
            .map_err(|error| LockError::io("failed to write update lock metadata", error))?;

        debug!("Acquired update lock for {}", root.display());
        Ok(Self { _file: lock_file })
    }
}

fn is_contention(error: &std::io::Error) -> bool {
    error.kind() == std::io::ErrorKind::WouldBlock
        || error.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
