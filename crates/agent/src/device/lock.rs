//! Advisory per-board lockfile, grounded on `device_lock()` in `device.c`.
//!
//! One exclusive, non-blocking `flock(2)` attempt per poll; on contention
//! the original sleeps 3s and then probes stdin for EOF to detect a dead
//! client. The `tokio::select!` here races the same sleep against a
//! transport-EOF watch so a vanished client doesn't leave the agent
//! waiting forever on a busy board.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::time::Duration;

use nix::fcntl::{flock, FlockArg};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::BackendError;

const RETRY_INTERVAL: Duration = Duration::from_secs(3);

pub struct BoardLock {
    file: File,
}

impl BoardLock {
    fn path_for(board: &str) -> PathBuf {
        std::env::temp_dir().join(format!("cdba-{board}.lock"))
    }

    /// Blocks (cooperatively) until the lock is acquired or `transport_gone`
    /// fires — a `CancellationToken` the main read loop cancels on EOF,
    /// standing in for the original's "probe stdin between retries" check
    /// now that the transport is owned by a different task.
    pub async fn acquire(board: &str, transport_gone: &CancellationToken) -> Result<Self, BackendError> {
        let path = Self::path_for(board);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(BackendError::Io)?;

        loop {
            match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
                Ok(()) => return Ok(Self { file }),
                Err(nix::errno::Errno::EWOULDBLOCK) => {
                    warn!("board {board} is in use, waiting...");
                    tokio::select! {
                        _ = sleep(RETRY_INTERVAL) => {}
                        _ = transport_gone.cancelled() => {
                            return Err(BackendError::LockTimeout(board.to_string()));
                        }
                    }
                }
                Err(e) => return Err(BackendError::Io(std::io::Error::from(e))),
            }
        }
    }
}

impl Drop for BoardLock {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
    }
}
