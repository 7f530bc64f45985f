use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, SuccessionError};

/// Pause between non-blocking lock attempts.
pub(crate) const LOCK_RETRY: Duration = Duration::from_millis(10);

/// Deadline and cancellation shared by one blocking store operation.
///
/// Checked between lock attempts, so an abandoned wait stops within one
/// [`LOCK_RETRY`] interval without ever holding the lock.
#[derive(Clone)]
pub(crate) struct LockWait {
    deadline: Instant,
    timeout: Duration,
    cancel: CancellationToken,
}

impl LockWait {
    pub(crate) fn new(timeout: Duration, cancel: &CancellationToken) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            timeout,
            cancel: cancel.clone(),
        }
    }

    /// Fail if the caller gave up or the deadline passed, otherwise sleep
    /// one retry interval.
    pub(crate) fn backoff(&self, what: &'static str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(SuccessionError::Cancelled(what));
        }
        if Instant::now() >= self.deadline {
            return Err(SuccessionError::Timeout {
                what,
                timeout: self.timeout,
            });
        }
        std::thread::sleep(LOCK_RETRY);
        Ok(())
    }
}

/// Sibling `<path>.lock` guarding the store at `path`.
pub(crate) fn lock_path(path: &Path) -> PathBuf {
    let mut lock = path.as_os_str().to_owned();
    lock.push(".lock");
    PathBuf::from(lock)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LockMode {
    Shared,
    Exclusive,
}

/// Acquire an flock on `path`, polling until available or `wait` expires.
///
/// Blocking: call from `spawn_blocking`. The returned guard holds the lock
/// until dropped.
pub(crate) fn acquire(path: &Path, mode: LockMode, wait: &LockWait) -> Result<Flock<File>> {
    let (arg, what) = match mode {
        LockMode::Shared => (FlockArg::LockSharedNonblock, "read lock"),
        LockMode::Exclusive => (FlockArg::LockExclusiveNonblock, "write lock"),
    };
    let mut file = File::options()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)?;
    loop {
        match Flock::lock(file, arg) {
            Ok(guard) => return Ok(guard),
            Err((f, e)) if e == Errno::EWOULDBLOCK || e == Errno::EINTR => file = f,
            Err((_, e)) => return Err(SuccessionError::Io(e.into())),
        }
        wait.backoff(what)?;
    }
}
