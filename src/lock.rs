//! Cross-platform advisory directory lock.
//!
//! `Locker` wraps a single path (the `.db_lock` sentinel file in a database
//! directory) and exposes `lock`/`unlock`. Each call to `lock` re-opens the
//! path and retries a non-blocking `fs2` lock on a fixed backoff until it
//! succeeds or the timeout elapses. Re-opening per attempt (instead of
//! caching the handle across attempts) avoids the classic bug where a
//! process closes a handle without releasing its lock and a later attempt
//! sees the file as unlocked while the kernel still holds it open elsewhere.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::{Error, Result};

pub struct Locker {
    path: PathBuf,
    handle: Option<File>,
}

impl Locker {
    pub fn new(path: impl AsRef<Path>) -> Locker {
        Locker {
            path: path.as_ref().to_path_buf(),
            handle: None,
        }
    }

    /// Acquires an exclusive or shared advisory lock on this locker's path,
    /// retrying every `poll_interval` until `timeout` elapses.
    pub fn lock(&mut self, exclusive: bool, timeout: Duration, poll_interval: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&self.path)?;

            let attempt = if exclusive {
                file.try_lock_exclusive()
            } else {
                file.try_lock_shared()
            };

            match attempt {
                Ok(()) => {
                    self.handle = Some(file);
                    return Ok(());
                }
                Err(_) => {
                    if Instant::now() >= deadline {
                        return Err(Error::LockTimeout(timeout));
                    }
                    sleep(poll_interval);
                }
            }
        }
    }

    /// Releases the lock held by this locker, if any, and closes the handle.
    pub fn unlock(&mut self) -> Result<()> {
        if let Some(file) = self.handle.take() {
            fs2::FileExt::unlock(&file)?;
        }
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for Locker {
    fn drop(&mut self) {
        let _ = self.unlock();
    }
}

/// RAII guard that releases a `Locker`'s lock when dropped, so every call
/// site gets "released on all exit paths, including error paths" for free.
pub struct LockGuard<'a> {
    locker: &'a mut Locker,
}

impl<'a> LockGuard<'a> {
    pub fn acquire(
        locker: &'a mut Locker,
        exclusive: bool,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<LockGuard<'a>> {
        locker.lock(exclusive, timeout, poll_interval)?;
        Ok(LockGuard { locker })
    }
}

impl<'a> Drop for LockGuard<'a> {
    fn drop(&mut self) {
        let _ = self.locker.unlock();
    }
}
