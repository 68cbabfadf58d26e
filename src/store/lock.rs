use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Instant;

use fd_lock::{RwLock, RwLockWriteGuard};
use tracing::debug;

use crate::error::MergeError;

/// Advisory exclusive lock on a file kept next to (never equal to) the store.
///
/// The OS drops the lock when the holding process exits, so a crashed
/// merge does not leave it held.
pub struct StoreLock {
    path: PathBuf,
    file: RwLock<File>,
}

pub struct StoreLockGuard<'a> {
    _guard: RwLockWriteGuard<'a, File>,
    path: &'a Path,
    acquired_at: Instant,
}

impl StoreLock {
    pub fn open(path: &Path) -> Result<Self, MergeError> {
        let lock_error = |source: std::io::Error| MergeError::Lock {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(lock_error)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)
            .map_err(lock_error)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
        })
    }

    /// Blocks until the lock is held. There is no timeout.
    pub fn acquire(&mut self) -> Result<StoreLockGuard<'_>, MergeError> {
        debug!(path = %self.path.display(), "waiting for store lock");
        let started = Instant::now();
        let guard = self.file.write().map_err(|source| MergeError::Lock {
            path: self.path.clone(),
            source,
        })?;
        debug!(
            path = %self.path.display(),
            waited_ms = started.elapsed().as_millis() as u64,
            "store lock acquired"
        );
        Ok(StoreLockGuard {
            _guard: guard,
            path: &self.path,
            acquired_at: Instant::now(),
        })
    }
}

impl Drop for StoreLockGuard<'_> {
    fn drop(&mut self) {
        debug!(
            path = %self.path.display(),
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "store lock released"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::StoreLock;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn creates_missing_lock_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("locks/facts.lock");
        let mut lock = StoreLock::open(&path).expect("open lock");
        drop(lock.acquire().expect("acquire"));
        assert!(path.is_file());
    }

    #[test]
    fn second_handle_waits_for_release() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("facts.lock");

        let mut first = StoreLock::open(&path).expect("first handle");
        let guard = first.acquire().expect("first acquire");

        let (tx, rx) = mpsc::channel();
        let waiter_path = path.clone();
        let waiter = thread::spawn(move || {
            let mut second = StoreLock::open(&waiter_path).expect("second handle");
            let _guard = second.acquire().expect("second acquire");
            tx.send(()).expect("signal");
        });

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        drop(guard);
        rx.recv_timeout(Duration::from_secs(10))
            .expect("waiter acquires after release");
        waiter.join().expect("waiter thread");
    }
}
