//! Build locks.
//!
//! A key is `Building` while `<lock_dir>/<key>.lock` exists and `Free`
//! otherwise.  The file is created with `O_CREAT | O_EXCL`, so acquisition is
//! one atomic step on any filesystem that honours exclusive create.  Sharing
//! a lock directory across hosts without that guarantee reintroduces
//! duplicate builds.

use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::reference::DeltaKey;
use crate::{Error, Result};

/// Interval between lock polls while waiting.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

const LOCK_EXTENSION: &str = "lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Free,
    Building,
}

/// Contents of a lock file, for operators inspecting the lock directory.
#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    key: String,
    build_id: String,
    pid: u32,
    started_at: String,
}

pub struct BuildLocks {
    dir: PathBuf,
    poll_interval: Duration,
}

impl BuildLocks {
    /// Use `dir` as the lock directory, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::Config(format!("failed to create lock dir {}: {e}", dir.display())))?;
        Ok(Self {
            dir,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, key: &DeltaKey) -> PathBuf {
        self.dir.join(format!("{}.{LOCK_EXTENSION}", key.file_stem()))
    }

    /// A lock file that cannot be checked counts as held.
    pub async fn state(&self, key: &DeltaKey) -> LockState {
        match tokio::fs::try_exists(self.path(key)).await {
            Ok(false) => LockState::Free,
            Ok(true) => LockState::Building,
            Err(e) => {
                warn!(%key, error = %e, "failed to check build lock");
                LockState::Building
            }
        }
    }

    pub async fn is_held(&self, key: &DeltaKey) -> bool {
        self.state(key).await == LockState::Building
    }

    /// Atomically take the lock for `key`.
    ///
    /// Fails with [`Error::AlreadyBuilding`] when another actor holds it.
    /// The returned guard releases the lock when dropped.
    pub async fn acquire(self: &Arc<Self>, key: &DeltaKey, build_id: &str) -> Result<BuildLock> {
        let path = self.path(key);
        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(%key, "lock already held");
                return Err(Error::AlreadyBuilding {
                    key: key.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let record = LockRecord {
            key: key.to_string(),
            build_id: build_id.to_string(),
            pid: std::process::id(),
            started_at: humantime::format_rfc3339_seconds(SystemTime::now()).to_string(),
        };
        let guard = BuildLock {
            locks: Arc::clone(self),
            key: key.clone(),
            released: false,
        };
        // The guard owns the file from here on; a failed write still releases.
        file.write_all(&serde_json::to_vec(&record)?).await?;

        debug!(%key, build_id, "lock acquired");
        Ok(guard)
    }

    /// Remove the lock for `key`.  Releasing a lock that is not held is a no-op.
    pub async fn release(&self, key: &DeltaKey) -> Result<()> {
        match tokio::fs::remove_file(self.path(key)).await {
            Ok(()) => {
                debug!(%key, "lock released");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Poll until `key` is free or `max_wait` has elapsed.  Returns `true` if
    /// the lock is still held when giving up.
    pub async fn wait_until_free(&self, key: &DeltaKey, max_wait: Duration) -> bool {
        let started = Instant::now();
        loop {
            if !self.is_held(key).await {
                return false;
            }
            if started.elapsed() >= max_wait {
                debug!(%key, waited = ?started.elapsed(), "gave up waiting for lock");
                return true;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Delete every lock file.  Only valid before this process starts
    /// building: with one coordinator per lock directory, any lock present at
    /// startup belongs to a process that no longer exists.
    pub fn clear_stale(&self) -> Result<usize> {
        let mut cleared = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOCK_EXTENSION) {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    info!(path = %path.display(), "removed stale build lock");
                    cleared += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(cleared)
    }
}

/// A held build lock.  Dropping it releases the lock, so every exit path of
/// a build (including panics) frees the key.
pub struct BuildLock {
    locks: Arc<BuildLocks>,
    key: DeltaKey,
    released: bool,
}

impl BuildLock {
    /// Release explicitly so failures can be logged.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        self.locks.release(&self.key).await
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match std::fs::remove_file(self.locks.path(&self.key)) {
            Ok(()) => debug!(key = %self.key, "lock released on drop"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(key = %self.key, error = %e, "failed to release build lock"),
        }
    }
}
