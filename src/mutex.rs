//! Cross-process named mutex built on atomic directory creation.
//!
//! `mkdir` on most filesystems is atomic: exactly one caller observes
//! success when two race to create the same path. That gives every process
//! sharing a `locks_path` directory a lock primitive without a database or
//! a lock server, at the cost of needing a reaper for crashed holders (see
//! [`crate::heartbeat`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, thiserror::Error)]
pub enum MutexError {
    #[error("timed out after {0:?} waiting to acquire lock {1:?}")]
    Timeout(Duration, PathBuf),

    #[error("io error operating on lock {1:?}: {0}")]
    Io(std::io::Error, PathBuf),
}

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const OWNER_FILE: &str = "owner.json";

/// Metadata recorded inside a lock directory so another process can inspect
/// who holds it (and since when) before deciding to [`force_release`] it.
/// Written best-effort after the directory itself is created; the `mkdir`
/// is the actual atomic operation, this is just evidence for operators.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockOwner {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// A held lock. Dropping it releases the lock by removing the lock
/// directory; release is therefore synchronous and infallible-by-best-effort
/// (errors are logged, not propagated, since a `Drop` impl cannot return a
/// `Result`).
pub struct NamedMutexGuard {
    path: PathBuf,
}

impl Drop for NamedMutexGuard {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_dir_all(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %err, "failed to release named mutex");
        }
    }
}

/// Acquire a named mutex under `locks_dir`, retrying until `timeout`
/// elapses.
///
/// `name` is expected to already be filesystem-safe (feature ids and the
/// literal `"claim"` name are used verbatim by the rest of this crate).
#[tracing::instrument(skip(locks_dir), fields(name = %name))]
pub async fn acquire(
    locks_dir: &Path,
    name: &str,
    timeout: Duration,
) -> Result<NamedMutexGuard, MutexError> {
    tokio::fs::create_dir_all(locks_dir)
        .await
        .map_err(|e| MutexError::Io(e, locks_dir.to_path_buf()))?;

    let lock_path = locks_dir.join(name);
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        match tokio::fs::create_dir(&lock_path).await {
            Ok(()) => {
                let owner = LockOwner {
                    pid: std::process::id(),
                    acquired_at: Utc::now(),
                };
                if let Ok(bytes) = serde_json::to_vec(&owner) {
                    let _ = tokio::fs::write(lock_path.join(OWNER_FILE), bytes).await;
                }
                return Ok(NamedMutexGuard { path: lock_path });
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(MutexError::Timeout(timeout, lock_path));
                }
                sleep(POLL_INTERVAL).await;
            }
            Err(err) => return Err(MutexError::Io(err, lock_path)),
        }
    }
}

/// Read back the owner metadata of a currently-held lock, if any and if
/// recorded. `None` covers both "not held" and "held but metadata missing".
pub async fn inspect(locks_dir: &Path, name: &str) -> Option<LockOwner> {
    let bytes = tokio::fs::read(locks_dir.join(name).join(OWNER_FILE))
        .await
        .ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Forcibly remove a lock directory regardless of age, used by the reaper
/// once it has independently decided the holder is dead.
pub async fn force_release(locks_dir: &Path, name: &str) -> Result<(), MutexError> {
    let lock_path = locks_dir.join(name);
    match tokio::fs::remove_dir_all(&lock_path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(MutexError::Io(err, lock_path)),
    }
}
