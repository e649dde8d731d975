//! Atomic persistence for the dynamic [`crate::state::FeatureStateDoc`].
//!
//! Every mutation goes through [`StateStore::transact`]: acquire the
//! `"state"` named mutex, read the current document from disk, run the
//! caller's closure, write the result to a temp file in the same
//! directory, then rename it over the real path. Rename within one
//! filesystem is atomic, so readers never observe a half-written document
//! even without the mutex; the mutex exists to serialize concurrent
//! writers so a read-modify-write round trip can't lose an update.

use crate::state::{validate_invariants, FeatureStateDoc, InvariantViolation};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StateStoreError {
    #[error(transparent)]
    Mutex(#[from] crate::mutex::MutexError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state document is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("mutation would violate a state invariant: {0}")]
    Invariant(#[from] InvariantViolation),
}

/// Handle to the shared state document.
#[derive(Clone)]
pub struct StateStore {
    state_path: PathBuf,
    locks_path: PathBuf,
    mutex_timeout: Duration,
}

impl StateStore {
    pub fn new(state_path: impl Into<PathBuf>, locks_path: impl Into<PathBuf>, mutex_timeout: Duration) -> Self {
        Self {
            state_path: state_path.into(),
            locks_path: locks_path.into(),
            mutex_timeout,
        }
    }

    pub fn from_config(config: &crate::config::OrchestratorConfig) -> Self {
        Self::new(
            config.state_path.clone(),
            config.locks_path.clone(),
            config.default_mutex_timeout,
        )
    }

    /// Read the current document without taking the mutex. Safe because
    /// writes are atomic renames; a reader either sees the old document or
    /// the new one, never a torn one.
    pub async fn read(&self) -> Result<FeatureStateDoc, StateStoreError> {
        match tokio::fs::read(&self.state_path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(FeatureStateDoc::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Run `f` against a freshly-read document under the `"state"` mutex,
    /// validate invariants against the result, persist only if they hold,
    /// and return whatever `f` returns alongside it.
    ///
    /// `f` may mutate the document and return an arbitrary value; the
    /// document itself is always the one persisted, regardless of what the
    /// closure returns. A mutation that leaves the document in a state
    /// [`crate::state::validate_invariants`] rejects is abandoned: nothing is
    /// written, and the call returns `Err` instead of `f`'s result.
    pub async fn transact<T>(
        &self,
        f: impl FnOnce(&mut FeatureStateDoc) -> T,
    ) -> Result<T, StateStoreError> {
        let _guard =
            crate::mutex::acquire(&self.locks_path, "state", self.mutex_timeout).await?;

        let mut doc = self.read().await?;
        doc.version += 1;
        let result = f(&mut doc);
        validate_invariants(&doc)?;
        self.write_atomic(&doc).await?;
        Ok(result)
    }

    async fn write_atomic(&self, doc: &FeatureStateDoc) -> Result<(), StateStoreError> {
        if let Some(parent) = self.state_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = self.tmp_path();
        let bytes = serde_json::to_vec_pretty(doc)?;
        tokio::fs::write(&tmp_path, &bytes).await?;
        tokio::fs::rename(&tmp_path, &self.state_path).await?;
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let parent = self.state_path.parent().unwrap_or_else(|| Path::new("."));
        parent.join(format!(".state-{}.tmp", Uuid::new_v4()))
    }
}

/// Shared handle type used throughout the orchestrator.
pub type SharedStateStore = Arc<StateStore>;
