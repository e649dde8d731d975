//! Version-control boundary — branch and merge operations are delegated to
//! an external git/PR-host integration; only the trait lives here.

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("branch operation failed: {0}")]
    BranchFailed(String),

    #[error("merge operation failed: {0}")]
    MergeFailed(String),
}

/// External collaborator responsible for branch lifecycle and merges.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Checked once during `Orchestrator::bootstrap`, before any worker is
    /// spawned: confirms the repository is reachable and the caller is
    /// authenticated against whatever host `merge`/`pr_url_for_current_branch`
    /// will eventually talk to. Default implementation just calls
    /// `current_branch`, which is enough to catch "no repo here" or
    /// "can't shell out to git at all"; a real git/PR-host integration
    /// should override this to also check auth.
    async fn preflight(&self) -> Result<(), VcsError> {
        self.current_branch().await.map(|_| ())
    }

    /// Create `branch` off `base` if it doesn't already exist.
    async fn ensure_branch(&self, branch: &str, base: &str) -> Result<(), VcsError>;

    /// The branch currently checked out in the worker's working copy.
    async fn current_branch(&self) -> Result<String, VcsError>;

    /// A hosted PR url for the current branch, if one has been opened.
    /// `None` means the builder completed the feature without opening a PR
    /// (e.g. a direct-push workflow), in which case the merge plan records
    /// a manual-merge stanza for it instead.
    async fn pr_url_for_current_branch(&self) -> Result<Option<String>, VcsError>;

    /// Merge `branch` into `base` in the order the caller requests; VCS
    /// implementations are expected to fast-forward or rebase as their
    /// local conventions dictate. Invoked by the merge phase after the
    /// implementation phase drains, in the order [`crate::merge_planner::MergePlanner`]
    /// computes — never by a worker on its own completion.
    async fn merge(&self, branch: &str, base: &str) -> Result<(), VcsError>;
}

/// No-op VCS used in tests and dry runs: branches and merges succeed
/// without touching a real repository.
pub struct NullVcs;

#[async_trait]
impl Vcs for NullVcs {
    async fn ensure_branch(&self, _branch: &str, _base: &str) -> Result<(), VcsError> {
        Ok(())
    }

    async fn current_branch(&self) -> Result<String, VcsError> {
        Ok("main".to_string())
    }

    async fn pr_url_for_current_branch(&self) -> Result<Option<String>, VcsError> {
        Ok(None)
    }

    async fn merge(&self, _branch: &str, _base: &str) -> Result<(), VcsError> {
        Ok(())
    }
}
