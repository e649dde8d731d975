//! Async human-in-the-loop decision protocol (C6).
//!
//! A worker that needs input it can't resolve itself raises a decision
//! request, parks its feature via
//! [`crate::claim::ClaimManager::await_decision`], and polls
//! [`DecisionQueue::await_answer`] until a human (or scripted test double)
//! answers through a [`DecisionChannel`]. The filesystem implementation
//! writes one JSON file per decision under `decisions_path`, keyed by a
//! UUID; answerers (a chat-platform bridge, an issue-comment poller, an
//! operator) are separate processes that call
//! [`DecisionChannel::answer`] against the same file, so the rendezvous is
//! the file itself — the same atomic-write-then-rename discipline
//! [`crate::state_store`] uses for the shared state document.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum DecisionError {
    #[error(transparent)]
    Mutex(#[from] crate::mutex::MutexError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decision record is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("timed out after {0:?} waiting for decision {1}")]
    Timeout(Duration, String),

    #[error("decision {0} has no such record")]
    UnknownDecision(String),

    #[error("answer {answer:?} is not among the recorded options {options:?} for decision {decision_id}")]
    InvalidOption {
        decision_id: String,
        answer: String,
        options: Vec<String>,
    },

    #[error("decision {0} is not Pending and cannot be answered or cancelled again")]
    NotPending(String),
}

/// Resolution status of a single decision request, per spec §3.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    Pending,
    Answered,
    TimedOut,
    Cancelled,
}

/// The inputs needed to raise a decision, bundled so [`DecisionChannel::create`]
/// doesn't grow an ever-longer positional argument list.
#[derive(Clone, Debug)]
pub struct DecisionRequest {
    pub feature_id: String,
    pub worker_id: String,
    pub question: String,
    pub options: Vec<String>,
    pub context: String,
    pub default_answer: Option<String>,
    pub timeout: Duration,
}

/// A single outstanding (or resolved) question raised by a worker.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub requesting_feature: String,
    pub requesting_worker: String,
    pub question: String,
    pub options: Vec<String>,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub default_answer: Option<String>,
    pub timeout_seconds: u64,
    pub status: DecisionStatus,
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub answered_by: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub answered_at: Option<DateTime<Utc>>,
}

/// External collaborator that persists decision requests and records their
/// resolution. Chat-platform ingress, issue-comment pollers, or a local
/// operator are all expected to call [`DecisionChannel::answer`] against the
/// same storage this crate reads.
#[async_trait]
pub trait DecisionChannel: Send + Sync {
    async fn create(&self, request: DecisionRequest) -> Result<Decision, DecisionError>;
    async fn poll(&self, decision_id: &str) -> Result<Decision, DecisionError>;

    /// Post an answer. Validates `answer` is one of the recorded `options`
    /// and that the decision is still Pending. Idempotent only for a repeat
    /// of the exact `(decision_id, answer, answerer)` triple already
    /// recorded; any other answer against an already-Answered record is
    /// rejected.
    async fn answer(
        &self,
        decision_id: &str,
        answer: &str,
        answerer: &str,
    ) -> Result<Decision, DecisionError>;

    async fn cancel(&self, decision_id: &str, reason: &str) -> Result<Decision, DecisionError>;

    /// Transition a Pending decision to TimedOut, applying `default_answer`
    /// as `answer` if present. Called by [`DecisionQueue::await_answer`]
    /// once its deadline elapses; a no-op (returns the record unchanged) if
    /// the decision already resolved in the meantime.
    async fn mark_timed_out(&self, decision_id: &str) -> Result<Decision, DecisionError>;

    /// Every currently-Pending decision, for display to a human.
    async fn pending(&self) -> Result<Vec<Decision>, DecisionError>;

    /// Remove every decision record older than `max_age`, regardless of
    /// status.
    async fn cleanup(&self, max_age: Duration) -> Result<usize, DecisionError>;
}

/// One JSON file per decision under a directory, named `<id>.json`.
/// Mutations go through a `"decision-<id>"` named mutex and an
/// atomic-rename write, the same discipline [`crate::state_store`] uses.
pub struct FilesystemDecisionChannel {
    decisions_path: PathBuf,
    locks_path: PathBuf,
    mutex_timeout: Duration,
}

impl FilesystemDecisionChannel {
    pub fn new(decisions_path: impl Into<PathBuf>) -> Self {
        let decisions_path = decisions_path.into();
        let locks_path = decisions_path.join(".locks");
        Self {
            decisions_path,
            locks_path,
            mutex_timeout: Duration::from_secs(10),
        }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.decisions_path.join(format!("{id}.json"))
    }

    async fn read(&self, id: &str) -> Result<Decision, DecisionError> {
        let bytes = tokio::fs::read(self.path_for(id))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    DecisionError::UnknownDecision(id.to_string())
                }
                _ => DecisionError::Io(e),
            })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn write(&self, decision: &Decision) -> Result<(), DecisionError> {
        let tmp = self
            .decisions_path
            .join(format!(".{}-{}.tmp", decision.id, Uuid::new_v4()));
        let bytes = serde_json::to_vec_pretty(decision)?;
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, self.path_for(&decision.id)).await?;
        Ok(())
    }

    /// Run `f` against the freshly-read record under a per-decision mutex,
    /// then persist whatever `f` returns.
    async fn mutate(
        &self,
        id: &str,
        f: impl FnOnce(Decision) -> Result<Decision, DecisionError>,
    ) -> Result<Decision, DecisionError> {
        let _guard = crate::mutex::acquire(
            &self.locks_path,
            &format!("decision-{id}"),
            self.mutex_timeout,
        )
        .await?;

        let current = self.read(id).await?;
        let updated = f(current)?;
        self.write(&updated).await?;
        Ok(updated)
    }
}

#[async_trait]
impl DecisionChannel for FilesystemDecisionChannel {
    async fn create(&self, request: DecisionRequest) -> Result<Decision, DecisionError> {
        tokio::fs::create_dir_all(&self.decisions_path).await?;
        let decision = Decision {
            id: Uuid::new_v4().to_string(),
            requesting_feature: request.feature_id,
            requesting_worker: request.worker_id,
            question: request.question,
            options: request.options,
            context: request.context,
            default_answer: request.default_answer,
            timeout_seconds: request.timeout.as_secs(),
            status: DecisionStatus::Pending,
            answer: None,
            answered_by: None,
            created_at: Utc::now(),
            answered_at: None,
        };
        self.write(&decision).await?;
        Ok(decision)
    }

    async fn poll(&self, decision_id: &str) -> Result<Decision, DecisionError> {
        self.read(decision_id).await
    }

    async fn answer(
        &self,
        decision_id: &str,
        answer: &str,
        answerer: &str,
    ) -> Result<Decision, DecisionError> {
        let decision_id = decision_id.to_string();
        let answer = answer.to_string();
        let answerer = answerer.to_string();
        self.mutate(&decision_id, move |mut decision| {
            if decision.status != DecisionStatus::Pending {
                let repeat_of_same_answer = decision.status == DecisionStatus::Answered
                    && decision.answer.as_deref() == Some(answer.as_str())
                    && decision.answered_by.as_deref() == Some(answerer.as_str());
                if repeat_of_same_answer {
                    return Ok(decision);
                }
                return Err(DecisionError::NotPending(decision.id));
            }
            if !decision.options.iter().any(|o| o == &answer) {
                return Err(DecisionError::InvalidOption {
                    decision_id: decision.id,
                    answer,
                    options: decision.options,
                });
            }
            decision.status = DecisionStatus::Answered;
            decision.answer = Some(answer);
            decision.answered_by = Some(answerer);
            decision.answered_at = Some(Utc::now());
            Ok(decision)
        })
        .await
    }

    async fn cancel(&self, decision_id: &str, reason: &str) -> Result<Decision, DecisionError> {
        let decision_id = decision_id.to_string();
        let reason = reason.to_string();
        self.mutate(&decision_id, move |mut decision| {
            if decision.status != DecisionStatus::Pending {
                return Err(DecisionError::NotPending(decision.id));
            }
            decision.status = DecisionStatus::Cancelled;
            decision.context = format!("{}\ncancelled: {reason}", decision.context);
            Ok(decision)
        })
        .await
    }

    async fn mark_timed_out(&self, decision_id: &str) -> Result<Decision, DecisionError> {
        let decision_id = decision_id.to_string();
        self.mutate(&decision_id, move |mut decision| {
            if decision.status != DecisionStatus::Pending {
                return Ok(decision);
            }
            decision.status = DecisionStatus::TimedOut;
            decision.answer = decision.default_answer.clone();
            decision.answered_at = Some(Utc::now());
            Ok(decision)
        })
        .await
    }

    async fn pending(&self) -> Result<Vec<Decision>, DecisionError> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.decisions_path).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            let Ok(decision) = serde_json::from_slice::<Decision>(&bytes) else {
                continue;
            };
            if decision.status == DecisionStatus::Pending {
                out.push(decision);
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }

    async fn cleanup(&self, max_age: Duration) -> Result<usize, DecisionError> {
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&self.decisions_path).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            let Ok(decision) = serde_json::from_slice::<Decision>(&bytes) else {
                continue;
            };
            if decision.created_at < cutoff {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Polls a [`DecisionChannel`] until it resolves or its own `timeout`
/// elapses, sleeping `poll_interval` between checks.
pub struct DecisionQueue {
    channel: std::sync::Arc<dyn DecisionChannel>,
    poll_interval: Duration,
}

impl DecisionQueue {
    pub fn new(channel: std::sync::Arc<dyn DecisionChannel>, poll_interval: Duration) -> Self {
        Self {
            channel,
            poll_interval,
        }
    }

    pub async fn request(&self, request: DecisionRequest) -> Result<Decision, DecisionError> {
        self.channel.create(request).await
    }

    /// Block until the decision resolves or its `timeout_seconds` elapses.
    /// On elapse, applies `default_answer` if the decision carried one
    /// (transitioning it to TimedOut) and returns that default; otherwise
    /// returns `Err(DecisionError::Timeout)`.
    #[tracing::instrument(skip(self))]
    pub async fn await_answer(&self, decision_id: &str) -> Result<String, DecisionError> {
        let initial = self.channel.poll(decision_id).await?;
        let timeout = Duration::from_secs(initial.timeout_seconds);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let decision = self.channel.poll(decision_id).await?;
            match decision.status {
                DecisionStatus::Answered => {
                    return Ok(decision
                        .answer
                        .expect("Answered decision always carries an answer"));
                }
                DecisionStatus::Cancelled => {
                    return Err(DecisionError::NotPending(decision_id.to_string()));
                }
                DecisionStatus::TimedOut => {
                    return decision
                        .answer
                        .ok_or_else(|| DecisionError::Timeout(timeout, decision_id.to_string()));
                }
                DecisionStatus::Pending => {}
            }

            if tokio::time::Instant::now() >= deadline {
                let resolved = self.channel.mark_timed_out(decision_id).await?;
                return resolved
                    .answer
                    .ok_or_else(|| DecisionError::Timeout(timeout, decision_id.to_string()));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    pub async fn cancel(&self, decision_id: &str, reason: &str) -> Result<Decision, DecisionError> {
        self.channel.cancel(decision_id, reason).await
    }

    pub async fn pending(&self) -> Result<Vec<Decision>, DecisionError> {
        self.channel.pending().await
    }

    pub async fn cleanup(&self, max_age: Duration) -> Result<usize, DecisionError> {
        self.channel.cleanup(max_age).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(options: &[&str]) -> DecisionRequest {
        DecisionRequest {
            feature_id: "feature-a".to_string(),
            worker_id: "w1".to_string(),
            question: "pick one".to_string(),
            options: options.iter().map(|s| s.to_string()).collect(),
            context: "".to_string(),
            default_answer: None,
            timeout: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_create_then_poll_pending() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FilesystemDecisionChannel::new(dir.path());
        let decision = channel.create(request(&["JWT", "Sessions"])).await.unwrap();
        let polled = channel.poll(&decision.id).await.unwrap();
        assert_eq!(polled.status, DecisionStatus::Pending);
    }

    #[tokio::test]
    async fn test_answer_rejects_option_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FilesystemDecisionChannel::new(dir.path());
        let decision = channel.create(request(&["JWT", "Sessions"])).await.unwrap();
        let result = channel.answer(&decision.id, "OAuth", "alice").await;
        assert!(matches!(result, Err(DecisionError::InvalidOption { .. })));
    }

    #[tokio::test]
    async fn test_second_distinct_answer_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FilesystemDecisionChannel::new(dir.path());
        let decision = channel.create(request(&["JWT", "Sessions"])).await.unwrap();
        channel.answer(&decision.id, "JWT", "alice").await.unwrap();

        let result = channel.answer(&decision.id, "Sessions", "bob").await;
        assert!(matches!(result, Err(DecisionError::NotPending(_))));
    }

    #[tokio::test]
    async fn test_repeating_identical_answer_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FilesystemDecisionChannel::new(dir.path());
        let decision = channel.create(request(&["JWT", "Sessions"])).await.unwrap();
        channel.answer(&decision.id, "JWT", "alice").await.unwrap();

        let repeat = channel.answer(&decision.id, "JWT", "alice").await.unwrap();
        assert_eq!(repeat.status, DecisionStatus::Answered);
    }

    #[tokio::test]
    async fn test_await_answer_returns_posted_answer() {
        let dir = tempfile::tempdir().unwrap();
        let channel = std::sync::Arc::new(FilesystemDecisionChannel::new(dir.path()));
        let decision = channel.create(request(&["JWT", "Sessions"])).await.unwrap();
        channel.answer(&decision.id, "JWT", "alice").await.unwrap();

        let queue = DecisionQueue::new(channel, Duration::from_millis(10));
        let answer = queue.await_answer(&decision.id).await.unwrap();
        assert_eq!(answer, "JWT");
    }

    #[tokio::test]
    async fn test_await_answer_applies_default_on_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let channel = std::sync::Arc::new(FilesystemDecisionChannel::new(dir.path()));
        let mut req = request(&["JWT", "Sessions"]);
        req.default_answer = Some("JWT".to_string());
        req.timeout = Duration::from_millis(30);
        let decision = channel.create(req).await.unwrap();

        let queue = DecisionQueue::new(channel.clone(), Duration::from_millis(5));
        let answer = queue.await_answer(&decision.id).await.unwrap();
        assert_eq!(answer, "JWT");
        let resolved = channel.poll(&decision.id).await.unwrap();
        assert_eq!(resolved.status, DecisionStatus::TimedOut);
    }

    #[tokio::test]
    async fn test_await_answer_without_default_reports_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let channel = std::sync::Arc::new(FilesystemDecisionChannel::new(dir.path()));
        let mut req = request(&["JWT", "Sessions"]);
        req.timeout = Duration::from_millis(30);
        let decision = channel.create(req).await.unwrap();

        let queue = DecisionQueue::new(channel, Duration::from_millis(5));
        let result = queue.await_answer(&decision.id).await;
        assert!(matches!(result, Err(DecisionError::Timeout(_, _))));
    }

    #[tokio::test]
    async fn test_pending_lists_only_unresolved_decisions() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FilesystemDecisionChannel::new(dir.path());
        let d1 = channel.create(request(&["a", "b"])).await.unwrap();
        let d2 = channel.create(request(&["a", "b"])).await.unwrap();
        channel.answer(&d1.id, "a", "alice").await.unwrap();

        let pending = channel.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, d2.id);
    }

    #[tokio::test]
    async fn test_cleanup_removes_regardless_of_status() {
        let dir = tempfile::tempdir().unwrap();
        let channel = FilesystemDecisionChannel::new(dir.path());
        let decision = channel.create(request(&["a", "b"])).await.unwrap();
        channel.answer(&decision.id, "a", "alice").await.unwrap();

        let removed = channel.cleanup(Duration::from_secs(0)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(matches!(
            channel.poll(&decision.id).await,
            Err(DecisionError::UnknownDecision(_))
        ));
    }
}
