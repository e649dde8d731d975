//! Worker loop (C8): claim, drive a builder to completion or a decision
//! point, report CI outcome, repeat.

use crate::budget::Budget;
use crate::catalog::Catalog;
use crate::claim::ClaimManager;
use crate::decision::{DecisionQueue, DecisionRequest};
use crate::notifier::{Notification, Notifier};
use crate::state::{CiStatus, FeatureState, FeatureStatus};
use crate::vcs::Vcs;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum BuilderError {
    #[error("builder invocation failed: {0}")]
    InvocationFailed(String),
}

/// One round of work a [`Builder`] reports back after being invoked on a
/// feature. A single call may either finish the feature, ask a question,
/// or simply make progress and expect to be invoked again.
#[derive(Clone, Debug)]
pub struct BuilderOutput {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub ci_status: Option<CiStatus>,
    pub decision_prompt: Option<String>,
    /// The closed set of acceptable answers, required whenever
    /// `decision_prompt` is set.
    pub decision_options: Vec<String>,
    pub decision_context: String,
    /// Answer applied automatically if nobody responds within the
    /// worker's `default_decision_timeout`.
    pub decision_default: Option<String>,
    /// The builder's raw captured text for this invocation. The Worker
    /// scans this for the three terminal markers (see [`parse_markers`])
    /// rather than trusting a pre-parsed flag — the marker contract is the
    /// part of the builder's output spec.md §1 keeps in scope.
    pub raw_output: String,
}

/// A terminal marker found in a builder's captured output, wrapped as
/// `<promise>...</promise>` per spec.md §6.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuilderMarker {
    /// `FEATURE_COMPLETE:<id>`
    FeatureComplete(String),
    /// `BLOCKED:<id>:<reason>`
    Blocked(String, String),
    /// `STUCK:<id>`
    Stuck(String),
}

/// Scan `output` for the builder's textual completion markers and return
/// the first one found by position, or `None` if the builder made progress
/// this round without signaling a terminal state. If more than one marker
/// appears, the first by position wins.
pub fn parse_markers(output: &str) -> Option<BuilderMarker> {
    const COMPLETE: &str = "<promise>FEATURE_COMPLETE:";
    const BLOCKED: &str = "<promise>BLOCKED:";
    const STUCK: &str = "<promise>STUCK:";
    const CLOSE: &str = "</promise>";

    let mut found: Option<(usize, BuilderMarker)> = None;
    let mut consider = |start: usize, marker: BuilderMarker| {
        if found.as_ref().map_or(true, |(i, _)| start < *i) {
            found = Some((start, marker));
        }
    };

    if let Some(start) = output.find(COMPLETE) {
        let body = &output[start + COMPLETE.len()..];
        if let Some(end) = body.find(CLOSE) {
            consider(start, BuilderMarker::FeatureComplete(body[..end].to_string()));
        }
    }
    if let Some(start) = output.find(BLOCKED) {
        let body = &output[start + BLOCKED.len()..];
        if let Some(end) = body.find(CLOSE) {
            if let Some((id, reason)) = body[..end].split_once(':') {
                consider(start, BuilderMarker::Blocked(id.to_string(), reason.to_string()));
            }
        }
    }
    if let Some(start) = output.find(STUCK) {
        let body = &output[start + STUCK.len()..];
        if let Some(end) = body.find(CLOSE) {
            consider(start, BuilderMarker::Stuck(body[..end].to_string()));
        }
    }

    found.map(|(_, marker)| marker)
}

/// External collaborator that actually performs feature work (an LLM
/// agent, in production). The orchestrator core never inspects `hints` or
/// prior builder output itself; it only feeds `decision_answer` back in
/// on the call following a resolved decision.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn invoke(
        &self,
        feature: &FeatureState,
        decision_answer: Option<&str>,
    ) -> Result<BuilderOutput, BuilderError>;
}

pub struct WorkerConfig {
    pub worker_id: String,
    pub default_branch: String,
    pub feature_branch_prefix: String,
    pub default_decision_timeout: Duration,
    pub claim_poll_interval: Duration,
    pub heartbeats_path: std::path::PathBuf,
    /// Delay before this worker's very first claim attempt, so a freshly
    /// spawned pool doesn't all hit `claim_next` in the same instant. Zero
    /// for a worker driven directly in a test.
    pub startup_stagger: Duration,
}

/// A single worker loop instance. Multiple `Worker`s share the same
/// [`ClaimManager`], [`Budget`], and external collaborators, and differ
/// only in `worker_id`.
pub struct Worker {
    config: WorkerConfig,
    claims: Arc<ClaimManager>,
    catalog: Arc<Catalog>,
    budget: Arc<Budget>,
    builder: Arc<dyn Builder>,
    decisions: Arc<DecisionQueue>,
    vcs: Arc<dyn Vcs>,
    notifier: Arc<dyn Notifier>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        claims: Arc<ClaimManager>,
        catalog: Arc<Catalog>,
        budget: Arc<Budget>,
        builder: Arc<dyn Builder>,
        decisions: Arc<DecisionQueue>,
        vcs: Arc<dyn Vcs>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            claims,
            catalog,
            budget,
            builder,
            decisions,
            vcs,
            notifier,
        }
    }

    /// Run until `shutdown` fires, claiming and draining one feature at a
    /// time. Returns once no eligible feature remains and shutdown has
    /// been requested, or immediately on an unrecoverable error.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) -> crate::Result<()> {
        if !self.config.startup_stagger.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.config.startup_stagger) => {}
                _ = shutdown.changed() => {}
            }
        }

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            let claimed = self.claims.claim_next(&self.config.worker_id).await?;
            let Some(feature) = claimed else {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.claim_poll_interval) => continue,
                    _ = shutdown.changed() => continue,
                }
            };

            self.notifier
                .notify(Notification::FeatureClaimed {
                    feature_id: feature.id.clone(),
                    worker_id: self.config.worker_id.clone(),
                })
                .await;

            if let Err(err) = self.drive_feature(feature.id.clone()).await {
                tracing::error!(feature_id = %feature.id, error = %err, "worker failed driving feature");
                self.claims.block(&feature.id, err.to_string()).await.ok();
            }
        }
    }

    /// Drive a single claimed feature to completion, blocking, or a
    /// parked decision.
    #[tracing::instrument(skip(self), fields(feature_id = %feature_id))]
    async fn drive_feature(&self, feature_id: String) -> crate::Result<()> {
        let spec = self
            .catalog
            .get(&feature_id)
            .ok_or_else(|| crate::OrchestratorError::Unrecoverable(format!("unknown feature {feature_id}")))?
            .clone();

        let branch = format!("{}/{}", self.config.feature_branch_prefix, feature_id);
        self.vcs
            .ensure_branch(&branch, &self.config.default_branch)
            .await
            .map_err(|e| crate::OrchestratorError::Unrecoverable(e.to_string()))?;
        self.claims.set_branch(&feature_id, branch.clone()).await?;

        let mut decision_answer: Option<String> = None;

        loop {
            self.claims
                .heartbeat(&feature_id, &self.config.worker_id)
                .await?;
            if let Err(err) =
                crate::heartbeat::touch(&self.config.heartbeats_path, &self.config.worker_id).await
            {
                tracing::warn!(worker_id = %self.config.worker_id, error = %err, "failed to write heartbeat beacon");
            }

            let current = self.claims.current(&feature_id).await?;
            if current.status == FeatureStatus::Blocked {
                self.notifier
                    .notify(Notification::FeatureBlocked {
                        feature_id: feature_id.clone(),
                        reason: current
                            .blocked_reason
                            .clone()
                            .unwrap_or_else(|| "iteration cap exceeded".to_string()),
                    })
                    .await;
                return Ok(());
            }

            // Recheck the budget before every expensive external call, not
            // after: an over-cap result suspends this feature (sleep and
            // retry) rather than failing it, per spec.md §3/§4.3/§7.
            if let Err(err) = self.budget.check(0, 0).await {
                tracing::warn!(
                    feature_id = %feature_id,
                    worker_id = %self.config.worker_id,
                    error = %err,
                    cooldown = ?self.budget.cooldown,
                    "budget exceeded, suspending before invoking builder",
                );
                tokio::time::sleep(self.budget.cooldown).await;
                continue;
            }

            let output = match self
                .builder
                .invoke(&current, decision_answer.as_deref())
                .await
            {
                Ok(output) => output,
                Err(err) => {
                    // A crashed/failed invocation is a non-terminal
                    // iteration (spec.md §7), not an unrecoverable error.
                    tracing::warn!(feature_id = %feature_id, error = %err, "builder invocation failed, retrying");
                    if self.record_non_terminal_iteration(&feature_id).await? {
                        return Ok(());
                    }
                    continue;
                }
            };

            self.budget
                .record(
                    &self.config.worker_id,
                    &feature_id,
                    output.input_tokens,
                    output.output_tokens,
                )
                .await
                .map_err(|e| crate::OrchestratorError::Unrecoverable(e.to_string()))?;

            if let Some(prompt) = output.decision_prompt {
                let decision = self
                    .decisions
                    .request(DecisionRequest {
                        feature_id: feature_id.clone(),
                        worker_id: self.config.worker_id.clone(),
                        question: prompt.clone(),
                        options: output.decision_options,
                        context: output.decision_context,
                        default_answer: output.decision_default,
                        timeout: self.config.default_decision_timeout,
                    })
                    .await
                    .map_err(|e| crate::OrchestratorError::Unrecoverable(e.to_string()))?;
                self.claims.await_decision(&feature_id, &decision.id).await?;
                self.notifier
                    .notify(Notification::DecisionRequested {
                        feature_id: feature_id.clone(),
                        decision_id: decision.id.clone(),
                        prompt,
                    })
                    .await;

                let answer = self
                    .decisions
                    .await_answer(&decision.id)
                    .await
                    .map_err(|e| crate::OrchestratorError::Unrecoverable(e.to_string()))?;
                self.claims.resume_from_decision(&feature_id).await?;
                decision_answer = Some(answer);
                continue;
            }
            decision_answer = None;

            if let Some(status) = output.ci_status {
                let state = self.claims.record_ci_result(&feature_id, status).await?;
                if state.status == FeatureStatus::Blocked {
                    self.notifier
                        .notify(Notification::FeatureBlocked {
                            feature_id: feature_id.clone(),
                            reason: state
                                .blocked_reason
                                .clone()
                                .unwrap_or_else(|| "CI attempt cap exceeded".to_string()),
                        })
                        .await;
                    return Ok(());
                }
                if status == CiStatus::Failed {
                    if self.record_non_terminal_iteration(&feature_id).await? {
                        return Ok(());
                    }
                    continue;
                }
            }

            match parse_markers(&output.raw_output) {
                Some(BuilderMarker::FeatureComplete(_)) => {
                    let pr_url = self
                        .vcs
                        .pr_url_for_current_branch()
                        .await
                        .map_err(|e| crate::OrchestratorError::Unrecoverable(e.to_string()))?;
                    self.claims
                        .complete(&feature_id, &self.config.worker_id, pr_url)
                        .await?;
                    self.notifier
                        .notify(Notification::FeatureCompleted { feature_id })
                        .await;
                    return Ok(());
                }
                Some(BuilderMarker::Blocked(_, reason)) => {
                    self.claims.block(&feature_id, reason.clone()).await?;
                    self.notifier
                        .notify(Notification::FeatureBlocked { feature_id, reason })
                        .await;
                    return Ok(());
                }
                Some(BuilderMarker::Stuck(_)) => {
                    let reason = format!("stuck after {} iterations", current.iteration_count + 1);
                    self.claims.block(&feature_id, reason.clone()).await?;
                    self.notifier
                        .notify(Notification::FeatureBlocked { feature_id, reason })
                        .await;
                    return Ok(());
                }
                None => {
                    if self.record_non_terminal_iteration(&feature_id).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Record one non-terminal round (no marker, CI failure, or invocation
    /// crash). Returns `true` if this pushed the feature over
    /// `max_iterations_per_feature`, blocking it and notifying; the caller
    /// should return rather than continue the loop in that case.
    async fn record_non_terminal_iteration(&self, feature_id: &str) -> crate::Result<bool> {
        let state = self.claims.record_iteration(feature_id).await?;
        if state.status == FeatureStatus::Blocked {
            self.notifier
                .notify(Notification::FeatureBlocked {
                    feature_id: feature_id.to_string(),
                    reason: state
                        .blocked_reason
                        .clone()
                        .unwrap_or_else(|| "max iterations reached".to_string()),
                })
                .await;
            return Ok(true);
        }
        Ok(false)
    }
}
