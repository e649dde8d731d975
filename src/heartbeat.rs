//! Heartbeat-based stale-claim detection (C5).
//!
//! Each worker periodically writes a small file under `heartbeats_path`,
//! named after its worker id, carrying the current timestamp — the
//! "liveness beacon" from spec.md's glossary, a signal distinct from (and
//! checked independently of) the `claimed_at` timestamp on the feature it
//! holds. The reaper here periodically scans the state document for
//! `InProgress` features and reclaims a claim only when **both** the claim
//! itself is old and its owning worker's beacon has gone quiet — the
//! double condition from spec.md §4.5. Age of claim alone would reap a
//! worker that's simply been busy inside the builder for a long time;
//! beacon staleness alone would reap a worker that only just claimed and
//! hasn't had a chance to write a beacon yet.

use crate::budget::Budget;
use crate::claim::ClaimManager;
use crate::notifier::{Notification, Notifier};
use crate::state::{CiStatus, FeatureStatus};
use crate::state_store::StateStore;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Write (or refresh) `worker_id`'s liveness beacon under `heartbeats_path`.
/// Atomic write-then-rename, same discipline as every other persisted
/// document in this crate, so a reader never observes a half-written
/// timestamp.
#[tracing::instrument(skip(heartbeats_path))]
pub async fn touch(heartbeats_path: &Path, worker_id: &str) -> std::io::Result<()> {
    tokio::fs::create_dir_all(heartbeats_path).await?;
    let tmp_path = heartbeats_path.join(format!(".{worker_id}.tmp"));
    let path = heartbeats_path.join(worker_id);
    tokio::fs::write(&tmp_path, Utc::now().to_rfc3339().as_bytes()).await?;
    tokio::fs::rename(&tmp_path, &path).await?;
    Ok(())
}

/// Read back `worker_id`'s last recorded beacon timestamp, if any.
pub async fn last_beacon(heartbeats_path: &Path, worker_id: &str) -> Option<DateTime<Utc>> {
    let text = tokio::fs::read_to_string(heartbeats_path.join(worker_id))
        .await
        .ok()?;
    DateTime::parse_from_rfc3339(text.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// A worker is "alive" when its beacon exists and was written within
/// `freshness` of now. A worker that has never beaconed is not alive.
pub async fn is_alive(heartbeats_path: &Path, worker_id: &str, freshness: Duration) -> bool {
    let Some(beacon) = last_beacon(heartbeats_path, worker_id).await else {
        return false;
    };
    let freshness = chrono::Duration::from_std(freshness).unwrap_or(chrono::Duration::zero());
    Utc::now() - beacon <= freshness
}

pub struct HeartbeatReaper {
    store: Arc<StateStore>,
    claims: Arc<ClaimManager>,
    budget: Arc<Budget>,
    notifier: Arc<dyn Notifier>,
    heartbeats_path: std::path::PathBuf,
    stale_claim_threshold: Duration,
    poll_interval: Duration,
    max_ci_attempts: u32,
}

impl HeartbeatReaper {
    pub fn new(
        store: Arc<StateStore>,
        claims: Arc<ClaimManager>,
        budget: Arc<Budget>,
        notifier: Arc<dyn Notifier>,
        heartbeats_path: impl Into<std::path::PathBuf>,
        stale_claim_threshold: Duration,
        poll_interval: Duration,
        max_ci_attempts: u32,
    ) -> Self {
        Self {
            store,
            claims,
            budget,
            notifier,
            heartbeats_path: heartbeats_path.into(),
            stale_claim_threshold,
            poll_interval,
            max_ci_attempts,
        }
    }

    /// Scan once and reclaim every stale claim found. Returns the ids
    /// reclaimed, for callers (and tests) that want to observe reaper
    /// activity without running the background loop. Also blocks any
    /// feature that has exhausted its CI attempt cap, mirroring step 4 of
    /// the reaper sweep even though [`ClaimManager::record_ci_result`]
    /// already blocks on the attempt that crosses the cap — this catches a
    /// record left failed by a worker that crashed before reporting back.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<Vec<String>, crate::claim::ClaimError> {
        let doc = self.store.read().await?;
        let now = Utc::now();
        let threshold =
            chrono::Duration::from_std(self.stale_claim_threshold).unwrap_or(chrono::Duration::zero());

        let mut candidates = Vec::new();
        for record in doc.features.values() {
            if record.status != FeatureStatus::InProgress {
                continue;
            }
            let (Some(claimed_at), Some(claimed_by)) = (record.claimed_at, record.claimed_by.clone())
            else {
                continue;
            };
            if now - claimed_at <= threshold {
                continue;
            }
            candidates.push((record.id.clone(), claimed_by));
        }

        let mut stale = Vec::new();
        for (feature_id, claimed_by) in candidates {
            if !is_alive(&self.heartbeats_path, &claimed_by, self.stale_claim_threshold).await {
                stale.push((feature_id, Some(claimed_by)));
            }
        }

        let mut reclaimed = Vec::new();
        for (feature_id, previous_worker) in stale {
            self.claims.reclaim(&feature_id).await?;
            tracing::warn!(feature_id = %feature_id, "reclaimed stale claim");
            self.notifier
                .notify(Notification::StaleClaimReclaimed {
                    feature_id: feature_id.clone(),
                    previous_worker: previous_worker.unwrap_or_else(|| "unknown".to_string()),
                })
                .await;
            reclaimed.push(feature_id);
        }

        let exhausted: Vec<String> = doc
            .features
            .values()
            .filter(|record| {
                record.status != FeatureStatus::Blocked
                    && record.ci_status == CiStatus::Failed
                    && record.ci_attempts >= self.max_ci_attempts
            })
            .map(|record| record.id.clone())
            .collect();

        for feature_id in exhausted {
            let reason = format!("CI failed {} times", self.max_ci_attempts);
            self.claims.block(&feature_id, reason.clone()).await?;
            tracing::warn!(feature_id = %feature_id, "blocked after exhausting CI attempt cap");
            self.notifier
                .notify(Notification::FeatureBlocked {
                    feature_id: feature_id.clone(),
                    reason,
                })
                .await;
        }

        Ok(reclaimed)
    }

    /// Run the sweep on a fixed interval until `shutdown` resolves. Before
    /// each sweep, consults [`Budget`]; if today's spend is already over
    /// cap the reaper sleeps a 5-minute cooldown instead of sweeping, since
    /// there's no point reclaiming claims for workers that can't spend
    /// anything once they resume.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        const COOLDOWN: Duration = Duration::from_secs(5 * 60);
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.budget.check(0, 0).await {
                        Ok(()) => {
                            if let Err(err) = self.sweep_once().await {
                                tracing::error!(error = %err, "heartbeat sweep failed");
                            }
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, cooldown = ?COOLDOWN, "budget exceeded, cooling down reaper");
                            tokio::select! {
                                _ = tokio::time::sleep(COOLDOWN) => {}
                                _ = shutdown.changed() => {
                                    if *shutdown.borrow() {
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
