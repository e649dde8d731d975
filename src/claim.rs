//! Atomic claim protocol and dependency-aware task selection (C4).

use crate::catalog::Catalog;
use crate::state::{CiStatus, FeatureState, FeatureStatus};
use crate::state_store::StateStore;
use chrono::Utc;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ClaimError {
    #[error(transparent)]
    StateStore(#[from] crate::state_store::StateStoreError),

    #[error("feature {0} not found in catalog")]
    UnknownFeature(String),

    #[error("feature {0} is not claimed by {1}")]
    NotClaimedBy(String, String),

    #[error("feature {0} has no outstanding claim")]
    NotClaimed(String),

    #[error("feature {0} is not currently available to claim")]
    Unavailable(String),
}

/// Coordinates claim/release/complete/block transitions against the
/// shared state document. Every public method goes through exactly one
/// [`StateStore::transact`] call, so each is atomic with respect to every
/// other worker and to the heartbeat reaper.
pub struct ClaimManager {
    store: Arc<StateStore>,
    catalog: Arc<Catalog>,
    max_iterations_per_feature: u32,
    max_ci_attempts: u32,
}

impl ClaimManager {
    pub fn new(
        store: Arc<StateStore>,
        catalog: Arc<Catalog>,
        max_iterations_per_feature: u32,
        max_ci_attempts: u32,
    ) -> Self {
        Self {
            store,
            catalog,
            max_iterations_per_feature,
            max_ci_attempts,
        }
    }

    /// A feature is eligible for claiming when it is Pending and every
    /// entry in `depends_on` is Completed.
    fn is_eligible(&self, id: &str, state: &crate::state::FeatureStateDoc) -> bool {
        let Some(record) = state.get(id) else {
            return false;
        };
        if record.status != FeatureStatus::Pending {
            return false;
        }
        let Some(spec) = self.catalog.get(id) else {
            return false;
        };
        spec.depends_on.iter().all(|dep| {
            state
                .get(dep)
                .map(|d| d.status == FeatureStatus::Completed)
                .unwrap_or(false)
        })
    }

    /// Atomically select and claim the eligible feature with the lowest
    /// `priority` number (lower numbers are higher priority), or return
    /// `None` if nothing is currently eligible. Ties are broken by ascending
    /// id, so selection is deterministic across workers racing the same
    /// document.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<FeatureState>, ClaimError> {
        let catalog = self.catalog.clone();
        let worker_id = worker_id.to_string();

        let result = self
            .store
            .transact(move |doc| {
                let mut candidates: Vec<&str> = catalog
                    .features
                    .iter()
                    .map(|f| f.id.as_str())
                    .filter(|id| {
                        let Some(record) = doc.get(id) else {
                            return false;
                        };
                        if record.status != FeatureStatus::Pending {
                            return false;
                        }
                        let spec = catalog.get(id).expect("catalog lookup of own id");
                        spec.depends_on.iter().all(|dep| {
                            doc.get(dep)
                                .map(|d| d.status == FeatureStatus::Completed)
                                .unwrap_or(false)
                        })
                    })
                    .collect();

                candidates.sort_by_key(|id| {
                    let spec = catalog.get(id).expect("catalog lookup of own id");
                    (spec.priority, id.to_string())
                });

                let chosen = candidates.first().map(|s| s.to_string());
                chosen.map(|id| {
                    let record = doc.get_mut(&id).expect("chosen id exists in state doc");
                    record.status = FeatureStatus::InProgress;
                    record.claimed_by = Some(worker_id.clone());
                    record.claimed_at = Some(Utc::now());
                    record.last_heartbeat = Some(Utc::now());
                    record.clone()
                })
            })
            .await?;

        Ok(result)
    }

    /// Attempt to claim one specific feature by id. Fails with
    /// `ClaimError::Unavailable` rather than silently doing nothing when the
    /// feature isn't Pending or a dependency hasn't Completed yet — callers
    /// happy to take whatever is eligible should use `claim_next` instead.
    pub async fn claim(&self, feature_id: &str, worker_id: &str) -> Result<FeatureState, ClaimError> {
        let feature_id = feature_id.to_string();
        let worker_id = worker_id.to_string();
        let catalog = self.catalog.clone();

        self.store
            .transact(move |doc| -> Result<FeatureState, ClaimError> {
                let spec = catalog
                    .get(&feature_id)
                    .ok_or_else(|| ClaimError::UnknownFeature(feature_id.clone()))?;
                let eligible = doc
                    .get(&feature_id)
                    .map(|record| {
                        record.status == FeatureStatus::Pending
                            && spec.depends_on.iter().all(|dep| {
                                doc.get(dep)
                                    .map(|d| d.status == FeatureStatus::Completed)
                                    .unwrap_or(false)
                            })
                    })
                    .unwrap_or(false);
                if !eligible {
                    return Err(ClaimError::Unavailable(feature_id));
                }

                let record = doc
                    .get_mut(&feature_id)
                    .expect("eligibility check above confirmed the record exists");
                record.status = FeatureStatus::InProgress;
                record.claimed_by = Some(worker_id.clone());
                record.claimed_at = Some(Utc::now());
                record.last_heartbeat = Some(Utc::now());
                Ok(record.clone())
            })
            .await?
    }

    /// Ids currently eligible for claiming: Pending, with every dependency
    /// Completed. Advisory only — a racing `claim`/`claim_next` may claim
    /// any of these ids before the caller acts on the snapshot.
    pub async fn claimable_ids(&self) -> Result<Vec<String>, ClaimError> {
        let doc = self.store.read().await?;
        Ok(self
            .catalog
            .features
            .iter()
            .map(|f| f.id.as_str())
            .filter(|id| self.is_eligible(id, &doc))
            .map(|id| id.to_string())
            .collect())
    }

    /// Current snapshot of a feature's dynamic record, without claiming or
    /// mutating anything.
    pub async fn current(&self, feature_id: &str) -> Result<FeatureState, ClaimError> {
        let doc = self.store.read().await?;
        doc.get(feature_id)
            .cloned()
            .ok_or_else(|| ClaimError::UnknownFeature(feature_id.to_string()))
    }

    /// Refresh the heartbeat timestamp for a worker's active claim.
    pub async fn heartbeat(&self, feature_id: &str, worker_id: &str) -> Result<(), ClaimError> {
        let feature_id = feature_id.to_string();
        let worker_id = worker_id.to_string();
        self.store
            .transact(move |doc| -> Result<(), ClaimError> {
                let record = doc
                    .get_mut(&feature_id)
                    .ok_or_else(|| ClaimError::UnknownFeature(feature_id.clone()))?;
                if record.claimed_by.as_deref() != Some(worker_id.as_str()) {
                    return Err(ClaimError::NotClaimedBy(feature_id.clone(), worker_id.clone()));
                }
                record.last_heartbeat = Some(Utc::now());
                Ok(())
            })
            .await?
    }

    /// Record one iteration for a claimed feature, blocking it if the cap
    /// is exceeded.
    pub async fn record_iteration(&self, feature_id: &str) -> Result<FeatureState, ClaimError> {
        let feature_id = feature_id.to_string();
        let max_iterations = self.max_iterations_per_feature;
        self.store
            .transact(move |doc| -> Result<FeatureState, ClaimError> {
                let record = doc
                    .get_mut(&feature_id)
                    .ok_or_else(|| ClaimError::UnknownFeature(feature_id.clone()))?;
                record.iteration_count += 1;
                if record.iteration_count >= max_iterations {
                    record.status = FeatureStatus::Blocked;
                    record.blocked_reason =
                        Some(format!("exceeded {max_iterations} iteration cap"));
                    record.claimed_by = None;
                    record.claimed_at = None;
                    record.last_heartbeat = None;
                }
                Ok(record.clone())
            })
            .await?
    }

    /// Record the outcome of a CI run, blocking the feature if the
    /// configured attempt cap is exceeded by a failure.
    pub async fn record_ci_result(
        &self,
        feature_id: &str,
        status: CiStatus,
    ) -> Result<FeatureState, ClaimError> {
        let feature_id = feature_id.to_string();
        let max_ci_attempts = self.max_ci_attempts;
        self.store
            .transact(move |doc| -> Result<FeatureState, ClaimError> {
                let record = doc
                    .get_mut(&feature_id)
                    .ok_or_else(|| ClaimError::UnknownFeature(feature_id.clone()))?;
                record.ci_status = status;
                if status == CiStatus::Failed {
                    record.ci_attempts += 1;
                    if record.ci_attempts >= max_ci_attempts {
                        record.status = FeatureStatus::Blocked;
                        record.blocked_reason =
                            Some(format!("exceeded {max_ci_attempts} CI attempt cap"));
                        record.claimed_by = None;
                        record.claimed_at = None;
                        record.last_heartbeat = None;
                    }
                }
                Ok(record.clone())
            })
            .await?
    }

    /// Record the branch a feature is being developed on.
    pub async fn set_branch(&self, feature_id: &str, branch: impl Into<String>) -> Result<(), ClaimError> {
        let feature_id = feature_id.to_string();
        let branch = branch.into();
        self.store
            .transact(move |doc| -> Result<(), ClaimError> {
                let record = doc
                    .get_mut(&feature_id)
                    .ok_or_else(|| ClaimError::UnknownFeature(feature_id.clone()))?;
                record.branch = Some(branch.clone());
                Ok(())
            })
            .await?
    }

    /// Mark a claimed feature Completed, stamping `completed_at` and
    /// recording `pr_url` when the builder (via VCS) produced one.
    pub async fn complete(
        &self,
        feature_id: &str,
        worker_id: &str,
        pr_url: Option<String>,
    ) -> Result<(), ClaimError> {
        let feature_id = feature_id.to_string();
        let worker_id = worker_id.to_string();
        self.store
            .transact(move |doc| -> Result<(), ClaimError> {
                let record = doc
                    .get_mut(&feature_id)
                    .ok_or_else(|| ClaimError::UnknownFeature(feature_id.clone()))?;
                if record.claimed_by.as_deref() != Some(worker_id.as_str()) {
                    return Err(ClaimError::NotClaimedBy(feature_id.clone(), worker_id.clone()));
                }
                record.status = FeatureStatus::Completed;
                record.completed_at = Some(Utc::now());
                record.claimed_by = None;
                record.claimed_at = None;
                record.last_heartbeat = None;
                if pr_url.is_some() {
                    record.pr_url = pr_url.clone();
                }
                Ok(())
            })
            .await?
    }

    /// Mark a feature Blocked with an explicit reason, regardless of
    /// caps — used for unrecoverable builder/decision failures.
    pub async fn block(&self, feature_id: &str, reason: impl Into<String>) -> Result<(), ClaimError> {
        let feature_id = feature_id.to_string();
        let reason = reason.into();
        self.store
            .transact(move |doc| -> Result<(), ClaimError> {
                let record = doc
                    .get_mut(&feature_id)
                    .ok_or_else(|| ClaimError::UnknownFeature(feature_id.clone()))?;
                record.status = FeatureStatus::Blocked;
                record.blocked_reason = Some(reason.clone());
                record.claimed_by = None;
                record.claimed_at = None;
                record.last_heartbeat = None;
                Ok(())
            })
            .await?
    }

    /// Park a claimed feature awaiting an async decision. The feature stays
    /// InProgress (the spec DFA has no separate "awaiting decision" state);
    /// `pending_decision_id` is the only record that it's parked, so the
    /// heartbeat reaper's InProgress-only scan still reclaims a claim whose
    /// owner dies while waiting on an answer.
    pub async fn await_decision(
        &self,
        feature_id: &str,
        decision_id: &str,
    ) -> Result<(), ClaimError> {
        let feature_id = feature_id.to_string();
        let decision_id = decision_id.to_string();
        self.store
            .transact(move |doc| -> Result<(), ClaimError> {
                let record = doc
                    .get_mut(&feature_id)
                    .ok_or_else(|| ClaimError::UnknownFeature(feature_id.clone()))?;
                record.pending_decision_id = Some(decision_id.clone());
                Ok(())
            })
            .await?
    }

    /// Clear the pending-decision marker once a decision has resolved. The
    /// feature was never moved out of InProgress, so there's nothing to
    /// resume it to.
    pub async fn resume_from_decision(&self, feature_id: &str) -> Result<(), ClaimError> {
        let feature_id = feature_id.to_string();
        self.store
            .transact(move |doc| -> Result<(), ClaimError> {
                let record = doc
                    .get_mut(&feature_id)
                    .ok_or_else(|| ClaimError::UnknownFeature(feature_id.clone()))?;
                record.pending_decision_id = None;
                Ok(())
            })
            .await?
    }

    /// Voluntarily give up an in-progress claim, returning the feature to
    /// Pending so it can be re-claimed. Requires the feature to currently be
    /// InProgress; unlike [`ClaimManager::reclaim`] (reaper-only, no
    /// precondition) this is for a worker choosing to step away.
    pub async fn release(&self, feature_id: &str, reason: impl Into<String>) -> Result<(), ClaimError> {
        let reason = reason.into();
        let feature_id_owned = feature_id.to_string();
        self.store
            .transact(move |doc| -> Result<(), ClaimError> {
                let record = doc
                    .get_mut(&feature_id_owned)
                    .ok_or_else(|| ClaimError::UnknownFeature(feature_id_owned.clone()))?;
                if record.status != FeatureStatus::InProgress {
                    return Err(ClaimError::NotClaimed(feature_id_owned.clone()));
                }
                record.status = FeatureStatus::Pending;
                record.claimed_by = None;
                record.claimed_at = None;
                record.last_heartbeat = None;
                Ok(())
            })
            .await?;
        tracing::info!(feature_id = %feature_id, reason = %reason, "released claim");
        Ok(())
    }

    /// Release a stale claim back to Pending, used by the heartbeat
    /// reaper. Unlike [`ClaimManager::complete`] this does not check the
    /// current owner, since by definition the owner is presumed dead.
    pub async fn reclaim(&self, feature_id: &str) -> Result<(), ClaimError> {
        let feature_id = feature_id.to_string();
        self.store
            .transact(move |doc| -> Result<(), ClaimError> {
                let record = doc
                    .get_mut(&feature_id)
                    .ok_or_else(|| ClaimError::UnknownFeature(feature_id.clone()))?;
                record.status = FeatureStatus::Pending;
                record.claimed_by = None;
                record.claimed_at = None;
                record.last_heartbeat = None;
                Ok(())
            })
            .await?
    }
}
