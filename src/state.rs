//! Dynamic feature state — the single mutable document every worker reads
//! and writes through [`crate::state_store::StateStore`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle status of a single feature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    /// Not yet claimed; eligible once its dependencies are Completed.
    Pending,
    /// Claimed by a worker and actively being iterated on. A feature parked
    /// on an outstanding decision request stays InProgress — `claim.rs`
    /// tracks that separately via `pending_decision_id` — so the heartbeat
    /// reaper's `InProgress`-only scan still covers a worker that dies while
    /// waiting on an answer.
    InProgress,
    /// CI passed, merge-planned or merged.
    Completed,
    /// Iteration cap or CI-attempt cap exceeded; needs human intervention.
    Blocked,
}

/// Outcome of the most recent CI run for a feature, if any.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiStatus {
    NotRun,
    Running,
    Passed,
    Failed,
}

/// Per-feature dynamic record.
///
/// Everything here may change over the lifetime of a run; `id` is the only
/// field shared with [`crate::catalog::FeatureSpec`], and it is never
/// reassigned once the record is created (invariant 6).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeatureState {
    pub id: String,
    pub status: FeatureStatus,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    #[serde(default)]
    pub iteration_count: u32,
    #[serde(default)]
    pub ci_attempts: u32,
    pub ci_status: CiStatus,
    pub branch: Option<String>,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub pending_decision_id: Option<String>,
    #[serde(default)]
    pub tokens_spent_input: u64,
    #[serde(default)]
    pub tokens_spent_output: u64,
    #[serde(default)]
    pub blocked_reason: Option<String>,
}

impl FeatureState {
    /// A fresh record for a feature that has never been claimed.
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: FeatureStatus::Pending,
            claimed_by: None,
            claimed_at: None,
            completed_at: None,
            last_heartbeat: None,
            iteration_count: 0,
            ci_attempts: 0,
            ci_status: CiStatus::NotRun,
            branch: None,
            pr_url: None,
            pending_decision_id: None,
            tokens_spent_input: 0,
            tokens_spent_output: 0,
            blocked_reason: None,
        }
    }
}

/// The full dynamic document: one record per feature id, plus a monotonic
/// version counter used to detect lost updates under concurrent access.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FeatureStateDoc {
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub features: HashMap<String, FeatureState>,
}

impl FeatureStateDoc {
    /// Build a fresh document seeding every catalog id as Pending. Existing
    /// entries for ids still present in the catalog are preserved; ids no
    /// longer in the catalog are dropped.
    pub fn reconcile(mut self, catalog: &crate::catalog::Catalog) -> Self {
        let mut reconciled = HashMap::with_capacity(catalog.features.len());
        for id in catalog.ids() {
            let entry = self
                .features
                .remove(id)
                .unwrap_or_else(|| FeatureState::pending(id));
            reconciled.insert(id.to_string(), entry);
        }
        self.features = reconciled;
        self
    }

    pub fn get(&self, id: &str) -> Option<&FeatureState> {
        self.features.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut FeatureState> {
        self.features.get_mut(id)
    }
}

/// An invariant from spec §3 was violated by a proposed mutation.
#[derive(Debug, thiserror::Error)]
pub enum InvariantViolation {
    #[error("feature {0} is InProgress but missing claimed_by/claimed_at")]
    InProgressMissingClaim(String),

    #[error("feature {0} has claimed_by/claimed_at set while not InProgress")]
    ClaimFieldsWithoutInProgress(String),

    #[error("feature {0} is Completed but missing completed_at")]
    CompletedMissingTimestamp(String),

    #[error("feature {0} is Blocked but missing blocked_reason")]
    BlockedMissingReason(String),
}

/// Check invariants 1-3 of spec §3 against every record in `doc`. Called
/// after every [`crate::state_store::StateStore::transact`] closure runs;
/// a violation means the mutation is abandoned without being written.
pub fn validate_invariants(doc: &FeatureStateDoc) -> Result<(), InvariantViolation> {
    for record in doc.features.values() {
        let has_claim = record.claimed_by.is_some() || record.claimed_at.is_some();
        match record.status {
            FeatureStatus::InProgress => {
                if record.claimed_by.is_none() || record.claimed_at.is_none() {
                    return Err(InvariantViolation::InProgressMissingClaim(
                        record.id.clone(),
                    ));
                }
            }
            _ if has_claim => {
                return Err(InvariantViolation::ClaimFieldsWithoutInProgress(
                    record.id.clone(),
                ));
            }
            _ => {}
        }
        match record.status {
            FeatureStatus::Completed => {
                if record.completed_at.is_none() {
                    return Err(InvariantViolation::CompletedMissingTimestamp(
                        record.id.clone(),
                    ));
                }
            }
            FeatureStatus::Blocked => {
                if record.blocked_reason.is_none() {
                    return Err(InvariantViolation::BlockedMissingReason(record.id.clone()));
                }
            }
            FeatureStatus::Pending | FeatureStatus::InProgress => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod invariant_tests {
    use super::*;

    #[test]
    fn test_in_progress_without_claim_is_rejected() {
        let mut doc = FeatureStateDoc::default();
        let mut record = FeatureState::pending("A");
        record.status = FeatureStatus::InProgress;
        doc.features.insert("A".to_string(), record);
        assert!(matches!(
            validate_invariants(&doc),
            Err(InvariantViolation::InProgressMissingClaim(_))
        ));
    }

    #[test]
    fn test_claim_fields_present_on_completed_record_is_rejected() {
        let mut doc = FeatureStateDoc::default();
        let mut record = FeatureState::pending("A");
        record.status = FeatureStatus::Completed;
        record.completed_at = Some(Utc::now());
        record.claimed_by = Some("w1".to_string());
        record.claimed_at = Some(Utc::now());
        doc.features.insert("A".to_string(), record);
        assert!(matches!(
            validate_invariants(&doc),
            Err(InvariantViolation::ClaimFieldsWithoutInProgress(_))
        ));
    }

    #[test]
    fn test_completed_without_timestamp_is_rejected() {
        let mut doc = FeatureStateDoc::default();
        let mut record = FeatureState::pending("A");
        record.status = FeatureStatus::Completed;
        doc.features.insert("A".to_string(), record);
        assert!(matches!(
            validate_invariants(&doc),
            Err(InvariantViolation::CompletedMissingTimestamp(_))
        ));
    }

    #[test]
    fn test_blocked_without_reason_is_rejected() {
        let mut doc = FeatureStateDoc::default();
        let mut record = FeatureState::pending("A");
        record.status = FeatureStatus::Blocked;
        doc.features.insert("A".to_string(), record);
        assert!(matches!(
            validate_invariants(&doc),
            Err(InvariantViolation::BlockedMissingReason(_))
        ));
    }

    #[test]
    fn test_well_formed_document_passes() {
        let mut doc = FeatureStateDoc::default();
        doc.features
            .insert("A".to_string(), FeatureState::pending("A"));
        assert!(validate_invariants(&doc).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, FeatureSpec, WorkflowType};

    fn spec(id: &str) -> FeatureSpec {
        FeatureSpec {
            id: id.to_string(),
            name: id.to_string(),
            depends_on: vec![],
            priority: 1,
            workflow_type: WorkflowType::Direct,
            hints: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_reconcile_seeds_missing_entries_as_pending() {
        let catalog = Catalog {
            features: vec![spec("A"), spec("B")],
            integration_tests: vec![],
        };
        let doc = FeatureStateDoc::default().reconcile(&catalog);
        assert_eq!(doc.features.len(), 2);
        assert_eq!(doc.get("A").unwrap().status, FeatureStatus::Pending);
    }

    #[test]
    fn test_reconcile_preserves_existing_and_drops_removed() {
        let mut doc = FeatureStateDoc::default();
        let mut existing = FeatureState::pending("A");
        existing.status = FeatureStatus::Completed;
        doc.features.insert("A".to_string(), existing);
        doc.features
            .insert("stale".to_string(), FeatureState::pending("stale"));

        let catalog = Catalog {
            features: vec![spec("A"), spec("B")],
            integration_tests: vec![],
        };
        let reconciled = doc.reconcile(&catalog);
        assert_eq!(reconciled.features.len(), 2);
        assert_eq!(
            reconciled.get("A").unwrap().status,
            FeatureStatus::Completed
        );
        assert!(reconciled.get("stale").is_none());
        assert!(reconciled.get("B").is_some());
    }
}
