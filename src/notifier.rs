//! Outbound notification boundary — chat-platform ingress lives outside
//! this crate; only the trait it implements lives here.

use async_trait::async_trait;

/// A notification-worthy event raised by the orchestrator core.
#[derive(Clone, Debug)]
pub enum Notification {
    FeatureClaimed { feature_id: String, worker_id: String },
    FeatureCompleted { feature_id: String },
    FeatureBlocked { feature_id: String, reason: String },
    DecisionRequested { feature_id: String, decision_id: String, prompt: String },
    BudgetExceeded { spent: f64, cap: f64 },
    StaleClaimReclaimed { feature_id: String, previous_worker: String },
}

/// External collaborator that surfaces orchestrator events to humans.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: Notification);
}

/// Discards every notification. Used in tests and as a safe default when
/// no external notification channel is configured.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _event: Notification) {}
}

/// Routes notifications through `tracing` instead of an external channel,
/// useful for local runs without a chat-platform integration wired up.
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn notify(&self, event: Notification) {
        match event {
            Notification::FeatureClaimed { feature_id, worker_id } => {
                tracing::info!(feature_id, worker_id, "feature claimed");
            }
            Notification::FeatureCompleted { feature_id } => {
                tracing::info!(feature_id, "feature completed");
            }
            Notification::FeatureBlocked { feature_id, reason } => {
                tracing::warn!(feature_id, reason, "feature blocked");
            }
            Notification::DecisionRequested {
                feature_id,
                decision_id,
                prompt,
            } => {
                tracing::info!(feature_id, decision_id, prompt, "decision requested");
            }
            Notification::BudgetExceeded { spent, cap } => {
                tracing::warn!(spent, cap, "daily budget exceeded");
            }
            Notification::StaleClaimReclaimed {
                feature_id,
                previous_worker,
            } => {
                tracing::warn!(feature_id, previous_worker, "stale claim reclaimed");
            }
        }
    }
}
