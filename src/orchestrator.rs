//! Orchestrator lifecycle (C9): bootstrap every component from
//! configuration, run the worker pool and heartbeat reaper to a drain,
//! then hand the completed backlog to the merge planner.

use crate::budget::Budget;
use crate::catalog::Catalog;
use crate::claim::ClaimManager;
use crate::config::OrchestratorConfig;
use crate::decision::{DecisionQueue, FilesystemDecisionChannel};
use crate::heartbeat::HeartbeatReaper;
use crate::merge_planner::{MergePlanner, MergeStep};
use crate::notifier::Notifier;
use crate::state::FeatureStatus;
use crate::state_store::StateStore;
use crate::vcs::Vcs;
use crate::worker::{Builder, Worker, WorkerConfig};
use std::sync::Arc;

/// Summary returned once a run drains.
#[derive(Debug)]
pub struct RunReport {
    pub completed: Vec<String>,
    pub blocked: Vec<String>,
    pub merge_plan: Vec<MergeStep>,
}

/// External collaborators an orchestrator is bootstrapped with. Tests and
/// the `demos/` binary supply scripted or null implementations; a
/// production deployment wires real chat, VCS, and LLM-worker bridges.
pub struct Collaborators {
    pub builder: Arc<dyn Builder>,
    pub vcs: Arc<dyn Vcs>,
    pub notifier: Arc<dyn Notifier>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    catalog: Arc<Catalog>,
    store: Arc<StateStore>,
    claims: Arc<ClaimManager>,
    budget: Arc<Budget>,
    decisions: Arc<DecisionQueue>,
    collaborators: Collaborators,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

impl Orchestrator {
    /// Load the catalog, reconcile the state document against it, and
    /// wire every internal component. Does not start any background
    /// tasks; call [`Orchestrator::run`] for that.
    pub async fn bootstrap(
        config: OrchestratorConfig,
        collaborators: Collaborators,
    ) -> crate::Result<Self> {
        config.validate()?;

        collaborators.vcs.preflight().await.map_err(|e| {
            crate::OrchestratorError::Unrecoverable(format!("VCS prerequisite check failed: {e}"))
        })?;

        let catalog = Catalog::load(&config.catalog_path)
            .map_err(|e| crate::OrchestratorError::Configuration(e.to_string()))?;
        let catalog = Arc::new(catalog);

        let store = Arc::new(StateStore::from_config(&config));
        store
            .transact(|doc| {
                let reconciled = std::mem::take(doc).reconcile(&catalog);
                *doc = reconciled;
            })
            .await?;

        let claims = Arc::new(ClaimManager::new(
            store.clone(),
            catalog.clone(),
            config.max_iterations_per_feature,
            config.max_ci_attempts,
        ));
        let budget = Arc::new(Budget::from_config(&config));
        let decisions = Arc::new(DecisionQueue::new(
            Arc::new(FilesystemDecisionChannel::new(config.decisions_path.clone())),
            std::time::Duration::from_secs(1),
        ));

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        Ok(Self {
            config,
            catalog,
            store,
            claims,
            budget,
            decisions,
            collaborators,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Request every worker and the reaper to stop after their current
    /// unit of work.
    pub fn request_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run the worker pool and heartbeat reaper until every feature is
    /// Completed or Blocked, then compute and execute a merge plan over the
    /// completed subset.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self) -> crate::Result<RunReport> {
        let reaper = HeartbeatReaper::new(
            self.store.clone(),
            self.claims.clone(),
            self.budget.clone(),
            self.collaborators.notifier.clone(),
            self.config.heartbeats_path.clone(),
            self.config.stale_claim_threshold,
            self.config.heartbeat_interval,
            self.config.max_ci_attempts,
        );
        let reaper_shutdown = self.shutdown_rx.clone();
        let reaper_handle = tokio::spawn(async move { reaper.run(reaper_shutdown).await });

        let mut worker_handles = self.spawn_workers();
        self.supervise(&mut worker_handles).await;
        self.request_shutdown();

        for handle in worker_handles {
            handle
                .await
                .map_err(|e| crate::OrchestratorError::Unrecoverable(e.to_string()))??;
        }
        reaper_handle
            .await
            .map_err(|e| crate::OrchestratorError::Unrecoverable(e.to_string()))?;

        let report = self.build_report().await?;
        self.execute_merge_plan(&report.merge_plan).await?;
        Ok(report)
    }

    fn spawn_workers(&self) -> Vec<tokio::task::JoinHandle<crate::Result<()>>> {
        let mut handles = Vec::new();
        for i in 0..self.config.num_workers {
            let worker = Worker::new(
                WorkerConfig {
                    worker_id: format!("worker-{i}"),
                    default_branch: self.config.default_branch.clone(),
                    feature_branch_prefix: self.config.feature_branch_prefix.clone(),
                    default_decision_timeout: self.config.default_decision_timeout,
                    claim_poll_interval: std::time::Duration::from_secs(1),
                    heartbeats_path: self.config.heartbeats_path.clone(),
                    startup_stagger: std::time::Duration::from_millis(50) * i as u32,
                },
                self.claims.clone(),
                self.catalog.clone(),
                self.budget.clone(),
                self.collaborators.builder.clone(),
                self.decisions.clone(),
                self.collaborators.vcs.clone(),
                self.collaborators.notifier.clone(),
            );
            let shutdown = self.shutdown_rx.clone();
            handles.push(tokio::spawn(async move { worker.run(shutdown).await }));
        }
        handles
    }

    /// Poll the state document on `supervision_interval` until every
    /// feature has reached a terminal status (Completed or Blocked). If the
    /// entire worker pool dies (panic or early return) while work remains
    /// outstanding, respawn a fresh pool rather than hanging forever waiting
    /// for progress nobody is making.
    async fn supervise(&self, worker_handles: &mut Vec<tokio::task::JoinHandle<crate::Result<()>>>) {
        let mut ticker = tokio::time::interval(self.config.supervision_interval);
        loop {
            ticker.tick().await;
            let Ok(doc) = self.store.read().await else {
                continue;
            };
            let drained = doc
                .features
                .values()
                .all(|f| matches!(f.status, FeatureStatus::Completed | FeatureStatus::Blocked));
            if drained {
                return;
            }

            let work_remains = doc
                .features
                .values()
                .any(|f| matches!(f.status, FeatureStatus::Pending | FeatureStatus::InProgress));
            let all_dead = !worker_handles.is_empty()
                && worker_handles.iter().all(|h| h.is_finished());
            if work_remains && all_dead {
                tracing::error!(
                    num_workers = self.config.num_workers,
                    "entire worker pool died with work outstanding; restarting pool"
                );
                *worker_handles = self.spawn_workers();
            }
        }
    }

    /// Walk the merge plan in the order [`MergePlanner`] computed and ask
    /// the VCS collaborator to merge each branch into `default_branch`.
    /// Skipped for steps with no recorded branch (the feature completed
    /// without ever opening one).
    async fn execute_merge_plan(&self, plan: &[MergeStep]) -> crate::Result<()> {
        for step in plan {
            let Some(branch) = &step.branch else {
                continue;
            };
            self.collaborators
                .vcs
                .merge(branch, &self.config.default_branch)
                .await
                .map_err(|e| crate::OrchestratorError::Unrecoverable(e.to_string()))?;
        }
        Ok(())
    }

    async fn build_report(&self) -> crate::Result<RunReport> {
        let doc = self.store.read().await?;
        let completed: Vec<String> = doc
            .features
            .values()
            .filter(|f| f.status == FeatureStatus::Completed)
            .map(|f| f.id.clone())
            .collect();
        let blocked: Vec<String> = doc
            .features
            .values()
            .filter(|f| f.status == FeatureStatus::Blocked)
            .map(|f| f.id.clone())
            .collect();

        let merge_plan = MergePlanner::new(&self.catalog).plan(&doc)?;

        Ok(RunReport {
            completed,
            blocked,
            merge_plan,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::NullNotifier;
    use crate::state::{CiStatus, FeatureState};
    use crate::vcs::NullVcs;
    use crate::worker::BuilderOutput;
    use async_trait::async_trait;
    use std::time::Duration;

    struct UnreachableVcs;

    #[async_trait]
    impl Vcs for UnreachableVcs {
        async fn ensure_branch(&self, _branch: &str, _base: &str) -> Result<(), crate::vcs::VcsError> {
            Ok(())
        }
        async fn current_branch(&self) -> Result<String, crate::vcs::VcsError> {
            Err(crate::vcs::VcsError::BranchFailed("no repository here".to_string()))
        }
        async fn pr_url_for_current_branch(&self) -> Result<Option<String>, crate::vcs::VcsError> {
            Ok(None)
        }
        async fn merge(&self, _branch: &str, _base: &str) -> Result<(), crate::vcs::VcsError> {
            Ok(())
        }
    }

    struct AlwaysCompleteBuilder;

    #[async_trait]
    impl Builder for AlwaysCompleteBuilder {
        async fn invoke(
            &self,
            feature: &FeatureState,
            _decision_answer: Option<&str>,
        ) -> Result<BuilderOutput, crate::worker::BuilderError> {
            Ok(BuilderOutput {
                input_tokens: 1,
                output_tokens: 1,
                ci_status: Some(CiStatus::Passed),
                decision_prompt: None,
                decision_options: Vec::new(),
                decision_context: String::new(),
                decision_default: None,
                raw_output: format!("<promise>FEATURE_COMPLETE:{}</promise>", feature.id),
            })
        }
    }

    fn write_catalog(dir: &std::path::Path) -> std::path::PathBuf {
        let path = dir.join("catalog.yaml");
        std::fs::write(
            &path,
            r#"
features:
  - id: A
    name: A
    depends_on: []
    priority: 1
    workflow_type: direct
  - id: B
    name: B
    depends_on: [A]
    priority: 1
    workflow_type: direct
"#,
        )
        .unwrap();
        path
    }

    #[tokio::test]
    async fn test_orchestrator_drains_a_simple_chain() {
        let dir = tempfile::tempdir().unwrap();
        let catalog_path = write_catalog(dir.path());

        let config = OrchestratorConfig {
            num_workers: 1,
            catalog_path,
            state_path: dir.path().join("state.json"),
            ledger_path: dir.path().join("ledger.csv"),
            decisions_path: dir.path().join("decisions"),
            locks_path: dir.path().join("locks"),
            heartbeats_path: dir.path().join("heartbeats"),
            supervision_interval: Duration::from_millis(20),
            heartbeat_interval: Duration::from_millis(20),
            default_mutex_timeout: Duration::from_secs(2),
            claim_mutex_timeout: Duration::from_secs(2),
            ..Default::default()
        };

        let orchestrator = Orchestrator::bootstrap(
            config,
            Collaborators {
                builder: Arc::new(AlwaysCompleteBuilder),
                vcs: Arc::new(NullVcs),
                notifier: Arc::new(NullNotifier),
            },
        )
        .await
        .unwrap();

        let report = orchestrator.run().await.unwrap();
        assert_eq!(report.blocked, Vec::<String>::new());
        assert!(report.completed.contains(&"A".to_string()));
        assert!(report.completed.contains(&"B".to_string()));

        let order: Vec<&str> = report
            .merge_plan
            .iter()
            .map(|s| s.feature_id.as_str())
            .collect();
        assert_eq!(order, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_bootstrap_rejects_cyclic_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.yaml");
        std::fs::write(
            &path,
            r#"
features:
  - id: P
    name: P
    depends_on: [Q]
    priority: 1
    workflow_type: direct
  - id: Q
    name: Q
    depends_on: [P]
    priority: 1
    workflow_type: direct
"#,
        )
        .unwrap();

        let config = OrchestratorConfig {
            catalog_path: path,
            state_path: dir.path().join("state.json"),
            ledger_path: dir.path().join("ledger.csv"),
            decisions_path: dir.path().join("decisions"),
            locks_path: dir.path().join("locks"),
            heartbeats_path: dir.path().join("heartbeats"),
            ..Default::default()
        };

        let result = Orchestrator::bootstrap(
            config,
            Collaborators {
                builder: Arc::new(AlwaysCompleteBuilder),
                vcs: Arc::new(NullVcs),
                notifier: Arc::new(NullNotifier),
            },
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_bootstrap_fails_before_spawning_workers_when_vcs_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let catalog_path = write_catalog(dir.path());

        let config = OrchestratorConfig {
            catalog_path,
            state_path: dir.path().join("state.json"),
            ledger_path: dir.path().join("ledger.csv"),
            decisions_path: dir.path().join("decisions"),
            locks_path: dir.path().join("locks"),
            heartbeats_path: dir.path().join("heartbeats"),
            ..Default::default()
        };

        let result = Orchestrator::bootstrap(
            config,
            Collaborators {
                builder: Arc::new(AlwaysCompleteBuilder),
                vcs: Arc::new(UnreachableVcs),
                notifier: Arc::new(NullNotifier),
            },
        )
        .await;
        assert!(matches!(
            result,
            Err(crate::OrchestratorError::Unrecoverable(_))
        ));

        // The state document must never have been initialized -- the
        // prerequisite check runs before the StateStore is touched at all.
        assert!(!dir.path().join("state.json").exists());
    }
}
