//! # Dev Swarm Orchestrator
//!
//! The concurrency and scheduling core of an autonomous multi-agent
//! development orchestrator: a control plane that drives a pool of worker
//! processes through a dependency-ordered backlog of feature implementation
//! tasks.
//!
//! ## Overview
//!
//! ```text
//! Orchestrator
//!   |-- StateStore (atomic read-modify-write, guarded by a named Mutex)
//!   |-- Heartbeat reaper (stale-claim recovery)
//!   |-- N x Worker
//!   |     |-- ClaimManager.claim_next()
//!   |     |-- Builder.invoke() (external collaborator)
//!   |     `-- complete() / block() via ClaimManager
//!   |-- DecisionQueue (async human-in-the-loop rendezvous)
//!   `-- MergePlanner (post-drain topological ordering)
//! ```
//!
//! The LLM worker process itself, chat-platform ingress, and git/PR-host
//! integration are external collaborators; only their trait boundaries are
//! specified here (see [`notifier`], [`vcs`], [`worker::Builder`],
//! [`decision::DecisionChannel`]).
//!
//! ## Usage
//!
//! ```rust,no_run
//! use dev_swarm_orchestrator::config::OrchestratorConfig;
//! use dev_swarm_orchestrator::orchestrator::Orchestrator;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = OrchestratorConfig::default();
//!     let orchestrator = Orchestrator::bootstrap(config).await?;
//!     let report = orchestrator.run().await?;
//!     println!("{:#?}", report);
//!     Ok(())
//! }
//! ```

pub mod budget;
pub mod catalog;
pub mod claim;
pub mod config;
pub mod decision;
pub mod heartbeat;
pub mod merge_planner;
pub mod mutex;
pub mod notifier;
pub mod orchestrator;
pub mod state;
pub mod state_store;
pub mod vcs;
pub mod worker;

pub use catalog::{Catalog, FeatureSpec, WorkflowType};
pub use claim::ClaimManager;
pub use state::{CiStatus, FeatureState, FeatureStatus};
pub use state_store::StateStore;

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors that can occur across the orchestrator core.
///
/// Variants map to the error-kind table in the design document: each kind
/// carries its own policy (fail loudly, suspend, or let the caller retry)
/// rather than a single catch-all.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("mutex error: {0}")]
    Mutex(#[from] mutex::MutexError),

    #[error("claim error: {0}")]
    Claim(#[from] claim::ClaimError),

    #[error("decision error: {0}")]
    Decision(#[from] decision::DecisionError),

    #[error("merge planning error: {0}")]
    MergePlan(#[from] merge_planner::MergePlanError),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unrecoverable: {0}")]
    Unrecoverable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}
