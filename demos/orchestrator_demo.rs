//! Standalone demonstration of a full orchestrator run against a scratch
//! catalog and an echo builder that completes every feature on the first
//! iteration. Run with `cargo run --example orchestrator_demo`.

use async_trait::async_trait;
use dev_swarm_orchestrator::config::OrchestratorConfig;
use dev_swarm_orchestrator::notifier::TracingNotifier;
use dev_swarm_orchestrator::orchestrator::{Collaborators, Orchestrator};
use dev_swarm_orchestrator::state::{CiStatus, FeatureState};
use dev_swarm_orchestrator::vcs::NullVcs;
use dev_swarm_orchestrator::worker::{Builder, BuilderError, BuilderOutput};
use std::sync::Arc;

struct EchoBuilder;

#[async_trait]
impl Builder for EchoBuilder {
    async fn invoke(
        &self,
        feature: &FeatureState,
        _decision_answer: Option<&str>,
    ) -> Result<BuilderOutput, BuilderError> {
        println!("building {}", feature.id);
        Ok(BuilderOutput {
            input_tokens: 120,
            output_tokens: 340,
            ci_status: Some(CiStatus::Passed),
            decision_prompt: None,
            decision_options: Vec::new(),
            decision_context: String::new(),
            decision_default: None,
            raw_output: format!("<promise>FEATURE_COMPLETE:{}</promise>", feature.id),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let dir = tempfile::tempdir()?;
    std::fs::write(
        dir.path().join("catalog.yaml"),
        r#"
features:
  - {id: api, name: "expose API", depends_on: [], priority: 10, workflow_type: tdd}
  - {id: ui, name: "build UI", depends_on: [api], priority: 5, workflow_type: direct}
  - {id: docs, name: "write docs", depends_on: [api], priority: 1, workflow_type: docs}
"#,
    )?;

    let config = OrchestratorConfig {
        num_workers: 2,
        catalog_path: dir.path().join("catalog.yaml"),
        state_path: dir.path().join("state.json"),
        ledger_path: dir.path().join("ledger.csv"),
        decisions_path: dir.path().join("decisions"),
        locks_path: dir.path().join("locks"),
        heartbeats_path: dir.path().join("heartbeats"),
        ..Default::default()
    };

    let orchestrator = Orchestrator::bootstrap(
        config,
        Collaborators {
            builder: Arc::new(EchoBuilder),
            vcs: Arc::new(NullVcs),
            notifier: Arc::new(TracingNotifier),
        },
    )
    .await?;

    let report = orchestrator.run().await?;
    println!("{:#?}", report.merge_plan);
    Ok(())
}
