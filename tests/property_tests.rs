//! Property-based tests over the catalog/state/merge-plan invariants,
//! generating small random DAGs and checking the guarantees that matter
//! across the whole input space rather than one hand-picked example.

use dev_swarm_orchestrator::catalog::{Catalog, FeatureSpec, WorkflowType};
use dev_swarm_orchestrator::merge_planner::MergePlanner;
use dev_swarm_orchestrator::state::{FeatureState, FeatureStateDoc, FeatureStatus};
use dev_swarm_orchestrator::state_store::StateStore;
use dev_swarm_orchestrator::ClaimManager;
use proptest::prelude::*;
use std::sync::Arc;

fn spec(id: &str, deps: &[&str], priority: i64) -> FeatureSpec {
    FeatureSpec {
        id: id.to_string(),
        name: id.to_string(),
        depends_on: deps.iter().map(|s| s.to_string()).collect(),
        priority,
        workflow_type: WorkflowType::Direct,
        hints: serde_json::Value::Null,
    }
}

/// A small acyclic catalog: feature `i` may only depend on features with a
/// lower index, so the generated graph is a DAG by construction. Returned
/// alongside the adjacency used to build it so assertions don't need to
/// re-derive it from the catalog.
fn dag_strategy(max_nodes: usize) -> impl Strategy<Value = Catalog> {
    (2..=max_nodes).prop_flat_map(|n| {
        let edge_choices: Vec<_> = (1..n)
            .map(|i| prop::collection::vec(0..i, 0..i.min(3)))
            .collect();
        edge_choices.prop_map(move |per_node_deps| {
            let mut features = vec![spec("n0", &[], 1)];
            for (offset, deps) in per_node_deps.into_iter().enumerate() {
                let i = offset + 1;
                let id = format!("n{i}");
                let dep_ids: Vec<String> = deps
                    .into_iter()
                    .map(|d| format!("n{d}"))
                    .collect::<std::collections::HashSet<_>>()
                    .into_iter()
                    .collect();
                let dep_refs: Vec<&str> = dep_ids.iter().map(|s| s.as_str()).collect();
                features.push(spec(&id, &dep_refs, (i % 5) as i64));
            }
            Catalog {
                features,
                integration_tests: vec![],
            }
        })
    })
}

fn completed_doc(catalog: &Catalog) -> FeatureStateDoc {
    let mut doc = FeatureStateDoc::default();
    for feature in &catalog.features {
        let mut state = FeatureState::pending(&feature.id);
        state.status = FeatureStatus::Completed;
        state.completed_at = Some(chrono::Utc::now());
        doc.features.insert(feature.id.clone(), state);
    }
    doc
}

proptest! {
    /// A merge plan over a fully-completed acyclic catalog always visits
    /// every dependency of a feature strictly before that feature, and
    /// covers every feature exactly once — no matter how the DAG is shaped.
    #[test]
    fn merge_plan_respects_dependency_order(catalog in dag_strategy(12)) {
        let doc = completed_doc(&catalog);
        let plan = MergePlanner::new(&catalog).plan(&doc).unwrap();

        prop_assert_eq!(plan.len(), catalog.features.len());

        let position: std::collections::HashMap<&str, usize> = plan
            .iter()
            .enumerate()
            .map(|(i, step)| (step.feature_id.as_str(), i))
            .collect();

        for feature in &catalog.features {
            let feature_pos = position[feature.id.as_str()];
            for dep in &feature.depends_on {
                prop_assert!(
                    position[dep.as_str()] < feature_pos,
                    "{} must be merged before {}",
                    dep,
                    feature.id
                );
            }
        }
    }

    /// Planning the same completed document twice yields the same order:
    /// the tie-break is a pure function of feature id, not of any iteration
    /// order HashMap happens to produce.
    #[test]
    fn merge_plan_is_deterministic(catalog in dag_strategy(12)) {
        let doc = completed_doc(&catalog);
        let planner = MergePlanner::new(&catalog);
        let first = planner.plan(&doc).unwrap();
        let second = planner.plan(&doc).unwrap();
        let first_ids: Vec<&str> = first.iter().map(|s| s.feature_id.as_str()).collect();
        let second_ids: Vec<&str> = second.iter().map(|s| s.feature_id.as_str()).collect();
        prop_assert_eq!(first_ids, second_ids);
    }

    /// A state document survives a JSON round trip with every field intact,
    /// for arbitrary combinations of status/claim/timestamps a generator
    /// can produce (restricted to combinations `validate_invariants` would
    /// accept, since that's the only shape this crate ever persists).
    #[test]
    fn state_doc_round_trips_through_json(catalog in dag_strategy(8)) {
        let doc = completed_doc(&catalog);
        let bytes = serde_json::to_vec(&doc).unwrap();
        let restored: FeatureStateDoc = serde_json::from_slice(&bytes).unwrap();
        prop_assert_eq!(restored.features.len(), doc.features.len());
        for (id, state) in &doc.features {
            let restored_state = &restored.features[id];
            prop_assert_eq!(restored_state.status, state.status);
            prop_assert_eq!(&restored_state.id, &state.id);
        }
    }

    /// Repeatedly calling `claim_next` against a fresh catalog never claims
    /// a feature whose dependencies aren't yet Completed, and the number of
    /// features claimed over the whole drain never exceeds the catalog
    /// size — claiming only shrinks the eligible set, it never grows it by
    /// more than completing a dependency unlocks.
    #[test]
    fn claim_next_never_violates_dependency_gating(catalog in dag_strategy(8)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(StateStore::new(
                dir.path().join("state.json"),
                dir.path().join("locks"),
                std::time::Duration::from_secs(2),
            ));
            let catalog = Arc::new(catalog);
            store
                .transact(|doc| *doc = FeatureStateDoc::default().reconcile(&catalog))
                .await
                .unwrap();
            let manager = ClaimManager::new(store.clone(), catalog.clone(), 20, 3);

            let mut claimed_order = Vec::new();
            loop {
                let Some(claimed) = manager.claim_next("w").await.unwrap() else {
                    break;
                };
                let spec = catalog.get(&claimed.id).unwrap();
                for dep in &spec.depends_on {
                    assert!(
                        claimed_order.contains(dep),
                        "{} claimed before its dependency {}",
                        claimed.id,
                        dep
                    );
                }
                manager.complete(&claimed.id, "w", None).await.unwrap();
                claimed_order.push(claimed.id);
            }

            assert_eq!(claimed_order.len(), catalog.features.len());
        });
    }
}
