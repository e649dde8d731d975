//! Topological merge planner (C7).
//!
//! Once a drain of the backlog finishes, features are merged in an order
//! that respects `depends_on`: Kahn's algorithm over the Completed subset
//! of the catalog, breaking ties by feature id alone, stable-ascending
//! among same-wave vertices, so the plan is deterministic given a fixed
//! state snapshot. Priority only governs claim order ([`crate::claim::ClaimManager::claim_next`]);
//! it plays no part here.

use crate::catalog::Catalog;
use crate::state::{FeatureStateDoc, FeatureStatus};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write as _;

#[derive(Debug, thiserror::Error)]
pub enum MergePlanError {
    #[error("dependency cycle detected among completed features: {0:?}")]
    Cycle(Vec<String>),
}

/// A single step of the merge plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergeStep {
    pub feature_id: String,
    pub branch: Option<String>,
    /// `None` means the builder's workflow never opened a PR (e.g. a
    /// direct-push feature); the rendered plan notes it as a manual merge.
    pub pr_url: Option<String>,
}

/// Render a merge plan as a human-readable listing: one line per step in
/// order, noting the branch and either its PR url or a manual-merge
/// stanza when none was recorded.
pub fn render_plan(steps: &[MergeStep]) -> String {
    let mut out = String::new();
    for (i, step) in steps.iter().enumerate() {
        let branch = step.branch.as_deref().unwrap_or("<no branch recorded>");
        match &step.pr_url {
            Some(url) => {
                let _ = writeln!(out, "{}. {} ({branch}) -> {url}", i + 1, step.feature_id);
            }
            None => {
                let _ = writeln!(
                    out,
                    "{}. {} ({branch}) -> MANUAL MERGE: no PR was opened for this branch, merge by hand",
                    i + 1,
                    step.feature_id
                );
            }
        }
    }
    out
}

pub struct MergePlanner<'a> {
    catalog: &'a Catalog,
}

impl<'a> MergePlanner<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    /// Produce a merge order over every Completed feature in `state`, such
    /// that a feature's dependencies always appear before it.
    pub fn plan(&self, state: &FeatureStateDoc) -> Result<Vec<MergeStep>, MergePlanError> {
        let completed: HashSet<&str> = state
            .features
            .values()
            .filter(|f| f.status == FeatureStatus::Completed)
            .map(|f| f.id.as_str())
            .collect();

        let mut in_degree: HashMap<&str, usize> = HashMap::new();
        let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();

        for feature in &self.catalog.features {
            if !completed.contains(feature.id.as_str()) {
                continue;
            }
            in_degree.entry(feature.id.as_str()).or_insert(0);
            for dep in &feature.depends_on {
                if !completed.contains(dep.as_str()) {
                    // A dependency that isn't Completed yet cannot appear
                    // in this plan; the caller is responsible for only
                    // planning a closed, fully-completed set.
                    continue;
                }
                *in_degree.entry(feature.id.as_str()).or_insert(0) += 1;
                successors
                    .entry(dep.as_str())
                    .or_default()
                    .push(feature.id.as_str());
            }
        }

        let mut ready: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(id, _)| *id)
            .collect();
        ready.sort();
        let mut queue: VecDeque<&str> = ready.into();

        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            if let Some(succs) = successors.get(id) {
                let mut newly_zero = Vec::new();
                for &succ in succs {
                    let deg = in_degree.get_mut(succ).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        newly_zero.push(succ);
                    }
                }
                newly_zero.sort();
                for id in newly_zero {
                    queue.push_back(id);
                }
            }
        }

        if order.len() != in_degree.len() {
            let residual: Vec<String> = in_degree
                .into_iter()
                .filter(|(id, _)| !order.contains(id))
                .map(|(id, _)| id.to_string())
                .collect();
            return Err(MergePlanError::Cycle(residual));
        }

        Ok(order
            .into_iter()
            .map(|id| MergeStep {
                feature_id: id.to_string(),
                branch: state.get(id).and_then(|f| f.branch.clone()),
                pr_url: state.get(id).and_then(|f| f.pr_url.clone()),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FeatureSpec, WorkflowType};
    use crate::state::FeatureState;

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

    fn completed(id: &str) -> FeatureState {
        let mut state = FeatureState::pending(id);
        state.status = FeatureStatus::Completed;
        state
    }

    #[test]
    fn test_chain_plans_in_dependency_order() {
        let catalog = Catalog {
            features: vec![
                spec("A", &[], 1),
                spec("B", &["A"], 1),
                spec("C", &["B"], 1),
            ],
            integration_tests: vec![],
        };
        let mut state = FeatureStateDoc::default();
        for id in ["A", "B", "C"] {
            state.features.insert(id.to_string(), completed(id));
        }

        let plan = MergePlanner::new(&catalog).plan(&state).unwrap();
        let order: Vec<&str> = plan.iter().map(|s| s.feature_id.as_str()).collect();
        assert_eq!(order, vec!["A", "B", "C"]);
    }

    #[test]
    fn test_independent_branches_ordered_by_id_not_priority() {
        let catalog = Catalog {
            features: vec![spec("low", &[], 1), spec("high", &[], 10)],
            integration_tests: vec![],
        };
        let mut state = FeatureStateDoc::default();
        state.features.insert("low".to_string(), completed("low"));
        state.features.insert("high".to_string(), completed("high"));

        let plan = MergePlanner::new(&catalog).plan(&state).unwrap();
        let order: Vec<&str> = plan.iter().map(|s| s.feature_id.as_str()).collect();
        // "high" sorts before "low" lexically; the higher numeric priority
        // of "high" is coincidental here, not the reason for the order.
        assert_eq!(order, vec!["high", "low"]);
    }

    #[test]
    fn test_render_plan_notes_manual_merge_when_no_pr_url() {
        let steps = vec![
            MergeStep {
                feature_id: "A".to_string(),
                branch: Some("feature/A".to_string()),
                pr_url: Some("https://example.invalid/pr/1".to_string()),
            },
            MergeStep {
                feature_id: "B".to_string(),
                branch: Some("feature/B".to_string()),
                pr_url: None,
            },
        ];
        let rendered = render_plan(&steps);
        assert!(rendered.contains("https://example.invalid/pr/1"));
        assert!(rendered.contains("MANUAL MERGE"));
    }

    #[test]
    fn test_cycle_among_completed_features_is_reported_not_silently_dropped() {
        // Constructed directly rather than through `Catalog::load`/`validate`,
        // since those reject a cyclic catalog before it ever reaches a
        // planner -- this exercises MergePlanner's own cycle detection, as
        // if the cycle had somehow been injected into an already-completed
        // pair of features (spec.md §8 scenario 6).
        let catalog = Catalog {
            features: vec![spec("P", &["Q"], 1), spec("Q", &["P"], 1)],
            integration_tests: vec![],
        };
        let mut state = FeatureStateDoc::default();
        state.features.insert("P".to_string(), completed("P"));
        state.features.insert("Q".to_string(), completed("Q"));

        let result = MergePlanner::new(&catalog).plan(&state);
        match result {
            Err(MergePlanError::Cycle(residual)) => {
                let mut residual = residual;
                residual.sort();
                assert_eq!(residual, vec!["P".to_string(), "Q".to_string()]);
            }
            Ok(_) => panic!("expected a cycle error, got an ordering"),
        }
    }

    #[test]
    fn test_incomplete_dependency_excluded_from_plan() {
        let catalog = Catalog {
            features: vec![spec("A", &[], 1), spec("B", &["A"], 1)],
            integration_tests: vec![],
        };
        let mut state = FeatureStateDoc::default();
        state.features.insert("B".to_string(), completed("B"));
        state
            .features
            .insert("A".to_string(), FeatureState::pending("A"));

        let plan = MergePlanner::new(&catalog).plan(&state).unwrap();
        let order: Vec<&str> = plan.iter().map(|s| s.feature_id.as_str()).collect();
        assert_eq!(order, vec!["B"]);
    }
}
