//! Static feature catalog — loaded once, never mutated at runtime.
//!
//! The catalog is source-controlled and branched along with code, whereas
//! the dynamic [`crate::state::FeatureStateDoc`] must be a single shared
//! view across every concurrent branch/worker. Keeping the two in separate
//! documents (rather than one mutable record per feature, as an earlier
//! variant of this crate did) is what makes invariant 6 — `id` and
//! `depends_on` never mutate after load — hold across orchestrator
//! restarts; see DESIGN.md.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Opaque hint about how a builder should approach a feature.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    Tdd,
    Direct,
    Docs,
    Other,
}

/// A single entry in the static catalog.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub priority: i64,
    pub workflow_type: WorkflowType,
    /// Opaque hints (api endpoints, packages, env vars, ...) forwarded to
    /// the builder unexamined.
    #[serde(default)]
    pub hints: serde_json::Value,
}

/// A labelled set of feature ids an integration-test phase exercises.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntegrationTestSet {
    pub name: String,
    pub feature_ids: Vec<String>,
}

/// The static, read-only feature catalog.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Catalog {
    pub features: Vec<FeatureSpec>,
    #[serde(default)]
    pub integration_tests: Vec<IntegrationTestSet>,
}

/// Errors that can occur while loading or validating a catalog.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog file not found or unreadable: {0}")]
    NotFound(std::io::Error),

    #[error("catalog is not valid YAML: {0}")]
    InvalidYaml(#[from] serde_yaml::Error),

    #[error("duplicate feature id: {0}")]
    DuplicateId(String),

    #[error("feature {feature} depends on unknown id {dependency}")]
    UnknownDependency { feature: String, dependency: String },

    #[error("dependency cycle detected in static catalog, involving: {0:?}")]
    Cycle(Vec<String>),
}

impl Catalog {
    /// Load and validate a catalog from a YAML file on disk.
    pub fn load(path: &std::path::Path) -> Result<Self, CatalogError> {
        let text = std::fs::read_to_string(path).map_err(CatalogError::NotFound)?;
        let catalog: Catalog = serde_yaml::from_str(&text)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Check structural validity: unique ids, dependencies that resolve,
    /// and an acyclic dependency graph (the same Kahn's-algorithm check the
    /// [`crate::merge_planner`] uses at runtime, applied here to the full
    /// catalog rather than just the Completed subset).
    pub fn validate(&self) -> Result<(), CatalogError> {
        let mut seen = HashSet::new();
        for feature in &self.features {
            if !seen.insert(feature.id.as_str()) {
                return Err(CatalogError::DuplicateId(feature.id.clone()));
            }
        }

        let ids: HashSet<&str> = self.features.iter().map(|f| f.id.as_str()).collect();
        for feature in &self.features {
            for dep in &feature.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(CatalogError::UnknownDependency {
                        feature: feature.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        self.check_acyclic()
    }

    fn check_acyclic(&self) -> Result<(), CatalogError> {
        let mut in_degree: HashMap<&str, usize> =
            self.features.iter().map(|f| (f.id.as_str(), 0)).collect();
        let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();

        for feature in &self.features {
            for dep in &feature.depends_on {
                *in_degree.get_mut(feature.id.as_str()).unwrap() += 1;
                successors
                    .entry(dep.as_str())
                    .or_default()
                    .push(feature.id.as_str());
            }
        }

        let mut queue: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(id, _)| *id)
            .collect();
        queue.sort_unstable();

        let mut visited = 0usize;
        let mut i = 0;
        while i < queue.len() {
            let id = queue[i];
            i += 1;
            visited += 1;
            if let Some(succs) = successors.get(id) {
                let mut newly_zero = Vec::new();
                for &succ in succs {
                    let deg = in_degree.get_mut(succ).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        newly_zero.push(succ);
                    }
                }
                newly_zero.sort_unstable();
                queue.extend(newly_zero);
            }
        }

        if visited != self.features.len() {
            let residual: Vec<String> = in_degree
                .into_iter()
                .filter(|(_, deg)| *deg > 0)
                .map(|(id, _)| id.to_string())
                .collect();
            return Err(CatalogError::Cycle(residual));
        }

        Ok(())
    }

    /// Look up a feature spec by id.
    pub fn get(&self, id: &str) -> Option<&FeatureSpec> {
        self.features.iter().find(|f| f.id == id)
    }

    /// Ids in catalog order, used to initialize a fresh state document.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.features.iter().map(|f| f.id.as_str())
    }
}
