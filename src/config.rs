//! Process-wide configuration for the orchestrator core.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration resolved once at startup and shared (read-only) by every
/// component.
///
/// Loaded the way the rest of the corpus loads layered config: a base TOML
/// file merged with environment overrides via the `config` crate (see
/// [`OrchestratorConfig::load`]). Defaults here mirror the values named in
/// the design document's §5 (timeouts) and §4 (per-component defaults).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Number of worker processes/tasks to run concurrently.
    pub num_workers: usize,

    /// Per-feature iteration cap before a worker gives up and blocks.
    pub max_iterations_per_feature: u32,

    /// CI failures tolerated before the reaper blocks a feature outright.
    pub max_ci_attempts: u32,

    /// Age of an in-progress claim, combined with heartbeat staleness,
    /// before the reaper reclaims it.
    #[serde(with = "humantime_serde")]
    pub stale_claim_threshold: Duration,

    /// Reaper wake interval.
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,

    /// Supervision loop wake interval (C9).
    #[serde(with = "humantime_serde")]
    pub supervision_interval: Duration,

    /// Hard daily spend cap, in the same unit as cost_per_*_token.
    pub max_daily_cost: f64,

    /// Price per input token.
    pub cost_per_input_token: f64,

    /// Price per output token.
    pub cost_per_output_token: f64,

    /// Cool-down applied when over budget before re-checking.
    #[serde(with = "humantime_serde")]
    pub budget_cooldown: Duration,

    /// Base branch new feature branches fork from.
    pub default_branch: String,

    /// Prefix applied to `<prefix>/<feature_id>` branch names.
    pub feature_branch_prefix: String,

    /// Default decision timeout when a worker doesn't specify one.
    #[serde(with = "humantime_serde")]
    pub default_decision_timeout: Duration,

    /// Mutex acquisition timeout for claim-related operations.
    #[serde(with = "humantime_serde")]
    pub claim_mutex_timeout: Duration,

    /// Mutex acquisition timeout for everything else.
    #[serde(with = "humantime_serde")]
    pub default_mutex_timeout: Duration,

    /// Path to the dynamic feature-state document (never source-controlled).
    pub state_path: PathBuf,

    /// Path to the static feature catalog.
    pub catalog_path: PathBuf,

    /// Path to the append-only cost ledger.
    pub ledger_path: PathBuf,

    /// Directory holding one file per decision record.
    pub decisions_path: PathBuf,

    /// Scratch directory backing named mutexes.
    pub locks_path: PathBuf,

    /// Directory holding per-worker heartbeat files.
    pub heartbeats_path: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            num_workers: 3,
            max_iterations_per_feature: 20,
            max_ci_attempts: 3,
            stale_claim_threshold: Duration::from_secs(10 * 60),
            heartbeat_interval: Duration::from_secs(60),
            supervision_interval: Duration::from_secs(30),
            max_daily_cost: 50.0,
            cost_per_input_token: 0.000_003,
            cost_per_output_token: 0.000_015,
            budget_cooldown: Duration::from_secs(5 * 60),
            default_branch: "main".to_string(),
            feature_branch_prefix: "feature".to_string(),
            default_decision_timeout: Duration::from_secs(60 * 60),
            claim_mutex_timeout: Duration::from_secs(10),
            default_mutex_timeout: Duration::from_secs(30),
            state_path: PathBuf::from(".orchestrator/state.json"),
            catalog_path: PathBuf::from(".orchestrator/catalog.yaml"),
            ledger_path: PathBuf::from(".orchestrator/ledger.csv"),
            decisions_path: PathBuf::from(".orchestrator/decisions"),
            locks_path: PathBuf::from(".orchestrator/locks"),
            heartbeats_path: PathBuf::from(".orchestrator/heartbeats"),
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from an optional TOML file layered under
    /// `ORCHESTRATOR_`-prefixed environment overrides.
    ///
    /// Defaults are seeded into the builder first (via `set_default`) so
    /// that a file or environment layer only needs to mention the fields it
    /// actually overrides.
    pub fn load(path: Option<&std::path::Path>) -> crate::Result<Self> {
        let defaults = Self::default();
        let mut builder = config::Config::builder();

        for (key, value) in defaults.as_default_pairs() {
            builder = builder
                .set_default(key, value)
                .map_err(|e| crate::OrchestratorError::Configuration(e.to_string()))?;
        }

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("ORCHESTRATOR")
                .separator("__")
                .try_parsing(true),
        );

        let merged = builder
            .build()
            .map_err(|e| crate::OrchestratorError::Configuration(e.to_string()))?;

        merged
            .try_deserialize()
            .map_err(|e| crate::OrchestratorError::Configuration(e.to_string()))
    }

    /// Flatten the default config into `(key, value)` pairs `config::Config`
    /// can seed itself with, in the same string-path-per-field shape the
    /// `config` crate expects.
    fn as_default_pairs(&self) -> Vec<(&'static str, config::Value)> {
        use config::Value;
        vec![
            ("num_workers", Value::from(self.num_workers as i64)),
            (
                "max_iterations_per_feature",
                Value::from(self.max_iterations_per_feature as i64),
            ),
            ("max_ci_attempts", Value::from(self.max_ci_attempts as i64)),
            (
                "stale_claim_threshold",
                Value::from(humantime::format_duration(self.stale_claim_threshold).to_string()),
            ),
            (
                "heartbeat_interval",
                Value::from(humantime::format_duration(self.heartbeat_interval).to_string()),
            ),
            (
                "supervision_interval",
                Value::from(humantime::format_duration(self.supervision_interval).to_string()),
            ),
            ("max_daily_cost", Value::from(self.max_daily_cost)),
            ("cost_per_input_token", Value::from(self.cost_per_input_token)),
            ("cost_per_output_token", Value::from(self.cost_per_output_token)),
            (
                "budget_cooldown",
                Value::from(humantime::format_duration(self.budget_cooldown).to_string()),
            ),
            ("default_branch", Value::from(self.default_branch.clone())),
            (
                "feature_branch_prefix",
                Value::from(self.feature_branch_prefix.clone()),
            ),
            (
                "default_decision_timeout",
                Value::from(
                    humantime::format_duration(self.default_decision_timeout).to_string(),
                ),
            ),
            (
                "claim_mutex_timeout",
                Value::from(humantime::format_duration(self.claim_mutex_timeout).to_string()),
            ),
            (
                "default_mutex_timeout",
                Value::from(humantime::format_duration(self.default_mutex_timeout).to_string()),
            ),
            (
                "state_path",
                Value::from(self.state_path.to_string_lossy().to_string()),
            ),
            (
                "catalog_path",
                Value::from(self.catalog_path.to_string_lossy().to_string()),
            ),
            (
                "ledger_path",
                Value::from(self.ledger_path.to_string_lossy().to_string()),
            ),
            (
                "decisions_path",
                Value::from(self.decisions_path.to_string_lossy().to_string()),
            ),
            (
                "locks_path",
                Value::from(self.locks_path.to_string_lossy().to_string()),
            ),
            (
                "heartbeats_path",
                Value::from(self.heartbeats_path.to_string_lossy().to_string()),
            ),
        ]
    }

    /// Validate invariants that aren't expressible in the type system alone.
    pub fn validate(&self) -> crate::Result<()> {
        if self.num_workers == 0 {
            return Err(crate::OrchestratorError::Configuration(
                "num_workers must be greater than 0".to_string(),
            ));
        }
        if self.max_iterations_per_feature == 0 {
            return Err(crate::OrchestratorError::Configuration(
                "max_iterations_per_feature must be greater than 0".to_string(),
            ));
        }
        if self.max_daily_cost <= 0.0 {
            return Err(crate::OrchestratorError::Configuration(
                "max_daily_cost must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.num_workers, 3);
        assert_eq!(config.max_ci_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let config = OrchestratorConfig {
            num_workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_non_positive_budget() {
        let config = OrchestratorConfig {
            max_daily_cost: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
