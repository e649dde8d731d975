//! Cost ledger and daily-budget enforcement.
//!
//! The ledger is an append-only CSV, written behind the `"budget"` named
//! mutex so concurrent workers can't interleave partial lines. The running
//! total for "today" is derived by summing ledger rows rather than kept as
//! a separate counter, so the ledger stays the single source of truth and
//! a crash never leaves a counter out of sync with its evidence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum BudgetError {
    #[error(transparent)]
    Mutex(#[from] crate::mutex::MutexError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("daily budget exceeded: spent {spent:.4}, cap {cap:.4}")]
    Exceeded { spent: f64, cap: f64 },
}

/// One row of the append-only ledger: ISO-8601 timestamp, worker id,
/// feature id, input-token count, output-token count, cost — in that fixed
/// column order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub timestamp: DateTime<Utc>,
    pub worker_id: String,
    pub feature_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

/// Tracks spend against [`crate::config::OrchestratorConfig::max_daily_cost`].
#[derive(Clone)]
pub struct Budget {
    ledger_path: PathBuf,
    locks_path: PathBuf,
    mutex_timeout: Duration,
    max_daily_cost: f64,
    cost_per_input_token: f64,
    cost_per_output_token: f64,
    pub cooldown: Duration,
}

impl Budget {
    pub fn from_config(config: &crate::config::OrchestratorConfig) -> Self {
        Self {
            ledger_path: config.ledger_path.clone(),
            locks_path: config.locks_path.clone(),
            mutex_timeout: config.default_mutex_timeout,
            max_daily_cost: config.max_daily_cost,
            cost_per_input_token: config.cost_per_input_token,
            cost_per_output_token: config.cost_per_output_token,
            cooldown: config.budget_cooldown,
        }
    }

    pub fn cost_of(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        input_tokens as f64 * self.cost_per_input_token
            + output_tokens as f64 * self.cost_per_output_token
    }

    /// Sum of `cost` across every ledger row recorded since UTC midnight.
    pub async fn spent_today(&self) -> Result<f64, BudgetError> {
        let records = self.read_ledger().await?;
        let today = Utc::now().date_naive();
        Ok(records
            .iter()
            .filter(|r| r.timestamp.date_naive() == today)
            .map(|r| r.cost)
            .sum())
    }

    /// Check whether recording `input_tokens`/`output_tokens` more spend
    /// would push today's total over the cap, without recording anything.
    pub async fn check(&self, input_tokens: u64, output_tokens: u64) -> Result<(), BudgetError> {
        let spent = self.spent_today().await?;
        let projected = spent + self.cost_of(input_tokens, output_tokens);
        if projected > self.max_daily_cost {
            return Err(BudgetError::Exceeded {
                spent: projected,
                cap: self.max_daily_cost,
            });
        }
        Ok(())
    }

    /// Append a ledger row for tokens already spent. Call after the fact
    /// (the spend already happened); callers should have called
    /// [`Budget::check`] beforehand to decide whether to proceed.
    pub async fn record(
        &self,
        worker_id: &str,
        feature_id: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> Result<(), BudgetError> {
        let record = LedgerRecord {
            timestamp: Utc::now(),
            worker_id: worker_id.to_string(),
            feature_id: feature_id.to_string(),
            input_tokens,
            output_tokens,
            cost: self.cost_of(input_tokens, output_tokens),
        };

        let _guard = crate::mutex::acquire(&self.locks_path, "budget", self.mutex_timeout).await?;

        if let Some(parent) = self.ledger_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let write_header = !tokio::fs::try_exists(&self.ledger_path).await.unwrap_or(false);
        let line = format!(
            "{},{},{},{},{},{}\n",
            record.timestamp.to_rfc3339(),
            record.worker_id,
            record.feature_id,
            record.input_tokens,
            record.output_tokens,
            record.cost,
        );

        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.ledger_path)
            .await?;
        if write_header {
            file.write_all(b"timestamp,worker_id,feature_id,input_tokens,output_tokens,cost\n")
                .await?;
        }
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn read_ledger(&self) -> Result<Vec<LedgerRecord>, BudgetError> {
        let text = match tokio::fs::read_to_string(&self.ledger_path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut records = Vec::new();
        for line in text.lines().skip(1) {
            let fields: Vec<&str> = line.splitn(6, ',').collect();
            if fields.len() != 6 {
                continue;
            }
            let Ok(timestamp) = DateTime::parse_from_rfc3339(fields[0]) else {
                continue;
            };
            records.push(LedgerRecord {
                timestamp: timestamp.with_timezone(&Utc),
                worker_id: fields[1].to_string(),
                feature_id: fields[2].to_string(),
                input_tokens: fields[3].parse().unwrap_or(0),
                output_tokens: fields[4].parse().unwrap_or(0),
                cost: fields[5].parse().unwrap_or(0.0),
            });
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget_in(dir: &std::path::Path) -> Budget {
        Budget {
            ledger_path: dir.join("ledger.csv"),
            locks_path: dir.join("locks"),
            mutex_timeout: Duration::from_secs(2),
            max_daily_cost: 1.0,
            cost_per_input_token: 0.01,
            cost_per_output_token: 0.02,
            cooldown: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_record_and_spent_today_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let budget = budget_in(dir.path());
        budget.record("w1", "feature-a", 10, 10).await.unwrap();
        let spent = budget.spent_today().await.unwrap();
        assert!((spent - budget.cost_of(10, 10)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_check_rejects_when_over_cap() {
        let dir = tempfile::tempdir().unwrap();
        let budget = budget_in(dir.path());
        // cost_of(40, 0) = 0.40, cap is 1.0 -- two rounds fit, a third doesn't.
        budget.record("w1", "feature-a", 40, 0).await.unwrap();
        budget.record("w1", "feature-b", 40, 0).await.unwrap();
        let result = budget.check(40, 0).await;
        assert!(matches!(result, Err(BudgetError::Exceeded { .. })));
    }

    #[tokio::test]
    async fn test_check_allows_when_under_cap() {
        let dir = tempfile::tempdir().unwrap();
        let budget = budget_in(dir.path());
        assert!(budget.check(10, 10).await.is_ok());
    }
}
