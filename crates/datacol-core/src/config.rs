//! Engine configuration.
//!
//! Poll budgets and timeouts for the reconciler, the rollout waiter, the
//! ephemeral-run executor, and the log multiplexer. All fields default to
//! the values the engine has always shipped with; a TOML file can override
//! any subset.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::provider::Provider;

/// Poll budgets for the rollout waiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutBudget {
    /// Max 1s polls while waiting for a new deployment generation.
    pub generation_attempts: u32,
    /// Seconds allowed for all replicas to become available.
    pub ready_timeout_secs: u64,
    /// Seconds between pending-pod failure inspections.
    pub pending_check_secs: u64,
}

impl Default for RolloutBudget {
    fn default() -> Self {
        Self {
            generation_attempts: 30,
            ready_timeout_secs: 120,
            pending_check_secs: 10,
        }
    }
}

/// Poll budget for ephemeral run pods reaching the Running phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunBudget {
    /// Max polls before the pod is declared stuck.
    pub poll_attempts: u32,
    /// Seconds between polls.
    pub poll_interval_secs: u64,
}

impl Default for RunBudget {
    fn default() -> Self {
        Self {
            poll_attempts: 20,
            poll_interval_secs: 1,
        }
    }
}

/// Timeouts for the log stream multiplexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogBudget {
    /// Milliseconds to wait for the first token of every source, so
    /// slow-starting pods are not skipped.
    pub first_timeout_ms: u64,
    /// Steady-state milliseconds to wait per round.
    pub next_timeout_ms: u64,
}

impl Default for LogBudget {
    fn default() -> Self {
        Self {
            first_timeout_ms: 5000,
            next_timeout_ms: 500,
        }
    }
}

impl LogBudget {
    pub fn first_timeout(&self) -> Duration {
        Duration::from_millis(self.first_timeout_ms)
    }

    pub fn next_timeout(&self) -> Duration {
        Duration::from_millis(self.next_timeout_ms)
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default cloud provider for requests that do not name one.
    pub provider: Provider,
    pub rollout: RolloutBudget,
    pub run: RunBudget,
    pub logs: LogBudget,
}

impl EngineConfig {
    /// Parse a configuration from TOML; missing fields keep their defaults.
    pub fn from_toml(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_shipped_budgets() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.rollout.generation_attempts, 30);
        assert_eq!(cfg.rollout.ready_timeout_secs, 120);
        assert_eq!(cfg.run.poll_attempts, 20);
        assert_eq!(cfg.logs.first_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn toml_overrides_a_subset() {
        let cfg = EngineConfig::from_toml(
            r#"
            provider = "aws"

            [rollout]
            ready_timeout_secs = 300
            "#,
        )
        .unwrap();
        assert_eq!(cfg.provider, Provider::Aws);
        assert_eq!(cfg.rollout.ready_timeout_secs, 300);
        assert_eq!(cfg.rollout.generation_attempts, 30);
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(EngineConfig::from_toml("provider = 42").is_err());
    }
}
