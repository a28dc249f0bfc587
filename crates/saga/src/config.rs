//! Orchestrator configuration loaded from environment variables.

use std::time::Duration;

use crate::retry::ExponentialBackoff;

/// Orchestrator tuning with sensible defaults.
///
/// Reads from environment variables:
/// - `SAGA_STEP_TIMEOUT_MS`: per-invocation timeout (default: `30000`)
/// - `SAGA_MAX_ATTEMPTS`: attempts per step before giving up (default: `5`)
/// - `SAGA_BACKOFF_BASE_MS`: delay after the first failure (default: `100`)
/// - `SAGA_BACKOFF_MAX_MS`: upper bound on any delay (default: `10000`)
/// - `SAGA_BACKOFF_JITTER`: fraction of each delay randomised away (default: `0.2`)
///
/// Values that are missing or fail to parse fall back to the default.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub step_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub backoff_jitter: f64,
}

impl OrchestratorConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            step_timeout: parse("SAGA_STEP_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.step_timeout),
            max_attempts: parse("SAGA_MAX_ATTEMPTS")
                .and_then(|v| u32::try_from(v).ok())
                .unwrap_or(defaults.max_attempts),
            backoff_base: parse("SAGA_BACKOFF_BASE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_base),
            backoff_max: parse("SAGA_BACKOFF_MAX_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.backoff_max),
            backoff_jitter: lookup("SAGA_BACKOFF_JITTER")
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|j| j.is_finite())
                .unwrap_or(defaults.backoff_jitter),
        }
    }

    /// Builds the default retry policy for steps that do not set their own.
    pub fn retry_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff::new()
            .with_max_attempts(self.max_attempts)
            .with_base_delay(self.backoff_base)
            .with_max_delay(self.backoff_max)
            .with_jitter(self.backoff_jitter)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(30),
            max_attempts: ExponentialBackoff::DEFAULT_MAX_ATTEMPTS,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(10),
            backoff_jitter: 0.2,
        }
    }
}
