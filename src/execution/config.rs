//! Configuration for the execution engine

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::retry::Backoff;

/// Timeouts, retries and breaker thresholds applied to every venue call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Per-attempt timeout (default: 2000ms)
    pub call_timeout_ms: u64,

    /// Retries after the first attempt for transient failures (default: 3)
    pub max_retries: u32,

    /// First backoff delay, doubled per retry (default: 250ms)
    pub backoff_base_ms: u64,

    /// Backoff ceiling (default: 8000ms)
    pub backoff_max_ms: u64,

    /// Consecutive transient failures that open the breaker (default: 5)
    pub breaker_failures: u32,

    /// Time the breaker stays open before probing (default: 30000ms)
    pub breaker_cooldown_ms: u64,

    /// Mirror the local stop as a resting stop order at the venue (default: true)
    pub protective_stops: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 2_000,
            max_retries: 3,
            backoff_base_ms: 250,
            backoff_max_ms: 8_000,
            breaker_failures: 5,
            breaker_cooldown_ms: 30_000,
            protective_stops: true,
        }
    }
}

impl ExecutionConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            base: Duration::from_millis(self.backoff_base_ms),
            max: Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms)),
        }
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.breaker_cooldown_ms)
    }
}
