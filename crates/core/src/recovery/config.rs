//! Retry and watchdog configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the recovery coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Failed attempts allowed before a job is failed for good.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff for the first retry (milliseconds). Doubles per attempt.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Upper bound on a single backoff (milliseconds).
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// A processing job untouched for this long is considered stuck (seconds).
    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold_secs: u64,

    /// How often the watchdog scans for stuck jobs (seconds).
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_stuck_threshold() -> u64 {
    1800 // 30 minutes
}

fn default_watchdog_interval() -> u64 {
    60
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            stuck_threshold_secs: default_stuck_threshold(),
            watchdog_interval_secs: default_watchdog_interval(),
        }
    }
}

impl RecoveryConfig {
    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_secs)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }
}
