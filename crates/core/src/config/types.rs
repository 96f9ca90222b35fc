use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::orchestrator::OrchestratorConfig;
use crate::recovery::RecoveryConfig;
use crate::stage::PipelineConfig;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    /// Declarative command pipelines, one per job type.
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8080
}

/// Snapshot persistence and retention
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// SQLite file the job and approval tables are mirrored to.
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
    /// Seconds between snapshots.
    #[serde(default = "default_snapshot_interval")]
    pub snapshot_interval_secs: u64,
    /// Terminal jobs older than this are deleted (seconds).
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
    /// Seconds between retention sweeps.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            snapshot_interval_secs: default_snapshot_interval(),
            retention_secs: default_retention(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl StorageConfig {
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("jobflow.db")
}

fn default_snapshot_interval() -> u64 {
    30
}

fn default_retention() -> u64 {
    7 * 24 * 3600 // one week
}

fn default_cleanup_interval() -> u64 {
    3600
}

/// Approval gate configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApprovalConfig {
    /// Timeout for requests that do not set their own (milliseconds).
    #[serde(default = "default_approval_timeout")]
    pub default_timeout_ms: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_approval_timeout(),
        }
    }
}

impl ApprovalConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

fn default_approval_timeout() -> u64 {
    24 * 3600 * 1000 // one day
}

/// Notification hub configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotificationConfig {
    /// Events buffered per listener before new ones are dropped.
    #[serde(default = "default_listener_buffer")]
    pub listener_buffer: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            listener_buffer: default_listener_buffer(),
        }
    }
}

fn default_listener_buffer() -> usize {
    256
}

/// Sanitized config for API responses (stage commands reduced to names)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub orchestrator: OrchestratorConfig,
    pub approval: ApprovalConfig,
    pub recovery: RecoveryConfig,
    pub notifications: NotificationConfig,
    pub pipelines: Vec<SanitizedPipelineConfig>,
}

/// Pipeline summary without programs or arguments
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedPipelineConfig {
    #[serde(rename = "type")]
    pub job_type: String,
    pub stages: Vec<String>,
    /// Stages that end with an approval checkpoint.
    pub checkpoints: Vec<String>,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            server: config.server.clone(),
            storage: config.storage.clone(),
            orchestrator: config.orchestrator.clone(),
            approval: config.approval.clone(),
            recovery: config.recovery.clone(),
            notifications: config.notifications.clone(),
            pipelines: config
                .pipelines
                .iter()
                .map(|p| SanitizedPipelineConfig {
                    job_type: p.job_type.clone(),
                    stages: p.stages.iter().map(|s| s.name.clone()).collect(),
                    checkpoints: p
                        .stages
                        .iter()
                        .filter(|s| s.checkpoint.is_some())
                        .map(|s| s.name.clone())
                        .collect(),
                })
                .collect(),
        }
    }
}
