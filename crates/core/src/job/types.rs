//! Core job data types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata key holding the number of failed attempts handed to the retry policy.
pub const RETRY_COUNT_KEY: &str = "retryCount";

/// Metadata key set by the AI timeout fallback strategy.
pub const FALLBACK_MODE_KEY: &str = "fallbackMode";

/// Metadata key holding the timeout multiplier stages may honour in fallback mode.
pub const TIMEOUT_MULTIPLIER_KEY: &str = "timeoutMultiplier";

/// Metadata key holding the scheduling priority hint ("low", "normal", "high").
pub const PRIORITY_KEY: &str = "priority";

/// Metadata key collecting approval responses recorded during a run.
pub const APPROVALS_KEY: &str = "approvals";

/// Current status of a job.
///
/// State machine flow:
/// ```text
/// Created -> Uploaded -> Queued -> Processing -> Completed
///    |          |          |        |    ^  \
///    |          |          |        |    |   -> Queued (scheduled retry)
///    |          |          |        v    |
///    |          |          |   AwaitingApproval
///    v          v          v        |
/// Cancelled  Cancelled  Failed/Cancelled  Failed/Cancelled
/// ```
///
/// `Completed`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Uploaded,
    Queued,
    Processing,
    AwaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [JobStatus; 8] = [
        JobStatus::Created,
        JobStatus::Uploaded,
        JobStatus::Queued,
        JobStatus::Processing,
        JobStatus::AwaitingApproval,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    /// Returns true if this is a terminal state (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Returns true if the job is being worked on by the orchestrator.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Processing | JobStatus::AwaitingApproval)
    }

    /// Returns true if the job can be cancelled from this state.
    pub fn can_cancel(&self) -> bool {
        !self.is_terminal()
    }

    /// Returns true if the permitted transition graph allows `self -> next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Created, Uploaded | Queued | Cancelled) => true,
            (Uploaded, Queued | Cancelled) => true,
            (Queued, Processing | Failed | Cancelled) => true,
            (Processing, AwaitingApproval | Queued | Completed | Failed | Cancelled) => true,
            (AwaitingApproval, Processing | Failed | Cancelled) => true,
            _ => false,
        }
    }

    /// Returns the status as a string (for filtering and storage).
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Uploaded => "uploaded",
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::AwaitingApproval => "awaiting_approval",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown job status: {}", s))
    }
}

/// Output recorded for one completed stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StageResult {
    /// Stage name.
    pub stage: String,
    /// Opaque output produced by the stage.
    pub output: Value,
    /// When the stage finished.
    pub completed_at: DateTime<Utc>,
}

/// A tracked unit of pipeline work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique identifier.
    pub id: String,

    /// Pipeline kind this job runs through.
    #[serde(rename = "type")]
    pub job_type: String,

    /// Current lifecycle status.
    pub status: JobStatus,

    /// Overall progress (0-100).
    pub progress: u8,

    /// Human-readable label of what is happening right now.
    pub current_step: String,

    /// Open key/value bag (options, retry count, fallback flags).
    #[serde(default)]
    pub metadata: Map<String, Value>,

    /// Last failure message.
    #[serde(default)]
    pub error: Option<String>,

    /// Approval this job is waiting on. Set iff status is `AwaitingApproval`.
    #[serde(default)]
    pub pending_approval: Option<String>,

    /// Stage outputs, attached on completion.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<StageResult>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Number of failed attempts recorded in metadata.
    pub fn retry_count(&self) -> u32 {
        self.metadata
            .get(RETRY_COUNT_KEY)
            .and_then(Value::as_u64)
            .map(|n| n.min(u32::MAX as u64) as u32)
            .unwrap_or(0)
    }

    /// Whether the AI timeout fallback has been switched on for this job.
    pub fn fallback_mode(&self) -> bool {
        self.metadata
            .get(FALLBACK_MODE_KEY)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Scheduling priority hint, if any.
    pub fn priority(&self) -> Option<&str> {
        self.metadata.get(PRIORITY_KEY).and_then(Value::as_str)
    }
}
