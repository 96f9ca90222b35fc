//! Approval request types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::job::{JobError, JobStatus};

/// A reviewer's choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject,
    Modify,
}

impl ApprovalDecision {
    pub const ALL: [ApprovalDecision; 3] = [
        ApprovalDecision::Approve,
        ApprovalDecision::Reject,
        ApprovalDecision::Modify,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalDecision::Approve => "approve",
            ApprovalDecision::Reject => "reject",
            ApprovalDecision::Modify => "modify",
        }
    }

    /// Whether the job may continue after this decision.
    pub fn continues(&self) -> bool {
        !matches!(self, ApprovalDecision::Reject)
    }
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(ApprovalDecision::Approve),
            "reject" => Ok(ApprovalDecision::Reject),
            "modify" => Ok(ApprovalDecision::Modify),
            other => Err(format!("unknown decision: {}", other)),
        }
    }
}

/// Lifecycle of an approval request. Every status except `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approve,
    Reject,
    Modify,
    Timeout,
    Cancelled,
}

impl ApprovalStatus {
    pub const ALL: [ApprovalStatus; 6] = [
        ApprovalStatus::Pending,
        ApprovalStatus::Approve,
        ApprovalStatus::Reject,
        ApprovalStatus::Modify,
        ApprovalStatus::Timeout,
        ApprovalStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approve => "approve",
            ApprovalStatus::Reject => "reject",
            ApprovalStatus::Modify => "modify",
            ApprovalStatus::Timeout => "timeout",
            ApprovalStatus::Cancelled => "cancelled",
        }
    }
}

impl From<ApprovalDecision> for ApprovalStatus {
    fn from(decision: ApprovalDecision) -> Self {
        match decision {
            ApprovalDecision::Approve => ApprovalStatus::Approve,
            ApprovalDecision::Reject => ApprovalStatus::Reject,
            ApprovalDecision::Modify => ApprovalStatus::Modify,
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_options() -> Vec<ApprovalDecision> {
    ApprovalDecision::ALL.to_vec()
}

/// What a stage asks the reviewer to decide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalSpec {
    /// Category of decision (e.g. `analysis_review`).
    #[serde(rename = "type")]
    pub approval_type: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_options")]
    pub options: Vec<ApprovalDecision>,
    /// Opaque payload shown to the decision-maker.
    #[serde(default)]
    pub data: Value,
    /// Falls back to the gate's configured default when absent.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ApprovalSpec {
    pub fn new(approval_type: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            approval_type: approval_type.into(),
            title: title.into(),
            description: String::new(),
            options: default_options(),
            data: Value::Null,
            timeout_ms: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_options(mut self, options: Vec<ApprovalDecision>) -> Self {
        self.options = options;
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// A reviewer's answer as submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalReply {
    pub decision: ApprovalDecision,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub modifications: Option<Value>,
}

impl ApprovalReply {
    pub fn new(decision: ApprovalDecision) -> Self {
        Self {
            decision,
            comment: None,
            modifications: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_modifications(mut self, modifications: Value) -> Self {
        self.modifications = Some(modifications);
        self
    }
}

/// The recorded response, including how long the reviewer took.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResponse {
    pub decision: ApprovalDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modifications: Option<Value>,
    pub latency_ms: u64,
}

/// A human-decision checkpoint tied to one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub id: String,
    pub job_id: String,
    #[serde(rename = "type")]
    pub approval_type: String,
    pub title: String,
    pub description: String,
    pub options: Vec<ApprovalDecision>,
    pub data: Value,
    pub status: ApprovalStatus,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub responded_at: Option<DateTime<Utc>>,
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ApprovalResponse>,
    /// Why the request ended without a response (timeout or cancel).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Approval {
    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }

    /// The decision, if a reviewer answered.
    pub fn decision(&self) -> Option<ApprovalDecision> {
        self.response.as_ref().map(|r| r.decision)
    }
}

/// Errors from the approval gate.
#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("approval not found: {0}")]
    NotFound(String),

    #[error("job {job_id} already has pending approval {approval_id}")]
    AlreadyPending { job_id: String, approval_id: String },

    #[error("approval {approval_id} already resolved as {status}")]
    AlreadyResolved {
        approval_id: String,
        status: ApprovalStatus,
    },

    #[error("decision {decision} is not allowed for approval {approval_id}")]
    InvalidDecision {
        approval_id: String,
        decision: ApprovalDecision,
    },

    #[error("job {job_id} is {status}, approvals can only be requested while processing")]
    JobNotProcessing { job_id: String, status: JobStatus },

    #[error("job store error: {0}")]
    Job(#[from] JobError),
}
