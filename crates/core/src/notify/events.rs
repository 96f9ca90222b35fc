//! Event names and the envelope delivered to listeners.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROCESSING_STARTED: &str = "processing:started";
pub const PROCESSING_PROGRESS: &str = "processing:progress";
pub const PROCESSING_COMPLETED: &str = "processing:completed";
pub const PROCESSING_ERROR: &str = "processing:error";
pub const PROCESSING_FAILED: &str = "processing:failed";
pub const PROCESSING_RETRY: &str = "processing:retry";
pub const PROCESSING_CANCELLED: &str = "processing:cancelled";
pub const APPROVAL_REQUESTED: &str = "approval:requested";
pub const APPROVAL_NEW: &str = "approval:new";
pub const APPROVAL_RESPONDED: &str = "approval:responded";
pub const APPROVAL_TIMEOUT: &str = "approval:timeout";
pub const APPROVAL_CANCELLED: &str = "approval:cancelled";
pub const SYSTEM_NOTIFICATION: &str = "system:notification";

/// Envelope wrapping a published event with server-side metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    /// Event name, e.g. `processing:progress`.
    pub event: String,
    /// Job the event is scoped to (None for broadcasts).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Server timestamp at publish time.
    pub timestamp: DateTime<Utc>,
    /// Event-specific payload.
    pub payload: Value,
}

impl JobEvent {
    pub fn new(event: impl Into<String>, job_id: Option<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            job_id,
            timestamp: Utc::now(),
            payload,
        }
    }
}
