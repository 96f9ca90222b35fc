//! Types for the pipeline orchestrator.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::JobStatus;

/// Errors that can occur during orchestration.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Job not found.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Invalid job status for operation.
    #[error("job {job_id} is {actual}, cannot {operation}")]
    InvalidState {
        job_id: String,
        operation: &'static str,
        actual: JobStatus,
    },

    /// Results requested before the job completed.
    #[error("job {job_id} is {status}, results are only available once completed")]
    NotCompleted { job_id: String, status: JobStatus },

    /// The orchestrator has been stopped.
    #[error("orchestrator is shutting down")]
    ShuttingDown,

    /// Job store error.
    #[error("job store error: {0}")]
    Job(#[from] crate::job::JobError),

    /// Approval gate error.
    #[error("approval error: {0}")]
    Approval(#[from] crate::approval::ApprovalError),

    /// Recovery coordinator error.
    #[error("recovery error: {0}")]
    Recovery(#[from] crate::recovery::RecoveryError),
}

/// Current status of the orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorStatus {
    /// Whether the background loops are running.
    pub running: bool,
    /// Jobs with a live pipeline task (including those waiting for a slot).
    pub active_tasks: usize,
    /// Free concurrency slots.
    pub available_slots: usize,
    /// Registered pipeline types.
    pub pipelines: Vec<String>,
}

/// What startup recovery did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptedSummary {
    /// Pending approvals closed.
    pub approvals_cancelled: usize,
    /// Jobs failed because they were mid-pipeline.
    pub jobs_failed: usize,
    /// Queued jobs whose pipeline was started again.
    pub jobs_requeued: usize,
}
