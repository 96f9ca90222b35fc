//! Job storage trait and types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use super::{Job, JobStatus, StageResult};

/// Error type for job store operations.
#[derive(Debug, Error)]
pub enum JobError {
    /// Job not found.
    #[error("job not found: {0}")]
    NotFound(String),

    /// A job with this id already exists.
    #[error("job already exists: {0}")]
    AlreadyExists(String),

    /// The job is terminal and can no longer be modified.
    #[error("job {job_id} is {status} and can no longer be modified")]
    Terminal { job_id: String, status: JobStatus },

    /// The requested status change is not in the permitted graph.
    #[error("invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: String,
        from: JobStatus,
        to: JobStatus,
    },

    /// A compare-and-set guard did not match the stored status.
    #[error("job {job_id} is {actual}, expected {expected}")]
    StatusMismatch {
        job_id: String,
        expected: JobStatus,
        actual: JobStatus,
    },

    /// The update would break a job invariant.
    #[error("invalid update for job {job_id}: {reason}")]
    InvalidUpdate { job_id: String, reason: String },

    /// Backend storage failure.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Request to create a new job.
#[derive(Debug, Clone, Default)]
pub struct CreateJobRequest {
    /// Caller-chosen id; a UUID is assigned when absent.
    pub id: Option<String>,
    /// Pipeline kind.
    pub job_type: String,
    /// Initial metadata (analysis options and the like).
    pub metadata: Map<String, Value>,
}

impl CreateJobRequest {
    /// Create a request for the given pipeline type.
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            id: None,
            job_type: job_type.into(),
            metadata: Map::new(),
        }
    }

    /// Use a specific id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Add one metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Partial update merged into a stored job.
///
/// `metadata` entries are merged key by key; a `null` value removes the key.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub current_step: Option<String>,
    pub metadata: Map<String, Value>,
    /// `Some(None)` clears the error.
    pub error: Option<Option<String>>,
    pub pending_approval: Option<String>,
    pub results: Option<Vec<StageResult>>,
    /// Compare-and-set guard: the update only applies if the job is in this status.
    pub expect_status: Option<JobStatus>,
}

impl JobUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update that only changes the status.
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_progress(mut self, progress: u8) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.current_step = Some(step.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    pub fn clear_error(mut self) -> Self {
        self.error = Some(None);
        self
    }

    pub fn with_pending_approval(mut self, approval_id: impl Into<String>) -> Self {
        self.pending_approval = Some(approval_id.into());
        self
    }

    pub fn with_results(mut self, results: Vec<StageResult>) -> Self {
        self.results = Some(results);
        self
    }

    pub fn expect_status(mut self, status: JobStatus) -> Self {
        self.expect_status = Some(status);
        self
    }

    /// Merge this update into `job`, enforcing status and approval invariants.
    ///
    /// On error the job is left untouched.
    pub fn apply_to(self, job: &mut Job, now: DateTime<Utc>) -> Result<(), JobError> {
        if job.status.is_terminal() {
            return Err(JobError::Terminal {
                job_id: job.id.clone(),
                status: job.status,
            });
        }

        if let Some(expected) = self.expect_status {
            if job.status != expected {
                return Err(JobError::StatusMismatch {
                    job_id: job.id.clone(),
                    expected,
                    actual: job.status,
                });
            }
        }

        let next_status = self.status.unwrap_or(job.status);
        if next_status != job.status && !job.status.can_transition_to(next_status) {
            return Err(JobError::InvalidTransition {
                job_id: job.id.clone(),
                from: job.status,
                to: next_status,
            });
        }

        let next_approval = if next_status == JobStatus::AwaitingApproval {
            match self.pending_approval.or_else(|| job.pending_approval.clone()) {
                Some(id) => Some(id),
                None => {
                    return Err(JobError::InvalidUpdate {
                        job_id: job.id.clone(),
                        reason: "awaiting_approval requires an approval id".to_string(),
                    })
                }
            }
        } else if self.pending_approval.is_some() {
            return Err(JobError::InvalidUpdate {
                job_id: job.id.clone(),
                reason: format!("pending approval set while {}", next_status),
            });
        } else {
            None
        };

        job.status = next_status;
        job.pending_approval = next_approval;
        if let Some(progress) = self.progress {
            job.progress = progress.min(100);
        }
        if let Some(step) = self.current_step {
            job.current_step = step;
        }
        for (key, value) in self.metadata {
            if value.is_null() {
                job.metadata.remove(&key);
            } else {
                job.metadata.insert(key, value);
            }
        }
        if let Some(error) = self.error {
            job.error = error;
        }
        if let Some(results) = self.results {
            job.results = results;
        }
        job.updated_at = now.max(job.updated_at);
        Ok(())
    }
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    /// Filter by status.
    pub status: Option<JobStatus>,
    /// Filter by pipeline type.
    pub job_type: Option<String>,
    /// Maximum number of results (None = all).
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by status.
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Filter by pipeline type.
    pub fn with_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    /// Set limit.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns true if the job passes the status and type filters.
    pub fn matches(&self, job: &Job) -> bool {
        self.status.is_none_or(|status| job.status == status)
            && self
                .job_type
                .as_deref()
                .is_none_or(|job_type| job.job_type == job_type)
    }
}

/// Trait for job storage backends.
///
/// Implementations must serialise read-modify-write per job id so
/// concurrent `update` calls for the same job never lose writes.
pub trait JobStore: Send + Sync {
    /// Create a new job in `created` status.
    fn create(&self, request: CreateJobRequest) -> Result<Job, JobError>;

    /// Get a job by ID.
    fn get(&self, id: &str) -> Result<Option<Job>, JobError>;

    /// Merge a partial update into a job and bump `updated_at`.
    fn update(&self, id: &str, update: JobUpdate) -> Result<Job, JobError>;

    /// List jobs matching the filter, newest first.
    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError>;

    /// Permanently delete a job. Returns the deleted job.
    fn delete(&self, id: &str) -> Result<Job, JobError>;

    /// Number of jobs per status (every status present, zero-filled).
    fn counts_by_status(&self) -> Result<BTreeMap<JobStatus, usize>, JobError>;

    /// Remove jobs whose last update is older than `age`.
    ///
    /// With `terminal_only` only completed, failed and cancelled jobs are
    /// considered. Returns the ids of the removed jobs so owners of
    /// associated artifacts can purge them.
    fn cleanup_older_than(
        &self,
        age: chrono::Duration,
        terminal_only: bool,
    ) -> Result<Vec<String>, JobError>;

    /// Copy of every stored job, for persistence.
    fn snapshot(&self) -> Result<Vec<Job>, JobError>;

    /// Load jobs from a snapshot, replacing entries with the same id.
    fn restore(&self, jobs: Vec<Job>) -> Result<usize, JobError>;
}
