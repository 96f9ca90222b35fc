//! Testing utilities and mock implementations.
//!
//! Mocks for the stage and resource seams, plus fixtures for putting jobs
//! into a given state without running a pipeline.
//!
//! # Example
//!
//! ```rust,ignore
//! use jobflow_core::testing::{MockStage, MockOutcome};
//!
//! let stage = MockStage::new("extract").with_progress(vec![50, 100]);
//! stage.push_outcome(MockOutcome::Succeed(json!({"pages": 3}))).await;
//! ```

mod mock_resource;
mod mock_stage;

pub use mock_resource::MockResource;
pub use mock_stage::{MockOutcome, MockStage};

/// Test fixtures and helper functions.
pub mod fixtures {
    use crate::job::{CreateJobRequest, Job, JobError, JobStatus, JobStore, JobUpdate};

    /// Create a job and walk it to `status` along permitted transitions.
    ///
    /// `awaiting_approval` is given a placeholder approval id.
    pub fn job_in_status(
        store: &dyn JobStore,
        id: &str,
        job_type: &str,
        status: JobStatus,
    ) -> Result<Job, JobError> {
        let mut job = store.create(CreateJobRequest::new(job_type).with_id(id))?;
        let path: &[JobStatus] = match status {
            JobStatus::Created => &[],
            JobStatus::Uploaded => &[JobStatus::Uploaded],
            JobStatus::Queued => &[JobStatus::Queued],
            JobStatus::Processing => &[JobStatus::Queued, JobStatus::Processing],
            JobStatus::AwaitingApproval => &[
                JobStatus::Queued,
                JobStatus::Processing,
                JobStatus::AwaitingApproval,
            ],
            JobStatus::Completed => &[
                JobStatus::Queued,
                JobStatus::Processing,
                JobStatus::Completed,
            ],
            JobStatus::Failed => &[JobStatus::Failed],
            JobStatus::Cancelled => &[JobStatus::Cancelled],
        };
        for next in path {
            let mut update = JobUpdate::status(*next);
            if *next == JobStatus::AwaitingApproval {
                update = update.with_pending_approval(format!("approval-{}", id));
            }
            if *next == JobStatus::Failed {
                // created -> failed is not permitted
                store.update(id, JobUpdate::status(JobStatus::Queued))?;
            }
            job = store.update(id, update)?;
        }
        Ok(job)
    }
}
