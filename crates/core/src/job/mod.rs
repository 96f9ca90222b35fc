//! Job records and the job table.

mod memory_store;
mod store;
mod types;

pub use memory_store::InMemoryJobStore;
pub use store::{CreateJobRequest, JobError, JobFilter, JobStore, JobUpdate};
pub use types::{
    Job, JobStatus, StageResult, APPROVALS_KEY, FALLBACK_MODE_KEY, PRIORITY_KEY, RETRY_COUNT_KEY,
    TIMEOUT_MULTIPLIER_KEY,
};
