//! Pipeline orchestrator.
//!
//! The orchestrator drives jobs through their registered pipeline:
//! - **Run**: one task per job, bounded by a semaphore
//! - **Checkpoint**: stages may suspend the job on the approval gate
//! - **Recovery**: stage failures resume, retry with backoff, or fail
//! - **Maintenance**: watchdog and retention loops

mod config;
mod runner;
mod types;

pub use config::OrchestratorConfig;
pub use runner::Orchestrator;
pub use types::{InterruptedSummary, OrchestratorError, OrchestratorStatus};
