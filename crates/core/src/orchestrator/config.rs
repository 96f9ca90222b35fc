//! Orchestrator configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration for the pipeline orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum number of jobs running their pipeline at the same time.
    /// Further jobs stay `queued` until a slot frees up.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,

    /// How often a stage may be re-run after a successful recovery
    /// strategy before the failure counts against the retry budget.
    #[serde(default = "default_max_resumes")]
    pub max_resumes_per_stage: u32,

    /// Scratch directory for stage programs.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

fn default_max_concurrent_jobs() -> usize {
    4
}

fn default_max_resumes() -> u32 {
    2
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("work")
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: default_max_concurrent_jobs(),
            max_resumes_per_stage: default_max_resumes(),
            work_dir: default_work_dir(),
        }
    }
}
