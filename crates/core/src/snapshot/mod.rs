//! Periodic persistence of the in-memory job and approval tables.
//!
//! Durability is best-effort: state changed since the last snapshot is lost
//! if the process crashes.

mod sqlite;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::approval::{Approval, ApprovalGate};
use crate::job::{Job, JobError, JobStore};

pub use sqlite::SqliteSnapshotStore;

/// Errors from the snapshot port.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot database error: {0}")]
    Database(String),

    #[error("snapshot serialization error: {0}")]
    Serialization(String),

    #[error("job store error: {0}")]
    Job(#[from] JobError),
}

/// Full copy of persisted state.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub jobs: Vec<Job>,
    pub approvals: Vec<Approval>,
}

/// Durable storage for snapshots. `save` replaces the previous snapshot.
pub trait SnapshotStore: Send + Sync {
    fn save(&self, snapshot: &Snapshot) -> Result<(), SnapshotError>;

    fn load(&self) -> Result<Snapshot, SnapshotError>;
}

/// Copies the live tables to a [`SnapshotStore`] and back.
pub struct Snapshotter {
    jobs: Arc<dyn JobStore>,
    gate: ApprovalGate,
    port: Arc<dyn SnapshotStore>,
}

impl Snapshotter {
    pub fn new(jobs: Arc<dyn JobStore>, gate: ApprovalGate, port: Arc<dyn SnapshotStore>) -> Self {
        Self { jobs, gate, port }
    }

    /// Write the current state. Returns the number of jobs written.
    pub fn persist(&self) -> Result<usize, SnapshotError> {
        let snapshot = Snapshot {
            jobs: self.jobs.snapshot()?,
            approvals: self.gate.snapshot(),
        };
        self.port.save(&snapshot)?;
        debug!(
            "Snapshot written: {} jobs, {} approvals",
            snapshot.jobs.len(),
            snapshot.approvals.len()
        );
        Ok(snapshot.jobs.len())
    }

    /// Load the last snapshot into the live tables.
    ///
    /// Returns `(jobs, approvals)` restored.
    pub fn restore(&self) -> Result<(usize, usize), SnapshotError> {
        let snapshot = self.port.load()?;
        let jobs = self.jobs.restore(snapshot.jobs)?;
        let approvals = self.gate.restore(snapshot.approvals);
        info!("Restored {} jobs and {} approvals from snapshot", jobs, approvals);
        Ok((jobs, approvals))
    }

    /// Persist every `interval` until `shutdown` fires, then once more.
    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        info!("Snapshot loop started (interval {:?})", interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.persist() {
                        error!("Periodic snapshot failed: {}", e);
                    }
                }
            }
        }

        match self.persist() {
            Ok(count) => info!("Final snapshot written ({} jobs)", count),
            Err(e) => error!("Final snapshot failed: {}", e),
        }
    }
}
