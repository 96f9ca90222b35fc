//! Shared harness for core integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use jobflow_core::recovery::ResettableResource;
use jobflow_core::{
    builtin_strategies, ApprovalGate, InMemoryJobStore, Job, JobStatus, JobStore, Listener,
    NotificationHub, Orchestrator, OrchestratorConfig, PipelineRegistry, RecoveryConfig,
    RecoveryCoordinator, Snapshotter, SqliteSnapshotStore,
};

/// A fully wired orchestrator over an in-memory store with a SQLite
/// snapshot file in a temporary directory.
pub struct Harness {
    pub store: Arc<InMemoryJobStore>,
    pub hub: Arc<NotificationHub>,
    pub gate: ApprovalGate,
    pub orchestrator: Arc<Orchestrator>,
    pub snapshot_store: Arc<SqliteSnapshotStore>,
    pub snapshotter: Snapshotter,
    pub dir: Arc<TempDir>,
}

impl Harness {
    pub fn new(pipelines: PipelineRegistry) -> Self {
        let dir = Arc::new(TempDir::new().expect("Failed to create temp dir"));
        Self::in_dir(dir, pipelines)
    }

    /// Build a fresh stack over an existing directory, as a restarted
    /// process would.
    pub fn in_dir(dir: Arc<TempDir>, pipelines: PipelineRegistry) -> Self {
        let store = Arc::new(InMemoryJobStore::new());
        let hub = Arc::new(NotificationHub::new(64));
        let gate = ApprovalGate::new(store.clone(), hub.clone(), Duration::from_secs(60));

        let snapshot_store = Arc::new(
            SqliteSnapshotStore::new(&dir.path().join("jobflow.db"))
                .expect("Failed to open snapshot store"),
        );
        let snapshotter = Snapshotter::new(store.clone(), gate.clone(), snapshot_store.clone());

        let resettable: Arc<dyn ResettableResource> = snapshot_store.clone();
        let strategies = builtin_strategies(
            store.clone(),
            hub.clone(),
            dir.path().join("work"),
            Some(resettable),
        );
        let recovery = Arc::new(
            RecoveryCoordinator::new(RecoveryConfig::default(), store.clone(), hub.clone())
                .with_strategies(strategies),
        );

        let orchestrator = Arc::new(Orchestrator::new(
            OrchestratorConfig {
                work_dir: dir.path().join("work"),
                ..OrchestratorConfig::default()
            },
            store.clone(),
            hub.clone(),
            gate.clone(),
            recovery,
            pipelines,
        ));

        Self {
            store,
            hub,
            gate,
            orchestrator,
            snapshot_store,
            snapshotter,
            dir,
        }
    }

    pub fn listen(&self, job_id: &str) -> Listener {
        let listener = self.hub.connect();
        self.hub.subscribe(job_id, listener.id());
        listener
    }

    pub fn job(&self, job_id: &str) -> Job {
        self.store
            .get(job_id)
            .expect("store error")
            .expect("job not found")
    }

    /// Poll until the job reaches `status` (tokio clock).
    pub async fn wait_for(&self, job_id: &str, status: JobStatus) -> Job {
        for _ in 0..5000 {
            let job = self.job(job_id);
            if job.status == status {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let job = self.job(job_id);
        panic!(
            "job {} stuck in {} while waiting for {}",
            job_id, job.status, status
        );
    }
}

/// Event names received so far.
pub fn drain(listener: &mut Listener) -> Vec<String> {
    std::iter::from_fn(|| listener.try_recv())
        .map(|e| e.event)
        .collect()
}
