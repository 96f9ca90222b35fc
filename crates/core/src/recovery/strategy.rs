//! Named recovery strategies and the built-in set.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{ErrorKind, RecoveryContext};
use crate::job::{
    JobFilter, JobStatus, JobStore, JobUpdate, FALLBACK_MODE_KEY, TIMEOUT_MULTIPLIER_KEY,
};
use crate::notify::{NotificationHub, PROCESSING_CANCELLED};

/// Result of running a strategy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyOutcome {
    /// True when the failing work can resume as is.
    pub recovered: bool,
    pub detail: String,
}

impl StrategyOutcome {
    pub fn recovered(detail: impl Into<String>) -> Self {
        Self {
            recovered: true,
            detail: detail.into(),
        }
    }

    pub fn not_recovered(detail: impl Into<String>) -> Self {
        Self {
            recovered: false,
            detail: detail.into(),
        }
    }
}

/// A side-effecting remedy for one kind of failure.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    /// Unique name, used for manual triggering.
    fn name(&self) -> &str;

    fn kind(&self) -> ErrorKind;

    fn description(&self) -> &str;

    async fn recover(&self, message: &str, ctx: &RecoveryContext) -> StrategyOutcome;
}

/// Something that can drop and re-establish its connection.
pub trait ResettableResource: Send + Sync {
    fn name(&self) -> &str;

    fn reset(&self) -> Result<(), String>;
}

/// Cancels queued low-priority jobs to relieve memory pressure.
pub struct ShedLowPriority {
    store: Arc<dyn JobStore>,
    hub: Arc<NotificationHub>,
}

impl ShedLowPriority {
    pub fn new(store: Arc<dyn JobStore>, hub: Arc<NotificationHub>) -> Self {
        Self { store, hub }
    }
}

#[async_trait]
impl RecoveryStrategy for ShedLowPriority {
    fn name(&self) -> &str {
        "shed-low-priority"
    }

    fn kind(&self) -> ErrorKind {
        ErrorKind::Memory
    }

    fn description(&self) -> &str {
        "Cancel queued jobs whose metadata.priority is \"low\""
    }

    async fn recover(&self, _message: &str, ctx: &RecoveryContext) -> StrategyOutcome {
        let queued = match self
            .store
            .list(&JobFilter::new().with_status(JobStatus::Queued))
        {
            Ok(jobs) => jobs,
            Err(e) => return StrategyOutcome::not_recovered(format!("cannot list jobs: {}", e)),
        };

        let mut shed = 0;
        for job in queued
            .iter()
            .filter(|j| j.priority() == Some("low") && ctx.job_id.as_deref() != Some(j.id.as_str()))
        {
            let update = JobUpdate::status(JobStatus::Cancelled)
                .with_step("cancelled")
                .with_metadata("cancelReason", json!("shed under memory pressure"))
                .expect_status(JobStatus::Queued);
            match self.store.update(&job.id, update) {
                Ok(_) => {
                    shed += 1;
                    self.hub.publish(
                        &job.id,
                        PROCESSING_CANCELLED,
                        json!({ "reason": "shed under memory pressure" }),
                    );
                }
                Err(e) => warn!("Could not shed job {}: {}", job.id, e),
            }
        }

        if shed == 0 {
            StrategyOutcome::not_recovered("no low-priority jobs to shed")
        } else {
            info!("Shed {} low-priority jobs", shed);
            StrategyOutcome::recovered(format!("cancelled {} low-priority jobs", shed))
        }
    }
}

/// Reopens the snapshot database connection.
pub struct ResetSnapshotStore {
    resource: Arc<dyn ResettableResource>,
}

impl ResetSnapshotStore {
    pub fn new(resource: Arc<dyn ResettableResource>) -> Self {
        Self { resource }
    }
}

#[async_trait]
impl RecoveryStrategy for ResetSnapshotStore {
    fn name(&self) -> &str {
        "reset-snapshot-store"
    }

    fn kind(&self) -> ErrorKind {
        ErrorKind::Database
    }

    fn description(&self) -> &str {
        "Reopen the snapshot database connection"
    }

    async fn recover(&self, _message: &str, _ctx: &RecoveryContext) -> StrategyOutcome {
        match self.resource.reset() {
            Ok(()) => StrategyOutcome::recovered(format!("{} reset", self.resource.name())),
            Err(e) => StrategyOutcome::not_recovered(format!(
                "{} reset failed: {}",
                self.resource.name(),
                e
            )),
        }
    }
}

/// Drops hub listeners whose connection is gone.
pub struct PruneListeners {
    hub: Arc<NotificationHub>,
}

impl PruneListeners {
    pub fn new(hub: Arc<NotificationHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl RecoveryStrategy for PruneListeners {
    fn name(&self) -> &str {
        "prune-listeners"
    }

    fn kind(&self) -> ErrorKind {
        ErrorKind::Websocket
    }

    fn description(&self) -> &str {
        "Remove notification listeners with closed connections"
    }

    async fn recover(&self, _message: &str, _ctx: &RecoveryContext) -> StrategyOutcome {
        let pruned = self.hub.prune_closed();
        StrategyOutcome::recovered(format!("pruned {} closed listeners", pruned))
    }
}

/// Recreates the work directory and checks it is writable.
pub struct PrepareWorkDir {
    dir: PathBuf,
}

impl PrepareWorkDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl RecoveryStrategy for PrepareWorkDir {
    fn name(&self) -> &str {
        "prepare-work-dir"
    }

    fn kind(&self) -> ErrorKind {
        ErrorKind::Filesystem
    }

    fn description(&self) -> &str {
        "Recreate the work directory and check that it is writable"
    }

    async fn recover(&self, _message: &str, _ctx: &RecoveryContext) -> StrategyOutcome {
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            return StrategyOutcome::not_recovered(format!(
                "cannot create {}: {}",
                self.dir.display(),
                e
            ));
        }

        let check = self.dir.join(".jobflow-write-check");
        if let Err(e) = tokio::fs::write(&check, b"ok").await {
            return StrategyOutcome::not_recovered(format!(
                "{} is not writable: {}",
                self.dir.display(),
                e
            ));
        }
        if let Err(e) = tokio::fs::remove_file(&check).await {
            debug!("Could not remove {}: {}", check.display(), e);
        }

        StrategyOutcome::recovered(format!("{} is writable", self.dir.display()))
    }
}

/// Switches the job to fallback parameters for its next attempt.
///
/// Never reports recovery: the adjusted job still has to go through the
/// regular retry path.
pub struct FallbackMode {
    store: Arc<dyn JobStore>,
}

impl FallbackMode {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl RecoveryStrategy for FallbackMode {
    fn name(&self) -> &str {
        "fallback-mode"
    }

    fn kind(&self) -> ErrorKind {
        ErrorKind::AiTimeout
    }

    fn description(&self) -> &str {
        "Enable fallbackMode and double timeoutMultiplier before retrying"
    }

    async fn recover(&self, _message: &str, ctx: &RecoveryContext) -> StrategyOutcome {
        let Some(job_id) = ctx.job_id.as_deref() else {
            return StrategyOutcome::not_recovered("no job to adjust");
        };
        let job = match self.store.get(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => return StrategyOutcome::not_recovered(format!("job {} not found", job_id)),
            Err(e) => return StrategyOutcome::not_recovered(e.to_string()),
        };

        let multiplier = job
            .metadata
            .get(TIMEOUT_MULTIPLIER_KEY)
            .and_then(|v| v.as_f64())
            .unwrap_or(1.0)
            * 2.0;
        let update = JobUpdate::new()
            .with_metadata(FALLBACK_MODE_KEY, json!(true))
            .with_metadata(TIMEOUT_MULTIPLIER_KEY, json!(multiplier));
        match self.store.update(job_id, update) {
            Ok(_) => StrategyOutcome::not_recovered(format!(
                "fallback mode enabled, timeout multiplier {}",
                multiplier
            )),
            Err(e) => StrategyOutcome::not_recovered(format!("cannot adjust job: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{CreateJobRequest, InMemoryJobStore};
    use crate::testing::MockResource;
    use tempfile::TempDir;

    fn queued(store: &InMemoryJobStore, id: &str, priority: Option<&str>) {
        let mut request = CreateJobRequest::new("doc").with_id(id);
        if let Some(priority) = priority {
            request = request.with_metadata("priority", json!(priority));
        }
        store.create(request).unwrap();
        store
            .update(id, JobUpdate::status(JobStatus::Queued))
            .unwrap();
    }

    #[tokio::test]
    async fn test_shed_low_priority_cancels_only_low_queued_jobs() {
        let store = Arc::new(InMemoryJobStore::new());
        let hub = Arc::new(NotificationHub::default());
        queued(&store, "low-1", Some("low"));
        queued(&store, "low-2", Some("low"));
        queued(&store, "normal", None);
        queued(&store, "high", Some("high"));

        let strategy = ShedLowPriority::new(store.clone(), hub);
        let outcome = strategy
            .recover("out of memory", &RecoveryContext::default())
            .await;

        assert!(outcome.recovered);
        for id in ["low-1", "low-2"] {
            assert_eq!(store.get(id).unwrap().unwrap().status, JobStatus::Cancelled);
        }
        for id in ["normal", "high"] {
            assert_eq!(store.get(id).unwrap().unwrap().status, JobStatus::Queued);
        }
    }

    #[tokio::test]
    async fn test_shed_with_nothing_to_shed_is_not_recovered() {
        let store = Arc::new(InMemoryJobStore::new());
        queued(&store, "normal", None);
        let strategy = ShedLowPriority::new(store, Arc::new(NotificationHub::default()));
        let outcome = strategy.recover("oom", &RecoveryContext::default()).await;
        assert!(!outcome.recovered);
    }

    #[tokio::test]
    async fn test_reset_snapshot_store_reports_resource_result() {
        let resource = Arc::new(MockResource::new("db"));
        let strategy = ResetSnapshotStore::new(resource.clone());

        assert!(strategy.recover("db", &RecoveryContext::default()).await.recovered);
        assert_eq!(resource.reset_count(), 1);

        resource.set_fail(true);
        let outcome = strategy.recover("db", &RecoveryContext::default()).await;
        assert!(!outcome.recovered);
        assert!(outcome.detail.contains("reset failed"));
    }

    #[tokio::test]
    async fn test_prune_listeners() {
        let hub = Arc::new(NotificationHub::default());
        let _alive = hub.connect();
        drop(hub.connect());

        let outcome = PruneListeners::new(hub.clone())
            .recover("websocket closed", &RecoveryContext::default())
            .await;
        assert!(outcome.recovered);
        assert_eq!(hub.listener_count(), 1);
    }

    #[tokio::test]
    async fn test_prepare_work_dir_creates_directory() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("work").join("nested");
        let outcome = PrepareWorkDir::new(&dir)
            .recover("ENOENT", &RecoveryContext::default())
            .await;
        assert!(outcome.recovered, "{}", outcome.detail);
        assert!(dir.is_dir());
        assert!(!dir.join(".jobflow-write-check").exists());
    }

    #[tokio::test]
    async fn test_prepare_work_dir_fails_when_path_is_a_file() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("occupied");
        std::fs::write(&file, b"x").unwrap();
        let outcome = PrepareWorkDir::new(&file)
            .recover("ENOENT", &RecoveryContext::default())
            .await;
        assert!(!outcome.recovered);
    }

    #[tokio::test]
    async fn test_fallback_mode_adjusts_job_without_recovering() {
        let store = Arc::new(InMemoryJobStore::new());
        queued(&store, "job-1", None);
        let strategy = FallbackMode::new(store.clone());
        let ctx = RecoveryContext::for_job("job-1");

        let outcome = strategy.recover("model timeout", &ctx).await;
        assert!(!outcome.recovered);
        let job = store.get("job-1").unwrap().unwrap();
        assert!(job.fallback_mode());
        assert_eq!(job.metadata[TIMEOUT_MULTIPLIER_KEY], json!(2.0));

        strategy.recover("model timeout", &ctx).await;
        let job = store.get("job-1").unwrap().unwrap();
        assert_eq!(job.metadata[TIMEOUT_MULTIPLIER_KEY], json!(4.0));
    }

    #[tokio::test]
    async fn test_fallback_mode_needs_a_job() {
        let strategy = FallbackMode::new(Arc::new(InMemoryJobStore::new()));
        let outcome = strategy
            .recover("model timeout", &RecoveryContext::default())
            .await;
        assert_eq!(outcome.detail, "no job to adjust");
    }
}
