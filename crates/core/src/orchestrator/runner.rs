//! Pipeline orchestrator implementation.
//!
//! Drives jobs through their pipeline:
//! - Each job runs as its own task, bounded by `max_concurrent_jobs`
//! - Stage failures go through the recovery coordinator
//! - Checkpoints suspend the job on the approval gate
//! - Background loops sweep stuck jobs and expire old ones

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::approval::{Approval, ApprovalError, ApprovalGate, ApprovalSpec, ApprovalStatus};
use crate::job::{
    CreateJobRequest, Job, JobError, JobFilter, JobStatus, JobStore, JobUpdate, StageResult,
    APPROVALS_KEY,
};
use crate::notify::{
    NotificationHub, PROCESSING_CANCELLED, PROCESSING_COMPLETED, PROCESSING_ERROR,
    PROCESSING_FAILED, PROCESSING_STARTED,
};
use crate::recovery::{RecoveryAction, RecoveryContext, RecoveryCoordinator};
use crate::stage::{PipelineRegistry, ProgressReporter, Stage, StageContext};

use super::config::OrchestratorConfig;
use super::types::{InterruptedSummary, OrchestratorError, OrchestratorStatus};

const INTERRUPTED: &str = "interrupted by restart";

/// How one pass over the pipeline ended.
enum PassOutcome {
    Completed(Vec<StageResult>),
    /// The job was requeued and the pipeline starts over.
    Retry,
    /// The job reached a final state (or left the orchestrator's hands).
    Halted,
}

/// How a checkpoint ended.
enum CheckpointOutcome {
    Continue,
    Halt,
}

type TaskMap = Arc<Mutex<HashMap<String, AbortHandle>>>;

fn lock_tasks(tasks: &TaskMap) -> MutexGuard<'_, HashMap<String, AbortHandle>> {
    tasks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Returns Ok(None) when a guarded update lost a race with another writer.
fn guarded(result: Result<Job, JobError>) -> Result<Option<Job>, OrchestratorError> {
    match result {
        Ok(job) => Ok(Some(job)),
        Err(JobError::StatusMismatch { .. }) | Err(JobError::Terminal { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// The pipeline orchestrator - the only component that drives job status
/// forward.
pub struct Orchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn JobStore>,
    hub: Arc<NotificationHub>,
    gate: ApprovalGate,
    recovery: Arc<RecoveryCoordinator>,
    pipelines: PipelineRegistry,

    // Runtime state
    slots: Arc<Semaphore>,
    tasks: TaskMap,
    running: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Create a new orchestrator.
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn JobStore>,
        hub: Arc<NotificationHub>,
        gate: ApprovalGate,
        recovery: Arc<RecoveryCoordinator>,
        pipelines: PipelineRegistry,
    ) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Self {
            config,
            store,
            hub,
            gate,
            recovery,
            pipelines,
            slots,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    pub fn gate(&self) -> &ApprovalGate {
        &self.gate
    }

    pub fn recovery(&self) -> &Arc<RecoveryCoordinator> {
        &self.recovery
    }

    pub fn pipelines(&self) -> &PipelineRegistry {
        &self.pipelines
    }

    fn job(&self, job_id: &str) -> Result<Job, OrchestratorError> {
        self.store
            .get(job_id)?
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.to_string()))
    }

    fn invalid(job: &Job, operation: &'static str) -> OrchestratorError {
        OrchestratorError::InvalidState {
            job_id: job.id.clone(),
            operation,
            actual: job.status,
        }
    }

    // ========================================================================
    // Job lifecycle
    // ========================================================================

    /// Create a job in `created` without starting it.
    pub fn create(&self, request: CreateJobRequest) -> Result<Job, OrchestratorError> {
        let job = self.store.create(request)?;
        info!("Created job {} (type {})", job.id, job.job_type);
        Ok(job)
    }

    /// Create a job and start its pipeline.
    pub fn submit(self: &Arc<Self>, request: CreateJobRequest) -> Result<Job, OrchestratorError> {
        let job = self.create(request)?;
        self.start(&job.id)
    }

    /// Record that the job's input has been uploaded.
    pub fn mark_uploaded(&self, job_id: &str) -> Result<Job, OrchestratorError> {
        let job = self.job(job_id)?;
        if job.status != JobStatus::Created {
            return Err(Self::invalid(&job, "mark uploaded"));
        }
        let update = JobUpdate::status(JobStatus::Uploaded)
            .with_step("uploaded")
            .expect_status(JobStatus::Created);
        guarded(self.store.update(job_id, update))?.ok_or_else(|| Self::invalid(&job, "mark uploaded"))
    }

    /// Queue a `created` or `uploaded` job and spawn its pipeline.
    ///
    /// A `queued` job without a live task (e.g. after a restart) is spawned
    /// again; one that already has a task is left alone.
    pub fn start(self: &Arc<Self>, job_id: &str) -> Result<Job, OrchestratorError> {
        if self.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }

        let job = self.job(job_id)?;
        let job = match job.status {
            JobStatus::Created | JobStatus::Uploaded => {
                let update = JobUpdate::status(JobStatus::Queued)
                    .with_step("queued")
                    .expect_status(job.status);
                guarded(self.store.update(job_id, update))?
                    .ok_or_else(|| Self::invalid(&job, "start"))?
            }
            JobStatus::Queued => job,
            _ => return Err(Self::invalid(&job, "start")),
        };

        self.spawn_run(&job.id);
        Ok(job)
    }

    /// Spawn the pipeline task for a job unless one is already live.
    fn spawn_run(self: &Arc<Self>, job_id: &str) -> bool {
        let mut tasks = lock_tasks(&self.tasks);
        if tasks.contains_key(job_id) {
            debug!("Job {} already has a pipeline task", job_id);
            return false;
        }

        let orchestrator = Arc::clone(self);
        let id = job_id.to_string();
        let handle = tokio::spawn(async move {
            orchestrator.run(&id).await;
            lock_tasks(&orchestrator.tasks).remove(&id);
        });
        tasks.insert(job_id.to_string(), handle.abort_handle());
        true
    }

    /// Run a job's pipeline to a final state.
    async fn run(&self, job_id: &str) {
        let _permit = tokio::select! {
            permit = self.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = self.shutdown.cancelled() => return,
        };

        if let Err(e) = self.drive(job_id).await {
            error!("Pipeline for job {} aborted: {}", job_id, e);
            self.fail(job_id, &e.to_string(), None).ok();
        }
    }

    async fn drive(&self, job_id: &str) -> Result<(), OrchestratorError> {
        loop {
            let job = self.job(job_id)?;
            if job.status != JobStatus::Queued {
                debug!("Job {} is {}, nothing to run", job_id, job.status);
                return Ok(());
            }

            let Some(stages) = self.pipelines.get(&job.job_type) else {
                let message = format!("no pipeline registered for job type '{}'", job.job_type);
                self.fail(job_id, &message, Some(JobStatus::Queued))?;
                return Ok(());
            };
            let stages = stages.to_vec();

            let update = JobUpdate::status(JobStatus::Processing)
                .with_step("starting")
                .expect_status(JobStatus::Queued);
            let Some(job) = guarded(self.store.update(job_id, update))? else {
                return Ok(());
            };

            let names: Vec<&str> = stages.iter().map(|s| s.name()).collect();
            self.hub.publish(
                job_id,
                PROCESSING_STARTED,
                json!({
                    "jobType": job.job_type,
                    "stages": names,
                    "retryCount": job.retry_count(),
                }),
            );
            info!(
                "Processing job {} (type {}, {} stages)",
                job_id,
                job.job_type,
                stages.len()
            );

            match self.run_pass(job_id, &stages).await? {
                PassOutcome::Completed(results) => {
                    self.complete(job_id, results)?;
                    return Ok(());
                }
                PassOutcome::Retry => continue,
                PassOutcome::Halted => return Ok(()),
            }
        }
    }

    async fn run_pass(
        &self,
        job_id: &str,
        stages: &[Arc<dyn Stage>],
    ) -> Result<PassOutcome, OrchestratorError> {
        let mut results: Vec<StageResult> = Vec::with_capacity(stages.len());

        for (index, stage) in stages.iter().enumerate() {
            let mut resumes = 0;
            let output = loop {
                let progress = ProgressReporter::new(
                    job_id,
                    stage.name(),
                    index,
                    stages.len(),
                    self.store.clone(),
                    self.hub.clone(),
                );
                let update = JobUpdate::new()
                    .with_step(stage.name())
                    .with_progress(progress.overall(0))
                    .expect_status(JobStatus::Processing);
                let Some(job) = guarded(self.store.update(job_id, update))? else {
                    return Ok(PassOutcome::Halted);
                };

                debug!("Job {} running stage {}", job_id, stage.name());
                let ctx = StageContext {
                    job,
                    previous: results.clone(),
                    progress,
                };
                let error = match stage.execute(ctx).await {
                    Ok(output) => break output,
                    Err(error) => error,
                };

                self.hub.publish(
                    job_id,
                    PROCESSING_ERROR,
                    json!({
                        "stage": stage.name(),
                        "error": error.message,
                        "retryable": error.retryable,
                    }),
                );
                warn!(
                    "Stage {} failed for job {}: {}",
                    stage.name(),
                    job_id,
                    error.message
                );

                let ctx = RecoveryContext::for_job(job_id).with_stage(stage.name());
                let result = self.recovery.handle(&error, &ctx).await;
                match result.action {
                    RecoveryAction::Resume if resumes < self.config.max_resumes_per_stage => {
                        resumes += 1;
                        info!(
                            "Resuming stage {} for job {} ({} of {})",
                            stage.name(),
                            job_id,
                            resumes,
                            self.config.max_resumes_per_stage
                        );
                    }
                    RecoveryAction::Fail => {
                        self.fail(job_id, &error.message, Some(JobStatus::Processing))?;
                        return Ok(PassOutcome::Halted);
                    }
                    RecoveryAction::Resume | RecoveryAction::Retry => {
                        return if self.recovery.retry_job(job_id, &error.message).await? {
                            Ok(PassOutcome::Retry)
                        } else {
                            Ok(PassOutcome::Halted)
                        };
                    }
                }
            };

            let job = self.job(job_id)?;
            if let Some(spec) = stage.checkpoint(&job, &output) {
                if let CheckpointOutcome::Halt = self.checkpoint(job_id, stage.name(), spec).await? {
                    return Ok(PassOutcome::Halted);
                }
            }

            results.push(StageResult {
                stage: stage.name().to_string(),
                output,
                completed_at: Utc::now(),
            });
        }

        Ok(PassOutcome::Completed(results))
    }

    /// Request an approval and suspend until it is answered.
    async fn checkpoint(
        &self,
        job_id: &str,
        stage: &str,
        spec: ApprovalSpec,
    ) -> Result<CheckpointOutcome, OrchestratorError> {
        let approval = match self.gate.request(job_id, spec) {
            Ok(approval) => approval,
            Err(ApprovalError::JobNotProcessing { .. }) => return Ok(CheckpointOutcome::Halt),
            Err(e) => return Err(e.into()),
        };
        let approval = self.gate.wait(&approval.id).await?;

        match approval.status {
            ApprovalStatus::Approve => Ok(CheckpointOutcome::Continue),
            ApprovalStatus::Modify => {
                self.record_modification(job_id, stage, &approval)?;
                Ok(CheckpointOutcome::Continue)
            }
            ApprovalStatus::Reject => {
                let mut message = format!("rejected by reviewer: {}", approval.title);
                if let Some(comment) = approval.response.as_ref().and_then(|r| r.comment.as_ref()) {
                    message.push_str(&format!(" ({})", comment));
                }
                self.fail(job_id, &message, Some(JobStatus::Processing))?;
                Ok(CheckpointOutcome::Halt)
            }
            // The gate already settled the job.
            ApprovalStatus::Timeout | ApprovalStatus::Cancelled | ApprovalStatus::Pending => {
                Ok(CheckpointOutcome::Halt)
            }
        }
    }

    fn record_modification(
        &self,
        job_id: &str,
        stage: &str,
        approval: &Approval,
    ) -> Result<(), OrchestratorError> {
        let job = self.job(job_id)?;
        let mut approvals: Map<String, Value> = job
            .metadata
            .get(APPROVALS_KEY)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let response = approval.response.as_ref();
        approvals.insert(
            stage.to_string(),
            json!({
                "approvalId": approval.id,
                "type": approval.approval_type,
                "decision": approval.status,
                "comment": response.and_then(|r| r.comment.clone()),
                "modifications": response.and_then(|r| r.modifications.clone()),
                "respondedAt": approval.responded_at,
            }),
        );
        let update = JobUpdate::new()
            .with_metadata(APPROVALS_KEY, Value::Object(approvals))
            .expect_status(JobStatus::Processing);
        guarded(self.store.update(job_id, update))?;
        Ok(())
    }

    fn complete(&self, job_id: &str, results: Vec<StageResult>) -> Result<(), OrchestratorError> {
        let stages: Vec<&str> = results.iter().map(|r| r.stage.as_str()).collect();
        let payload = json!({ "stages": stages });
        let update = JobUpdate::status(JobStatus::Completed)
            .with_progress(100)
            .with_step("completed")
            .clear_error()
            .with_results(results)
            .expect_status(JobStatus::Processing);
        if guarded(self.store.update(job_id, update))?.is_none() {
            debug!("Job {} left processing before completion", job_id);
            return Ok(());
        }

        self.recovery.clear_attempts(job_id);
        self.hub.publish(job_id, PROCESSING_COMPLETED, payload);
        info!("Job {} completed", job_id);
        Ok(())
    }

    /// Fail a job, optionally only if it is still in `expected`.
    fn fail(
        &self,
        job_id: &str,
        message: &str,
        expected: Option<JobStatus>,
    ) -> Result<(), OrchestratorError> {
        let mut update = JobUpdate::status(JobStatus::Failed)
            .with_error(message)
            .with_step("failed");
        if let Some(expected) = expected {
            update = update.expect_status(expected);
        }
        if guarded(self.store.update(job_id, update))?.is_none() {
            debug!("Job {} already moved on, not failing it", job_id);
            return Ok(());
        }

        self.recovery.clear_attempts(job_id);
        self.hub
            .publish(job_id, PROCESSING_FAILED, json!({ "error": message }));
        warn!("Job {} failed: {}", job_id, message);
        Ok(())
    }

    /// Cancel a job and stop its pipeline task.
    ///
    /// A job waiting for approval is cancelled through the gate so a timer
    /// firing at the same moment resolves to exactly one outcome.
    pub fn cancel(&self, job_id: &str, reason: &str) -> Result<Job, OrchestratorError> {
        let cancelled = loop {
            let job = self.job(job_id)?;
            if job.status.is_terminal() {
                return Err(Self::invalid(&job, "cancel"));
            }

            if let (JobStatus::AwaitingApproval, Some(approval_id)) =
                (job.status, job.pending_approval.as_deref())
            {
                match self.gate.cancel(approval_id, reason) {
                    Ok(_) => {
                        let job = self.job(job_id)?;
                        if job.status == JobStatus::Cancelled {
                            break job;
                        }
                        continue;
                    }
                    Err(ApprovalError::AlreadyResolved { .. }) | Err(ApprovalError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            let update = JobUpdate::status(JobStatus::Cancelled)
                .with_step("cancelled")
                .with_metadata("cancelReason", json!(reason))
                .expect_status(job.status);
            match self.store.update(job_id, update) {
                Ok(job) => break job,
                Err(JobError::StatusMismatch { .. }) | Err(JobError::Terminal { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        };

        if let Some(handle) = lock_tasks(&self.tasks).remove(job_id) {
            handle.abort();
        }
        self.recovery.clear_attempts(job_id);
        self.hub
            .publish(job_id, PROCESSING_CANCELLED, json!({ "reason": reason }));
        info!("Job {} cancelled: {}", job_id, reason);
        Ok(cancelled)
    }

    /// Stage outputs of a completed job.
    pub fn results(&self, job_id: &str) -> Result<Vec<StageResult>, OrchestratorError> {
        let job = self.job(job_id)?;
        if job.status != JobStatus::Completed {
            return Err(OrchestratorError::NotCompleted {
                job_id: job.id,
                status: job.status,
            });
        }
        Ok(job.results)
    }

    /// Settle work left over from a previous process after a snapshot
    /// restore.
    pub fn recover_interrupted(self: &Arc<Self>) -> Result<InterruptedSummary, OrchestratorError> {
        let mut summary = InterruptedSummary::default();

        for approval in self.gate.list(true) {
            match self.gate.abandon(&approval.id, INTERRUPTED) {
                Ok(_) => summary.approvals_cancelled += 1,
                Err(e) => debug!("Approval {} not abandoned: {}", approval.id, e),
            }
        }

        for status in [JobStatus::Processing, JobStatus::AwaitingApproval] {
            for job in self.store.list(&JobFilter::new().with_status(status))? {
                let update = JobUpdate::status(JobStatus::Failed)
                    .with_error(INTERRUPTED)
                    .with_step("failed")
                    .expect_status(status);
                if guarded(self.store.update(&job.id, update))?.is_some() {
                    self.hub
                        .publish(&job.id, PROCESSING_FAILED, json!({ "error": INTERRUPTED }));
                    summary.jobs_failed += 1;
                }
            }
        }

        for job in self.store.list(&JobFilter::new().with_status(JobStatus::Queued))? {
            if self.spawn_run(&job.id) {
                summary.jobs_requeued += 1;
            }
        }

        info!(
            "Recovered interrupted work: {} approvals cancelled, {} jobs failed, {} jobs requeued",
            summary.approvals_cancelled, summary.jobs_failed, summary.jobs_requeued
        );
        Ok(summary)
    }

    /// Delete terminal jobs older than `retention` along with their
    /// approvals.
    pub fn cleanup_expired(&self, retention: Duration) -> Result<usize, OrchestratorError> {
        let age = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let removed = self.store.cleanup_older_than(age, true)?;
        if removed.is_empty() {
            return Ok(0);
        }

        let approvals = self.gate.purge_jobs(&removed);
        for id in &removed {
            self.recovery.clear_attempts(id);
        }
        info!(
            "Cleaned up {} expired jobs ({} approvals)",
            removed.len(),
            approvals
        );
        Ok(removed.len())
    }

    // ========================================================================
    // Background loops
    // ========================================================================

    /// Start the watchdog and retention loops.
    pub fn spawn_maintenance(self: &Arc<Self>, retention: Duration, cleanup_interval: Duration) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Orchestrator already running");
            return;
        }

        info!("Starting orchestrator maintenance loops");
        self.spawn_watchdog_loop();
        self.spawn_retention_loop(retention, cleanup_interval);
    }

    fn spawn_watchdog_loop(&self) {
        let recovery = Arc::clone(&self.recovery);
        let tasks = Arc::clone(&self.tasks);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            recovery
                .run_watchdog(shutdown, move |ids| {
                    let mut tasks = lock_tasks(&tasks);
                    for id in ids {
                        if let Some(handle) = tasks.remove(id) {
                            handle.abort();
                        }
                    }
                })
                .await;
        });
    }

    fn spawn_retention_loop(self: &Arc<Self>, retention: Duration, interval: Duration) {
        let orchestrator = Arc::clone(self);
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            info!("Retention loop started");

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Retention loop received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = orchestrator.cleanup_expired(retention) {
                            warn!("Retention cleanup failed: {}", e);
                        }
                    }
                }
            }

            info!("Retention loop stopped");
        });
    }

    /// Stop background loops and abort every pipeline task.
    ///
    /// Jobs keep their current status; `recover_interrupted` settles them
    /// on the next start.
    pub fn stop(&self) {
        info!("Stopping orchestrator");
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.cancel();

        let mut tasks = lock_tasks(&self.tasks);
        let aborted = tasks.len();
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
        info!("Orchestrator stopped ({} pipeline tasks aborted)", aborted);
    }

    /// Get current orchestrator status.
    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            running: self.running.load(Ordering::SeqCst),
            active_tasks: lock_tasks(&self.tasks).len(),
            available_slots: self.slots.available_permits(),
            pipelines: self.pipelines.job_types(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::{ApprovalDecision, ApprovalReply};
    use crate::job::{InMemoryJobStore, RETRY_COUNT_KEY};
    use crate::notify::{Listener, PROCESSING_PROGRESS, PROCESSING_RETRY};
    use crate::recovery::{ErrorKind, RecoveryConfig, RecoveryStrategy, ResetSnapshotStore};
    use crate::stage::StageError;
    use crate::testing::{MockResource, MockStage};

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        hub: Arc<NotificationHub>,
        gate: ApprovalGate,
        orchestrator: Arc<Orchestrator>,
    }

    impl Fixture {
        fn new(pipelines: PipelineRegistry) -> Self {
            Self::with(pipelines, OrchestratorConfig::default(), Vec::new())
        }

        fn with(
            pipelines: PipelineRegistry,
            config: OrchestratorConfig,
            strategies: Vec<Arc<dyn RecoveryStrategy>>,
        ) -> Self {
            let store = Arc::new(InMemoryJobStore::new());
            let hub = Arc::new(NotificationHub::default());
            let gate = ApprovalGate::new(store.clone(), hub.clone(), Duration::from_secs(60));
            let recovery = Arc::new(
                RecoveryCoordinator::new(RecoveryConfig::default(), store.clone(), hub.clone())
                    .with_strategies(strategies),
            );
            let orchestrator = Arc::new(Orchestrator::new(
                config,
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
            }
        }

        fn listen(&self, job_id: &str) -> Listener {
            let listener = self.hub.connect();
            self.hub.subscribe(job_id, listener.id());
            listener
        }

        async fn wait_for(&self, job_id: &str, status: JobStatus) -> Job {
            for _ in 0..2000 {
                let job = self.store.get(job_id).unwrap().unwrap();
                if job.status == status {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            let job = self.store.get(job_id).unwrap().unwrap();
            panic!("job {} stuck in {} waiting for {}", job_id, job.status, status);
        }
    }

    fn events(listener: &mut Listener) -> Vec<String> {
        std::iter::from_fn(|| listener.try_recv()).map(|e| e.event).collect()
    }

    fn request(id: &str) -> CreateJobRequest {
        CreateJobRequest::new("doc").with_id(id)
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_runs_pipeline_to_completion() {
        let extract = Arc::new(MockStage::new("extract").with_progress(vec![50, 100]));
        let analyse = Arc::new(MockStage::new("analyse"));
        let fx = Fixture::new(
            PipelineRegistry::new().with_pipeline("doc", vec![extract.clone(), analyse.clone()]),
        );
        let mut listener = fx.listen("job-1");

        fx.orchestrator.submit(request("job-1")).unwrap();
        let job = fx.wait_for("job-1", JobStatus::Completed).await;

        assert_eq!(job.progress, 100);
        assert_eq!(job.results.len(), 2);
        assert_eq!(job.results[0].stage, "extract");
        assert_eq!(job.results[1].output, json!({ "stage": "analyse" }));
        assert_eq!(extract.call_count().await, 1);
        assert_eq!(analyse.call_count().await, 1);

        let events = events(&mut listener);
        assert_eq!(events.first().map(String::as_str), Some(PROCESSING_STARTED));
        assert_eq!(events.last().map(String::as_str), Some(PROCESSING_COMPLETED));
        assert_eq!(
            events.iter().filter(|e| *e == PROCESSING_PROGRESS).count(),
            2
        );
    }

    #[tokio::test]
    async fn test_create_and_mark_uploaded() {
        let fx = Fixture::new(PipelineRegistry::new());

        let job = fx.orchestrator.create(request("job-1")).unwrap();
        assert_eq!(job.status, JobStatus::Created);

        let job = fx.orchestrator.mark_uploaded("job-1").unwrap();
        assert_eq!(job.status, JobStatus::Uploaded);

        let err = fx.orchestrator.mark_uploaded("job-1").unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidState { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_pipeline_fails_job() {
        let fx = Fixture::new(PipelineRegistry::new());

        fx.orchestrator.submit(request("job-1")).unwrap();
        let job = fx.wait_for("job-1", JobStatus::Failed).await;

        assert_eq!(
            job.error.as_deref(),
            Some("no pipeline registered for job type 'doc'")
        );
    }

    #[tokio::test]
    async fn test_start_rejects_running_job() {
        let fx = Fixture::new(PipelineRegistry::new());
        crate::testing::fixtures::job_in_status(
            fx.store.as_ref(),
            "job-1",
            "doc",
            JobStatus::Processing,
        )
        .unwrap();

        let err = fx.orchestrator.start("job-1").unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::InvalidState {
                actual: JobStatus::Processing,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_approve_continues() {
        let review = Arc::new(
            MockStage::new("analyse")
                .with_checkpoint(ApprovalSpec::new("analysis_review", "Review analysis")),
        );
        let generate = Arc::new(MockStage::new("generate"));
        let fx = Fixture::new(
            PipelineRegistry::new().with_pipeline("doc", vec![review, generate.clone()]),
        );

        fx.orchestrator.submit(request("job-1")).unwrap();
        let job = fx.wait_for("job-1", JobStatus::AwaitingApproval).await;
        assert_eq!(generate.call_count().await, 0);

        let approval_id = job.pending_approval.unwrap();
        let approval = fx.gate.get(&approval_id).unwrap();
        assert_eq!(approval.data, json!({ "stage": "analyse" }));

        fx.gate
            .respond(&approval_id, ApprovalReply::new(ApprovalDecision::Approve))
            .unwrap();
        let job = fx.wait_for("job-1", JobStatus::Completed).await;

        assert_eq!(generate.call_count().await, 1);
        assert!(job.metadata.get(APPROVALS_KEY).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_modify_is_recorded() {
        let review = Arc::new(
            MockStage::new("analyse")
                .with_checkpoint(ApprovalSpec::new("analysis_review", "Review analysis")),
        );
        let generate = Arc::new(MockStage::new("generate"));
        let fx = Fixture::new(
            PipelineRegistry::new().with_pipeline("doc", vec![review, generate.clone()]),
        );

        fx.orchestrator.submit(request("job-1")).unwrap();
        let job = fx.wait_for("job-1", JobStatus::AwaitingApproval).await;
        fx.gate
            .respond(
                &job.pending_approval.unwrap(),
                ApprovalReply::new(ApprovalDecision::Modify)
                    .with_modifications(json!({ "tone": "formal" })),
            )
            .unwrap();
        let job = fx.wait_for("job-1", JobStatus::Completed).await;

        let recorded = &job.metadata[APPROVALS_KEY]["analyse"];
        assert_eq!(recorded["decision"], "modify");
        assert_eq!(recorded["modifications"], json!({ "tone": "formal" }));

        // The next stage ran with the recorded modification visible.
        let seen = generate.recorded_jobs().await;
        assert_eq!(
            seen[0].metadata[APPROVALS_KEY]["analyse"]["modifications"]["tone"],
            "formal"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_checkpoint_reject_fails_job() {
        let review = Arc::new(
            MockStage::new("analyse")
                .with_checkpoint(ApprovalSpec::new("analysis_review", "Review analysis")),
        );
        let generate = Arc::new(MockStage::new("generate"));
        let fx = Fixture::new(
            PipelineRegistry::new().with_pipeline("doc", vec![review, generate.clone()]),
        );

        fx.orchestrator.submit(request("job-1")).unwrap();
        let job = fx.wait_for("job-1", JobStatus::AwaitingApproval).await;
        fx.gate
            .respond(
                &job.pending_approval.unwrap(),
                ApprovalReply::new(ApprovalDecision::Reject).with_comment("wrong document"),
            )
            .unwrap();
        let job = fx.wait_for("job-1", JobStatus::Failed).await;

        assert_eq!(
            job.error.as_deref(),
            Some("rejected by reviewer: Review analysis (wrong document)")
        );
        assert_eq!(generate.call_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_awaiting_approval() {
        let review = Arc::new(
            MockStage::new("analyse")
                .with_checkpoint(ApprovalSpec::new("analysis_review", "Review analysis")),
        );
        let fx = Fixture::new(PipelineRegistry::new().with_pipeline("doc", vec![review]));
        let mut listener = fx.listen("job-1");

        fx.orchestrator.submit(request("job-1")).unwrap();
        let job = fx.wait_for("job-1", JobStatus::AwaitingApproval).await;
        let approval_id = job.pending_approval.unwrap();

        let job = fx.orchestrator.cancel("job-1", "user request").unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.pending_approval.is_none());
        assert_eq!(job.metadata["cancelReason"], "user request");

        let approval = fx.gate.get(&approval_id).unwrap();
        assert_eq!(approval.status, ApprovalStatus::Cancelled);
        assert!(events(&mut listener).contains(&PROCESSING_CANCELLED.to_string()));

        // A second cancel is rejected.
        assert!(fx.orchestrator.cancel("job-1", "again").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_processing_aborts_task() {
        let slow = Arc::new(MockStage::new("extract").with_delay(Duration::from_secs(30)));
        let after = Arc::new(MockStage::new("analyse"));
        let fx = Fixture::new(
            PipelineRegistry::new().with_pipeline("doc", vec![slow.clone(), after.clone()]),
        );

        fx.orchestrator.submit(request("job-1")).unwrap();
        fx.wait_for("job-1", JobStatus::Processing).await;
        assert_eq!(fx.orchestrator.status().active_tasks, 1);

        fx.orchestrator.cancel("job-1", "user request").unwrap();
        assert_eq!(fx.orchestrator.status().active_tasks, 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        let job = fx.store.get("job-1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(after.call_count().await, 0);
        assert_eq!(fx.orchestrator.status().available_slots, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_results_only_when_completed() {
        let review = Arc::new(
            MockStage::new("analyse")
                .with_checkpoint(ApprovalSpec::new("analysis_review", "Review analysis")),
        );
        let fx = Fixture::new(PipelineRegistry::new().with_pipeline("doc", vec![review]));

        fx.orchestrator.submit(request("job-1")).unwrap();
        let job = fx.wait_for("job-1", JobStatus::AwaitingApproval).await;
        let err = fx.orchestrator.results("job-1").unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::NotCompleted {
                status: JobStatus::AwaitingApproval,
                ..
            }
        ));

        fx.gate
            .respond(
                &job.pending_approval.unwrap(),
                ApprovalReply::new(ApprovalDecision::Approve),
            )
            .unwrap();
        fx.wait_for("job-1", JobStatus::Completed).await;

        let results = fx.orchestrator.results("job-1").unwrap();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            fx.orchestrator.results("missing"),
            Err(OrchestratorError::JobNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovered_failure_resumes_stage() {
        let resource = Arc::new(MockResource::new("snapshot-store"));
        let strategies: Vec<Arc<dyn RecoveryStrategy>> =
            vec![Arc::new(ResetSnapshotStore::new(resource.clone()))];
        let stage = Arc::new(MockStage::new("analyse"));
        stage
            .fail_next(StageError::new("database is locked").with_kind(ErrorKind::Database))
            .await;
        let fx = Fixture::with(
            PipelineRegistry::new().with_pipeline("doc", vec![stage.clone()]),
            OrchestratorConfig::default(),
            strategies,
        );

        fx.orchestrator.submit(request("job-1")).unwrap();
        let job = fx.wait_for("job-1", JobStatus::Completed).await;

        assert_eq!(stage.call_count().await, 2);
        assert_eq!(resource.reset_count(), 1);
        assert_eq!(job.retry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_budget_falls_back_to_retry() {
        let resource = Arc::new(MockResource::new("snapshot-store"));
        let strategies: Vec<Arc<dyn RecoveryStrategy>> =
            vec![Arc::new(ResetSnapshotStore::new(resource.clone()))];
        let stage = Arc::new(MockStage::new("analyse"));
        for _ in 0..2 {
            stage
                .fail_next(StageError::new("database is locked").with_kind(ErrorKind::Database))
                .await;
        }
        let config = OrchestratorConfig {
            max_resumes_per_stage: 1,
            ..OrchestratorConfig::default()
        };
        let fx = Fixture::with(
            PipelineRegistry::new().with_pipeline("doc", vec![stage.clone()]),
            config,
            strategies,
        );
        let mut listener = fx.listen("job-1");

        fx.orchestrator.submit(request("job-1")).unwrap();
        let job = fx.wait_for("job-1", JobStatus::Completed).await;

        assert_eq!(stage.call_count().await, 3);
        assert_eq!(job.retry_count(), 1);
        assert!(events(&mut listener).contains(&PROCESSING_RETRY.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_every_attempt_exhausts_retries() {
        let stage = Arc::new(MockStage::new("analyse"));
        stage.fail_always(StageError::new("something odd happened")).await;
        let fx = Fixture::new(PipelineRegistry::new().with_pipeline("doc", vec![stage.clone()]));

        fx.orchestrator.submit(request("job-1")).unwrap();
        let job = fx.wait_for("job-1", JobStatus::Failed).await;

        assert_eq!(job.metadata[RETRY_COUNT_KEY], 3);
        assert_eq!(stage.call_count().await, 3);
        assert_eq!(
            job.error.as_deref(),
            Some("max retries exceeded after 3 attempts: something odd happened")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_stage_error_fails_immediately() {
        let stage = Arc::new(MockStage::new("analyse"));
        stage.fail_next(StageError::fatal("input is not a document")).await;
        let fx = Fixture::new(PipelineRegistry::new().with_pipeline("doc", vec![stage.clone()]));

        fx.orchestrator.submit(request("job-1")).unwrap();
        let job = fx.wait_for("job-1", JobStatus::Failed).await;

        assert_eq!(stage.call_count().await, 1);
        assert_eq!(job.retry_count(), 0);
        assert_eq!(job.error.as_deref(), Some("input is not a document"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let slow = Arc::new(MockStage::new("extract").with_delay(Duration::from_secs(10)));
        let config = OrchestratorConfig {
            max_concurrent_jobs: 1,
            ..OrchestratorConfig::default()
        };
        let fx = Fixture::with(
            PipelineRegistry::new().with_pipeline("doc", vec![slow.clone()]),
            config,
            Vec::new(),
        );

        fx.orchestrator.submit(request("job-1")).unwrap();
        fx.orchestrator.submit(request("job-2")).unwrap();
        fx.wait_for("job-1", JobStatus::Processing).await;

        let status = fx.orchestrator.status();
        assert_eq!(status.active_tasks, 2);
        assert_eq!(status.available_slots, 0);
        assert_eq!(
            fx.store.get("job-2").unwrap().unwrap().status,
            JobStatus::Queued
        );

        fx.wait_for("job-1", JobStatus::Completed).await;
        fx.wait_for("job-2", JobStatus::Completed).await;
        assert_eq!(slow.call_count().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_interrupted() {
        let stage = Arc::new(MockStage::new("extract"));
        let fx = Fixture::new(PipelineRegistry::new().with_pipeline("doc", vec![stage.clone()]));
        let store = fx.store.as_ref();
        crate::testing::fixtures::job_in_status(store, "processing", "doc", JobStatus::Processing)
            .unwrap();
        crate::testing::fixtures::job_in_status(store, "queued", "doc", JobStatus::Queued).unwrap();
        crate::testing::fixtures::job_in_status(store, "waiting", "doc", JobStatus::Processing)
            .unwrap();
        let approval = fx
            .gate
            .request("waiting", ApprovalSpec::new("analysis_review", "Review"))
            .unwrap();

        let summary = fx.orchestrator.recover_interrupted().unwrap();
        assert_eq!(
            summary,
            InterruptedSummary {
                approvals_cancelled: 1,
                jobs_failed: 2,
                jobs_requeued: 1,
            }
        );

        for id in ["processing", "waiting"] {
            let job = fx.store.get(id).unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Failed);
            assert_eq!(job.error.as_deref(), Some(INTERRUPTED));
        }
        assert_eq!(
            fx.gate.get(&approval.id).unwrap().status,
            ApprovalStatus::Cancelled
        );
        fx.wait_for("queued", JobStatus::Completed).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_expired_purges_approvals() {
        let review = Arc::new(
            MockStage::new("analyse")
                .with_checkpoint(ApprovalSpec::new("analysis_review", "Review analysis")),
        );
        let fx = Fixture::new(PipelineRegistry::new().with_pipeline("doc", vec![review]));

        fx.orchestrator.submit(request("job-1")).unwrap();
        let job = fx.wait_for("job-1", JobStatus::AwaitingApproval).await;
        let approval_id = job.pending_approval.unwrap();
        fx.orchestrator.cancel("job-1", "done").unwrap();

        // Not old enough yet.
        assert_eq!(fx.orchestrator.cleanup_expired(Duration::from_secs(3600)).unwrap(), 0);

        assert_eq!(fx.orchestrator.cleanup_expired(Duration::ZERO).unwrap(), 1);
        assert!(fx.store.get("job-1").unwrap().is_none());
        assert!(fx.gate.get(&approval_id).is_none());
    }

    #[tokio::test]
    async fn test_stop_refuses_new_work() {
        let fx = Fixture::new(PipelineRegistry::new());
        fx.orchestrator.create(request("job-1")).unwrap();

        fx.orchestrator.spawn_maintenance(Duration::from_secs(3600), Duration::from_secs(60));
        assert!(fx.orchestrator.status().running);

        fx.orchestrator.stop();
        assert!(!fx.orchestrator.status().running);
        assert!(matches!(
            fx.orchestrator.start("job-1"),
            Err(OrchestratorError::ShuttingDown)
        ));
    }
}
