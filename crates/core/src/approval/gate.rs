//! Approval gate: pending human decisions with cancellable timeouts.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Approval, ApprovalDecision, ApprovalError, ApprovalReply, ApprovalResponse, ApprovalSpec,
    ApprovalStatus,
};
use crate::job::{JobError, JobStatus, JobStore, JobUpdate};
use crate::notify::{
    NotificationHub, APPROVAL_CANCELLED, APPROVAL_NEW, APPROVAL_REQUESTED, APPROVAL_RESPONDED,
    APPROVAL_TIMEOUT, PROCESSING_FAILED,
};

struct Entry {
    approval: Approval,
    timer: Option<CancellationToken>,
    done: watch::Sender<Option<Approval>>,
}

impl Entry {
    fn new(approval: Approval, timer: Option<CancellationToken>) -> Self {
        let settled = approval.status.is_terminal().then(|| approval.clone());
        let (done, _) = watch::channel(settled);
        Self {
            approval,
            timer,
            done,
        }
    }

    /// Move a pending request to its terminal status and wake waiters.
    fn settle(
        &mut self,
        status: ApprovalStatus,
        response: Option<ApprovalResponse>,
        reason: Option<String>,
    ) -> Approval {
        self.approval.status = status;
        self.approval.responded_at = Some(Utc::now());
        self.approval.response = response;
        self.approval.reason = reason;
        if let Some(timer) = self.timer.take() {
            timer.cancel();
        }
        self.done.send_replace(Some(self.approval.clone()));
        self.approval.clone()
    }
}

fn ensure_pending(approval: &Approval) -> Result<(), ApprovalError> {
    if approval.status.is_terminal() {
        return Err(ApprovalError::AlreadyResolved {
            approval_id: approval.id.clone(),
            status: approval.status,
        });
    }
    Ok(())
}

/// Manages outstanding approval requests tied to jobs.
///
/// Transitions out of `pending` happen under the table lock, so when a
/// response, a cancel and the timer race exactly one of them wins and the
/// others see `AlreadyResolved`.
#[derive(Clone)]
pub struct ApprovalGate {
    store: Arc<dyn JobStore>,
    hub: Arc<NotificationHub>,
    default_timeout_ms: u64,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
}

impl ApprovalGate {
    pub fn new(
        store: Arc<dyn JobStore>,
        hub: Arc<NotificationHub>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            store,
            hub,
            default_timeout_ms: default_timeout.as_millis() as u64,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open an approval for a processing job and move it to `awaiting_approval`.
    pub fn request(&self, job_id: &str, spec: ApprovalSpec) -> Result<Approval, ApprovalError> {
        let job = self
            .store
            .get(job_id)?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;

        let timeout_ms = spec.timeout_ms.unwrap_or(self.default_timeout_ms);
        let mut options = spec.options;
        if options.is_empty() {
            options = ApprovalDecision::ALL.to_vec();
        }

        let approval = Approval {
            id: Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            approval_type: spec.approval_type,
            title: spec.title,
            description: spec.description,
            options,
            data: spec.data,
            status: ApprovalStatus::Pending,
            requested_at: Utc::now(),
            responded_at: None,
            timeout_ms,
            response: None,
            reason: None,
        };

        let token = CancellationToken::new();
        {
            let mut entries = self.lock();
            if let Some(existing) = entries
                .values()
                .find(|e| e.approval.job_id == job_id && e.approval.is_pending())
            {
                return Err(ApprovalError::AlreadyPending {
                    job_id: job_id.to_string(),
                    approval_id: existing.approval.id.clone(),
                });
            }
            if job.status != JobStatus::Processing {
                return Err(ApprovalError::JobNotProcessing {
                    job_id: job_id.to_string(),
                    status: job.status,
                });
            }

            let update = JobUpdate::status(JobStatus::AwaitingApproval)
                .with_pending_approval(&approval.id)
                .with_step(format!("awaiting approval: {}", approval.title))
                .expect_status(JobStatus::Processing);
            self.store
                .update(job_id, update)
                .map_err(|e| match e {
                    JobError::StatusMismatch { job_id, actual, .. } => {
                        ApprovalError::JobNotProcessing {
                            job_id,
                            status: actual,
                        }
                    }
                    other => ApprovalError::Job(other),
                })?;

            entries.insert(
                approval.id.clone(),
                Entry::new(approval.clone(), Some(token.clone())),
            );
        }

        self.arm_timer(
            approval.id.clone(),
            Duration::from_millis(timeout_ms),
            token,
        );

        let payload = serde_json::to_value(&approval).unwrap_or_default();
        self.hub
            .publish(job_id, APPROVAL_REQUESTED, payload.clone());
        self.hub.broadcast(APPROVAL_NEW, payload);

        info!(
            "Approval {} requested for job {} ({}), timeout {}ms",
            approval.id, job_id, approval.approval_type, timeout_ms
        );
        Ok(approval)
    }

    fn arm_timer(&self, approval_id: String, timeout: Duration, token: CancellationToken) {
        let deadline = Instant::now() + timeout;
        let gate = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Timer for approval {} disarmed", approval_id);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    gate.expire(&approval_id);
                }
            }
        });
    }

    /// Record a reviewer's decision and return the job to `processing`.
    pub fn respond(
        &self,
        approval_id: &str,
        reply: ApprovalReply,
    ) -> Result<Approval, ApprovalError> {
        let approval = {
            let mut entries = self.lock();
            let entry = entries
                .get_mut(approval_id)
                .ok_or_else(|| ApprovalError::NotFound(approval_id.to_string()))?;
            ensure_pending(&entry.approval)?;
            if !entry.approval.options.contains(&reply.decision) {
                return Err(ApprovalError::InvalidDecision {
                    approval_id: approval_id.to_string(),
                    decision: reply.decision,
                });
            }

            let latency_ms = (Utc::now() - entry.approval.requested_at)
                .num_milliseconds()
                .max(0) as u64;
            let response = ApprovalResponse {
                decision: reply.decision,
                comment: reply.comment,
                modifications: reply.modifications,
                latency_ms,
            };

            // The job moves before waiters wake so they see it processing.
            let update = JobUpdate::status(JobStatus::Processing)
                .with_step(format!("approval {}: {}", reply.decision, entry.approval.title))
                .expect_status(JobStatus::AwaitingApproval);
            if let Err(e) = self.store.update(&entry.approval.job_id, update) {
                warn!(
                    "Approval {} answered but job {} was not updated: {}",
                    approval_id, entry.approval.job_id, e
                );
            }
            entry.settle(reply.decision.into(), Some(response), None)
        };

        let response = approval.response.as_ref();
        self.hub.publish(
            &approval.job_id,
            APPROVAL_RESPONDED,
            json!({
                "approvalId": approval.id,
                "decision": reply.decision,
                "comment": response.and_then(|r| r.comment.clone()),
                "latencyMs": response.map(|r| r.latency_ms),
            }),
        );

        info!(
            "Approval {} for job {} answered: {}",
            approval.id, approval.job_id, reply.decision
        );
        Ok(approval)
    }

    /// Cancel a pending approval and the job waiting on it.
    pub fn cancel(&self, approval_id: &str, reason: &str) -> Result<Approval, ApprovalError> {
        let update = JobUpdate::status(JobStatus::Cancelled)
            .with_step("cancelled")
            .with_metadata("cancelReason", json!(reason))
            .expect_status(JobStatus::AwaitingApproval);
        self.close(approval_id, reason, Some(update))
    }

    /// Cancel a pending approval without touching its job.
    ///
    /// Used when the caller takes care of the job's final state itself.
    pub fn abandon(&self, approval_id: &str, reason: &str) -> Result<Approval, ApprovalError> {
        self.close(approval_id, reason, None)
    }

    fn close(
        &self,
        approval_id: &str,
        reason: &str,
        job_update: Option<JobUpdate>,
    ) -> Result<Approval, ApprovalError> {
        let approval = {
            let mut entries = self.lock();
            let entry = entries
                .get_mut(approval_id)
                .ok_or_else(|| ApprovalError::NotFound(approval_id.to_string()))?;
            ensure_pending(&entry.approval)?;
            if let Some(update) = job_update {
                if let Err(e) = self.store.update(&entry.approval.job_id, update) {
                    warn!(
                        "Approval {} cancelled but job {} was not updated: {}",
                        approval_id, entry.approval.job_id, e
                    );
                }
            }
            entry.settle(ApprovalStatus::Cancelled, None, Some(reason.to_string()))
        };

        self.hub.publish(
            &approval.job_id,
            APPROVAL_CANCELLED,
            json!({ "approvalId": approval.id, "reason": reason }),
        );
        info!(
            "Approval {} for job {} cancelled: {}",
            approval.id, approval.job_id, reason
        );
        Ok(approval)
    }

    /// Timer expiry: fail the job and settle the approval as `timeout`.
    ///
    /// Both happen under the table lock. If the job already left
    /// `awaiting_approval` the approval is closed as cancelled instead and
    /// no timeout is announced.
    fn expire(&self, approval_id: &str) {
        let (approval, error) = {
            let mut entries = self.lock();
            let Some(entry) = entries.get_mut(approval_id) else {
                return;
            };
            if entry.approval.status.is_terminal() {
                return;
            }

            let error = format!(
                "approval timeout: '{}' not answered within {}ms",
                entry.approval.title, entry.approval.timeout_ms
            );
            let update = JobUpdate::status(JobStatus::Failed)
                .with_error(&error)
                .with_step("approval timed out")
                .expect_status(JobStatus::AwaitingApproval);
            if let Err(e) = self.store.update(&entry.approval.job_id, update) {
                warn!(
                    "Approval {} timed out but job {} was not updated: {}",
                    approval_id, entry.approval.job_id, e
                );
                entry.settle(
                    ApprovalStatus::Cancelled,
                    None,
                    Some(format!("job no longer awaiting approval: {}", e)),
                );
                return;
            }

            let reason = format!("no response within {}ms", entry.approval.timeout_ms);
            (entry.settle(ApprovalStatus::Timeout, None, Some(reason)), error)
        };

        self.hub.publish(
            &approval.job_id,
            APPROVAL_TIMEOUT,
            json!({ "approvalId": approval.id, "timeoutMs": approval.timeout_ms }),
        );
        self.hub.publish(
            &approval.job_id,
            PROCESSING_FAILED,
            json!({ "error": error }),
        );
        warn!("Approval {} for job {} timed out", approval.id, approval.job_id);
    }

    /// Suspend until the approval reaches a terminal status.
    pub async fn wait(&self, approval_id: &str) -> Result<Approval, ApprovalError> {
        let mut rx = {
            let entries = self.lock();
            let entry = entries
                .get(approval_id)
                .ok_or_else(|| ApprovalError::NotFound(approval_id.to_string()))?;
            if entry.approval.status.is_terminal() {
                return Ok(entry.approval.clone());
            }
            entry.done.subscribe()
        };

        let settled = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ApprovalError::NotFound(approval_id.to_string()))?;
        let approval: Option<Approval> = (*settled).clone();
        approval.ok_or_else(|| ApprovalError::NotFound(approval_id.to_string()))
    }

    pub fn get(&self, approval_id: &str) -> Option<Approval> {
        self.lock().get(approval_id).map(|e| e.approval.clone())
    }

    /// List approvals, newest first.
    pub fn list(&self, pending_only: bool) -> Vec<Approval> {
        let mut approvals: Vec<Approval> = self
            .lock()
            .values()
            .filter(|e| !pending_only || e.approval.is_pending())
            .map(|e| e.approval.clone())
            .collect();
        approvals.sort_by(|a, b| {
            b.requested_at
                .cmp(&a.requested_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        approvals
    }

    /// The job's outstanding approval, if any.
    pub fn pending_for_job(&self, job_id: &str) -> Option<Approval> {
        self.lock()
            .values()
            .find(|e| e.approval.job_id == job_id && e.approval.is_pending())
            .map(|e| e.approval.clone())
    }

    pub fn counts_by_status(&self) -> BTreeMap<ApprovalStatus, usize> {
        let mut counts: BTreeMap<ApprovalStatus, usize> =
            ApprovalStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for entry in self.lock().values() {
            *counts.entry(entry.approval.status).or_default() += 1;
        }
        counts
    }

    /// Drop every approval record belonging to the given jobs.
    pub fn purge_jobs(&self, job_ids: &[String]) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| {
            let purge = job_ids.contains(&entry.approval.job_id);
            if purge {
                if let Some(timer) = entry.timer.take() {
                    timer.cancel();
                }
            }
            !purge
        });
        let purged = before - entries.len();
        if purged > 0 {
            debug!("Purged {} approval records", purged);
        }
        purged
    }

    /// Copy of every approval record, for persistence.
    pub fn snapshot(&self) -> Vec<Approval> {
        self.lock().values().map(|e| e.approval.clone()).collect()
    }

    /// Load approval records from a snapshot.
    ///
    /// Restored pending requests carry no timer; startup recovery is
    /// expected to close them.
    pub fn restore(&self, approvals: Vec<Approval>) -> usize {
        let mut entries = self.lock();
        let count = approvals.len();
        for approval in approvals {
            entries.insert(approval.id.clone(), Entry::new(approval, None));
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{CreateJobRequest, InMemoryJobStore};
    use crate::notify::Listener;

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        hub: Arc<NotificationHub>,
        gate: ApprovalGate,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(InMemoryJobStore::new());
            let hub = Arc::new(NotificationHub::default());
            let gate = ApprovalGate::new(store.clone(), hub.clone(), Duration::from_secs(60));
            Self { store, hub, gate }
        }

        fn processing_job(&self, id: &str) -> String {
            self.store
                .create(CreateJobRequest::new("doc").with_id(id))
                .unwrap();
            self.store
                .update(id, JobUpdate::status(JobStatus::Queued))
                .unwrap();
            self.store
                .update(id, JobUpdate::status(JobStatus::Processing))
                .unwrap();
            id.to_string()
        }

        fn listen(&self, job_id: &str) -> Listener {
            let listener = self.hub.connect();
            self.hub.subscribe(job_id, listener.id());
            listener
        }

        fn job_status(&self, id: &str) -> JobStatus {
            self.store.get(id).unwrap().unwrap().status
        }
    }

    fn drain(listener: &mut Listener) -> Vec<String> {
        std::iter::from_fn(|| listener.try_recv())
            .map(|e| e.event)
            .collect()
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_request_moves_job_to_awaiting_approval() {
        let fx = Fixture::new();
        let job_id = fx.processing_job("job-1");
        let mut listener = fx.listen(&job_id);

        let approval = fx
            .gate
            .request(&job_id, ApprovalSpec::new("analysis_review", "Review analysis"))
            .unwrap();

        assert!(approval.is_pending());
        assert_eq!(approval.timeout_ms, 60_000);
        let job = fx.store.get(&job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::AwaitingApproval);
        assert_eq!(job.pending_approval.as_deref(), Some(approval.id.as_str()));

        // Subscribed listeners also get the broadcast.
        assert_eq!(drain(&mut listener), vec![APPROVAL_REQUESTED, APPROVAL_NEW]);
    }

    #[tokio::test]
    async fn test_second_request_is_rejected() {
        let fx = Fixture::new();
        let job_id = fx.processing_job("job-1");
        let first = fx
            .gate
            .request(&job_id, ApprovalSpec::new("review", "First"))
            .unwrap();

        let err = fx
            .gate
            .request(&job_id, ApprovalSpec::new("review", "Second"))
            .unwrap_err();
        match err {
            ApprovalError::AlreadyPending { approval_id, .. } => assert_eq!(approval_id, first.id),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(fx.gate.list(true).len(), 1);
    }

    #[tokio::test]
    async fn test_request_requires_processing_job() {
        let fx = Fixture::new();
        fx.store
            .create(CreateJobRequest::new("doc").with_id("idle"))
            .unwrap();

        let err = fx
            .gate
            .request("idle", ApprovalSpec::new("review", "Check"))
            .unwrap_err();
        assert!(matches!(err, ApprovalError::JobNotProcessing { status: JobStatus::Created, .. }));

        let err = fx
            .gate
            .request("missing", ApprovalSpec::new("review", "Check"))
            .unwrap_err();
        assert!(matches!(err, ApprovalError::Job(JobError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_respond_returns_job_to_processing() {
        let fx = Fixture::new();
        let job_id = fx.processing_job("job-1");
        let approval = fx
            .gate
            .request(&job_id, ApprovalSpec::new("review", "Check"))
            .unwrap();
        let mut listener = fx.listen(&job_id);

        let answered = fx
            .gate
            .respond(
                &approval.id,
                ApprovalReply::new(ApprovalDecision::Approve).with_comment("looks good"),
            )
            .unwrap();

        assert_eq!(answered.status, ApprovalStatus::Approve);
        assert!(answered.responded_at.is_some());
        let response = answered.response.unwrap();
        assert_eq!(response.comment.as_deref(), Some("looks good"));

        let job = fx.store.get(&job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.pending_approval.is_none());
        assert_eq!(drain(&mut listener), vec![APPROVAL_RESPONDED]);
    }

    #[tokio::test]
    async fn test_respond_twice_is_already_resolved() {
        let fx = Fixture::new();
        let job_id = fx.processing_job("job-1");
        let approval = fx
            .gate
            .request(&job_id, ApprovalSpec::new("review", "Check"))
            .unwrap();

        fx.gate
            .respond(&approval.id, ApprovalReply::new(ApprovalDecision::Reject))
            .unwrap();
        let err = fx
            .gate
            .respond(&approval.id, ApprovalReply::new(ApprovalDecision::Approve))
            .unwrap_err();
        assert!(matches!(
            err,
            ApprovalError::AlreadyResolved {
                status: ApprovalStatus::Reject,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_decision_outside_options_is_rejected() {
        let fx = Fixture::new();
        let job_id = fx.processing_job("job-1");
        let spec = ApprovalSpec::new("review", "Check")
            .with_options(vec![ApprovalDecision::Approve, ApprovalDecision::Reject]);
        let approval = fx.gate.request(&job_id, spec).unwrap();

        let err = fx
            .gate
            .respond(&approval.id, ApprovalReply::new(ApprovalDecision::Modify))
            .unwrap_err();
        assert!(matches!(err, ApprovalError::InvalidDecision { .. }));
        assert!(fx.gate.get(&approval.id).unwrap().is_pending());
    }

    #[tokio::test]
    async fn test_unknown_approval_is_not_found() {
        let fx = Fixture::new();
        let err = fx
            .gate
            .respond("nope", ApprovalReply::new(ApprovalDecision::Approve))
            .unwrap_err();
        assert!(matches!(err, ApprovalError::NotFound(_)));
        assert!(matches!(
            fx.gate.cancel("nope", "x").unwrap_err(),
            ApprovalError::NotFound(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_at_deadline_not_before() {
        let fx = Fixture::new();
        let job_id = fx.processing_job("J1");
        let approval = fx
            .gate
            .request(&job_id, ApprovalSpec::new("review", "Check").with_timeout_ms(1000))
            .unwrap();
        let mut listener = fx.listen(&job_id);

        tokio::time::advance(Duration::from_millis(999)).await;
        settle().await;
        assert!(fx.gate.get(&approval.id).unwrap().is_pending());
        assert_eq!(fx.job_status(&job_id), JobStatus::AwaitingApproval);

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;

        let expired = fx.gate.get(&approval.id).unwrap();
        assert_eq!(expired.status, ApprovalStatus::Timeout);
        let job = fx.store.get(&job_id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().starts_with("approval timeout"));
        assert_eq!(drain(&mut listener), vec![APPROVAL_TIMEOUT, PROCESSING_FAILED]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_does_not_fail_job_that_moved_on() {
        let fx = Fixture::new();
        let job_id = fx.processing_job("job-1");
        let approval = fx
            .gate
            .request(&job_id, ApprovalSpec::new("review", "Check").with_timeout_ms(100))
            .unwrap();
        fx.store
            .update(&job_id, JobUpdate::status(JobStatus::Cancelled))
            .unwrap();
        let mut listener = fx.listen(&job_id);

        tokio::time::advance(Duration::from_millis(100)).await;
        settle().await;

        let closed = fx.gate.get(&approval.id).unwrap();
        assert_eq!(closed.status, ApprovalStatus::Cancelled);
        assert_eq!(fx.job_status(&job_id), JobStatus::Cancelled);
        assert!(drain(&mut listener).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_disarms_timer() {
        let fx = Fixture::new();
        let job_id = fx.processing_job("job-1");
        let approval = fx
            .gate
            .request(&job_id, ApprovalSpec::new("review", "Check").with_timeout_ms(1000))
            .unwrap();

        let cancelled = fx.gate.cancel(&approval.id, "user abort").unwrap();
        assert_eq!(cancelled.status, ApprovalStatus::Cancelled);
        assert_eq!(cancelled.reason.as_deref(), Some("user abort"));

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;

        assert_eq!(
            fx.gate.get(&approval.id).unwrap().status,
            ApprovalStatus::Cancelled
        );
        assert_eq!(fx.job_status(&job_id), JobStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_after_timeout_is_already_resolved() {
        let fx = Fixture::new();
        let job_id = fx.processing_job("job-1");
        let approval = fx
            .gate
            .request(&job_id, ApprovalSpec::new("review", "Check").with_timeout_ms(10))
            .unwrap();

        let settled = fx.gate.wait(&approval.id).await.unwrap();
        assert_eq!(settled.status, ApprovalStatus::Timeout);

        let err = fx
            .gate
            .respond(&approval.id, ApprovalReply::new(ApprovalDecision::Approve))
            .unwrap_err();
        assert!(matches!(
            err,
            ApprovalError::AlreadyResolved {
                status: ApprovalStatus::Timeout,
                ..
            }
        ));
        assert_eq!(fx.job_status(&job_id), JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_wait_wakes_on_response() {
        let fx = Fixture::new();
        let job_id = fx.processing_job("job-1");
        let approval = fx
            .gate
            .request(&job_id, ApprovalSpec::new("review", "Check"))
            .unwrap();

        let gate = fx.gate.clone();
        let id = approval.id.clone();
        let waiter = tokio::spawn(async move { gate.wait(&id).await });
        settle().await;

        fx.gate
            .respond(&approval.id, ApprovalReply::new(ApprovalDecision::Modify))
            .unwrap();
        let settled = waiter.await.unwrap().unwrap();
        assert_eq!(settled.status, ApprovalStatus::Modify);
        assert_eq!(settled.decision(), Some(ApprovalDecision::Modify));
    }

    #[tokio::test]
    async fn test_abandon_leaves_job_alone() {
        let fx = Fixture::new();
        let job_id = fx.processing_job("job-1");
        let approval = fx
            .gate
            .request(&job_id, ApprovalSpec::new("review", "Check"))
            .unwrap();

        fx.gate.abandon(&approval.id, "restart").unwrap();
        assert_eq!(fx.job_status(&job_id), JobStatus::AwaitingApproval);
        assert!(fx.gate.pending_for_job(&job_id).is_none());
    }

    #[tokio::test]
    async fn test_purge_and_counts() {
        let fx = Fixture::new();
        let a = fx.processing_job("a");
        let b = fx.processing_job("b");
        let first = fx
            .gate
            .request(&a, ApprovalSpec::new("review", "A"))
            .unwrap();
        fx.gate
            .request(&b, ApprovalSpec::new("review", "B"))
            .unwrap();
        fx.gate
            .respond(&first.id, ApprovalReply::new(ApprovalDecision::Approve))
            .unwrap();

        let counts = fx.gate.counts_by_status();
        assert_eq!(counts[&ApprovalStatus::Pending], 1);
        assert_eq!(counts[&ApprovalStatus::Approve], 1);
        assert_eq!(counts[&ApprovalStatus::Timeout], 0);

        assert_eq!(fx.gate.purge_jobs(&[a.clone()]), 1);
        assert!(fx.gate.get(&first.id).is_none());
        assert_eq!(fx.gate.list(false).len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_restore() {
        let fx = Fixture::new();
        let job_id = fx.processing_job("job-1");
        let approval = fx
            .gate
            .request(&job_id, ApprovalSpec::new("review", "Check"))
            .unwrap();
        fx.gate
            .respond(&approval.id, ApprovalReply::new(ApprovalDecision::Approve))
            .unwrap();

        let records = fx.gate.snapshot();
        let other = Fixture::new();
        assert_eq!(other.gate.restore(records), 1);

        let restored = other.gate.wait(&approval.id).await.unwrap();
        assert_eq!(restored.status, ApprovalStatus::Approve);
    }
}
