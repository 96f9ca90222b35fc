//! Recovery coordinator: strategy dispatch, bounded retry, stuck-job watchdog.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{classify, ErrorKind, RecoveryConfig, RecoveryStrategy};
use crate::job::{JobError, JobFilter, JobStatus, JobStore, JobUpdate, RETRY_COUNT_KEY};
use crate::notify::{NotificationHub, PROCESSING_FAILED, PROCESSING_RETRY};
use crate::stage::StageError;

/// Errors from the recovery coordinator.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("unknown recovery strategy: {0}")]
    UnknownStrategy(String),

    #[error("job store error: {0}")]
    Job(#[from] JobError),
}

/// Where a failure happened.
#[derive(Debug, Clone, Default)]
pub struct RecoveryContext {
    pub job_id: Option<String>,
    pub stage: Option<String>,
}

impl RecoveryContext {
    pub fn for_job(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            stage: None,
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }
}

/// What the orchestrator should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Re-run the failed stage.
    Resume,
    /// Go through the retry budget.
    Retry,
    /// Give up.
    Fail,
}

impl RecoveryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryAction::Resume => "resume",
            RecoveryAction::Retry => "retry",
            RecoveryAction::Fail => "fail",
        }
    }
}

/// Outcome of [`RecoveryCoordinator::handle`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryResult {
    pub kind: ErrorKind,
    /// Strategy that ran, None when the kind has none.
    pub strategy: Option<String>,
    pub success: bool,
    pub action: RecoveryAction,
    pub detail: String,
}

/// Description of a registered strategy.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyInfo {
    pub name: String,
    pub kind: ErrorKind,
    pub description: String,
}

/// Count of recovery decisions for one kind and action.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryStat {
    pub kind: ErrorKind,
    pub action: RecoveryAction,
    pub count: u64,
}

/// Classifies failures, runs strategies and manages retries.
///
/// Backoff attempt counters live in memory only and start from zero after a
/// restart; the persisted `retryCount` still bounds the total.
pub struct RecoveryCoordinator {
    config: RecoveryConfig,
    store: Arc<dyn JobStore>,
    hub: Arc<NotificationHub>,
    strategies: Vec<Arc<dyn RecoveryStrategy>>,
    attempts: Mutex<HashMap<String, u32>>,
    stats: Mutex<HashMap<(ErrorKind, RecoveryAction), u64>>,
}

impl RecoveryCoordinator {
    pub fn new(config: RecoveryConfig, store: Arc<dyn JobStore>, hub: Arc<NotificationHub>) -> Self {
        Self {
            config,
            store,
            hub,
            strategies: Vec::new(),
            attempts: Mutex::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// Register a strategy. A later strategy for the same kind takes over
    /// automatic handling; both stay available to [`trigger`](Self::trigger).
    pub fn with_strategy(mut self, strategy: Arc<dyn RecoveryStrategy>) -> Self {
        self.strategies.retain(|s| s.name() != strategy.name());
        self.strategies.push(strategy);
        self
    }

    pub fn with_strategies(
        self,
        strategies: impl IntoIterator<Item = Arc<dyn RecoveryStrategy>>,
    ) -> Self {
        strategies
            .into_iter()
            .fold(self, |coordinator, s| coordinator.with_strategy(s))
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    fn strategy_for(&self, kind: ErrorKind) -> Option<&Arc<dyn RecoveryStrategy>> {
        self.strategies.iter().rev().find(|s| s.kind() == kind)
    }

    fn attempts(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, kind: ErrorKind, action: RecoveryAction) {
        *self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((kind, action))
            .or_default() += 1;
    }

    /// Classify a stage failure and run the matching strategy.
    pub async fn handle(&self, error: &StageError, ctx: &RecoveryContext) -> RecoveryResult {
        let kind = classify(&error.message, error.kind);

        let result = if !error.retryable {
            RecoveryResult {
                kind,
                strategy: None,
                success: false,
                action: RecoveryAction::Fail,
                detail: "error is not retryable".to_string(),
            }
        } else if let Some(strategy) = self.strategy_for(kind) {
            let outcome = strategy.recover(&error.message, ctx).await;
            RecoveryResult {
                kind,
                strategy: Some(strategy.name().to_string()),
                success: outcome.recovered,
                action: if outcome.recovered {
                    RecoveryAction::Resume
                } else {
                    RecoveryAction::Retry
                },
                detail: outcome.detail,
            }
        } else {
            RecoveryResult {
                kind,
                strategy: None,
                success: false,
                action: RecoveryAction::Retry,
                detail: format!("no recovery strategy for {} errors", kind),
            }
        };

        self.record(kind, result.action);
        info!(
            "Recovery for job {} ({} error): strategy={} action={} detail={}",
            ctx.job_id.as_deref().unwrap_or("-"),
            kind,
            result.strategy.as_deref().unwrap_or("none"),
            result.action.as_str(),
            result.detail
        );
        result
    }

    /// Backoff before the retry following `attempt` (zero-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        let delay = self
            .config
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.config.max_delay_ms);
        Duration::from_millis(delay)
    }

    /// Count a failed attempt and, if budget remains, requeue the job after
    /// a backoff.
    ///
    /// Returns false when the job was failed for good, or when it left
    /// `processing` while waiting.
    pub async fn retry_job(&self, job_id: &str, error: &str) -> Result<bool, RecoveryError> {
        let job = self
            .store
            .get(job_id)?
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))?;
        let failures = job.retry_count() + 1;
        let max_attempts = self.config.max_attempts.max(1);

        if failures >= max_attempts {
            let message = format!(
                "max retries exceeded after {} attempts: {}",
                failures, error
            );
            self.store.update(
                job_id,
                JobUpdate::status(JobStatus::Failed)
                    .with_metadata(RETRY_COUNT_KEY, json!(failures))
                    .with_error(&message)
                    .with_step("failed"),
            )?;
            self.attempts().remove(job_id);
            self.hub.publish(
                job_id,
                PROCESSING_FAILED,
                json!({ "error": message, "retryCount": failures }),
            );
            warn!("Job {} failed permanently: {}", job_id, message);
            return Ok(false);
        }

        let attempt = {
            let mut attempts = self.attempts();
            let counter = attempts.entry(job_id.to_string()).or_insert(0);
            let current = *counter;
            *counter += 1;
            current
        };
        let delay = self.backoff_delay(attempt);

        let waiting = JobUpdate::new()
            .with_metadata(RETRY_COUNT_KEY, json!(failures))
            .with_error(error)
            .with_step(format!(
                "waiting to retry ({} of {} attempts failed)",
                failures, max_attempts
            ))
            .expect_status(JobStatus::Processing);
        match self.store.update(job_id, waiting) {
            Ok(_) => {}
            Err(JobError::StatusMismatch { .. }) | Err(JobError::Terminal { .. }) => {
                debug!("Job {} is no longer processing, not retrying", job_id);
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }
        self.hub.publish(
            job_id,
            PROCESSING_RETRY,
            json!({
                "retryCount": failures,
                "maxAttempts": max_attempts,
                "delayMs": delay.as_millis() as u64,
                "error": error,
            }),
        );
        info!(
            "Retrying job {} in {:?} (failure {} of {})",
            job_id, delay, failures, max_attempts
        );

        tokio::time::sleep(delay).await;

        let requeue = JobUpdate::status(JobStatus::Queued)
            .with_step("queued for retry")
            .expect_status(JobStatus::Processing);
        match self.store.update(job_id, requeue) {
            Ok(_) => Ok(true),
            Err(JobError::StatusMismatch { .. }) | Err(JobError::Terminal { .. }) => {
                debug!("Job {} changed while waiting to retry", job_id);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drop the in-memory backoff counter for a job.
    pub fn clear_attempts(&self, job_id: &str) {
        self.attempts().remove(job_id);
    }

    /// Run a strategy by name, outside of any failure.
    pub async fn trigger(
        &self,
        name: &str,
        job_id: Option<String>,
    ) -> Result<RecoveryResult, RecoveryError> {
        let strategy = self
            .strategies
            .iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| RecoveryError::UnknownStrategy(name.to_string()))?;

        let ctx = RecoveryContext {
            job_id,
            stage: None,
        };
        let outcome = strategy.recover("manual trigger", &ctx).await;
        info!(
            "Manually triggered {}: recovered={} {}",
            name, outcome.recovered, outcome.detail
        );
        Ok(RecoveryResult {
            kind: strategy.kind(),
            strategy: Some(name.to_string()),
            success: outcome.recovered,
            action: if outcome.recovered {
                RecoveryAction::Resume
            } else {
                RecoveryAction::Retry
            },
            detail: outcome.detail,
        })
    }

    pub fn strategies(&self) -> Vec<StrategyInfo> {
        self.strategies
            .iter()
            .map(|s| StrategyInfo {
                name: s.name().to_string(),
                kind: s.kind(),
                description: s.description().to_string(),
            })
            .collect()
    }

    pub fn stats(&self) -> Vec<RecoveryStat> {
        let mut stats: Vec<RecoveryStat> = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|((kind, action), count)| RecoveryStat {
                kind: *kind,
                action: *action,
                count: *count,
            })
            .collect();
        stats.sort_by_key(|s| (s.kind, s.action.as_str()));
        stats
    }

    /// Fail `processing` jobs whose last update is older than the stuck
    /// threshold. Returns the ids of the failed jobs.
    pub fn sweep_stuck_jobs(&self, now: DateTime<Utc>) -> Result<Vec<String>, RecoveryError> {
        let threshold = self.config.stuck_threshold();
        let Some(cutoff) = chrono::Duration::from_std(threshold)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
        else {
            return Ok(Vec::new());
        };
        let processing = self
            .store
            .list(&JobFilter::new().with_status(JobStatus::Processing))?;

        let mut failed = Vec::new();
        for job in processing.into_iter().filter(|j| j.updated_at < cutoff) {
            let message = format!(
                "stuck job timeout: no progress for more than {}s",
                threshold.as_secs()
            );
            let update = JobUpdate::status(JobStatus::Failed)
                .with_error(&message)
                .with_step("failed")
                .expect_status(JobStatus::Processing);
            match self.store.update(&job.id, update) {
                Ok(_) => {
                    self.attempts().remove(&job.id);
                    self.hub
                        .publish(&job.id, PROCESSING_FAILED, json!({ "error": message }));
                    warn!("Job {} failed by watchdog: {}", job.id, message);
                    failed.push(job.id);
                }
                Err(e) => debug!("Watchdog skipped job {}: {}", job.id, e),
            }
        }
        Ok(failed)
    }

    /// Sweep for stuck jobs every watchdog interval until shutdown.
    ///
    /// `on_stuck` receives the ids failed by each sweep.
    pub async fn run_watchdog<F>(&self, shutdown: CancellationToken, on_stuck: F)
    where
        F: Fn(&[String]) + Send + Sync,
    {
        let interval = self.config.watchdog_interval();
        info!("Watchdog started (interval {:?})", interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    match self.sweep_stuck_jobs(Utc::now()) {
                        Ok(ids) if !ids.is_empty() => on_stuck(&ids),
                        Ok(_) => {}
                        Err(e) => error!("Watchdog sweep failed: {}", e),
                    }
                }
            }
        }
        info!("Watchdog stopped");
    }
}
