//! Mock stage for testing.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::approval::ApprovalSpec;
use crate::job::Job;
use crate::stage::{Stage, StageContext, StageError};

/// What one call of a [`MockStage`] does.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Succeed(Value),
    Fail(StageError),
}

/// Mock implementation of the Stage trait.
///
/// Provides controllable behavior for testing:
/// - Scripted outcomes, consumed one per call
/// - A fallback outcome once the script runs out
/// - Progress reports and an artificial delay per call
/// - An optional approval checkpoint
///
/// # Example
///
/// ```rust,ignore
/// use jobflow_core::testing::MockStage;
///
/// let stage = MockStage::new("analyse");
/// stage.fail_next(StageError::new("database is locked")).await;
///
/// // First call fails, later calls succeed
/// assert_eq!(stage.call_count().await, 0);
/// ```
#[derive(Debug)]
pub struct MockStage {
    name: String,
    checkpoint: Option<ApprovalSpec>,
    progress_steps: Vec<u8>,
    delay: Duration,
    /// Outcomes for the next calls, in order.
    script: Arc<RwLock<VecDeque<MockOutcome>>>,
    /// Outcome once the script is empty.
    fallback: Arc<RwLock<MockOutcome>>,
    /// Jobs seen by each call.
    calls: Arc<RwLock<Vec<Job>>>,
}

impl MockStage {
    /// Create a stage that succeeds with `{"stage": name}`.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let output = json!({ "stage": name });
        Self {
            name,
            checkpoint: None,
            progress_steps: Vec::new(),
            delay: Duration::ZERO,
            script: Arc::new(RwLock::new(VecDeque::new())),
            fallback: Arc::new(RwLock::new(MockOutcome::Succeed(output))),
            calls: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Request this approval after every successful call.
    pub fn with_checkpoint(mut self, spec: ApprovalSpec) -> Self {
        self.checkpoint = Some(spec);
        self
    }

    /// Report these stage percentages on every call.
    pub fn with_progress(mut self, steps: Vec<u8>) -> Self {
        self.progress_steps = steps;
        self
    }

    /// Sleep this long on every call (tokio clock).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue an outcome for a future call.
    pub async fn push_outcome(&self, outcome: MockOutcome) {
        self.script.write().await.push_back(outcome);
    }

    /// Make the next call fail.
    pub async fn fail_next(&self, error: StageError) {
        self.push_outcome(MockOutcome::Fail(error)).await;
    }

    /// Make every unscripted call fail.
    pub async fn fail_always(&self, error: StageError) {
        *self.fallback.write().await = MockOutcome::Fail(error);
    }

    /// Make every unscripted call succeed with `output`.
    pub async fn succeed_with(&self, output: Value) {
        *self.fallback.write().await = MockOutcome::Succeed(output);
    }

    /// Number of times the stage ran.
    pub async fn call_count(&self) -> usize {
        self.calls.read().await.len()
    }

    /// Job snapshots passed to each call.
    pub async fn recorded_jobs(&self) -> Vec<Job> {
        self.calls.read().await.clone()
    }
}

#[async_trait]
impl Stage for MockStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn checkpoint(&self, _job: &Job, output: &Value) -> Option<ApprovalSpec> {
        self.checkpoint
            .clone()
            .map(|spec| spec.with_data(output.clone()))
    }

    async fn execute(&self, ctx: StageContext) -> Result<Value, StageError> {
        self.calls.write().await.push(ctx.job.clone());

        for pct in &self.progress_steps {
            ctx.progress.report(*pct, None);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let next = self.script.write().await.pop_front();
        let outcome = match next {
            Some(outcome) => outcome,
            None => self.fallback.read().await.clone(),
        };
        match outcome {
            MockOutcome::Succeed(value) => Ok(value),
            MockOutcome::Fail(error) => Err(error),
        }
    }
}
