//! Per-run context handed to a stage.

use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use crate::job::{Job, JobStore, JobUpdate, StageResult};
use crate::notify::{NotificationHub, PROCESSING_PROGRESS};

/// Everything a stage sees while it runs.
#[derive(Clone)]
pub struct StageContext {
    /// Job as it was when the stage started.
    pub job: Job,
    /// Outputs of the stages that already completed in this run.
    pub previous: Vec<StageResult>,
    pub progress: ProgressReporter,
}

impl StageContext {
    /// Output of an earlier stage by name.
    pub fn output_of(&self, stage: &str) -> Option<&serde_json::Value> {
        self.previous
            .iter()
            .find(|r| r.stage == stage)
            .map(|r| &r.output)
    }
}

/// Reports a stage's progress as overall job progress.
///
/// A stage at index `i` of `n` reporting `p` percent puts the job at
/// `(i * 100 + p) / n`.
#[derive(Clone)]
pub struct ProgressReporter {
    job_id: String,
    stage: String,
    index: usize,
    count: usize,
    store: Arc<dyn JobStore>,
    hub: Arc<NotificationHub>,
}

impl ProgressReporter {
    pub fn new(
        job_id: impl Into<String>,
        stage: impl Into<String>,
        index: usize,
        count: usize,
        store: Arc<dyn JobStore>,
        hub: Arc<NotificationHub>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            stage: stage.into(),
            index,
            count: count.max(1),
            store,
            hub,
        }
    }

    /// Overall job progress for a stage-local percentage.
    pub fn overall(&self, stage_percent: u8) -> u8 {
        let pct = stage_percent.min(100) as usize;
        ((self.index.min(self.count) * 100 + pct) / self.count).min(100) as u8
    }

    /// Record progress and publish `processing:progress`.
    pub fn report(&self, stage_percent: u8, message: Option<&str>) {
        let progress = self.overall(stage_percent);
        let step = match message {
            Some(message) => format!("{}: {}", self.stage, message),
            None => self.stage.clone(),
        };

        let update = JobUpdate::new().with_progress(progress).with_step(&step);
        if let Err(e) = self.store.update(&self.job_id, update) {
            debug!("Progress for job {} not recorded: {}", self.job_id, e);
            return;
        }

        self.hub.publish(
            &self.job_id,
            PROCESSING_PROGRESS,
            json!({
                "progress": progress,
                "stage": self.stage,
                "stagePercent": stage_percent.min(100),
                "currentStep": step,
            }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{CreateJobRequest, InMemoryJobStore, JobStatus};

    fn reporter(index: usize, count: usize) -> (Arc<InMemoryJobStore>, Arc<NotificationHub>, ProgressReporter) {
        let store = Arc::new(InMemoryJobStore::new());
        store
            .create(CreateJobRequest::new("doc").with_id("job-1"))
            .unwrap();
        let hub = Arc::new(NotificationHub::default());
        let reporter =
            ProgressReporter::new("job-1", "analyse", index, count, store.clone(), hub.clone());
        (store, hub, reporter)
    }

    #[test]
    fn test_overall_progress_spans_stages() {
        let (_, _, first) = reporter(0, 4);
        assert_eq!(first.overall(0), 0);
        assert_eq!(first.overall(100), 25);

        let (_, _, third) = reporter(2, 4);
        assert_eq!(third.overall(50), 62);
        assert_eq!(third.overall(200), 75);
    }

    #[test]
    fn test_report_updates_job_and_publishes() {
        let (store, hub, reporter) = reporter(1, 2);
        let mut listener = hub.connect();
        hub.subscribe("job-1", listener.id());

        reporter.report(50, Some("page 3 of 6"));

        let job = store.get("job-1").unwrap().unwrap();
        assert_eq!(job.progress, 75);
        assert_eq!(job.current_step, "analyse: page 3 of 6");
        let event = listener.try_recv().unwrap();
        assert_eq!(event.event, PROCESSING_PROGRESS);
        assert_eq!(event.payload["progress"], 75);
        assert_eq!(event.payload["stagePercent"], 50);
    }

    #[test]
    fn test_report_on_terminal_job_is_silent() {
        let (store, hub, reporter) = reporter(0, 1);
        store
            .update("job-1", JobUpdate::status(JobStatus::Cancelled))
            .unwrap();
        let mut listener = hub.connect();
        hub.subscribe("job-1", listener.id());

        reporter.report(10, None);
        assert!(listener.try_recv().is_none());
    }
}
