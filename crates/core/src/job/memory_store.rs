//! In-memory job table with per-job locking.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::Utc;

use super::{CreateJobRequest, Job, JobError, JobFilter, JobStatus, JobStore, JobUpdate};

type JobSlot = Arc<Mutex<Job>>;

/// Arena of jobs keyed by id.
///
/// The outer lock only guards membership; every read-modify-write of a job
/// happens under that job's own mutex.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<String, JobSlot>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: &str) -> Option<JobSlot> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn slots(&self) -> Vec<JobSlot> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn read_job(slot: &JobSlot) -> Job {
        slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl JobStore for InMemoryJobStore {
    fn create(&self, request: CreateJobRequest) -> Result<Job, JobError> {
        let id = request
            .id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let now = Utc::now();
        let job = Job {
            id: id.clone(),
            job_type: request.job_type,
            status: JobStatus::Created,
            progress: 0,
            current_step: "created".to_string(),
            metadata: request.metadata,
            error: None,
            pending_approval: None,
            results: Vec::new(),
            created_at: now,
            updated_at: now,
        };

        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if jobs.contains_key(&id) {
            return Err(JobError::AlreadyExists(id));
        }
        jobs.insert(id, Arc::new(Mutex::new(job.clone())));
        Ok(job)
    }

    fn get(&self, id: &str) -> Result<Option<Job>, JobError> {
        Ok(self.slot(id).map(|slot| Self::read_job(&slot)))
    }

    fn update(&self, id: &str, update: JobUpdate) -> Result<Job, JobError> {
        let slot = self
            .slot(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        let mut job = slot.lock().unwrap_or_else(PoisonError::into_inner);

        // Apply to a copy so a rejected update leaves the stored job intact.
        let mut next = job.clone();
        update.apply_to(&mut next, Utc::now())?;
        *job = next;
        Ok(job.clone())
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError> {
        let mut jobs: Vec<Job> = self
            .slots()
            .iter()
            .map(Self::read_job)
            .filter(|job| filter.matches(job))
            .collect();

        jobs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }

    fn delete(&self, id: &str) -> Result<Job, JobError> {
        let slot = self
            .jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        Ok(Self::read_job(&slot))
    }

    fn counts_by_status(&self) -> Result<BTreeMap<JobStatus, usize>, JobError> {
        let mut counts: BTreeMap<JobStatus, usize> =
            JobStatus::ALL.iter().map(|status| (*status, 0)).collect();
        for slot in self.slots() {
            let status = slot.lock().unwrap_or_else(PoisonError::into_inner).status;
            *counts.entry(status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    fn cleanup_older_than(
        &self,
        age: chrono::Duration,
        terminal_only: bool,
    ) -> Result<Vec<String>, JobError> {
        let Some(cutoff) = Utc::now().checked_sub_signed(age) else {
            return Ok(Vec::new());
        };
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);

        let expired: Vec<String> = jobs
            .iter()
            .filter(|(_, slot)| {
                let job = slot.lock().unwrap_or_else(PoisonError::into_inner);
                job.updated_at < cutoff && (!terminal_only || job.status.is_terminal())
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            jobs.remove(id);
        }
        Ok(expired)
    }

    fn snapshot(&self) -> Result<Vec<Job>, JobError> {
        Ok(self.slots().iter().map(Self::read_job).collect())
    }

    fn restore(&self, restored: Vec<Job>) -> Result<usize, JobError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let count = restored.len();
        for job in restored {
            jobs.insert(job.id.clone(), Arc::new(Mutex::new(job)));
        }
        Ok(count)
    }
}
