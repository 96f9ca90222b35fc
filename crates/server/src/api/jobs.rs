//! Job API handlers.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use jobflow_core::{CreateJobRequest, Job, JobFilter, JobStatus, StageResult};

use super::ApiError;
use crate::state::AppState;

/// Maximum allowed limit for job queries
const MAX_LIMIT: usize = 1000;

/// Default limit for job queries
const DEFAULT_LIMIT: usize = 100;

const DEFAULT_CANCEL_REASON: &str = "cancelled by user";

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for creating a job
#[derive(Debug, Deserialize)]
pub struct CreateJobBody {
    /// Pipeline kind
    #[serde(rename = "type")]
    pub job_type: String,
    /// Caller-chosen id
    pub id: Option<String>,
    /// Initial metadata
    pub metadata: Option<Map<String, Value>>,
    /// Queue the job right away; `false` leaves it in `created` for an upload
    #[serde(default = "default_start")]
    pub start: bool,
}

fn default_start() -> bool {
    true
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateJobResponse {
    pub job_id: String,
    pub status: JobStatus,
}

/// Query parameters for listing jobs
#[derive(Debug, Deserialize)]
pub struct ListJobsParams {
    pub status: Option<String>,
    #[serde(rename = "type")]
    pub job_type: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ListJobsResponse {
    pub jobs: Vec<Job>,
    pub count: usize,
    pub limit: usize,
}

#[derive(Debug, Serialize)]
pub struct JobStatsResponse {
    pub total: usize,
    pub counts: BTreeMap<JobStatus, usize>,
}

/// Request body for cancelling a job
#[derive(Debug, Deserialize)]
pub struct CancelJobBody {
    /// Optional reason for cancellation
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResultsResponse {
    pub job_id: String,
    pub results: Vec<StageResult>,
}

// ============================================================================
// Handlers
// ============================================================================

/// Create a job and queue it unless the body says `"start": false`
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateJobBody>,
) -> Result<(StatusCode, Json<CreateJobResponse>), ApiError> {
    if body.job_type.trim().is_empty() {
        return Err(ApiError::bad_request("job type cannot be empty"));
    }
    if !state.orchestrator().pipelines().contains(&body.job_type) {
        return Err(ApiError::bad_request(format!(
            "no pipeline registered for job type '{}'",
            body.job_type
        )));
    }

    let request = CreateJobRequest {
        id: body.id,
        job_type: body.job_type,
        metadata: body.metadata.unwrap_or_default(),
    };

    let orchestrator = state.orchestrator();
    let job = if body.start {
        orchestrator.submit(request)?
    } else {
        orchestrator.create(request)?
    };

    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse {
            job_id: job.id,
            status: job.status,
        }),
    ))
}

/// List jobs, newest first
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListJobsParams>,
) -> Result<Json<ListJobsResponse>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let mut filter = JobFilter::new().with_limit(limit);

    if let Some(status) = params.status.as_deref() {
        let status: JobStatus = status.parse().map_err(ApiError::bad_request)?;
        filter = filter.with_status(status);
    }
    if let Some(job_type) = params.job_type {
        filter = filter.with_type(job_type);
    }

    let jobs = state.store().list(&filter)?;
    Ok(Json(ListJobsResponse {
        count: jobs.len(),
        jobs,
        limit,
    }))
}

/// Job counts per status
pub async fn job_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<JobStatsResponse>, ApiError> {
    let counts = state.store().counts_by_status()?;
    Ok(Json(JobStatsResponse {
        total: counts.values().sum(),
        counts,
    }))
}

/// Get a job by ID
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    state
        .store()
        .get(&id)?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("job not found: {}", id)))
}

/// Cancel a job
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<CancelJobBody>>,
) -> Result<Json<Job>, ApiError> {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());

    let job = state.orchestrator().cancel(&id, &reason)?;
    Ok(Json(job))
}

/// Queue a job and start its pipeline
pub async fn start_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let job = state.orchestrator().start(&id)?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

/// Mark a job's input as uploaded
pub async fn mark_uploaded(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    let job = state.orchestrator().mark_uploaded(&id)?;
    Ok(Json(job))
}

/// Stage outputs of a completed job
pub async fn get_results(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobResultsResponse>, ApiError> {
    let results = state.orchestrator().results(&id)?;
    Ok(Json(JobResultsResponse {
        job_id: id,
        results,
    }))
}
