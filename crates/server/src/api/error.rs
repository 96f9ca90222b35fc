//! Mapping from domain errors to HTTP responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

use jobflow_core::{ApprovalError, JobError, OrchestratorError, RecoveryError};

/// Error body returned by every endpoint.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// A status code plus a human readable message.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            error!("Request failed: {}", self.message);
        }
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

fn job_status(e: &JobError) -> StatusCode {
    match e {
        JobError::NotFound(_) => StatusCode::NOT_FOUND,
        JobError::AlreadyExists(_)
        | JobError::Terminal { .. }
        | JobError::InvalidTransition { .. }
        | JobError::StatusMismatch { .. } => StatusCode::CONFLICT,
        JobError::InvalidUpdate { .. } => StatusCode::BAD_REQUEST,
        JobError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn approval_status(e: &ApprovalError) -> StatusCode {
    match e {
        ApprovalError::NotFound(_) => StatusCode::NOT_FOUND,
        ApprovalError::AlreadyPending { .. }
        | ApprovalError::AlreadyResolved { .. }
        | ApprovalError::JobNotProcessing { .. } => StatusCode::CONFLICT,
        ApprovalError::InvalidDecision { .. } => StatusCode::BAD_REQUEST,
        ApprovalError::Job(e) => job_status(e),
    }
}

fn recovery_status(e: &RecoveryError) -> StatusCode {
    match e {
        RecoveryError::UnknownStrategy(_) => StatusCode::NOT_FOUND,
        RecoveryError::Job(e) => job_status(e),
    }
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        Self::new(job_status(&e), e.to_string())
    }
}

impl From<ApprovalError> for ApiError {
    fn from(e: ApprovalError) -> Self {
        Self::new(approval_status(&e), e.to_string())
    }
}

impl From<RecoveryError> for ApiError {
    fn from(e: RecoveryError) -> Self {
        Self::new(recovery_status(&e), e.to_string())
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        let status = match &e {
            OrchestratorError::JobNotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::InvalidState { .. } | OrchestratorError::NotCompleted { .. } => {
                StatusCode::CONFLICT
            }
            OrchestratorError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::Job(inner) => job_status(inner),
            OrchestratorError::Approval(inner) => approval_status(inner),
            OrchestratorError::Recovery(inner) => recovery_status(inner),
        };
        Self::new(status, e.to_string())
    }
}
