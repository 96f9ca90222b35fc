//! Approval API handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use jobflow_core::{Approval, ApprovalDecision, ApprovalReply};

use super::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListApprovalsParams {
    /// Include resolved approvals
    #[serde(default)]
    pub all: bool,
}

#[derive(Debug, Serialize)]
pub struct ListApprovalsResponse {
    pub approvals: Vec<Approval>,
    pub count: usize,
}

/// Reviewer response. The decision is parsed by hand so an unknown value
/// is a 400 rather than a body rejection.
#[derive(Debug, Deserialize)]
pub struct RespondBody {
    pub decision: String,
    pub comment: Option<String>,
    pub modifications: Option<Value>,
}

/// List pending approvals, or all of them with `?all=true`
pub async fn list_approvals(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListApprovalsParams>,
) -> Json<ListApprovalsResponse> {
    let approvals = state.gate().list(!params.all);
    Json(ListApprovalsResponse {
        count: approvals.len(),
        approvals,
    })
}

/// Get an approval by ID
pub async fn get_approval(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Approval>, ApiError> {
    state
        .gate()
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("approval not found: {}", id)))
}

/// Record a reviewer decision
pub async fn respond(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<RespondBody>,
) -> Result<Json<Approval>, ApiError> {
    let decision: ApprovalDecision = body.decision.parse().map_err(ApiError::bad_request)?;

    let reply = ApprovalReply {
        decision,
        comment: body.comment,
        modifications: body.modifications,
    };
    let approval = state.gate().respond(&id, reply)?;
    Ok(Json(approval))
}
