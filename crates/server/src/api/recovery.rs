//! Recovery API handlers.

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use jobflow_core::recovery::{RecoveryResult, RecoveryStat, StrategyInfo};

use super::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerBody {
    pub strategy: String,
    pub job_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StrategiesResponse {
    pub strategies: Vec<StrategyInfo>,
}

#[derive(Debug, Serialize)]
pub struct RecoveryStatsResponse {
    pub stats: Vec<RecoveryStat>,
}

/// Run a named strategy by hand
pub async fn trigger(
    State(state): State<Arc<AppState>>,
    Json(body): Json<TriggerBody>,
) -> Result<Json<RecoveryResult>, ApiError> {
    if let Some(job_id) = body.job_id.as_deref() {
        if state.store().get(job_id)?.is_none() {
            return Err(ApiError::not_found(format!("job not found: {}", job_id)));
        }
    }

    let result = state
        .recovery()
        .trigger(&body.strategy, body.job_id)
        .await?;
    Ok(Json(result))
}

pub async fn list_strategies(State(state): State<Arc<AppState>>) -> Json<StrategiesResponse> {
    Json(StrategiesResponse {
        strategies: state.recovery().strategies(),
    })
}

pub async fn get_stats(State(state): State<Arc<AppState>>) -> Json<RecoveryStatsResponse> {
    Json(RecoveryStatsResponse {
        stats: state.recovery().stats(),
    })
}
