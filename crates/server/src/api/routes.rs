use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::{approvals, handlers, jobs, middleware::metrics_middleware, recovery, ws};
use crate::state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // API routes
    let api_routes = Router::new()
        // Health, config, metrics
        .route("/health", get(handlers::health))
        .route("/config", get(handlers::get_config))
        .route("/metrics", get(handlers::get_metrics))
        .route("/status", get(handlers::get_status))
        // Jobs
        .route("/jobs", post(jobs::create_job).get(jobs::list_jobs))
        .route("/jobs/stats", get(jobs::job_stats))
        .route("/jobs/{id}", get(jobs::get_job).delete(jobs::cancel_job))
        .route("/jobs/{id}/start", post(jobs::start_job))
        .route("/jobs/{id}/uploaded", post(jobs::mark_uploaded))
        .route("/jobs/{id}/results", get(jobs::get_results))
        // Approvals
        .route("/approvals", get(approvals::list_approvals))
        .route("/approvals/{id}", get(approvals::get_approval))
        .route("/approvals/{id}/respond", post(approvals::respond))
        // Recovery
        .route("/recovery/trigger", post(recovery::trigger))
        .route("/recovery/strategies", get(recovery::list_strategies))
        .route("/recovery/stats", get(recovery::get_stats))
        // Real-time events
        .route("/ws", get(ws::ws_handler))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
