//! Prometheus metrics for observability.
//!
//! Covers HTTP traffic and websocket delivery (updated as they happen), plus
//! job, approval, recovery and orchestrator state, collected at scrape time.

use once_cell::sync::Lazy;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry, TextEncoder,
};
use regex_lite::Regex;

use jobflow_core::{ApprovalStatus, JobStatus};

use crate::state::AppState;

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// HTTP Request Metrics
// =============================================================================

/// HTTP request duration in seconds.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "jobflow_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![
            0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
        ]),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests total count.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("jobflow_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests currently in flight.
pub static HTTP_REQUESTS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "jobflow_http_requests_in_flight",
        "Number of HTTP requests currently being processed",
    )
    .unwrap()
});

// =============================================================================
// WebSocket Metrics
// =============================================================================

/// Active WebSocket connections.
pub static WS_CONNECTIONS_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "jobflow_ws_connections_active",
        "Number of active WebSocket connections",
    )
    .unwrap()
});

/// Total WebSocket connections (cumulative).
pub static WS_CONNECTIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "jobflow_ws_connections_total",
        "Total WebSocket connections since startup",
    )
    .unwrap()
});

/// WebSocket messages sent by event name.
pub static WS_MESSAGES_SENT: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("jobflow_ws_messages_sent_total", "WebSocket messages sent"),
        &["event"],
    )
    .unwrap()
});

/// Hub events that never reached a listener (collected dynamically).
pub static HUB_EVENTS_DROPPED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "jobflow_hub_events_dropped",
        "Events dropped because a listener buffer was full or closed",
    )
    .unwrap()
});

/// Connected hub listeners (collected dynamically).
pub static HUB_LISTENERS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("jobflow_hub_listeners", "Number of connected hub listeners").unwrap()
});

/// Job subscriptions across all listeners (collected dynamically).
pub static HUB_SUBSCRIPTIONS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "jobflow_hub_subscriptions",
        "Number of job subscriptions held by listeners",
    )
    .unwrap()
});

// =============================================================================
// Job, Approval and Recovery Metrics (collected dynamically)
// =============================================================================

/// Jobs by current status.
pub static JOBS_BY_STATUS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("jobflow_jobs_by_status", "Current job count by status"),
        &["status"],
    )
    .unwrap()
});

/// Approvals by current status.
pub static APPROVALS_BY_STATUS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "jobflow_approvals_by_status",
            "Current approval count by status",
        ),
        &["status"],
    )
    .unwrap()
});

/// Recovery decisions since startup, by error kind and resulting action.
pub static RECOVERY_ATTEMPTS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new(
            "jobflow_recovery_attempts",
            "Recovery decisions since startup by error kind and action",
        ),
        &["kind", "action"],
    )
    .unwrap()
});

// =============================================================================
// Orchestrator Metrics (collected dynamically)
// =============================================================================

/// Orchestrator running state (1 = running, 0 = stopped).
pub static ORCHESTRATOR_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "jobflow_orchestrator_running",
        "Whether the orchestrator is running (1) or stopped (0)",
    )
    .unwrap()
});

/// Pipeline tasks currently alive.
pub static ORCHESTRATOR_ACTIVE_TASKS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "jobflow_orchestrator_active_tasks",
        "Number of live pipeline tasks",
    )
    .unwrap()
});

/// Free concurrency slots.
pub static ORCHESTRATOR_AVAILABLE_SLOTS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "jobflow_orchestrator_available_slots",
        "Number of free pipeline concurrency slots",
    )
    .unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    // HTTP
    registry
        .register(Box::new(HTTP_REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_IN_FLIGHT.clone()))
        .unwrap();

    // WebSocket and hub
    registry
        .register(Box::new(WS_CONNECTIONS_ACTIVE.clone()))
        .unwrap();
    registry
        .register(Box::new(WS_CONNECTIONS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(WS_MESSAGES_SENT.clone()))
        .unwrap();
    registry
        .register(Box::new(HUB_EVENTS_DROPPED.clone()))
        .unwrap();
    registry.register(Box::new(HUB_LISTENERS.clone())).unwrap();
    registry
        .register(Box::new(HUB_SUBSCRIPTIONS.clone()))
        .unwrap();

    // Jobs, approvals, recovery
    registry.register(Box::new(JOBS_BY_STATUS.clone())).unwrap();
    registry
        .register(Box::new(APPROVALS_BY_STATUS.clone()))
        .unwrap();
    registry
        .register(Box::new(RECOVERY_ATTEMPTS.clone()))
        .unwrap();

    // Orchestrator
    registry
        .register(Box::new(ORCHESTRATOR_RUNNING.clone()))
        .unwrap();
    registry
        .register(Box::new(ORCHESTRATOR_ACTIVE_TASKS.clone()))
        .unwrap();
    registry
        .register(Box::new(ORCHESTRATOR_AVAILABLE_SLOTS.clone()))
        .unwrap();
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Collect dynamic metrics from current application state.
///
/// Called right before encoding so gauges reflect the current job table,
/// approval table, hub and orchestrator.
pub fn collect_dynamic_metrics(state: &AppState) {
    let status = state.orchestrator().status();
    ORCHESTRATOR_RUNNING.set(if status.running { 1 } else { 0 });
    ORCHESTRATOR_ACTIVE_TASKS.set(status.active_tasks as i64);
    ORCHESTRATOR_AVAILABLE_SLOTS.set(status.available_slots as i64);

    let hub = state.hub().stats();
    HUB_EVENTS_DROPPED.set(hub.dropped as i64);
    HUB_LISTENERS.set(hub.listeners as i64);
    HUB_SUBSCRIPTIONS.set(hub.subscriptions as i64);

    if let Ok(counts) = state.store().counts_by_status() {
        for status in JobStatus::ALL {
            let count = counts.get(&status).copied().unwrap_or(0);
            JOBS_BY_STATUS
                .with_label_values(&[status.as_str()])
                .set(count as i64);
        }
    }

    let approvals = state.gate().counts_by_status();
    for status in ApprovalStatus::ALL {
        let count = approvals.get(&status).copied().unwrap_or(0);
        APPROVALS_BY_STATUS
            .with_label_values(&[status.as_str()])
            .set(count as i64);
    }

    for stat in state.recovery().stats() {
        RECOVERY_ATTEMPTS
            .with_label_values(&[stat.kind.as_str(), stat.action.as_str()])
            .set(stat.count as i64);
    }
}

static UUID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}")
        .unwrap()
});

static NUMERIC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/\d+(/|$)").unwrap());

/// Normalize a path for metric labels (replace IDs with placeholders).
///
/// Used for requests that did not match a route; matched requests are
/// labelled with their route template instead.
pub fn normalize_path(path: &str) -> String {
    let result = UUID_RE.replace_all(path, "{id}");
    let result = NUMERIC_RE.replace_all(&result, "/{id}$1");
    result.to_string()
}
