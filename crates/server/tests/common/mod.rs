//! Shared test infrastructure for API integration tests.
//!
//! Builds the full router over an in-memory job store and mock stages, and
//! drives it in-process with `tower::ServiceExt::oneshot`.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use jobflow_core::testing::MockStage;
use jobflow_core::{
    builtin_strategies, ApprovalGate, ApprovalSpec, Config, InMemoryJobStore, Job, JobStatus,
    JobStore, NotificationHub, Orchestrator, OrchestratorConfig, PipelineRegistry,
    RecoveryCoordinator, StageError,
};
use jobflow_server::state::AppState;

/// Response from a test request.
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
    pub text: String,
}

/// Test fixture holding the router and the components behind it.
pub struct TestFixture {
    /// The Axum router for testing
    pub router: Router,
    pub state: Arc<AppState>,
    pub store: Arc<InMemoryJobStore>,
    pub orchestrator: Arc<Orchestrator>,
    /// Stage that fails every call with a non-retryable error
    pub broken: Arc<MockStage>,
    /// Temp directory for the work dir (kept alive for the test)
    pub temp_dir: TempDir,
}

impl TestFixture {
    /// Pipelines available to tests:
    /// - `quick`: one `extract` stage
    /// - `reviewed`: `analyse` with an approval checkpoint, then `generate`
    /// - `broken`: one stage that always fails fatally
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");

        let broken = Arc::new(MockStage::new("convert"));
        let pipelines = PipelineRegistry::new()
            .with_pipeline("quick", vec![Arc::new(MockStage::new("extract"))])
            .with_pipeline(
                "reviewed",
                vec![
                    Arc::new(MockStage::new("analyse").with_checkpoint(
                        ApprovalSpec::new("analysis_review", "Review the analysis"),
                    )),
                    Arc::new(MockStage::new("generate")),
                ],
            )
            .with_pipeline("broken", vec![broken.clone()]);

        let config = Config::default();
        let store = Arc::new(InMemoryJobStore::new());
        let hub = Arc::new(NotificationHub::new(64));
        let gate = ApprovalGate::new(store.clone(), hub.clone(), Duration::from_secs(3600));
        let work_dir = temp_dir.path().join("work");

        let recovery = Arc::new(
            RecoveryCoordinator::new(config.recovery.clone(), store.clone(), hub.clone())
                .with_strategies(builtin_strategies(
                    store.clone(),
                    hub.clone(),
                    work_dir.clone(),
                    None,
                )),
        );

        let orchestrator = Arc::new(Orchestrator::new(
            OrchestratorConfig {
                work_dir,
                ..OrchestratorConfig::default()
            },
            store.clone(),
            hub,
            gate,
            recovery,
            pipelines,
        ));

        let state = Arc::new(AppState::new(config, orchestrator.clone()));
        let router = jobflow_server::api::create_router(state.clone());

        Self {
            router,
            state,
            store,
            orchestrator,
            broken,
            temp_dir,
        }
    }

    /// Make the `broken` pipeline fail on every call.
    pub async fn break_converter(&self) {
        self.broken
            .fail_always(StageError::fatal("unsupported input format"))
            .await;
    }

    pub fn job(&self, id: &str) -> Job {
        self.store
            .get(id)
            .expect("store error")
            .expect("job not found")
    }

    /// Poll until the job reaches `status`.
    pub async fn wait_for(&self, id: &str, status: JobStatus) -> Job {
        for _ in 0..2000 {
            let job = self.job(id);
            if job.status == status {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let job = self.job(id);
        panic!("job {} stuck in {} while waiting for {}", id, job.status, status);
    }

    /// Send a GET request.
    pub async fn get(&self, path: &str) -> TestResponse {
        self.request("GET", path, None).await
    }

    /// Send a POST request with JSON body.
    pub async fn post(&self, path: &str, body: Value) -> TestResponse {
        self.request("POST", path, Some(body)).await
    }

    /// Send a POST request without a body.
    pub async fn post_empty(&self, path: &str) -> TestResponse {
        self.request("POST", path, None).await
    }

    /// Send a DELETE request.
    pub async fn delete(&self, path: &str) -> TestResponse {
        self.request("DELETE", path, None).await
    }

    /// Send a DELETE request with JSON body.
    pub async fn delete_with_body(&self, path: &str, body: Value) -> TestResponse {
        self.request("DELETE", path, Some(body)).await
    }

    /// Send a request to the router.
    async fn request(&self, method: &str, path: &str, body: Option<Value>) -> TestResponse {
        let mut request_builder = Request::builder().method(method).uri(path);

        let body = if let Some(json_body) = body {
            request_builder = request_builder.header("Content-Type", "application/json");
            Body::from(serde_json::to_vec(&json_body).unwrap())
        } else {
            Body::empty()
        };

        let request = request_builder.body(body).unwrap();

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Failed to send request");

        let status = response.status();
        let body_bytes = response
            .into_body()
            .collect()
            .await
            .expect("Failed to collect body")
            .to_bytes();

        let text = String::from_utf8_lossy(&body_bytes).to_string();
        let body: Value = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
        };

        TestResponse { status, body, text }
    }
}
