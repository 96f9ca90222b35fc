use std::sync::Arc;

use jobflow_core::{
    ApprovalGate, Config, JobStore, NotificationHub, Orchestrator, RecoveryCoordinator,
    SanitizedConfig,
};

/// Shared application state
pub struct AppState {
    config: Config,
    orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(config: Config, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            config,
            orchestrator,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        self.orchestrator.store()
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        self.orchestrator.hub()
    }

    pub fn gate(&self) -> &ApprovalGate {
        self.orchestrator.gate()
    }

    pub fn recovery(&self) -> &Arc<RecoveryCoordinator> {
        self.orchestrator.recovery()
    }
}
