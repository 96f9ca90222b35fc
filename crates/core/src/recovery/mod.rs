//! Failure classification, recovery strategies and bounded retry.

mod classify;
mod config;
mod coordinator;
mod strategy;

use std::path::PathBuf;
use std::sync::Arc;

use crate::job::JobStore;
use crate::notify::NotificationHub;

pub use classify::{classify, ErrorKind};
pub use config::RecoveryConfig;
pub use coordinator::{
    RecoveryAction, RecoveryContext, RecoveryCoordinator, RecoveryError, RecoveryResult,
    RecoveryStat, StrategyInfo,
};
pub use strategy::{
    FallbackMode, PrepareWorkDir, PruneListeners, RecoveryStrategy, ResetSnapshotStore,
    ResettableResource, ShedLowPriority, StrategyOutcome,
};

/// The standard strategy set.
///
/// `reset-snapshot-store` is only included when a resettable snapshot
/// resource is available. Network and unknown failures have no strategy.
pub fn builtin_strategies(
    store: Arc<dyn JobStore>,
    hub: Arc<NotificationHub>,
    work_dir: impl Into<PathBuf>,
    snapshot: Option<Arc<dyn ResettableResource>>,
) -> Vec<Arc<dyn RecoveryStrategy>> {
    let mut strategies: Vec<Arc<dyn RecoveryStrategy>> = vec![
        Arc::new(ShedLowPriority::new(store.clone(), hub.clone())),
        Arc::new(PruneListeners::new(hub)),
        Arc::new(PrepareWorkDir::new(work_dir)),
        Arc::new(FallbackMode::new(store)),
    ];
    if let Some(resource) = snapshot {
        strategies.push(Arc::new(ResetSnapshotStore::new(resource)));
    }
    strategies
}
