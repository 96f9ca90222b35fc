pub mod approval;
pub mod config;
pub mod job;
pub mod notify;
pub mod orchestrator;
pub mod recovery;
pub mod snapshot;
pub mod stage;
pub mod testing;

pub use approval::{
    Approval, ApprovalDecision, ApprovalError, ApprovalGate, ApprovalReply, ApprovalSpec,
    ApprovalStatus,
};
pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, SanitizedConfig,
};
pub use job::{
    CreateJobRequest, InMemoryJobStore, Job, JobError, JobFilter, JobStatus, JobStore, JobUpdate,
    StageResult,
};
pub use notify::{JobEvent, Listener, NotificationHub};
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorError, OrchestratorStatus};
pub use recovery::{
    builtin_strategies, classify, ErrorKind, RecoveryConfig, RecoveryCoordinator, RecoveryError,
    RecoveryStrategy,
};
pub use snapshot::{SnapshotError, SnapshotStore, Snapshotter, SqliteSnapshotStore};
pub use stage::{PipelineRegistry, Stage, StageContext, StageError};
