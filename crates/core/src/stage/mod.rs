//! Pipeline stages: the units of work a job runs through.

mod command;
mod config;
mod context;
mod registry;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::approval::ApprovalSpec;
use crate::job::Job;
use crate::recovery::ErrorKind;

pub use command::CommandStage;
pub use config::{CheckpointConfig, CommandStageConfig, PipelineConfig};
pub use context::{ProgressReporter, StageContext};
pub use registry::PipelineRegistry;

/// Failure reported by a stage.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StageError {
    pub message: String,
    /// Explicit kind, skipping message-based classification.
    pub kind: Option<ErrorKind>,
    /// False when recovery must not be attempted.
    pub retryable: bool,
}

impl StageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            retryable: true,
        }
    }

    /// An error no strategy or retry can fix.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            retryable: false,
        }
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = Some(kind);
        self
    }
}

/// One ordered step of a pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Approval to request once the stage has produced `output`.
    fn checkpoint(&self, _job: &Job, _output: &Value) -> Option<ApprovalSpec> {
        None
    }

    async fn execute(&self, ctx: StageContext) -> Result<Value, StageError>;
}
