//! Declarative pipeline configuration.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::approval::{ApprovalDecision, ApprovalSpec};
use crate::recovery::ErrorKind;

/// A pipeline of external commands for one job type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Job type this pipeline handles.
    #[serde(rename = "type")]
    pub job_type: String,
    pub stages: Vec<CommandStageConfig>,
}

/// A stage that runs an external program.
///
/// The program receives `{"job": .., "previous": [..]}` on stdin, may write
/// `progress <percent> [message]` lines to stderr and prints its JSON output
/// on stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandStageConfig {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Kill the program after this long (seconds), scaled by the job's
    /// `timeoutMultiplier`.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    /// Failure kind to report instead of classifying the error message.
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    /// Approval requested after every successful run.
    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
}

fn default_timeout() -> u64 {
    300 // 5 minutes
}

/// Approval checkpoint declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(rename = "type")]
    pub approval_type: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_options")]
    pub options: Vec<ApprovalDecision>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_options() -> Vec<ApprovalDecision> {
    ApprovalDecision::ALL.to_vec()
}

impl CheckpointConfig {
    /// Build the approval request, attaching the stage output as its data.
    pub fn to_spec(&self, output: &Value) -> ApprovalSpec {
        let mut spec = ApprovalSpec::new(&self.approval_type, &self.title)
            .with_description(&self.description)
            .with_options(self.options.clone())
            .with_data(output.clone());
        spec.timeout_ms = self.timeout_ms;
        spec
    }
}
