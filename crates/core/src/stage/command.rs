//! Stage backed by an external program.

use std::collections::VecDeque;
use std::process::Stdio;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use super::{CommandStageConfig, Stage, StageContext, StageError};
use crate::approval::ApprovalSpec;
use crate::job::{Job, TIMEOUT_MULTIPLIER_KEY};

static PROGRESS_LINE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^progress\s+(\d{1,3})(?:\s+(.+))?$").ok());

/// Lines of stderr kept for error messages.
const STDERR_TAIL: usize = 20;

/// Runs a configured program with the job on stdin and its output on stdout.
pub struct CommandStage {
    config: CommandStageConfig,
}

impl CommandStage {
    pub fn new(config: CommandStageConfig) -> Self {
        Self { config }
    }

    fn timeout_for(&self, job: &Job) -> Duration {
        let multiplier = job
            .metadata
            .get(TIMEOUT_MULTIPLIER_KEY)
            .and_then(Value::as_f64)
            .filter(|m| *m > 0.0)
            .unwrap_or(1.0);
        let base = Duration::from_secs(self.config.timeout_secs);
        match Duration::try_from_secs_f64(self.config.timeout_secs as f64 * multiplier) {
            Ok(scaled) => scaled,
            Err(e) => {
                warn!(
                    "Stage {}: timeout multiplier {} unusable ({}), using {:?}",
                    self.config.name, multiplier, e, base
                );
                base
            }
        }
    }

    fn error(&self, message: String) -> StageError {
        let err = StageError::new(message);
        match self.config.error_kind {
            Some(kind) => err.with_kind(kind),
            None => err,
        }
    }
}

fn parse_progress(line: &str) -> Option<(u8, Option<String>)> {
    let re = PROGRESS_LINE.as_ref()?;
    let caps = re.captures(line.trim())?;
    let percent = caps.get(1)?.as_str().parse::<u16>().ok()?.min(100) as u8;
    let message = caps.get(2).map(|m| m.as_str().to_string());
    Some((percent, message))
}

fn parse_output(stdout: &[u8]) -> Value {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

#[async_trait]
impl Stage for CommandStage {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn checkpoint(&self, _job: &Job, output: &Value) -> Option<ApprovalSpec> {
        self.config.checkpoint.as_ref().map(|c| c.to_spec(output))
    }

    async fn execute(&self, ctx: StageContext) -> Result<Value, StageError> {
        let limit = self.timeout_for(&ctx.job);
        let input = serde_json::to_vec(&json!({
            "job": ctx.job,
            "previous": ctx.previous,
        }))
        .map_err(|e| StageError::fatal(format!("failed to encode stage input: {}", e)))?;

        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    StageError::fatal(format!("program not found: {}", self.config.program))
                } else {
                    self.error(format!("failed to start {}: {}", self.config.program, e))
                }
            })?;

        let (Some(mut stdin), Some(mut stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(StageError::fatal("stage process pipes unavailable"));
        };

        debug!(
            "Stage {} started {} for job {}",
            self.config.name, self.config.program, ctx.job.id
        );

        let progress = ctx.progress.clone();
        let result = timeout(limit, async {
            // A child that exits without reading stdin is not an error here.
            if let Err(e) = stdin.write_all(&input).await {
                debug!("Stage {} did not read its input: {}", self.config.name, e);
            }
            drop(stdin);

            let read_stdout = async {
                let mut buf = Vec::new();
                stdout.read_to_end(&mut buf).await.map(|_| buf)
            };

            let read_stderr = async {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL);
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some((percent, message)) = parse_progress(&line) {
                        progress.report(percent, message.as_deref());
                        continue;
                    }
                    if tail.len() == STDERR_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                tail
            };

            let (stdout_buf, tail) = tokio::join!(read_stdout, read_stderr);
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, stdout_buf?, tail))
        })
        .await;

        match result {
            Ok(Ok((status, stdout_buf, tail))) => {
                if !status.success() {
                    let detail = tail.back().cloned().unwrap_or_default();
                    return Err(self.error(format!(
                        "stage {} exited with code {:?}: {}",
                        self.config.name,
                        status.code(),
                        detail
                    )));
                }
                Ok(parse_output(&stdout_buf))
            }
            Ok(Err(e)) => Err(self.error(format!("stage {} i/o error: {}", self.config.name, e))),
            Err(_) => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill stage {}: {}", self.config.name, e);
                }
                Err(self.error(format!(
                    "stage {} timed out after {}s",
                    self.config.name,
                    limit.as_secs()
                )))
            }
        }
    }
}
