use std::collections::HashSet;

use super::{types::Config, ConfigError};

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

/// Validate configuration
/// Currently validates:
/// - Server port is not 0
/// - Intervals, buffers and limits are non-zero
/// - Retry backoff bounds are ordered
/// - Pipelines have unique types, at least one stage, unique stage names
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    // Server validation
    if config.server.port == 0 {
        return Err(invalid("server.port cannot be 0"));
    }

    // Storage validation
    if config.storage.snapshot_interval_secs == 0 {
        return Err(invalid("storage.snapshot_interval_secs must be at least 1"));
    }
    if config.storage.cleanup_interval_secs == 0 {
        return Err(invalid("storage.cleanup_interval_secs must be at least 1"));
    }

    // Orchestrator validation
    if config.orchestrator.max_concurrent_jobs == 0 {
        return Err(invalid("orchestrator.max_concurrent_jobs must be at least 1"));
    }

    // Approval validation
    if config.approval.default_timeout_ms == 0 {
        return Err(invalid("approval.default_timeout_ms must be at least 1"));
    }

    // Recovery validation
    let recovery = &config.recovery;
    if recovery.max_attempts == 0 {
        return Err(invalid("recovery.max_attempts must be at least 1"));
    }
    if recovery.base_delay_ms > recovery.max_delay_ms {
        return Err(invalid(format!(
            "recovery.base_delay_ms ({}) exceeds recovery.max_delay_ms ({})",
            recovery.base_delay_ms, recovery.max_delay_ms
        )));
    }
    if recovery.watchdog_interval_secs == 0 {
        return Err(invalid("recovery.watchdog_interval_secs must be at least 1"));
    }

    // Notification validation
    if config.notifications.listener_buffer == 0 {
        return Err(invalid("notifications.listener_buffer must be at least 1"));
    }

    // Pipeline validation
    let mut types = HashSet::new();
    for pipeline in &config.pipelines {
        if pipeline.job_type.is_empty() {
            return Err(invalid("pipeline type cannot be empty"));
        }
        if !types.insert(pipeline.job_type.as_str()) {
            return Err(invalid(format!(
                "pipeline type '{}' is defined more than once",
                pipeline.job_type
            )));
        }
        if pipeline.stages.is_empty() {
            return Err(invalid(format!(
                "pipeline '{}' has no stages",
                pipeline.job_type
            )));
        }

        let mut names = HashSet::new();
        for stage in &pipeline.stages {
            if !names.insert(stage.name.as_str()) {
                return Err(invalid(format!(
                    "pipeline '{}' has more than one stage named '{}'",
                    pipeline.job_type, stage.name
                )));
            }
            if stage.program.is_empty() {
                return Err(invalid(format!(
                    "stage '{}' of pipeline '{}' has no program",
                    stage.name, pipeline.job_type
                )));
            }
        }
    }

    Ok(())
}
