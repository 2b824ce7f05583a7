use std::fmt;

use thiserror::Error;

use crate::models::AgentConfig;

/// Fatal configuration problems. Any of these aborts startup with exit
/// code 1.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no monitoring paths configured; [watch].monitoring_paths needs at least one entry")]
    NoMonitoringPaths,

    #[error("monitoring path is not a directory: {0}")]
    MonitoringPathMissing(String),

    #[error("invalid file filter {filter:?}: {reason}")]
    InvalidFileFilter { filter: String, reason: String },

    #[error("[upload].connection_string is required")]
    MissingConnectionString,

    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("{field} must be greater than zero")]
    ZeroLimit { field: &'static str },

    #[error("batch queue capacity {capacity} is below [batch].max_records {max_records}; the queue could never fill one batch")]
    QueueSmallerThanBatch { capacity: usize, max_records: usize },

    #[error("failed to read configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// A non-fatal observation about the configuration. Logged at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    ShortShutdownBudget(u64),
    LargeBatchBytes(usize),
    TinyStabilizationPeriod(u64),
}

impl fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigWarning::ShortShutdownBudget(secs) => write!(
                f,
                "shutdown budget of {secs}s may not cover a final flush plus upload retries"
            ),
            ConfigWarning::LargeBatchBytes(bytes) => write!(
                f,
                "batch.max_bytes of {bytes} exceeds 64 MiB; uploads of this size retry poorly"
            ),
            ConfigWarning::TinyStabilizationPeriod(secs) => write!(
                f,
                "stabilization period of {secs}s risks reading files that are still being written"
            ),
        }
    }
}

pub type ConfigWarnings = Vec<ConfigWarning>;

/// Apply the guard rails. Returns the warning list when the configuration
/// is usable; the first fatal problem otherwise.
pub fn validate(config: &AgentConfig) -> Result<ConfigWarnings, ConfigError> {
    if config.watch.monitoring_paths.is_empty() {
        return Err(ConfigError::NoMonitoringPaths);
    }
    for path in &config.watch.monitoring_paths {
        if !path.is_dir() {
            return Err(ConfigError::MonitoringPathMissing(
                path.display().to_string(),
            ));
        }
    }
    if config.watch.file_filter.trim().is_empty() {
        return Err(ConfigError::InvalidFileFilter {
            filter: config.watch.file_filter.clone(),
            reason: "empty pattern".to_string(),
        });
    }
    if config.batch.max_bytes == 0 {
        return Err(ConfigError::ZeroLimit {
            field: "batch.max_bytes",
        });
    }
    if config.batch.max_records == 0 {
        return Err(ConfigError::ZeroLimit {
            field: "batch.max_records",
        });
    }
    if config.batch.queue_capacity == 0 {
        return Err(ConfigError::ZeroLimit {
            field: "batch.queue_capacity",
        });
    }
    if config.ingest.max_concurrency == 0 {
        return Err(ConfigError::ZeroLimit {
            field: "ingest.max_concurrency",
        });
    }
    if config.retry.max_attempts == 0 {
        return Err(ConfigError::ZeroLimit {
            field: "retry.max_attempts",
        });
    }
    if config.batch.queue_capacity < config.batch.max_records {
        return Err(ConfigError::QueueSmallerThanBatch {
            capacity: config.batch.queue_capacity,
            max_records: config.batch.max_records,
        });
    }
    if config.upload.connection_string.trim().is_empty() {
        return Err(ConfigError::MissingConnectionString);
    }
    check_connection_string_shape(&config.upload.connection_string)?;

    let mut warnings = Vec::new();
    if config.agent.shutdown_budget_secs < 5 {
        warnings.push(ConfigWarning::ShortShutdownBudget(
            config.agent.shutdown_budget_secs,
        ));
    }
    if config.batch.max_bytes > 64 * 1024 * 1024 {
        warnings.push(ConfigWarning::LargeBatchBytes(config.batch.max_bytes));
    }
    if config.watch.stabilization_period_secs < 2 {
        warnings.push(ConfigWarning::TinyStabilizationPeriod(
            config.watch.stabilization_period_secs,
        ));
    }
    Ok(warnings)
}

/// Cheap structural check so an obviously broken connection string fails
/// at startup instead of as an auth error; the full parse (base64 key
/// decode and so on) stays with the credential layer.
fn check_connection_string_shape(raw: &str) -> Result<(), ConfigError> {
    let mut has_endpoint = false;
    let mut has_key = false;
    for segment in raw.split(';').filter(|s| !s.trim().is_empty()) {
        let Some((name, value)) = segment.split_once('=') else {
            return Err(ConfigError::InvalidConnectionString(
                "segment without '='".to_string(),
            ));
        };
        match name.trim() {
            "Endpoint" => has_endpoint = !value.trim().is_empty(),
            "SharedAccessKey" => has_key = !value.trim().is_empty(),
            _ => {}
        }
    }
    if !has_endpoint {
        return Err(ConfigError::InvalidConnectionString(
            "missing Endpoint segment".to_string(),
        ));
    }
    if !has_key {
        return Err(ConfigError::InvalidConnectionString(
            "missing SharedAccessKey segment".to_string(),
        ));
    }
    Ok(())
}
