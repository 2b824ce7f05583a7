use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level agent configuration.
///
/// All sections carry defaults so a minimal deployment only has to provide
/// the watch paths and the upload identity.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AgentConfig {
    /// Directory watching and file-stability tuning.
    pub watch: WatchSettings,
    /// File reading and line parsing limits.
    pub ingest: IngestSettings,
    /// Batch assembly thresholds and queue sizing.
    pub batch: BatchSettings,
    /// Retry/backoff policy for transient upload failures.
    pub retry: RetrySettings,
    /// Device identity and object-store endpoint.
    pub upload: UploadSettings,
    /// Process-level knobs: dead-letter path, shutdown budget, control port.
    pub agent: AgentSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchSettings {
    /// Directories monitored for newline-delimited JSON files. At least one
    /// is required; the agent refuses to start on an empty list.
    pub monitoring_paths: Vec<PathBuf>,
    /// Filename glob a file must match before it is tracked.
    pub file_filter: String,
    /// Quiet period a file must hold (no size or mtime change) before it is
    /// considered safe to read end-to-end.
    pub stabilization_period_secs: u64,
    /// Cadence of the full directory rescan that recovers from dropped OS
    /// notifications.
    pub rescan_interval_secs: u64,
    /// Cap on concurrently tracked in-flight paths. Overflow blocks the
    /// notification emitter, which is the intended backpressure.
    pub max_pending_files: usize,
    /// Probe attempts against an erroring file before it is marked failed.
    pub max_probe_attempts: u32,
    /// Watch subdirectories recursively.
    pub recursive: bool,
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            monitoring_paths: Vec::new(),
            file_filter: "*.jsonl".to_string(),
            stabilization_period_secs: 5,
            rescan_interval_secs: 60,
            max_pending_files: 1024,
            max_probe_attempts: 5,
            recursive: true,
        }
    }
}

impl WatchSettings {
    pub fn stabilization_period(&self) -> Duration {
        Duration::from_secs(self.stabilization_period_secs)
    }

    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSettings {
    /// Files read in parallel. Defaults to the host CPU count.
    pub max_concurrency: usize,
    /// Re-open attempts after a mid-stream read error, 500 ms apart.
    pub max_read_retries: u32,
    /// Delay between read retries (linear, not exponential).
    pub read_retry_delay_ms: u64,
    /// Floor for the whole-file read deadline: a file of N bytes gets
    /// `max(N / floor, 10 s)` to stream before the reader gives up.
    pub bytes_per_second_floor: u64,
    /// WARN-level samples logged per file before drop logging goes quiet.
    pub drop_log_sample: u32,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            max_concurrency: num_cpus::get(),
            max_read_retries: 3,
            read_retry_delay_ms: 500,
            bytes_per_second_floor: 1024 * 1024,
            drop_log_sample: 5,
        }
    }
}

impl IngestSettings {
    pub fn read_retry_delay(&self) -> Duration {
        Duration::from_millis(self.read_retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Serialized batch size ceiling. A record that would push the pending
    /// batch past this seals the batch first.
    pub max_bytes: usize,
    /// Record-count ceiling per batch.
    pub max_records: usize,
    /// A non-empty batch older than this is flushed regardless of size.
    pub processing_interval_secs: u64,
    /// A non-empty batch idle (no new records) this long is flushed.
    pub idle_timeout_secs: u64,
    /// Capacity of the record queue between readers and the batch
    /// processor. Enqueue blocks when full.
    pub queue_capacity: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024,
            max_records: 10_000,
            processing_interval_secs: 30,
            idle_timeout_secs: 10,
            queue_capacity: 100_000,
        }
    }
}

impl BatchSettings {
    pub fn processing_interval(&self) -> Duration {
        Duration::from_secs(self.processing_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Attempts per upload before the batch goes to the dead letter.
    pub max_attempts: u32,
    /// First backoff delay.
    pub initial_secs: f64,
    /// Backoff ceiling.
    pub max_secs: f64,
    /// Exponential growth factor between attempts.
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_secs: 1.0,
            max_secs: 30.0,
            multiplier: 2.0,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    /// Device connection string:
    /// `Endpoint=https://...;DeviceId=...;SharedAccessKey=<base64>`.
    /// Treated as a secret; never logged.
    pub connection_string: String,
    /// Device identity under which objects are keyed. When empty, the
    /// `DeviceId` segment of the connection string is used.
    pub device_id: String,
    /// Root prefix of uploaded object keys.
    pub root: String,
    /// Deadline applied to each individual upload attempt.
    pub attempt_timeout_secs: u64,
    /// Lifetime of minted access tokens; refreshed proactively at 80%.
    pub token_ttl_secs: u64,
    /// Reconnect backoff: first delay after a transport-level disconnect.
    pub reconnect_initial_secs: f64,
    /// Reconnect backoff ceiling. Reconnect attempts are unbounded.
    pub reconnect_max_secs: f64,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            connection_string: String::new(),
            device_id: String::new(),
            root: "logs".to_string(),
            attempt_timeout_secs: 30,
            token_ttl_secs: 3600,
            reconnect_initial_secs: 2.0,
            reconnect_max_secs: 300.0,
        }
    }
}

impl UploadSettings {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

// Keep the connection string out of debug output and startup logs.
impl fmt::Debug for UploadSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadSettings")
            .field(
                "connection_string",
                &if self.connection_string.is_empty() {
                    "<unset>"
                } else {
                    "<redacted>"
                },
            )
            .field("device_id", &self.device_id)
            .field("root", &self.root)
            .field("attempt_timeout_secs", &self.attempt_timeout_secs)
            .field("token_ttl_secs", &self.token_ttl_secs)
            .field("reconnect_initial_secs", &self.reconnect_initial_secs)
            .field("reconnect_max_secs", &self.reconnect_max_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Landing zone for batches that exhausted retries or hit a permanent
    /// remote error. Never cleaned up by the agent itself.
    pub dead_letter_path: PathBuf,
    /// Grace period for draining in-flight work at shutdown. Tasks still
    /// running past the budget are abandoned with a warning.
    pub shutdown_budget_secs: u64,
    /// Listen address of the health/control endpoint.
    pub control_listen: String,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            dead_letter_path: PathBuf::from("dead-letter"),
            shutdown_budget_secs: 30,
            control_listen: "127.0.0.1:9464".to_string(),
        }
    }
}

impl AgentSettings {
    pub fn shutdown_budget(&self) -> Duration {
        Duration::from_secs(self.shutdown_budget_secs)
    }
}
