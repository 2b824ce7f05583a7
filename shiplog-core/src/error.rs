use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Watch configuration error: {0}")]
    WatchConfig(String),

    #[error("File failed: {path}: {reason}")]
    FileFailed { path: PathBuf, reason: String },

    #[error("Record of {bytes} bytes exceeds batch limit of {limit}")]
    RecordTooLarge { bytes: usize, limit: usize },

    #[error("Queue closed")]
    QueueClosed,

    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Remote rejected request: status {status}: {detail}")]
    RemoteStatus { status: u16, detail: String },

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Deadline exceeded: {0}")]
    Timeout(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
