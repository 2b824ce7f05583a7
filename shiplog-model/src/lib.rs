//! Core data model definitions shared across shiplog crates.
#![allow(missing_docs)]

pub mod batch;
pub mod error;
pub mod file;
pub mod level;
pub mod record;
pub mod sanitize;

// Intentionally curated re-exports for downstream consumers.
pub use batch::{Batch, BatchId};
pub use error::{ModelError, Result as ModelResult};
pub use file::{FileDescriptor, FileState, WatchId};
pub use level::LogLevel;
pub use record::{ErrorDetail, LogRecord};
