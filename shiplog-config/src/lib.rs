//! Shared configuration library for shiplog.
//!
//! This crate centralizes config defaults, TOML/environment layering, and
//! validation rules. The agent binary and the core supervisor both consume
//! these types so there is a single source of truth for tuning knobs and
//! guard rails.

pub mod loader;
pub mod models;
pub mod validation;

pub use loader::{ConfigSource, load};
pub use models::{
    AgentConfig, AgentSettings, BatchSettings, IngestSettings, RetrySettings,
    UploadSettings, WatchSettings,
};
pub use validation::{ConfigError, ConfigWarning, ConfigWarnings};
