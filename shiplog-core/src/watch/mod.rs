//! Directory watching: stability arbitration, the notify-backed watcher,
//! and the file-descriptor catalog.

pub mod catalog;
pub mod stability;
pub mod watcher;

pub use catalog::FileCatalog;
pub use stability::{Observation, Stability, StabilityArbiter};
pub use watcher::{
    ChangeMask, DirectoryWatcher, FileStable, WatchConfig, WatchEvent, WatcherTuning,
};
