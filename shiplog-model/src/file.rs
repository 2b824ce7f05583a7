use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::error::{ModelError, Result};

/// Identifier of a watched directory configuration.
pub type WatchId = Uuid;

/// Lifecycle of a tracked file path.
///
/// `Observed -> Stabilizing -> Reading -> Processed -> Archived | Failed`.
/// Transitions are validated by [`FileState::can_transition_to`]; the
/// catalog applies them with compare-and-set so the watcher and a reader
/// never race an entry into an illegal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Observed,
    Stabilizing,
    Reading,
    Processed,
    Archived,
    Failed,
}

impl FileState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileState::Observed => "observed",
            FileState::Stabilizing => "stabilizing",
            FileState::Reading => "reading",
            FileState::Processed => "processed",
            FileState::Archived => "archived",
            FileState::Failed => "failed",
        }
    }

    /// Whether `self -> next` is a legal lifecycle step.
    ///
    /// Re-growth is the one loop: a `Processed` file whose writer appends
    /// again returns to `Stabilizing` under a new write epoch. `Failed`
    /// files also return to `Stabilizing` when the periodic rescan
    /// re-observes them.
    pub fn can_transition_to(&self, next: FileState) -> bool {
        use FileState::*;
        matches!(
            (self, next),
            (Observed, Stabilizing)
                | (Stabilizing, Stabilizing)
                | (Stabilizing, Reading)
                | (Stabilizing, Failed)
                | (Reading, Processed)
                | (Reading, Failed)
                | (Processed, Stabilizing)
                | (Processed, Archived)
                | (Failed, Stabilizing)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FileState::Archived | FileState::Failed)
    }
}

/// One tracked file path and what the watcher knows about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub path: PathBuf,
    pub state: FileState,
    /// Size observed at the last stability probe.
    pub last_size: u64,
    /// Modification time observed at the last stability probe.
    pub last_mtime: Option<DateTime<Utc>>,
    /// Successive probes that saw no change.
    pub stable_polls: u32,
    /// Incremented each time the file grows again after a `FileStable`
    /// emission, so append-then-quiesce cycles re-fire exactly once each.
    pub write_epoch: u64,
    /// Watch configuration that owns this path.
    pub watch_id: WatchId,
    /// Set when encoding detection fell back to UTF-8 on ambiguous bytes.
    pub encoding_warning: bool,
}

impl FileDescriptor {
    pub fn new(path: PathBuf, watch_id: WatchId) -> Self {
        Self {
            path,
            state: FileState::Observed,
            last_size: 0,
            last_mtime: None,
            stable_polls: 0,
            write_epoch: 0,
            watch_id,
            encoding_warning: false,
        }
    }

    /// Apply a transition, rejecting illegal steps.
    pub fn transition(&mut self, next: FileState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(ModelError::IllegalTransition {
                from: self.state.as_str(),
                to: next.as_str(),
            });
        }
        self.state = next;
        Ok(())
    }
}
