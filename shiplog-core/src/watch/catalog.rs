//! Catalog of every file path the agent has ever tracked.
//!
//! Exactly one entry per absolute path. Entries are created by the watcher
//! and mutated by the watcher and readers through compare-and-set on the
//! state field, so concurrent actors never race an entry into an illegal
//! transition.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use dashmap::DashMap;
use shiplog_model::{FileDescriptor, FileState, WatchId};

use crate::error::{AgentError, Result};

#[derive(Debug)]
pub struct FileCatalog {
    entries: DashMap<PathBuf, FileDescriptor>,
    /// Terminal entries in retirement order, pruned past `terminal_cap`.
    terminal_order: Mutex<VecDeque<PathBuf>>,
    terminal_cap: usize,
}

impl FileCatalog {
    pub fn new(terminal_cap: usize) -> Self {
        Self {
            entries: DashMap::new(),
            terminal_order: Mutex::new(VecDeque::new()),
            terminal_cap,
        }
    }

    /// Create the entry for `path` if this is the first observation.
    /// Returns a snapshot either way.
    pub fn observe(&self, path: &Path, watch_id: WatchId) -> FileDescriptor {
        self.entries
            .entry(path.to_path_buf())
            .or_insert_with(|| FileDescriptor::new(path.to_path_buf(), watch_id))
            .clone()
    }

    pub fn get(&self, path: &Path) -> Option<FileDescriptor> {
        self.entries.get(path).map(|entry| entry.clone())
    }

    /// Transition `path` from `expect` to `next`.
    ///
    /// Returns `Ok(false)` when the current state is not `expect` (another
    /// actor got there first); `Err` when the step itself is illegal, which
    /// is an internal invariant violation, not a race.
    pub fn compare_and_set(
        &self,
        path: &Path,
        expect: FileState,
        next: FileState,
    ) -> Result<bool> {
        let Some(mut entry) = self.entries.get_mut(path) else {
            return Ok(false);
        };
        if entry.state != expect {
            return Ok(false);
        }
        entry
            .transition(next)
            .map_err(|e| AgentError::Internal(e.to_string()))?;
        let became_terminal = next.is_terminal();
        drop(entry);

        if became_terminal {
            self.retire(path);
        }
        Ok(true)
    }

    /// Bump the write epoch of `path`, returning the new value.
    pub fn bump_epoch(&self, path: &Path) -> Option<u64> {
        self.entries.get_mut(path).map(|mut entry| {
            entry.write_epoch += 1;
            entry.write_epoch
        })
    }

    pub fn epoch(&self, path: &Path) -> Option<u64> {
        self.entries.get(path).map(|entry| entry.write_epoch)
    }

    /// Record the size/mtime a stability decision was based on. The rescan
    /// uses this to tell a re-grown processed file from an unchanged one.
    pub fn record_observation(
        &self,
        path: &Path,
        size: u64,
        mtime: Option<chrono::DateTime<chrono::Utc>>,
        stable_polls: u32,
    ) {
        if let Some(mut entry) = self.entries.get_mut(path) {
            entry.last_size = size;
            entry.last_mtime = mtime;
            entry.stable_polls = stable_polls;
        }
    }

    pub fn set_encoding_warning(&self, path: &Path) {
        if let Some(mut entry) = self.entries.get_mut(path) {
            entry.encoding_warning = true;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Per-state entry counts for the health surface.
    pub fn state_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.entries.iter() {
            *counts.entry(entry.state.as_str()).or_insert(0) += 1;
        }
        counts
    }

    fn retire(&self, path: &Path) {
        let mut order = self.terminal_order.lock().expect("terminal order lock");
        order.push_back(path.to_path_buf());
        while order.len() > self.terminal_cap {
            if let Some(oldest) = order.pop_front() {
                // Only drop entries that are still terminal; a re-grown file
                // has left retirement and keeps its catalog entry.
                let still_terminal = self
                    .entries
                    .get(&oldest)
                    .is_some_and(|entry| entry.state.is_terminal());
                if still_terminal {
                    self.entries.remove(&oldest);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn catalog() -> FileCatalog {
        FileCatalog::new(4)
    }

    #[test]
    fn observe_is_idempotent() {
        let catalog = catalog();
        let watch = Uuid::new_v4();
        let a = catalog.observe(Path::new("/logs/a.jsonl"), watch);
        let b = catalog.observe(Path::new("/logs/a.jsonl"), watch);
        assert_eq!(a.path, b.path);
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn cas_only_applies_from_expected_state() {
        let catalog = catalog();
        let watch = Uuid::new_v4();
        let path = Path::new("/logs/a.jsonl");
        catalog.observe(path, watch);

        assert!(catalog
            .compare_and_set(path, FileState::Observed, FileState::Stabilizing)
            .unwrap());
        // A second racer sees the state already moved on.
        assert!(!catalog
            .compare_and_set(path, FileState::Observed, FileState::Stabilizing)
            .unwrap());
        // An illegal step is an invariant violation, not a race.
        assert!(catalog
            .compare_and_set(path, FileState::Stabilizing, FileState::Archived)
            .is_err());
    }

    #[test]
    fn epochs_increment_per_regrowth() {
        let catalog = catalog();
        let path = Path::new("/logs/a.jsonl");
        catalog.observe(path, Uuid::new_v4());
        assert_eq!(catalog.epoch(path), Some(0));
        assert_eq!(catalog.bump_epoch(path), Some(1));
        assert_eq!(catalog.bump_epoch(path), Some(2));
    }

    #[test]
    fn terminal_entries_are_pruned_past_cap() {
        let catalog = FileCatalog::new(2);
        let watch = Uuid::new_v4();
        for i in 0..5 {
            let path = PathBuf::from(format!("/logs/{i}.jsonl"));
            catalog.observe(&path, watch);
            catalog
                .compare_and_set(&path, FileState::Observed, FileState::Stabilizing)
                .unwrap();
            catalog
                .compare_and_set(&path, FileState::Stabilizing, FileState::Reading)
                .unwrap();
            catalog
                .compare_and_set(&path, FileState::Reading, FileState::Processed)
                .unwrap();
            catalog
                .compare_and_set(&path, FileState::Processed, FileState::Archived)
                .unwrap();
        }
        assert_eq!(catalog.len(), 2, "only the cap of archived entries remains");
    }
}
