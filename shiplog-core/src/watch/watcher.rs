//! Translates filesystem notifications into `FileStable` events.
//!
//! One notify watcher per registered directory feeds a bounded raw-event
//! channel. A single dispatcher task owns the per-path debounce map,
//! consults the stability arbiter when a debounce window closes, and emits
//! `FileStable` exactly once per (path, write-epoch). Dropped OS
//! notifications are recovered by a periodic full rescan.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use shiplog_config::WatchSettings;
use shiplog_model::{FileState, WatchId};

use crate::error::{AgentError, Result};
use crate::health::{ComponentStatus, HealthReporter as _};
use crate::supervision::{self, RestartBudget, Supervision};
use crate::watch::catalog::FileCatalog;
use crate::watch::stability::{Observation, Stability, StabilityArbiter};

/// Which raw change kinds a watch reacts to.
#[derive(Debug, Clone, Copy)]
pub struct ChangeMask {
    pub create: bool,
    pub modify: bool,
    pub rename_into: bool,
}

impl Default for ChangeMask {
    fn default() -> Self {
        Self {
            create: true,
            modify: true,
            rename_into: true,
        }
    }
}

/// One monitored directory.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    pub id: WatchId,
    pub path: PathBuf,
    pub filter: glob::Pattern,
    pub recursive: bool,
    pub mask: ChangeMask,
}

impl WatchConfig {
    pub fn new(path: PathBuf, filter: &str, recursive: bool) -> Result<Self> {
        let filter = glob::Pattern::new(filter).map_err(|e| {
            AgentError::WatchConfig(format!("invalid file filter {filter:?}: {e}"))
        })?;
        Ok(Self {
            id: Uuid::new_v4(),
            path,
            filter,
            recursive,
            mask: ChangeMask::default(),
        })
    }

    fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| self.filter.matches(name))
    }
}

/// Informational stream: raw observations, before any stability decision.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    FileCreated { watch_id: WatchId, path: PathBuf },
    FileChanged { watch_id: WatchId, path: PathBuf },
}

/// A file that held still for the stabilization period. Consumed by the
/// reader pool; `epoch` lets a reader discard stale emissions after the
/// writer re-opened the file.
#[derive(Debug, Clone)]
pub struct FileStable {
    pub watch_id: WatchId,
    pub path: PathBuf,
    pub epoch: u64,
    pub size: u64,
}

/// Timing and capacity knobs, separated from [`WatchSettings`] so tests
/// can run with millisecond windows.
#[derive(Debug, Clone, Copy)]
pub struct WatcherTuning {
    pub stabilization_period: Duration,
    pub rescan_interval: Duration,
    pub max_pending_files: usize,
    pub max_probe_attempts: u32,
}

impl From<&WatchSettings> for WatcherTuning {
    fn from(settings: &WatchSettings) -> Self {
        Self {
            stabilization_period: settings.stabilization_period(),
            rescan_interval: settings.rescan_interval(),
            max_pending_files: settings.max_pending_files,
            max_probe_attempts: settings.max_probe_attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawKind {
    Created,
    Changed,
}

#[derive(Debug)]
struct RawEvent {
    watch_id: WatchId,
    path: PathBuf,
    kind: RawKind,
}

/// Debounce entry for one in-flight path.
#[derive(Debug)]
struct Pending {
    watch_id: WatchId,
    epoch: u64,
    deadline: Instant,
    observation: Option<Observation>,
    probe_errors: u32,
}

struct WatchHandle {
    config: WatchConfig,
    // Held for its Drop: dropping the notify watcher stops the stream.
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("config", &self.config)
            .finish()
    }
}

/// Directory watcher. See the module docs for the moving parts.
pub struct DirectoryWatcher {
    tuning: WatcherTuning,
    arbiter: StabilityArbiter,
    catalog: Arc<FileCatalog>,
    watches: Arc<DashMap<WatchId, WatchHandle>>,
    raw_tx: mpsc::Sender<RawEvent>,
    raw_rx: std::sync::Mutex<Option<mpsc::Receiver<RawEvent>>>,
    events_tx: broadcast::Sender<WatchEvent>,
    stable_tx: mpsc::Sender<FileStable>,
}

impl std::fmt::Debug for DirectoryWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryWatcher")
            .field("tuning", &self.tuning)
            .field("watch_count", &self.watches.len())
            .finish()
    }
}

/// Raw-event channel depth. Small on purpose: once the debounce map is at
/// `max_pending_files`, the dispatcher stops draining this channel and the
/// notify callback blocks, which is the backpressure contract.
const RAW_CHANNEL_CAPACITY: usize = 256;

impl DirectoryWatcher {
    pub fn new(
        tuning: WatcherTuning,
        arbiter: StabilityArbiter,
        catalog: Arc<FileCatalog>,
        stable_tx: mpsc::Sender<FileStable>,
    ) -> Self {
        let (raw_tx, raw_rx) = mpsc::channel(RAW_CHANNEL_CAPACITY);
        let (events_tx, _) = broadcast::channel(1024);
        Self {
            tuning,
            arbiter,
            catalog,
            watches: Arc::new(DashMap::new()),
            raw_tx,
            raw_rx: std::sync::Mutex::new(Some(raw_rx)),
            events_tx,
            stable_tx,
        }
    }

    /// Subscribe to the informational `FileCreated`/`FileChanged` stream.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.events_tx.subscribe()
    }

    /// Register a directory. The directory must already exist; the agent
    /// never creates watch roots.
    pub fn add_watch(&self, config: WatchConfig) -> Result<WatchId> {
        if !config.path.is_dir() {
            return Err(AgentError::WatchConfig(format!(
                "watch path is not a directory: {}",
                config.path.display()
            )));
        }

        let raw_tx = self.raw_tx.clone();
        let watch_id = config.id;
        let filter = config.filter.clone();
        let mask = config.mask;
        let mut watcher = notify::recommended_watcher(
            move |result: std::result::Result<Event, notify::Error>| {
                let event = match result {
                    Ok(event) => event,
                    Err(error) => {
                        // Dropped notifications are recovered by the rescan.
                        warn!(%error, "filesystem notification error");
                        return;
                    }
                };
                let Some(kind) = convert_kind(&event.kind, mask) else {
                    return;
                };
                for path in &event.paths {
                    let name_matches = path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| filter.matches(n));
                    if !name_matches {
                        continue;
                    }
                    // Blocking send: a full pipeline stalls the notify
                    // thread rather than dropping or buffering unboundedly.
                    if raw_tx
                        .blocking_send(RawEvent {
                            watch_id,
                            path: path.clone(),
                            kind,
                        })
                        .is_err()
                    {
                        return;
                    }
                }
            },
        )
        .map_err(|e| AgentError::WatchConfig(format!("failed to create watcher: {e}")))?;

        let mode = if config.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher
            .watch(&config.path, mode)
            .map_err(|e| AgentError::WatchConfig(format!("failed to watch path: {e}")))?;

        info!(watch_id = %watch_id, path = %config.path.display(), "watching directory");
        self.watches.insert(
            watch_id,
            WatchHandle {
                config,
                _watcher: watcher,
            },
        );
        Ok(watch_id)
    }

    /// Stop watching. Returns whether the id was known. Already-tracked
    /// files keep flowing; only new notifications stop.
    pub fn remove_watch(&self, id: WatchId) -> bool {
        let removed = self.watches.remove(&id).is_some();
        if removed {
            info!(watch_id = %id, "stopped watching directory");
        }
        removed
    }

    pub fn list(&self) -> Vec<WatchConfig> {
        self.watches
            .iter()
            .map(|entry| entry.config.clone())
            .collect()
    }

    /// Spawn the dispatcher. Call once; a second call is an error.
    ///
    /// A panic in the dispatcher loses only the in-flight debounce map
    /// (the rescan re-discovers those paths); the task restarts within the
    /// supervision budget.
    pub fn start(
        self: &Arc<Self>,
        token: CancellationToken,
        supervision: Supervision,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let mut raw_rx = self
            .raw_rx
            .lock()
            .expect("raw receiver lock")
            .take()
            .ok_or_else(|| AgentError::Internal("watcher already started".to_string()))?;
        let watcher = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let mut budget = RestartBudget::new();
            loop {
                let run = std::panic::AssertUnwindSafe(
                    watcher.run_dispatcher(&mut raw_rx, token.clone()),
                )
                .catch_unwind();
                match run.await {
                    Ok(()) => break,
                    Err(payload) => {
                        let message = supervision::panic_message(payload.as_ref());
                        error!(task = "watcher", message, "task panicked");
                        if budget.allow_restart() {
                            warn!(task = "watcher", "restarting after panic");
                            continue;
                        }
                        supervision.health.report("watcher", ComponentStatus::Failed);
                        supervision.fatal.cancel();
                        break;
                    }
                }
            }
        }))
    }

    async fn run_dispatcher(&self, raw_rx: &mut mpsc::Receiver<RawEvent>, token: CancellationToken) {
        let mut pending: HashMap<PathBuf, Pending> = HashMap::new();
        let mut rescan = tokio::time::interval(self.tuning.rescan_interval);
        rescan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; that initial
        // rescan is also what picks up files that predate the agent.
        loop {
            let next_deadline = pending.values().map(|p| p.deadline).min();
            let at_capacity = pending.len() >= self.tuning.max_pending_files;

            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(pending = pending.len(), "watcher dispatcher cancelled");
                    break;
                }
                _ = rescan.tick() => {
                    self.full_rescan(&mut pending).await;
                }
                _ = sleep_until_opt(next_deadline) => {
                    self.fire_due(&mut pending, &token).await;
                }
                raw = raw_rx.recv(), if !at_capacity => {
                    match raw {
                        Some(event) => self.handle_raw(event, &mut pending),
                        None => break,
                    }
                }
            }
        }
    }

    fn handle_raw(&self, event: RawEvent, pending: &mut HashMap<PathBuf, Pending>) {
        let descriptor = self.catalog.observe(&event.path, event.watch_id);

        let info = match event.kind {
            RawKind::Created => WatchEvent::FileCreated {
                watch_id: event.watch_id,
                path: event.path.clone(),
            },
            RawKind::Changed => WatchEvent::FileChanged {
                watch_id: event.watch_id,
                path: event.path.clone(),
            },
        };
        // Informational; no subscriber is fine.
        let _ = self.events_tx.send(info);

        let deadline = Instant::now() + self.tuning.stabilization_period;
        if let Some(entry) = pending.get_mut(&event.path) {
            // Already debouncing: the writer is still active, push the
            // window out. The arbiter will see any growth on its own.
            entry.deadline = deadline;
            return;
        }

        let epoch = match descriptor.state {
            FileState::Observed => {
                match self
                    .catalog
                    .compare_and_set(&event.path, FileState::Observed, FileState::Stabilizing)
                {
                    Ok(_) => descriptor.write_epoch,
                    Err(error) => {
                        error!(%error, path = %event.path.display(), "catalog transition failed");
                        return;
                    }
                }
            }
            // A change after a completed (or failed) read is a new write
            // epoch: the quiesce cycle re-fires under a fresh number.
            FileState::Processed => match self.reenter_stabilizing(&event.path, FileState::Processed) {
                Some(epoch) => epoch,
                None => return,
            },
            FileState::Failed => match self.reenter_stabilizing(&event.path, FileState::Failed) {
                Some(epoch) => epoch,
                None => return,
            },
            // Emitted but not yet (or currently) being read: the writer
            // came back, so the emitted epoch is stale.
            FileState::Stabilizing | FileState::Reading => {
                match self.catalog.bump_epoch(&event.path) {
                    Some(epoch) => epoch,
                    None => return,
                }
            }
            FileState::Archived => {
                debug!(path = %event.path.display(), "change on archived path ignored");
                return;
            }
        };

        pending.insert(
            event.path,
            Pending {
                watch_id: event.watch_id,
                epoch,
                deadline,
                observation: None,
                probe_errors: 0,
            },
        );
    }

    fn reenter_stabilizing(&self, path: &Path, from: FileState) -> Option<u64> {
        match self.catalog.compare_and_set(path, from, FileState::Stabilizing) {
            Ok(true) => self.catalog.bump_epoch(path),
            Ok(false) => self.catalog.epoch(path),
            Err(error) => {
                error!(%error, path = %path.display(), "catalog transition failed");
                None
            }
        }
    }

    async fn fire_due(&self, pending: &mut HashMap<PathBuf, Pending>, token: &CancellationToken) {
        let now = Instant::now();
        let due: Vec<PathBuf> = pending
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();

        for path in due {
            if token.is_cancelled() {
                return;
            }
            let Some(mut entry) = pending.remove(&path) else {
                continue;
            };
            let (stability, observation) = self.arbiter.probe(&path, entry.observation.as_ref()).await;
            entry.observation = observation;

            match stability {
                Stability::Gone => {
                    debug!(path = %path.display(), "file vanished before stabilizing");
                    let _ = self
                        .catalog
                        .compare_and_set(&path, FileState::Stabilizing, FileState::Failed);
                }
                Stability::Error(reason) => {
                    entry.probe_errors += 1;
                    if entry.probe_errors >= self.tuning.max_probe_attempts {
                        warn!(path = %path.display(), %reason, "stability probes exhausted");
                        let _ = self
                            .catalog
                            .compare_and_set(&path, FileState::Stabilizing, FileState::Failed);
                    } else {
                        entry.deadline = now + self.tuning.stabilization_period;
                        pending.insert(path, entry);
                    }
                }
                Stability::Growing => {
                    entry.deadline = now + self.tuning.stabilization_period;
                    pending.insert(path, entry);
                }
                Stability::Stable => {
                    let state = self.catalog.get(&path).map(|d| d.state);
                    match state {
                        Some(FileState::Stabilizing) => {
                            self.finish_stable(&path, &entry, token).await;
                        }
                        Some(FileState::Reading) => {
                            // A reader is still on the previous epoch; try
                            // again after it finishes.
                            entry.deadline = now + self.tuning.stabilization_period;
                            pending.insert(path, entry);
                        }
                        // The previous epoch's read concluded while this
                        // epoch debounced; pull the path back into
                        // stabilizing (same epoch, no bump) and emit.
                        Some(from @ (FileState::Processed | FileState::Failed)) => {
                            match self
                                .catalog
                                .compare_and_set(&path, from, FileState::Stabilizing)
                            {
                                Ok(true) => self.finish_stable(&path, &entry, token).await,
                                Ok(false) | Err(_) => {
                                    debug!(path = %path.display(), "lost race re-entering stabilizing");
                                }
                            }
                        }
                        other => {
                            debug!(path = %path.display(), state = ?other, "stable path no longer eligible");
                        }
                    }
                }
            }
        }
    }

    /// Record the winning observation and emit the event.
    async fn finish_stable(&self, path: &Path, entry: &Pending, token: &CancellationToken) {
        let (size, mtime, polls) = entry
            .observation
            .as_ref()
            .map(|o| (o.size, o.mtime, o.agreeing_polls))
            .unwrap_or((0, None, 0));
        self.catalog.record_observation(path, size, mtime, polls);
        self.emit_stable(path, entry, size, token).await;
    }

    async fn emit_stable(
        &self,
        path: &Path,
        entry: &Pending,
        size: u64,
        token: &CancellationToken,
    ) {
        let event = FileStable {
            watch_id: entry.watch_id,
            path: path.to_path_buf(),
            epoch: entry.epoch,
            size,
        };
        debug!(path = %path.display(), epoch = entry.epoch, size, "file stable");
        tokio::select! {
            biased;
            _ = token.cancelled() => {}
            result = self.stable_tx.send(event) => {
                if result.is_err() {
                    warn!(path = %path.display(), "reader channel closed; dropping stable event");
                }
            }
        }
    }

    /// Walk every watch root and synthesize change events for files the
    /// notification stream missed: unseen paths, failed paths, and
    /// processed paths that grew since their last read.
    async fn full_rescan(&self, pending: &mut HashMap<PathBuf, Pending>) {
        let configs = self.list();
        for config in configs {
            let mut stack = vec![config.path.clone()];
            while let Some(dir) = stack.pop() {
                let mut entries = match tokio::fs::read_dir(&dir).await {
                    Ok(entries) => entries,
                    Err(error) => {
                        warn!(path = %dir.display(), %error, "rescan could not read directory");
                        continue;
                    }
                };
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let path = entry.path();
                    let Ok(file_type) = entry.file_type().await else {
                        continue;
                    };
                    if file_type.is_dir() {
                        if config.recursive {
                            stack.push(path);
                        }
                        continue;
                    }
                    if !config.matches(&path) || pending.contains_key(&path) {
                        continue;
                    }
                    if let Some(kind) = self.rescan_kind(&path).await {
                        self.handle_raw(
                            RawEvent {
                                watch_id: config.id,
                                path,
                                kind,
                            },
                            pending,
                        );
                    }
                }
            }
        }
    }

    /// Decide whether a rescanned file deserves a synthetic event.
    async fn rescan_kind(&self, path: &Path) -> Option<RawKind> {
        let Some(descriptor) = self.catalog.get(path) else {
            return Some(RawKind::Created);
        };
        match descriptor.state {
            FileState::Failed => Some(RawKind::Changed),
            FileState::Processed => {
                let metadata = tokio::fs::metadata(path).await.ok()?;
                let mtime = metadata.modified().ok().map(chrono::DateTime::<chrono::Utc>::from);
                let grew = metadata.len() != descriptor.last_size
                    || match (descriptor.last_mtime, mtime) {
                        (Some(prev), Some(cur)) => cur > prev,
                        _ => false,
                    };
                grew.then_some(RawKind::Changed)
            }
            // Observed means a raw event exists but was never debounced
            // (agent restart); re-arm it.
            FileState::Observed => Some(RawKind::Changed),
            _ => None,
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn convert_kind(kind: &EventKind, mask: ChangeMask) -> Option<RawKind> {
    use notify::event::{ModifyKind, RenameMode};
    match kind {
        EventKind::Create(_) if mask.create => Some(RawKind::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) if mask.rename_into => {
            Some(RawKind::Created)
        }
        EventKind::Modify(ModifyKind::Name(_)) => None,
        EventKind::Modify(_) if mask.modify => Some(RawKind::Changed),
        // Access and metadata-only events are noise here.
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::io::Write;

    fn tuning() -> WatcherTuning {
        WatcherTuning {
            stabilization_period: Duration::from_millis(120),
            rescan_interval: Duration::from_millis(200),
            max_pending_files: 64,
            max_probe_attempts: 3,
        }
    }

    fn supervision() -> Supervision {
        Supervision::new(Arc::new(crate::health::AgentHealth::new()), CancellationToken::new())
    }

    fn build(
        stable_tx: mpsc::Sender<FileStable>,
    ) -> (Arc<DirectoryWatcher>, Arc<FileCatalog>) {
        let catalog = Arc::new(FileCatalog::new(1024));
        let clock = Arc::new(SystemClock);
        let arbiter = StabilityArbiter::new(Duration::from_millis(100), clock);
        let watcher = Arc::new(DirectoryWatcher::new(
            tuning(),
            arbiter,
            Arc::clone(&catalog),
            stable_tx,
        ));
        (watcher, catalog)
    }

    #[tokio::test]
    async fn add_watch_rejects_missing_directory() {
        let (stable_tx, _stable_rx) = mpsc::channel(8);
        let (watcher, _) = build(stable_tx);
        let config =
            WatchConfig::new(PathBuf::from("/definitely/not/here"), "*.jsonl", true).unwrap();
        assert!(matches!(
            watcher.add_watch(config),
            Err(AgentError::WatchConfig(_))
        ));
    }

    #[tokio::test]
    async fn emits_stable_once_for_quiet_file() {
        let dir = tempfile::tempdir().unwrap();
        let (stable_tx, mut stable_rx) = mpsc::channel(8);
        let (watcher, _catalog) = build(stable_tx);
        let config = WatchConfig::new(dir.path().to_path_buf(), "*.jsonl", true).unwrap();
        watcher.add_watch(config).unwrap();

        let token = CancellationToken::new();
        let handle = watcher.start(token.clone(), supervision()).unwrap();

        let path = dir.path().join("a.jsonl");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{{\"id\":\"r1\"}}").unwrap();
        file.sync_all().unwrap();
        drop(file);

        let stable = tokio::time::timeout(Duration::from_secs(5), stable_rx.recv())
            .await
            .expect("stable event within deadline")
            .expect("channel open");
        assert_eq!(stable.path, path);
        assert_eq!(stable.epoch, 0);

        // No second emission for the same epoch.
        let second = tokio::time::timeout(Duration::from_millis(400), stable_rx.recv()).await;
        assert!(second.is_err(), "unexpected duplicate emission");

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn rescan_picks_up_preexisting_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pre.jsonl");
        std::fs::write(&path, b"{\"id\":\"r1\"}\n").unwrap();

        let (stable_tx, mut stable_rx) = mpsc::channel(8);
        let (watcher, _catalog) = build(stable_tx);
        let config = WatchConfig::new(dir.path().to_path_buf(), "*.jsonl", true).unwrap();
        watcher.add_watch(config).unwrap();

        let token = CancellationToken::new();
        let handle = watcher.start(token.clone(), supervision()).unwrap();

        let stable = tokio::time::timeout(Duration::from_secs(5), stable_rx.recv())
            .await
            .expect("rescan finds the file")
            .expect("channel open");
        assert_eq!(stable.path, path);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn filter_excludes_other_extensions() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("noise.txt"), b"not logs").unwrap();

        let (stable_tx, mut stable_rx) = mpsc::channel(8);
        let (watcher, catalog) = build(stable_tx);
        let config = WatchConfig::new(dir.path().to_path_buf(), "*.jsonl", true).unwrap();
        watcher.add_watch(config).unwrap();

        let token = CancellationToken::new();
        let handle = watcher.start(token.clone(), supervision()).unwrap();

        let result = tokio::time::timeout(Duration::from_millis(500), stable_rx.recv()).await;
        assert!(result.is_err(), "txt file must not produce events");
        assert!(catalog.is_empty());

        token.cancel();
        handle.await.unwrap();
    }
}
