//! Builds the pipeline from configuration and owns its lifecycle.
//!
//! The supervisor constructs every component with its collaborators
//! injected (clock, object store, health registry), spawns the task set,
//! and drives the ordered graceful drain at shutdown: watcher first, then
//! readers, then the queue fence, then the processor's final flush, then
//! the uploader. Tasks still running past the shutdown budget are
//! abandoned with a warning.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use shiplog_config::AgentConfig;

use crate::clock::Clock;
use crate::error::{AgentError, Result};
use crate::health::{AgentHealth, ComponentStatus, HealthReporter as _};
use crate::ingest::line::LineProcessor;
use crate::ingest::reader::{FileReader, ReaderPool, ReaderTuning};
use crate::pipeline::processor::{BatchProcessor, ProcessorHandle, ProcessorTuning};
use crate::pipeline::queue::{QueueSender, batch_queue};
use crate::retry::{self, RetryPolicy};
use crate::supervision::Supervision;
use crate::upload::credentials::ConnectionString;
use crate::upload::dead_letter::{DeadLetterInventory, DeadLetterStore};
use crate::upload::store::ObjectStoreClient;
use crate::upload::uploader::Uploader;
use crate::watch::catalog::FileCatalog;
use crate::watch::stability::StabilityArbiter;
use crate::watch::watcher::{DirectoryWatcher, WatchConfig, WatcherTuning};

/// Entries kept for already-archived/failed files in the catalog.
const CATALOG_TERMINAL_CAP: usize = 4096;
/// Stable-event channel depth between watcher and reader pool.
const STABLE_CHANNEL_CAPACITY: usize = 64;

/// How the agent came to rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Drained within the budget.
    Clean,
    /// The budget expired; remaining tasks were abandoned.
    Abandoned,
    /// A task exhausted its restart budget; the process is faulted.
    Fatal,
}

pub struct Supervisor {
    config: AgentConfig,
    clock: Arc<dyn Clock>,
    health: Arc<AgentHealth>,
    store: Arc<dyn ObjectStoreClient>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("config", &self.config)
            .finish()
    }
}

/// Handles to a started pipeline.
pub struct RunningAgent {
    pub health: Arc<AgentHealth>,
    pub catalog: Arc<FileCatalog>,
    pub watcher: Arc<DirectoryWatcher>,
    pub uploader: Arc<Uploader>,
    pub queue: QueueSender,
    pub processor: ProcessorHandle,
    pub dead_letter_inventory: DeadLetterInventory,
    drain: CancellationToken,
    abandon: CancellationToken,
    fatal: CancellationToken,
    shutdown_budget: Duration,
    watcher_task: Option<JoinHandle<()>>,
    pool_task: Option<JoinHandle<()>>,
    processor_task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for RunningAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningAgent")
            .field("uploader_state", &self.uploader.state())
            .field("queue_depth", &self.queue.depth())
            .field("fatal", &self.fatal.is_cancelled())
            .finish()
    }
}

impl Supervisor {
    pub fn new(
        config: AgentConfig,
        clock: Arc<dyn Clock>,
        health: Arc<AgentHealth>,
        store: Arc<dyn ObjectStoreClient>,
    ) -> Self {
        Self {
            config,
            clock,
            health,
            store,
        }
    }

    /// Construct and launch the whole pipeline.
    ///
    /// Errors here are initialization failures, except
    /// [`AgentError::WatchConfig`] which the binary maps to the
    /// configuration exit code.
    pub async fn start(self) -> Result<RunningAgent> {
        let config = &self.config;

        let dead_letter =
            Arc::new(DeadLetterStore::open(&config.agent.dead_letter_path).await?);
        let dead_letter_inventory = dead_letter.inventory().await?;

        let device_id = resolve_device_id(config)?;
        let catalog = Arc::new(FileCatalog::new(CATALOG_TERMINAL_CAP));
        let arbiter = StabilityArbiter::new(
            config.watch.stabilization_period(),
            Arc::clone(&self.clock),
        );

        let drain = CancellationToken::new();
        let abandon = CancellationToken::new();
        let fatal = CancellationToken::new();
        let supervision = Supervision::new(Arc::clone(&self.health), fatal.clone());

        // Watcher -> reader pool channel.
        let (stable_tx, stable_rx) = tokio::sync::mpsc::channel(STABLE_CHANNEL_CAPACITY);
        let watcher = Arc::new(DirectoryWatcher::new(
            WatcherTuning::from(&config.watch),
            arbiter,
            Arc::clone(&catalog),
            stable_tx,
        ));
        for path in &config.watch.monitoring_paths {
            let watch_config = WatchConfig::new(
                path.clone(),
                &config.watch.file_filter,
                config.watch.recursive,
            )?;
            watcher.add_watch(watch_config)?;
        }

        // Reader pool -> batch processor channel.
        let (queue_tx, queue_rx) = batch_queue(config.batch.queue_capacity);

        let uploader = Arc::new(Uploader::new(
            Arc::clone(&self.store),
            config.upload.root.clone(),
            device_id,
            RetryPolicy::from_settings(&config.retry),
            RetryPolicy::reconnect(
                config.upload.reconnect_initial_secs,
                config.upload.reconnect_max_secs,
            ),
            Arc::clone(&self.health),
            Arc::clone(&self.clock),
            abandon.clone(),
        ));
        match uploader.connect(&drain).await {
            Ok(()) => {}
            Err(error) => {
                if retry::classify(&error) == retry::ErrorClass::Permanent {
                    return Err(error);
                }
                // Transient: come up degraded, the first upload's wait
                // kicks off the reconnect loop.
                warn!(%error, "store unreachable at startup; will reconnect");
            }
        }

        let reader_tuning = ReaderTuning::from(&config.ingest);
        let reader = Arc::new(FileReader::new(
            reader_tuning,
            LineProcessor::new(Arc::clone(&self.clock)),
            Arc::clone(&catalog),
            queue_tx.clone(),
            Arc::clone(&self.health),
        ));
        let pool = ReaderPool::new(reader, reader_tuning);

        let (processor, processor_handle) = BatchProcessor::new(
            ProcessorTuning::from(&config.batch),
            queue_rx,
            Arc::clone(&uploader) as Arc<dyn crate::pipeline::processor::BatchSink>,
            dead_letter,
            Arc::clone(&self.health),
            Arc::clone(&self.clock),
            config.retry.max_attempts,
        );

        let watcher_task = watcher.start(drain.clone(), supervision.clone())?;
        let pool_task = pool.start(stable_rx, drain.clone(), supervision.clone());
        let processor_task = processor.start(drain.clone(), abandon.clone(), supervision);

        for component in ["watcher", "reader-pool", "batch-processor"] {
            self.health.report(component, ComponentStatus::Healthy);
        }
        info!(
            paths = config.watch.monitoring_paths.len(),
            dead_letters = dead_letter_inventory.batches,
            "agent pipeline started"
        );

        Ok(RunningAgent {
            health: self.health,
            catalog,
            watcher,
            uploader,
            queue: queue_tx,
            processor: processor_handle,
            dead_letter_inventory,
            drain,
            abandon,
            fatal,
            shutdown_budget: config.agent.shutdown_budget(),
            watcher_task: Some(watcher_task),
            pool_task: Some(pool_task),
            processor_task: Some(processor_task),
        })
    }
}

impl RunningAgent {
    /// Token that fires when a component exhausted its restart budget.
    pub fn fatal_token(&self) -> CancellationToken {
        self.fatal.clone()
    }

    /// Ordered graceful drain within the shutdown budget.
    pub async fn shutdown(mut self) -> ShutdownOutcome {
        let was_fatal = self.fatal.is_cancelled();
        info!(fatal = was_fatal, "shutting down");

        let aborts: Vec<AbortHandle> = [
            self.watcher_task.as_ref(),
            self.pool_task.as_ref(),
            self.processor_task.as_ref(),
        ]
        .into_iter()
        .flatten()
        .map(JoinHandle::abort_handle)
        .collect();

        self.drain.cancel();
        let budget = self.shutdown_budget;
        let graceful = async {
            // Watcher first: no new paths enter the pipeline.
            if let Some(task) = self.watcher_task.take() {
                let _ = task.await;
            }
            // Readers drain what they already claimed.
            if let Some(task) = self.pool_task.take() {
                let _ = task.await;
            }
            // Producers are done; fence the queue so the processor sees a
            // finite tail, final-flushes, and exits.
            self.queue.close();
            if let Some(task) = self.processor_task.take() {
                let _ = task.await;
            }
            self.uploader.disconnect().await;
        };

        match tokio::time::timeout(budget, graceful).await {
            Ok(()) => {
                for component in ["watcher", "reader-pool", "batch-processor"] {
                    self.health.report(component, ComponentStatus::Stopped);
                }
                if was_fatal {
                    ShutdownOutcome::Fatal
                } else {
                    info!("shutdown complete");
                    ShutdownOutcome::Clean
                }
            }
            Err(_) => {
                warn!(
                    budget_secs = budget.as_secs(),
                    "shutdown budget exceeded; abandoning remaining tasks"
                );
                self.abandon.cancel();
                for abort in aborts {
                    abort.abort();
                }
                ShutdownOutcome::Abandoned
            }
        }
    }
}

/// The device identity: explicit config wins, else the `DeviceId` segment
/// of the connection string.
fn resolve_device_id(config: &AgentConfig) -> Result<String> {
    if !config.upload.device_id.trim().is_empty() {
        return Ok(config.upload.device_id.trim().to_string());
    }
    if config.upload.connection_string.trim().is_empty() {
        return Err(AgentError::Credential(
            "no device id: set [upload].device_id or a connection string".to_string(),
        ));
    }
    Ok(ConnectionString::parse(&config.upload.connection_string)?.device_id)
}
