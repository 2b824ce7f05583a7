//! Uploads sealed batches over the device-identity channel.
//!
//! The uploader owns the connection state machine. Transport-level
//! failures fault the connection and hand recovery to a single, patient
//! reconnect task; uploads in flight during a fault block on the state
//! watch until the connection is re-attained or the caller cancels.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use shiplog_model::Batch;

use crate::clock::Clock;
use crate::error::{AgentError, Result};
use crate::health::{AgentHealth, ComponentStatus, HealthReporter};
use crate::pipeline::processor::BatchSink;
use crate::retry::{self, RetryPolicy};
use crate::upload::store::ObjectStoreClient;

/// Connection lifecycle of the upload channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Faulted,
}

impl ConnectionState {
    fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Faulted)
                | (Connected, Faulted)
                | (Connected, Disconnecting)
                | (Faulted, Connecting)
                | (Faulted, Connected)
                | (Faulted, Disconnecting)
                | (Disconnecting, Disconnected)
        )
    }
}

/// Successful upload description, for callers that log or meter.
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub key: String,
    pub bytes: usize,
}

pub struct Uploader {
    store: Arc<dyn ObjectStoreClient>,
    root: String,
    device_id: String,
    retry_policy: RetryPolicy,
    reconnect_policy: RetryPolicy,
    state_tx: watch::Sender<ConnectionState>,
    /// Single-slot guard: at most one reconnect task runs.
    reconnect_guard: Arc<tokio::sync::Mutex<()>>,
    health: Arc<AgentHealth>,
    clock: Arc<dyn Clock>,
    /// Cancels reconnect tasks at process shutdown.
    shutdown: CancellationToken,
}

impl fmt::Debug for Uploader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Uploader")
            .field("root", &self.root)
            .field("device_id", &self.device_id)
            .field("state", &self.state())
            .finish()
    }
}

impl Uploader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn ObjectStoreClient>,
        root: String,
        device_id: String,
        retry_policy: RetryPolicy,
        reconnect_policy: RetryPolicy,
        health: Arc<AgentHealth>,
        clock: Arc<dyn Clock>,
        shutdown: CancellationToken,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            store,
            root,
            device_id,
            retry_policy,
            reconnect_policy,
            state_tx,
            reconnect_guard: Arc::new(tokio::sync::Mutex::new(())),
            health,
            clock,
            shutdown,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Establish the channel: `Disconnected -> Connecting -> Connected`.
    pub async fn connect(&self, token: &CancellationToken) -> Result<()> {
        self.transition(ConnectionState::Connecting);
        match self.store.ping(token).await {
            Ok(()) => {
                self.transition(ConnectionState::Connected);
                self.health.report("uploader", ComponentStatus::Healthy);
                info!(device_id = %self.device_id, "upload channel connected");
                Ok(())
            }
            Err(error) => {
                self.transition(ConnectionState::Faulted);
                self.health.report("uploader", ComponentStatus::Degraded);
                Err(error)
            }
        }
    }

    pub async fn disconnect(&self) {
        self.transition(ConnectionState::Disconnecting);
        self.transition(ConnectionState::Disconnected);
        self.health.report("uploader", ComponentStatus::Stopped);
        info!("upload channel disconnected");
    }

    /// Serialize and upload one sealed batch under its hierarchical key,
    /// wrapped in the retry engine. Blocks while the connection is faulted
    /// until it is re-attained or `token` cancels.
    pub async fn upload_batch(
        &self,
        batch: &Batch,
        token: &CancellationToken,
    ) -> Result<UploadReceipt> {
        let body = batch.to_jsonl()?;
        let key = batch.object_key(&self.root, &self.device_id);

        let delivered = retry::execute(&self.retry_policy, token, |attempt| {
            let key = key.as_str();
            let body = body.as_slice();
            async move {
                self.wait_connected(token).await?;
                if attempt > 0 {
                    debug!(%key, attempt, "upload retry");
                }
                match self.store.upload(key, body, token).await {
                    Ok(()) => Ok(()),
                    Err(error) => {
                        if is_disconnect(&error) {
                            self.fault(&error);
                        }
                        Err(error)
                    }
                }
            }
        })
        .await;
        if let Err(error) = delivered {
            if !matches!(error, AgentError::Cancelled(_)) {
                // Retries exhausted or the remote rejected us outright.
                self.health.report("uploader", ComponentStatus::Degraded);
            }
            return Err(error);
        }

        let receipt = UploadReceipt {
            key,
            bytes: body.len(),
        };
        self.health.record_upload(receipt.bytes as u64, self.clock.now());
        debug!(key = %receipt.key, bytes = receipt.bytes, "batch uploaded");
        Ok(receipt)
    }

    /// Wait until `Connected`, observing cancellation. While `Faulted`
    /// this also makes sure a reconnect task is running.
    async fn wait_connected(&self, token: &CancellationToken) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected | ConnectionState::Disconnecting => {
                    return Err(AgentError::Internal(
                        "upload channel is not connected".to_string(),
                    ));
                }
                ConnectionState::Faulted => {
                    self.spawn_reconnect();
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            return Err(AgentError::Cancelled("waiting for connection".to_string()));
                        }
                        changed = rx.changed() => {
                            changed.map_err(|_| {
                                AgentError::Internal("connection state channel closed".to_string())
                            })?;
                        }
                    }
                }
                ConnectionState::Connecting => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            return Err(AgentError::Cancelled("waiting for connection".to_string()));
                        }
                        changed = rx.changed() => {
                            changed.map_err(|_| {
                                AgentError::Internal("connection state channel closed".to_string())
                            })?;
                        }
                    }
                }
            }
        }
    }

    /// `Connected -> Faulted` on a transport-level failure, exactly once.
    fn fault(&self, error: &AgentError) {
        let mut faulted = false;
        self.state_tx.send_if_modified(|state| {
            if matches!(*state, ConnectionState::Connected | ConnectionState::Connecting) {
                *state = ConnectionState::Faulted;
                faulted = true;
                true
            } else {
                false
            }
        });
        if faulted {
            warn!(%error, "transport fault; upload channel degraded");
            self.health.report("uploader", ComponentStatus::Degraded);
            self.spawn_reconnect();
        }
    }

    /// Launch the reconnect task unless one is already running.
    fn spawn_reconnect(&self) {
        let guard = Arc::clone(&self.reconnect_guard);
        let store = Arc::clone(&self.store);
        let state_tx = self.state_tx.clone();
        let health = Arc::clone(&self.health);
        let policy = self.reconnect_policy;
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            // Single slot: if another reconnect holds the guard, this task
            // has nothing to do.
            let Ok(_guard) = guard.try_lock() else {
                return;
            };
            info!("reconnect task started");
            loop {
                if shutdown.is_cancelled() {
                    return;
                }
                let shutdown_ref = &shutdown;
                let store_ref = &store;
                let result = retry::execute(&policy, shutdown_ref, |attempt| async move {
                    debug!(attempt, "reconnect attempt");
                    store_ref.ping(shutdown_ref).await
                })
                .await;

                match result {
                    Ok(()) => {
                        let restored = state_tx.send_if_modified(|state| {
                            if *state == ConnectionState::Faulted {
                                *state = ConnectionState::Connected;
                                true
                            } else {
                                false
                            }
                        });
                        if restored {
                            health.report("uploader", ComponentStatus::Healthy);
                            info!("upload channel reconnected");
                        }
                        return;
                    }
                    Err(AgentError::Cancelled(_)) => return,
                    Err(error) => {
                        // Permanent failure (bad credentials, endpoint
                        // misconfigured). Stay faulted, keep trying at the
                        // patient ceiling; operators see Degraded.
                        warn!(%error, "reconnect failed; holding at backoff ceiling");
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            _ = tokio::time::sleep(policy.max) => {}
                        }
                    }
                }
            }
        });
    }

    fn transition(&self, next: ConnectionState) {
        self.state_tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                warn!(from = ?state, to = ?next, "ignoring invalid connection transition");
                false
            }
        });
    }
}

/// Whether an error means the transport itself is gone (as opposed to the
/// remote rejecting a well-delivered request).
fn is_disconnect(error: &AgentError) -> bool {
    match error {
        AgentError::Timeout(_) => true,
        AgentError::Transport(e) => e.is_connect() || e.is_timeout() || e.is_request(),
        _ => false,
    }
}

#[async_trait]
impl BatchSink for Uploader {
    async fn upload_batch(&self, batch: &Batch, token: &CancellationToken) -> Result<()> {
        Uploader::upload_batch(self, batch, token).await.map(|_| ())
    }
}
