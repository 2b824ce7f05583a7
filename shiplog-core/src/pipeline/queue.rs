//! Bounded multi-producer/single-consumer record queue.
//!
//! Producers are file readers; the single consumer is the batch processor.
//! Enqueue blocks when the queue is full, which is how slow uploads
//! propagate backpressure all the way back to file reads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use shiplog_model::LogRecord;

use crate::error::{AgentError, Result};

#[derive(Debug)]
struct Shared {
    depth: AtomicUsize,
    closed: AtomicBool,
    close_notify: Notify,
}

/// Producer half. Clone freely; all clones observe the same close.
#[derive(Debug, Clone)]
pub struct QueueSender {
    tx: mpsc::Sender<LogRecord>,
    shared: Arc<Shared>,
}

/// Consumer half. Exactly one exists.
#[derive(Debug)]
pub struct QueueReceiver {
    rx: mpsc::Receiver<LogRecord>,
    shared: Arc<Shared>,
}

/// Build the queue with the given capacity.
pub fn batch_queue(capacity: usize) -> (QueueSender, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    let shared = Arc::new(Shared {
        depth: AtomicUsize::new(0),
        closed: AtomicBool::new(false),
        close_notify: Notify::new(),
    });
    (
        QueueSender {
            tx,
            shared: Arc::clone(&shared),
        },
        QueueReceiver { rx, shared },
    )
}

impl QueueSender {
    /// Enqueue one record, blocking while the queue is full.
    pub async fn enqueue(&self, record: LogRecord, token: &CancellationToken) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(AgentError::QueueClosed);
        }
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(AgentError::Cancelled("queue enqueue".to_string())),
            result = self.tx.send(record) => match result {
                Ok(()) => {
                    self.shared.depth.fetch_add(1, Ordering::AcqRel);
                    Ok(())
                }
                Err(_) => Err(AgentError::QueueClosed),
            },
        }
    }

    pub async fn enqueue_many(
        &self,
        records: Vec<LogRecord>,
        token: &CancellationToken,
    ) -> Result<()> {
        for record in records {
            self.enqueue(record, token).await?;
        }
        Ok(())
    }

    /// Stop accepting new records. Buffered records remain dequeueable;
    /// subsequent enqueues fail with [`AgentError::QueueClosed`].
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.close_notify.notify_waiters();
    }

    pub fn depth(&self) -> usize {
        self.shared.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl QueueReceiver {
    /// Dequeue up to `max` records, waiting at most `wait` for the first.
    ///
    /// Returns an empty vec on timeout, and also once the queue is closed
    /// and fully drained (check [`QueueReceiver::is_terminated`]).
    pub async fn dequeue_up_to(&mut self, max: usize, wait: Duration) -> Vec<LogRecord> {
        let mut out = Vec::new();
        self.drain_ready(max, &mut out);
        if !out.is_empty() {
            return out;
        }
        if self.is_terminated() {
            return out;
        }

        tokio::select! {
            _ = self.shared.close_notify.notified() => {
                // Producers are fenced by the closed flag; whatever is
                // buffered now is the final tail.
                self.drain_ready(max, &mut out);
            }
            maybe = self.rx.recv() => {
                if let Some(record) = maybe {
                    self.shared.depth.fetch_sub(1, Ordering::AcqRel);
                    out.push(record);
                    self.drain_ready(max, &mut out);
                }
            }
            _ = tokio::time::sleep(wait) => {}
        }
        out
    }

    /// Closed and nothing buffered: the final dequeue has happened.
    pub fn is_terminated(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
            && self.shared.depth.load(Ordering::Acquire) == 0
    }

    pub fn depth(&self) -> usize {
        self.shared.depth.load(Ordering::Acquire)
    }

    fn drain_ready(&mut self, max: usize, out: &mut Vec<LogRecord>) {
        while out.len() < max {
            match self.rx.try_recv() {
                Ok(record) => {
                    self.shared.depth.fetch_sub(1, Ordering::AcqRel);
                    out.push(record);
                }
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use shiplog_model::LogLevel;

    fn record(id: &str) -> LogRecord {
        LogRecord {
            id: id.to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap(),
            device_id: "dev".to_string(),
            level: LogLevel::Info,
            message: "m".to_string(),
            category: None,
            tags: None,
            data: None,
            error: None,
            source_file: None,
            processed_at: None,
        }
    }

    #[tokio::test]
    async fn preserves_order() {
        let (tx, mut rx) = batch_queue(16);
        let token = CancellationToken::new();
        for i in 0..5 {
            tx.enqueue(record(&format!("r{i}")), &token).await.unwrap();
        }
        let got = rx.dequeue_up_to(10, Duration::from_millis(10)).await;
        let ids: Vec<_> = got.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["r0", "r1", "r2", "r3", "r4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_blocks_producer() {
        let (tx, mut rx) = batch_queue(2);
        let token = CancellationToken::new();
        tx.enqueue(record("r0"), &token).await.unwrap();
        tx.enqueue(record("r1"), &token).await.unwrap();

        let blocked = {
            let tx = tx.clone();
            let token = token.clone();
            tokio::spawn(async move { tx.enqueue(record("r2"), &token).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished(), "third enqueue must block");

        let drained = rx.dequeue_up_to(1, Duration::from_millis(1)).await;
        assert_eq!(drained.len(), 1);
        blocked.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn close_drains_then_rejects() {
        let (tx, mut rx) = batch_queue(8);
        let token = CancellationToken::new();
        tx.enqueue(record("r0"), &token).await.unwrap();
        tx.close();

        assert!(matches!(
            tx.enqueue(record("r1"), &token).await,
            Err(AgentError::QueueClosed)
        ));

        let tail = rx.dequeue_up_to(10, Duration::from_millis(10)).await;
        assert_eq!(tail.len(), 1);
        assert!(rx.is_terminated());
        let after = rx.dequeue_up_to(10, Duration::from_millis(10)).await;
        assert!(after.is_empty());
    }

    #[tokio::test]
    async fn cancellation_unblocks_enqueue() {
        let (tx, _rx) = batch_queue(1);
        let token = CancellationToken::new();
        tx.enqueue(record("r0"), &token).await.unwrap();

        let blocked = {
            let tx = tx.clone();
            let token = token.clone();
            tokio::spawn(async move { tx.enqueue(record("r1"), &token).await })
        };
        token.cancel();
        let result = blocked.await.unwrap();
        assert!(matches!(result, Err(AgentError::Cancelled(_))));
    }
}
