//! In-process health registry backing the control endpoint.
//!
//! Components report coarse status transitions; hot-path counters are
//! plain atomics so the pipeline never blocks on observability.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// Coarse per-component condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Starting,
    Healthy,
    Degraded,
    Failed,
    Stopped,
}

/// Sink for component status transitions. The supervisor wires every
/// component to the shared [`AgentHealth`]; tests substitute their own.
pub trait HealthReporter: Send + Sync + std::fmt::Debug {
    fn report(&self, component: &str, status: ComponentStatus);
}

/// Smoothing factor for the upload throughput gauge.
const THROUGHPUT_EWMA_ALPHA: f64 = 0.3;

#[derive(Debug, Default)]
pub struct AgentHealth {
    components: DashMap<String, ComponentStatus>,
    records_accepted: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_validation: AtomicU64,
    dropped_timestamp: AtomicU64,
    dropped_too_large: AtomicU64,
    lines_skipped: AtomicU64,
    batches_flushed: AtomicU64,
    batches_dead_lettered: AtomicU64,
    bytes_uploaded: AtomicU64,
    queue_depth: AtomicUsize,
    /// Milliseconds since the epoch; 0 = never.
    last_upload_ms: AtomicI64,
    /// EWMA of upload throughput, stored as f64 bits.
    bytes_per_sec: AtomicU64,
}

/// Serializable view for `/health/detail`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub healthy: bool,
    pub components: BTreeMap<String, ComponentStatus>,
    pub queue_depth: usize,
    pub records_accepted: u64,
    pub dropped_malformed: u64,
    pub dropped_validation: u64,
    pub dropped_timestamp: u64,
    pub dropped_too_large: u64,
    pub lines_skipped: u64,
    pub batches_flushed: u64,
    pub batches_dead_lettered: u64,
    pub bytes_uploaded: u64,
    pub bytes_per_sec: u64,
    pub last_upload_at: Option<DateTime<Utc>>,
}

impl AgentHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_accepted(&self, count: u64) {
        self.records_accepted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_dropped_malformed(&self) {
        self.dropped_malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_validation(&self) {
        self.dropped_validation.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_timestamp(&self) {
        self.dropped_timestamp.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_too_large(&self) {
        self.dropped_too_large.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_line_skipped(&self) {
        self.lines_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_letter(&self) {
        self.batches_dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.store(depth, Ordering::Relaxed);
    }

    /// Fold a completed upload into the throughput gauge.
    pub fn record_upload(&self, bytes: u64, at: DateTime<Utc>) {
        self.bytes_uploaded.fetch_add(bytes, Ordering::Relaxed);
        let previous_ms = self.last_upload_ms.swap(at.timestamp_millis(), Ordering::Relaxed);
        if previous_ms > 0 {
            let elapsed = (at.timestamp_millis() - previous_ms).max(1) as f64 / 1000.0;
            let instant_rate = bytes as f64 / elapsed;
            let previous = f64::from_bits(self.bytes_per_sec.load(Ordering::Relaxed));
            let next = if previous == 0.0 {
                instant_rate
            } else {
                previous + THROUGHPUT_EWMA_ALPHA * (instant_rate - previous)
            };
            self.bytes_per_sec.store(next.to_bits(), Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let components: BTreeMap<String, ComponentStatus> = self
            .components
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        let healthy = !components
            .values()
            .any(|status| matches!(status, ComponentStatus::Failed));
        let last_ms = self.last_upload_ms.load(Ordering::Relaxed);
        HealthSnapshot {
            healthy,
            components,
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            records_accepted: self.records_accepted.load(Ordering::Relaxed),
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
            dropped_validation: self.dropped_validation.load(Ordering::Relaxed),
            dropped_timestamp: self.dropped_timestamp.load(Ordering::Relaxed),
            dropped_too_large: self.dropped_too_large.load(Ordering::Relaxed),
            lines_skipped: self.lines_skipped.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            batches_dead_lettered: self.batches_dead_lettered.load(Ordering::Relaxed),
            bytes_uploaded: self.bytes_uploaded.load(Ordering::Relaxed),
            bytes_per_sec: f64::from_bits(self.bytes_per_sec.load(Ordering::Relaxed)) as u64,
            last_upload_at: (last_ms > 0)
                .then(|| Utc.timestamp_millis_opt(last_ms).single())
                .flatten(),
        }
    }
}

impl HealthReporter for AgentHealth {
    fn report(&self, component: &str, status: ComponentStatus) {
        tracing::debug!(component, ?status, "component status");
        self.components.insert(component.to_string(), status);
    }
}
