//! Decides when a file has stopped being written.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::Clock;

/// Outcome of one stability probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stability {
    /// Unchanged for the stabilization period across at least two polls.
    Stable,
    /// Still changing, or not yet quiet for long enough.
    Growing,
    /// The path no longer exists.
    Gone,
    /// Metadata could not be read. The caller retries up to its probe cap.
    Error(String),
}

/// What the arbiter remembers about a path between probes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub size: u64,
    pub mtime: Option<DateTime<Utc>>,
    /// First instant of the current quiet run.
    pub quiet_since: DateTime<Utc>,
    /// Successive polls that agreed with this size/mtime pair.
    pub agreeing_polls: u32,
}

/// Samples size and mtime and requires a full [`StabilityArbiter::period`]
/// of agreement across at least two polls before declaring a file safe to
/// read end-to-end.
#[derive(Debug, Clone)]
pub struct StabilityArbiter {
    period: Duration,
    clock: Arc<dyn Clock>,
}

impl StabilityArbiter {
    pub fn new(period: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { period, clock }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Probe `path`, comparing against the previous observation if any.
    ///
    /// Zero-length files are never stable: the writer has created but not
    /// yet filled them. An mtime that advanced under an unchanged size
    /// still counts as growing (the writer touched the file).
    pub async fn probe(
        &self,
        path: &Path,
        previous: Option<&Observation>,
    ) -> (Stability, Option<Observation>) {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return (Stability::Gone, None);
            }
            Err(error) => return (Stability::Error(error.to_string()), previous.cloned()),
        };

        let now = self.clock.now();
        let size = metadata.len();
        let mtime = metadata.modified().ok().map(DateTime::<Utc>::from);

        if size == 0 {
            // Keep a fresh observation so later growth restarts the clock.
            let observation = Observation {
                size,
                mtime,
                quiet_since: now,
                agreeing_polls: 0,
            };
            return (Stability::Growing, Some(observation));
        }

        let observation = match previous {
            Some(prev) if prev.size == size && !mtime_advanced(prev.mtime, mtime) => Observation {
                size,
                mtime,
                quiet_since: prev.quiet_since,
                agreeing_polls: prev.agreeing_polls.saturating_add(1),
            },
            _ => Observation {
                size,
                mtime,
                quiet_since: now,
                agreeing_polls: 1,
            },
        };

        let quiet_for = (now - observation.quiet_since)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let stability = if observation.agreeing_polls >= 2 && quiet_for >= self.period {
            Stability::Stable
        } else {
            Stability::Growing
        };
        (stability, Some(observation))
    }
}

fn mtime_advanced(previous: Option<DateTime<Utc>>, current: Option<DateTime<Utc>>) -> bool {
    match (previous, current) {
        (Some(prev), Some(cur)) => cur > prev,
        // Filesystems without mtimes: size agreement is all we have.
        _ => false,
    }
}
