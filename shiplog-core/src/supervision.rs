//! Task supervision: panic containment and restart budgeting.
//!
//! Long-running component tasks wrap their loops in `catch_unwind`. A
//! panic is an internal invariant violation: the task restarts with fresh
//! loop state, up to [`RestartBudget`] times per window; past that the
//! component reports `Failed` and the fatal token brings the process down
//! with the drain-timeout exit code.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::health::AgentHealth;

/// Shared context every supervised task gets: where to report, and the
/// token that declares the whole process unrecoverable.
#[derive(Debug, Clone)]
pub struct Supervision {
    pub health: Arc<AgentHealth>,
    pub fatal: CancellationToken,
}

impl Supervision {
    pub fn new(health: Arc<AgentHealth>, fatal: CancellationToken) -> Self {
        Self { health, fatal }
    }
}

/// Restarts allowed per sliding window.
const MAX_RESTARTS: usize = 3;
const RESTART_WINDOW: Duration = Duration::from_secs(60);

/// Sliding-window restart accounting for one task.
#[derive(Debug)]
pub struct RestartBudget {
    events: VecDeque<Instant>,
}

impl RestartBudget {
    pub fn new() -> Self {
        Self {
            events: VecDeque::new(),
        }
    }

    /// Record a panic; returns whether a restart is still within budget.
    pub fn allow_restart(&mut self) -> bool {
        let now = Instant::now();
        while let Some(front) = self.events.front() {
            if now.duration_since(*front) > RESTART_WINDOW {
                self.events.pop_front();
            } else {
                break;
            }
        }
        if self.events.len() >= MAX_RESTARTS {
            return false;
        }
        self.events.push_back(now);
        true
    }
}

impl Default for RestartBudget {
    fn default() -> Self {
        Self::new()
    }
}

/// Best-effort extraction of a panic payload message for the log.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn budget_allows_three_then_refuses() {
        let mut budget = RestartBudget::new();
        assert!(budget.allow_restart());
        assert!(budget.allow_restart());
        assert!(budget.allow_restart());
        assert!(!budget.allow_restart());
    }

    #[tokio::test(start_paused = true)]
    async fn budget_window_slides() {
        let mut budget = RestartBudget::new();
        for _ in 0..3 {
            assert!(budget.allow_restart());
        }
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(budget.allow_restart());
    }
}
