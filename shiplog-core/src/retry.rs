//! Retry engine: error classification and exponential backoff.
//!
//! Callers never catch broadly; they wrap fallible operations in
//! [`execute`] and let [`classify`] decide what is worth another attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{AgentError, Result};
use shiplog_config::RetrySettings;

/// Whether an error is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network flakes, timeouts, throttling, server-side 5xx. Retried.
    Transient,
    /// Auth, validation, client-side 4xx (except 408/429). Not retried.
    Permanent,
}

/// Pure classification of an [`AgentError`].
pub fn classify(error: &AgentError) -> ErrorClass {
    match error {
        AgentError::Io(_) => ErrorClass::Transient,
        AgentError::Timeout(_) => ErrorClass::Transient,
        AgentError::Transport(e) => {
            // Request construction problems are permanent; everything that
            // touched the network is worth another attempt.
            if e.is_builder() || e.is_redirect() {
                ErrorClass::Permanent
            } else {
                ErrorClass::Transient
            }
        }
        AgentError::RemoteStatus { status, .. } => match status {
            408 | 429 => ErrorClass::Transient,
            500..=599 => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        },
        AgentError::Auth(_)
        | AgentError::Credential(_)
        | AgentError::Serialization(_)
        | AgentError::WatchConfig(_)
        | AgentError::RecordTooLarge { .. }
        | AgentError::FileFailed { .. }
        | AgentError::QueueClosed
        | AgentError::Cancelled(_)
        | AgentError::Internal(_) => ErrorClass::Permanent,
    }
}

/// Exponential backoff policy. `max_attempts == 0` means unbounded, which
/// the uploader's reconnect loop uses.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial: Duration::from_secs_f64(settings.initial_secs),
            max: Duration::from_secs_f64(settings.max_secs),
            multiplier: settings.multiplier,
        }
    }

    /// The more patient policy used while re-establishing a connection:
    /// attempts are unbounded until cancellation.
    pub fn reconnect(initial_secs: f64, max_secs: f64) -> Self {
        Self {
            max_attempts: 0,
            initial: Duration::from_secs_f64(initial_secs),
            max: Duration::from_secs_f64(max_secs),
            multiplier: 2.0,
        }
    }

    /// Anchor delay before the `attempt`-th retry (0-based), pre-jitter:
    /// `min(max, initial * multiplier^attempt)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.min(63) as i32;
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(exp);
        Duration::from_secs_f64(scaled.min(self.max.as_secs_f64()))
    }

    /// Anchor delay with multiplicative jitter in `[0.8, 1.2]`.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let anchor = self.delay_for(attempt).as_secs_f64();
        let factor = rand::rng().random_range(0.8..=1.2);
        Duration::from_secs_f64(anchor * factor)
    }

    fn attempts_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts != 0 && attempt >= self.max_attempts
    }
}

/// Run `op` until it succeeds, fails permanently, exhausts the policy, or
/// the token cancels. The closure receives the 0-based attempt index.
pub async fn execute<T, F, Fut>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        if token.is_cancelled() {
            return Err(AgentError::Cancelled("retry loop".to_string()));
        }

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(AgentError::Cancelled("retry loop".to_string())),
            result = op(attempt) => result,
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if classify(&error) == ErrorClass::Permanent {
            return Err(error);
        }
        attempt += 1;
        if policy.attempts_exhausted(attempt) {
            warn!(attempts = attempt, error = %error, "retries exhausted");
            return Err(error);
        }

        let delay = policy.jittered_delay(attempt - 1);
        debug!(attempt, delay_ms = delay.as_millis() as u64, error = %error, "retrying after transient error");
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(AgentError::Cancelled("retry backoff".to_string())),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn classification_table() {
        assert_eq!(
            classify(&AgentError::Timeout("upload".into())),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&AgentError::RemoteStatus {
                status: 503,
                detail: String::new()
            }),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&AgentError::RemoteStatus {
                status: 429,
                detail: String::new()
            }),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&AgentError::RemoteStatus {
                status: 403,
                detail: String::new()
            }),
            ErrorClass::Permanent
        );
        assert_eq!(
            classify(&AgentError::Auth("bad key".into())),
            ErrorClass::Permanent
        );
    }

    #[test]
    fn anchor_delays_are_monotonic_and_bounded() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        };
        let mut previous = Duration::ZERO;
        for attempt in 0..10 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= previous, "delay shrank at attempt {attempt}");
            assert!(delay >= policy.initial || attempt == 0);
            assert!(delay <= policy.max);
            previous = delay;
        }
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
        assert_eq!(policy.delay_for(9), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_in_band() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial: Duration::from_secs(2),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        };
        for attempt in 0..5 {
            let anchor = policy.delay_for(attempt).as_secs_f64();
            for _ in 0..50 {
                let jittered = policy.jittered_delay(attempt).as_secs_f64();
                assert!(jittered >= anchor * 0.8 - f64::EPSILON);
                assert!(jittered <= anchor * 1.2 + f64::EPSILON);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial: Duration::from_millis(10),
            max: Duration::from_millis(100),
            multiplier: 2.0,
        };
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result = execute(&policy, &token, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(AgentError::Timeout("simulated".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_short_circuit() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial: Duration::from_millis(10),
            max: Duration::from_millis(100),
            multiplier: 2.0,
        };
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<()> = execute(&policy, &token, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AgentError::Auth("denied".into())) }
        })
        .await;
        assert!(matches!(result, Err(AgentError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_last_error() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial: Duration::from_millis(10),
            max: Duration::from_millis(100),
            multiplier: 2.0,
        };
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<()> = execute(&policy, &token, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(AgentError::Timeout("still down".into())) }
        })
        .await;
        assert!(matches!(result, Err(AgentError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_stops_immediately() {
        let policy = RetryPolicy {
            max_attempts: 0,
            initial: Duration::from_secs(3600),
            max: Duration::from_secs(3600),
            multiplier: 2.0,
        };
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<()> = execute(&policy, &token, |_| async {
            Err(AgentError::Timeout("never".into()))
        })
        .await;
        assert!(matches!(result, Err(AgentError::Cancelled(_))));
    }
}
