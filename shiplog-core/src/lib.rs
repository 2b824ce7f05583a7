//! Core pipeline of the shiplog collection agent.
//!
//! Data flows `watch -> ingest -> pipeline -> upload`: the watcher turns
//! filesystem noise into `FileStable` events, readers stream stable files
//! through line validation into a bounded queue, the batch processor seals
//! size/count/time-bounded batches, and the uploader delivers them over
//! the device-identity channel with retries and reconnects. The
//! supervisor owns construction and the ordered drain.

pub mod clock;
pub mod error;
pub mod health;
pub mod ingest;
pub mod pipeline;
pub mod retry;
pub mod supervision;
pub mod supervisor;
pub mod upload;
pub mod watch;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{AgentError, Result};
pub use health::{AgentHealth, ComponentStatus, HealthReporter, HealthSnapshot};
pub use retry::{ErrorClass, RetryPolicy, classify};
pub use supervisor::{RunningAgent, ShutdownOutcome, Supervisor};
