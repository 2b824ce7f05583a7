//! Batch assembly: the bounded record queue, the builder that enforces
//! batch bounds, and the single-consumer processor loop.

pub mod builder;
pub mod processor;
pub mod queue;

pub use builder::{AddResult, BatchBuilder};
pub use processor::{
    BatchProcessor, BatchResult, BatchSink, ProcessorHandle, ProcessorState, ProcessorTuning,
};
pub use queue::{QueueReceiver, QueueSender, batch_queue};
