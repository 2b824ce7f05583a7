//! File ingestion: encoding detection, line processing, and the reader
//! pool that streams stable files into the batch queue.

pub mod encoding;
pub mod line;
pub mod reader;

pub use encoding::{Detection, LineDecoder, detect};
pub use line::{DropCounters, LineError, LineProcessor};
pub use reader::{FileReader, ReaderPool, ReaderTuning, ReadSummary};
