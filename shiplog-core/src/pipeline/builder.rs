//! Accumulates records into the pending batch and enforces its bounds.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use shiplog_model::{Batch, LogRecord};

use crate::error::{AgentError, Result};

/// Result of offering a record to the builder.
#[derive(Debug)]
pub enum AddResult {
    Added,
    /// Accepting the record would push the pending batch past the byte
    /// limit. The record is handed back; seal first, then re-offer.
    WouldExceed(Box<LogRecord>, usize),
}

/// Mutable accumulation state. Only the batch processor's consumer task
/// touches a builder, so there is no interior locking.
#[derive(Debug)]
pub struct BatchBuilder {
    max_bytes: usize,
    max_records: usize,
    records: Vec<LogRecord>,
    bytes: usize,
    source_files: Vec<String>,
}

impl BatchBuilder {
    pub fn new(max_bytes: usize, max_records: usize) -> Self {
        Self {
            max_bytes,
            max_records,
            records: Vec::new(),
            bytes: 0,
            source_files: Vec::new(),
        }
    }

    /// Serialized JSONL footprint of one record (newline included).
    pub fn record_size(record: &LogRecord) -> Result<usize> {
        Ok(serde_json::to_vec(record)?.len() + 1)
    }

    /// Offer a record whose size was computed with
    /// [`BatchBuilder::record_size`]. A record too large for any batch is
    /// rejected outright.
    pub fn try_add(&mut self, record: LogRecord, size: usize) -> Result<AddResult> {
        if size > self.max_bytes {
            return Err(AgentError::RecordTooLarge {
                bytes: size,
                limit: self.max_bytes,
            });
        }
        if self.bytes + size > self.max_bytes {
            return Ok(AddResult::WouldExceed(Box::new(record), size));
        }

        if let Some(source) = &record.source_file {
            if !self.source_files.iter().any(|s| s == source) {
                self.source_files.push(source.clone());
            }
        }
        self.bytes += size;
        self.records.push(record);
        Ok(AddResult::Added)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    pub fn byte_size(&self) -> usize {
        self.bytes
    }

    /// The count trigger: the pending batch is at its record ceiling.
    pub fn is_full(&self) -> bool {
        self.records.len() >= self.max_records
    }

    /// Seal the pending batch, swapping in an empty builder state. Returns
    /// `None` when there is nothing to seal. The batch id is assigned here,
    /// in seal order.
    pub fn seal(&mut self, created_at: DateTime<Utc>) -> Option<Batch> {
        if self.records.is_empty() {
            return None;
        }
        let records = std::mem::take(&mut self.records);
        let source_files = std::mem::take(&mut self.source_files);
        let byte_size = std::mem::take(&mut self.bytes);
        Some(Batch {
            id: Uuid::new_v4(),
            created_at,
            byte_size,
            source_files,
            records,
        })
    }
}
