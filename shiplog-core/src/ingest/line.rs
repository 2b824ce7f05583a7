//! Parses, validates, and sanitizes one JSON line into a [`LogRecord`].

use std::sync::Arc;

use chrono::DateTime;
use thiserror::Error;
use tracing::debug;

use shiplog_model::{LogRecord, ModelError};

use crate::clock::Clock;

/// Why a line was dropped. All variants are non-fatal at line granularity:
/// the line is counted and the file continues.
#[derive(Debug, Error)]
pub enum LineError {
    #[error("malformed JSON: {0}")]
    MalformedJson(String),

    #[error("unsupported timestamp: {0}")]
    UnsupportedTimestamp(String),

    #[error("validation failed: {0}")]
    ValidationFailed(String),
}

/// Per-file drop accounting, reported in the end-of-file summary.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DropCounters {
    pub malformed: u64,
    pub timestamp: u64,
    pub validation: u64,
    pub skipped: u64,
}

impl DropCounters {
    pub fn count(&mut self, error: &LineError) {
        match error {
            LineError::MalformedJson(_) => self.malformed += 1,
            LineError::UnsupportedTimestamp(_) => self.timestamp += 1,
            LineError::ValidationFailed(_) => self.validation += 1,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.malformed + self.timestamp + self.validation
    }
}

#[derive(Debug, Clone)]
pub struct LineProcessor {
    clock: Arc<dyn Clock>,
}

impl LineProcessor {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Run one raw line through the pipeline: skip blanks, parse strictly,
    /// check the timestamp format, validate, escape, and stamp provenance.
    ///
    /// `Ok(None)` is a skipped blank line, not an error.
    pub fn process(
        &self,
        raw_line: &str,
        source_file: &str,
    ) -> std::result::Result<Option<LogRecord>, LineError> {
        let trimmed = raw_line.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        // Parsing through `Value` first makes duplicate keys resolve
        // last-key-wins instead of failing the whole line.
        let value: serde_json::Value = serde_json::from_str(trimmed)
            .map_err(|e| LineError::MalformedJson(e.to_string()))?;
        if let Some(map) = value.as_object() {
            // More keys in the raw text than in the parsed map means a
            // duplicate collapsed; last key wins.
            let raw_keys = top_level_key_count(trimmed);
            if raw_keys > map.len() {
                debug!(source_file, raw_keys, kept = map.len(), "duplicate keys collapsed");
            }
        }

        match value.get("timestamp") {
            Some(serde_json::Value::String(raw)) => {
                DateTime::parse_from_rfc3339(raw)
                    .map_err(|e| LineError::UnsupportedTimestamp(format!("{raw:?}: {e}")))?;
            }
            Some(_) => {
                return Err(LineError::UnsupportedTimestamp(
                    "timestamp must be an RFC 3339 string".to_string(),
                ));
            }
            None => {
                return Err(LineError::ValidationFailed(
                    "missing required field: timestamp".to_string(),
                ));
            }
        }

        let mut record: LogRecord = serde_json::from_value(value)
            .map_err(|e| LineError::ValidationFailed(e.to_string()))?;

        let now = self.clock.now();
        record.validate(now).map_err(|e: ModelError| {
            LineError::ValidationFailed(e.to_string())
        })?;

        record.sanitize();
        record.source_file = Some(source_file.to_string());
        record.processed_at = Some(now);
        Ok(Some(record))
    }
}

/// Count the keys of a top-level JSON object by scanning for colons at
/// nesting depth one, outside strings. Only called on text serde already
/// accepted, so the scan never sees invalid JSON.
fn top_level_key_count(raw: &str) -> usize {
    let mut depth = 0u32;
    let mut in_string = false;
    let mut escaped = false;
    let mut keys = 0;
    for ch in raw.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' | '[' if !in_string => depth += 1,
            '}' | ']' if !in_string => depth = depth.saturating_sub(1),
            ':' if !in_string && depth == 1 => keys += 1,
            _ => {}
        }
    }
    keys
}
