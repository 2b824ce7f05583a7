use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::level::LogLevel;
use crate::sanitize::escape_html;

/// Earliest timestamp any machine in the fleet can legitimately claim.
/// Records dated before this are clock garbage (dead CMOS battery, epoch
/// resets) and are rejected at the line level.
pub const MIN_TIMESTAMP_YEAR: i32 = 2000;

/// Accepted clock skew into the future.
pub const MAX_FUTURE_SKEW_HOURS: i64 = 24;

const MAX_ID_CHARS: usize = 50;
const MAX_DEVICE_ID_CHARS: usize = 100;
const MAX_CATEGORY_CHARS: usize = 100;
const MAX_TAG_CHARS: usize = 50;
const MAX_ERROR_CODE_CHARS: usize = 50;

/// Structured error payload attached to a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

/// One ingested machine event.
///
/// The wire shape is the producer contract: camelCase keys, RFC 3339
/// timestamps. `source_file` and `processed_at` are absent on the wire in;
/// the reader stamps them before the record enters the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub device_id: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

impl LogRecord {
    /// Check every bound of the record contract against `now`.
    ///
    /// Validation is pure; it never mutates. A record that validates once
    /// validates again after [`LogRecord::sanitize`]: escaping never empties
    /// a field, and length bounds count escaped entities as one character.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        bounded_required("id", &self.id, MAX_ID_CHARS)?;
        bounded_required("deviceId", &self.device_id, MAX_DEVICE_ID_CHARS)?;
        if self.message.trim().is_empty() {
            return Err(ModelError::MissingField("message"));
        }

        let floor = Utc
            .with_ymd_and_hms(MIN_TIMESTAMP_YEAR, 1, 1, 0, 0, 0)
            .single()
            .expect("constant timestamp floor");
        let ceiling = now + chrono::Duration::hours(MAX_FUTURE_SKEW_HOURS);
        if self.timestamp < floor || self.timestamp > ceiling {
            return Err(ModelError::TimestampOutOfRange(
                self.timestamp.to_rfc3339(),
            ));
        }

        if let Some(category) = &self.category {
            bounded_optional("category", category, MAX_CATEGORY_CHARS)?;
        }
        if let Some(tags) = &self.tags {
            for tag in tags {
                if tag.trim().is_empty() {
                    return Err(ModelError::OutOfBounds {
                        field: "tags",
                        detail: "empty tag".to_string(),
                    });
                }
                bounded_optional("tags", tag, MAX_TAG_CHARS)?;
            }
        }
        if let Some(error) = &self.error {
            if error.message.trim().is_empty() {
                return Err(ModelError::MissingField("error.message"));
            }
            if let Some(code) = &error.code {
                bounded_optional("error.code", code, MAX_ERROR_CODE_CHARS)?;
            }
        }

        Ok(())
    }

    /// HTML-escape every string field that downstream viewers render.
    ///
    /// Idempotent: sanitizing a sanitized record is a no-op (see
    /// [`crate::sanitize::escape_html`]).
    pub fn sanitize(&mut self) {
        self.id = escape_html(&self.id);
        self.device_id = escape_html(&self.device_id);
        self.message = escape_html(&self.message);
        if let Some(category) = &self.category {
            self.category = Some(escape_html(category));
        }
        if let Some(tags) = &mut self.tags {
            for tag in tags.iter_mut() {
                *tag = escape_html(tag);
            }
        }
        if let Some(error) = &mut self.error {
            error.message = escape_html(&error.message);
            if let Some(code) = &error.code {
                error.code = Some(escape_html(code));
            }
        }
    }
}

fn bounded_required(field: &'static str, value: &str, max_chars: usize) -> Result<()> {
    if value.is_empty() {
        return Err(ModelError::MissingField(field));
    }
    bounded_optional(field, value, max_chars)
}

fn bounded_optional(field: &'static str, value: &str, max_chars: usize) -> Result<()> {
    let count = logical_char_count(value);
    if count > max_chars {
        return Err(ModelError::OutOfBounds {
            field,
            detail: format!("{count} chars exceeds {max_chars}"),
        });
    }
    Ok(())
}

/// Character count with each escaper-emitted entity counted as one
/// character, so a record still validates after [`LogRecord::sanitize`].
fn logical_char_count(value: &str) -> usize {
    let mut count = 0;
    let mut rest = value;
    while !rest.is_empty() {
        if rest.starts_with('&') {
            if let Some(entity) = crate::sanitize::EMITTED_ENTITIES
                .iter()
                .find(|e| rest.starts_with(**e))
            {
                count += 1;
                rest = &rest[entity.len()..];
                continue;
            }
        }
        let ch = rest.chars().next().expect("non-empty str");
        count += 1;
        rest = &rest[ch.len_utf8()..];
    }
    count
}
