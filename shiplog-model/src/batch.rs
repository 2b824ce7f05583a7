use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::record::LogRecord;

/// Identifier assigned to a batch when it is sealed.
pub type BatchId = Uuid;

/// A sealed, immutable group of validated records uploaded as one object.
///
/// Sealing order is upload order; the id is assigned at seal time. The
/// builder that enforces the size and count bounds lives in the core crate;
/// a `Batch` that exists is by construction within bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub created_at: DateTime<Utc>,
    /// Serialized JSONL size of `records`, trailing newlines included.
    pub byte_size: usize,
    /// Distinct `source_file` values contributing to this batch, in first
    /// appearance order.
    pub source_files: Vec<String>,
    pub records: Vec<LogRecord>,
}

impl Batch {
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Wire body for upload: UTF-8, one record per line, trailing newline,
    /// no BOM, no enclosing array.
    pub fn to_jsonl(&self) -> serde_json::Result<Vec<u8>> {
        let mut body = Vec::with_capacity(self.byte_size);
        for record in &self.records {
            serde_json::to_writer(&mut body, record)?;
            body.push(b'\n');
        }
        Ok(body)
    }

    /// Hierarchical object key for this batch:
    /// `{root}/{yyyy}/{MM}/{dd}/{device_id}/{batch_id}.jsonl`.
    pub fn object_key(&self, root: &str, device_id: &str) -> String {
        format!(
            "{root}/{}/{device_id}/{}.jsonl",
            self.created_at.format("%Y/%m/%d"),
            self.id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::level::LogLevel;
    use chrono::TimeZone;

    fn record(id: &str) -> LogRecord {
        LogRecord {
            id: id.to_string(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap(),
            device_id: "dev-1".to_string(),
            level: LogLevel::Info,
            message: "m".to_string(),
            category: None,
            tags: None,
            data: None,
            error: None,
            source_file: Some("a.jsonl".to_string()),
            processed_at: None,
        }
    }

    #[test]
    fn jsonl_body_is_one_record_per_line_with_trailing_newline() {
        let batch = Batch {
            id: Uuid::new_v4(),
            created_at: Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap(),
            byte_size: 0,
            source_files: vec!["a.jsonl".to_string()],
            records: vec![record("r1"), record("r2")],
        };
        let body = batch.to_jsonl().unwrap();
        assert_eq!(body.last(), Some(&b'\n'));
        assert!(!body.starts_with(&[0xEF, 0xBB, 0xBF]), "no BOM");
        let text = String::from_utf8(body).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let parsed: LogRecord = serde_json::from_str(line).unwrap();
            assert_eq!(parsed.device_id, "dev-1");
        }
    }

    #[test]
    fn object_key_layout() {
        let id = Uuid::new_v4();
        let batch = Batch {
            id,
            created_at: Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap(),
            byte_size: 0,
            source_files: vec![],
            records: vec![],
        };
        assert_eq!(
            batch.object_key("logs", "press-07"),
            format!("logs/2024/05/02/press-07/{id}.jsonl")
        );
    }
}
