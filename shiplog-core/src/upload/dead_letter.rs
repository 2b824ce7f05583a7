//! On-disk landing zone for batches that could not be uploaded.
//!
//! Batches land here after retry exhaustion or a permanent remote error
//! and stay until an external tool acknowledges them. The agent never
//! deletes or re-enqueues a dead-lettered batch; on startup it only counts
//! them for the health surface.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use shiplog_model::{Batch, BatchId};

use crate::error::Result;

/// Sidecar written next to each dead-lettered payload so the operator (or
/// the acknowledgement tool) knows why it is there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterMeta {
    pub batch_id: BatchId,
    pub created_at: DateTime<Utc>,
    pub stored_at: DateTime<Utc>,
    pub reason: String,
    pub upload_attempts: u32,
    pub record_count: usize,
    pub byte_size: usize,
}

/// Counts reported by the startup inventory.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DeadLetterInventory {
    pub batches: usize,
    pub bytes: u64,
}

#[derive(Debug)]
pub struct DeadLetterStore {
    root: PathBuf,
}

impl DeadLetterStore {
    /// Open the store, creating the directory if needed.
    pub async fn open(root: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(root).await?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Persist `batch` with its failure context. Returns the payload path.
    pub async fn store(
        &self,
        batch: &Batch,
        reason: &str,
        upload_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<PathBuf> {
        let payload_path = self.root.join(format!("{}.jsonl", batch.id));
        let meta_path = self.root.join(format!("{}.meta.json", batch.id));

        let body = batch.to_jsonl()?;
        let mut file = tokio::fs::File::create(&payload_path).await?;
        file.write_all(&body).await?;
        file.sync_all().await?;

        let meta = DeadLetterMeta {
            batch_id: batch.id,
            created_at: batch.created_at,
            stored_at: now,
            reason: reason.to_string(),
            upload_attempts,
            record_count: batch.record_count(),
            byte_size: body.len(),
        };
        let meta_body = serde_json::to_vec_pretty(&meta)?;
        tokio::fs::write(&meta_path, meta_body).await?;

        warn!(
            batch_id = %batch.id,
            records = batch.record_count(),
            reason,
            path = %payload_path.display(),
            "batch dead-lettered"
        );
        Ok(payload_path)
    }

    /// Count what previous runs left behind. Read-only.
    pub async fn inventory(&self) -> Result<DeadLetterInventory> {
        let mut inventory = DeadLetterInventory::default();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            inventory.batches += 1;
            if let Ok(metadata) = entry.metadata().await {
                inventory.bytes += metadata.len();
            }
        }
        if inventory.batches > 0 {
            info!(
                batches = inventory.batches,
                bytes = inventory.bytes,
                "dead-letter directory is not empty; an external tool must acknowledge these"
            );
        }
        Ok(inventory)
    }
}
