//! Streams a stable file line-by-line into the batch queue.
//!
//! Each file is one reader task, so record order within a file survives
//! all the way into the batch payload. Reads are chunked and decoded
//! incrementally; a mid-stream I/O error re-opens the file and skips the
//! lines already emitted, which keeps the at-least-once contract without
//! duplicating records on the happy path.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::Stream;
use futures::{FutureExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use shiplog_config::IngestSettings;
use shiplog_model::{FileState, LogRecord};

use crate::error::{AgentError, Result};
use crate::health::{AgentHealth, ComponentStatus, HealthReporter as _};
use crate::supervision::{self, RestartBudget, Supervision};
use crate::ingest::encoding::{self, LineDecoder};
use crate::ingest::line::{DropCounters, LineError, LineProcessor};
use crate::pipeline::queue::QueueSender;
use crate::watch::catalog::FileCatalog;
use crate::watch::watcher::FileStable;

/// Buffered read chunk.
const READ_CHUNK: usize = 64 * 1024;
/// Bytes sniffed for encoding detection.
const SNIFF_LEN: usize = 4 * 1024;
/// Minimum whole-file deadline regardless of size.
const MIN_FILE_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
pub struct ReaderTuning {
    pub max_concurrency: usize,
    pub max_read_retries: u32,
    pub read_retry_delay: Duration,
    pub bytes_per_second_floor: u64,
    pub drop_log_sample: u32,
}

impl From<&IngestSettings> for ReaderTuning {
    fn from(settings: &IngestSettings) -> Self {
        Self {
            max_concurrency: settings.max_concurrency.max(1),
            max_read_retries: settings.max_read_retries,
            read_retry_delay: settings.read_retry_delay(),
            bytes_per_second_floor: settings.bytes_per_second_floor.max(1),
            drop_log_sample: settings.drop_log_sample,
        }
    }
}

/// End-of-file accounting returned to the pool.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadSummary {
    pub records: u64,
}

#[derive(Debug)]
pub struct FileReader {
    tuning: ReaderTuning,
    processor: LineProcessor,
    catalog: Arc<FileCatalog>,
    queue: QueueSender,
    health: Arc<AgentHealth>,
}

impl FileReader {
    pub fn new(
        tuning: ReaderTuning,
        processor: LineProcessor,
        catalog: Arc<FileCatalog>,
        queue: QueueSender,
        health: Arc<AgentHealth>,
    ) -> Self {
        Self {
            tuning,
            processor,
            catalog,
            queue,
            health,
        }
    }

    /// Lazy, finite stream of the valid records in `path`. Not
    /// restartable: dropped lines are counted against the file as the
    /// stream advances.
    ///
    /// I/O errors mid-stream re-open the file up to the retry cap (linear
    /// delay), skipping lines already yielded; a terminal error ends the
    /// stream with `Err`.
    pub fn read(
        self: &Arc<Self>,
        path: &Path,
        token: &CancellationToken,
    ) -> impl Stream<Item = Result<LogRecord>> + Send + use<> {
        let reader = Arc::clone(self);
        let path = path.to_path_buf();
        let token = token.clone();
        async_stream::stream! {
            let source_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            let mut drops = DropCounters::default();
            // Lines consumed so far, dropped ones included. A retry
            // re-reads from the head and skips up to here, so records are
            // neither duplicated nor lost by a mid-stream error.
            let mut lines_done: u64 = 0;
            let mut attempt: u32 = 0;

            'attempts: loop {
                let opened = reader.open_and_sniff(&path).await;
                let (mut file, mut decoder) = match opened {
                    Ok(pair) => pair,
                    Err(error) => {
                        attempt += 1;
                        if attempt > reader.tuning.max_read_retries {
                            yield Err(error);
                            break 'attempts;
                        }
                        warn!(path = %path.display(), %error, attempt, "open failed; retrying");
                        tokio::time::sleep(reader.tuning.read_retry_delay).await;
                        continue 'attempts;
                    }
                };

                let mut chunk = vec![0u8; READ_CHUNK];
                let mut lines: Vec<String> = Vec::new();
                let mut line_no: u64 = 0;
                loop {
                    if token.is_cancelled() {
                        yield Err(AgentError::Cancelled("file read".to_string()));
                        break 'attempts;
                    }
                    let read = match file.read(&mut chunk).await {
                        Ok(read) => read,
                        Err(error) => {
                            attempt += 1;
                            if attempt > reader.tuning.max_read_retries {
                                yield Err(error.into());
                                break 'attempts;
                            }
                            warn!(path = %path.display(), %error, attempt, "read error; retrying");
                            tokio::time::sleep(reader.tuning.read_retry_delay).await;
                            continue 'attempts;
                        }
                    };
                    if read == 0 {
                        decoder.finish(&mut lines);
                    } else {
                        decoder.feed(&chunk[..read], &mut lines);
                    }

                    for raw in lines.drain(..) {
                        line_no += 1;
                        if line_no <= lines_done {
                            continue;
                        }
                        lines_done = line_no;
                        match reader.processor.process(&raw, &source_name) {
                            Ok(Some(record)) => yield Ok(record),
                            Ok(None) => {
                                drops.skipped += 1;
                                reader.health.record_line_skipped();
                            }
                            Err(error) => {
                                reader.count_drop(&path, line_no, &error, &mut drops);
                            }
                        }
                    }
                    if read == 0 {
                        if drops.dropped() > 0 || drops.skipped > 0 {
                            info!(
                                path = %path.display(),
                                malformed = drops.malformed,
                                bad_timestamp = drops.timestamp,
                                invalid = drops.validation,
                                blank = drops.skipped,
                                "lines dropped in file"
                            );
                        }
                        break 'attempts;
                    }
                }
            }
        }
    }

    async fn open_and_sniff(&self, path: &Path) -> Result<(tokio::fs::File, LineDecoder)> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut sniff = vec![0u8; SNIFF_LEN];
        let mut filled = 0;
        while filled < sniff.len() {
            let read = file.read(&mut sniff[filled..]).await?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        sniff.truncate(filled);

        let detection = encoding::detect(&sniff);
        if detection.ambiguous {
            warn!(path = %path.display(), "ambiguous encoding; assuming UTF-8");
            self.catalog.set_encoding_warning(path);
        }
        file.seek(std::io::SeekFrom::Start(0)).await?;
        Ok((file, LineDecoder::new(&detection)))
    }

    fn count_drop(&self, path: &Path, line_no: u64, error: &LineError, drops: &mut DropCounters) {
        drops.count(error);
        match error {
            LineError::MalformedJson(_) => self.health.record_dropped_malformed(),
            LineError::UnsupportedTimestamp(_) => self.health.record_dropped_timestamp(),
            LineError::ValidationFailed(_) => self.health.record_dropped_validation(),
        }
        if drops.dropped() <= u64::from(self.tuning.drop_log_sample) {
            warn!(path = %path.display(), line = line_no, %error, "dropping line");
        }
    }
}

/// Consumes `FileStable` events and fans files out to reader tasks, at
/// most `max_concurrency` in flight.
#[derive(Debug)]
pub struct ReaderPool {
    reader: Arc<FileReader>,
    tuning: ReaderTuning,
}

impl ReaderPool {
    pub fn new(reader: Arc<FileReader>, tuning: ReaderTuning) -> Self {
        Self { reader, tuning }
    }

    pub fn start(
        self,
        mut stable_rx: mpsc::Receiver<FileStable>,
        token: CancellationToken,
        supervision: Supervision,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut budget = RestartBudget::new();
            loop {
                let run = std::panic::AssertUnwindSafe(self.run(&mut stable_rx, token.clone()))
                    .catch_unwind();
                match run.await {
                    Ok(()) => break,
                    Err(payload) => {
                        let message = supervision::panic_message(payload.as_ref());
                        tracing::error!(task = "reader-pool", message, "task panicked");
                        if budget.allow_restart() {
                            warn!(task = "reader-pool", "restarting after panic");
                            continue;
                        }
                        supervision
                            .health
                            .report("reader-pool", ComponentStatus::Failed);
                        supervision.fatal.cancel();
                        break;
                    }
                }
            }
        })
    }

    async fn run(&self, stable_rx: &mut mpsc::Receiver<FileStable>, token: CancellationToken) {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.tuning.max_concurrency));
        let mut tasks = JoinSet::new();

        loop {
            // Opportunistically reap finished readers.
            while tasks.try_join_next().is_some() {}

            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                maybe = stable_rx.recv() => {
                    let Some(event) = maybe else { break };
                    let permit = tokio::select! {
                        biased;
                        _ = token.cancelled() => break,
                        permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                            Ok(permit) => permit,
                            Err(_) => break,
                        },
                    };
                    let reader = Arc::clone(&self.reader);
                    let task_token = token.clone();
                    tasks.spawn(async move {
                        let _permit = permit;
                        reader.ingest_file(event, task_token).await;
                    });
                }
            }
        }

        // Graceful drain: running readers finish (or bail at their next
        // cancellation check); no new files are accepted.
        while tasks.join_next().await.is_some() {}
        debug!("reader pool stopped");
    }
}

impl FileReader {
    /// Claim and ingest one stable file, driving records into the queue.
    async fn ingest_file(self: Arc<Self>, event: FileStable, token: CancellationToken) {
        let path = event.path.clone();

        // Stale emissions (the writer came back after this event was
        // queued) are dropped; the newer epoch re-fires on its own.
        if self.catalog.epoch(&path) != Some(event.epoch) {
            debug!(path = %path.display(), epoch = event.epoch, "stale stable event ignored");
            return;
        }
        match self
            .catalog
            .compare_and_set(&path, FileState::Stabilizing, FileState::Reading)
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(path = %path.display(), "file no longer claimable");
                return;
            }
            Err(error) => {
                warn!(path = %path.display(), %error, "claim failed");
                return;
            }
        }

        let deadline = self.file_deadline(event.size);
        let outcome = tokio::time::timeout(deadline, self.drive(&path, &token)).await;

        match outcome {
            Ok(Ok(summary)) => {
                info!(
                    path = %path.display(),
                    records = summary.records,
                    "file processed"
                );
                self.health.record_accepted(summary.records);
                let _ = self
                    .catalog
                    .compare_and_set(&path, FileState::Reading, FileState::Processed);
            }
            Ok(Err(error)) => {
                if matches!(error, AgentError::Cancelled(_)) {
                    debug!(path = %path.display(), "read cancelled during drain");
                } else {
                    warn!(path = %path.display(), %error, "file failed");
                }
                let _ = self
                    .catalog
                    .compare_and_set(&path, FileState::Reading, FileState::Failed);
            }
            Err(_elapsed) => {
                warn!(
                    path = %path.display(),
                    deadline_secs = deadline.as_secs(),
                    "whole-file deadline exceeded"
                );
                let _ = self
                    .catalog
                    .compare_and_set(&path, FileState::Reading, FileState::Failed);
            }
        }
    }

    async fn drive(self: &Arc<Self>, path: &Path, token: &CancellationToken) -> Result<ReadSummary> {
        let mut summary = ReadSummary::default();
        let stream = self.read(path, token);
        futures::pin_mut!(stream);
        while let Some(item) = stream.next().await {
            let record = item?;
            self.queue.enqueue(record, token).await?;
            summary.records += 1;
        }
        Ok(summary)
    }

    fn file_deadline(&self, size: u64) -> Duration {
        let budget = Duration::from_secs_f64(size as f64 / self.tuning.bytes_per_second_floor as f64);
        budget.max(MIN_FILE_DEADLINE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::pipeline::queue::batch_queue;
    use chrono::Utc;
    use std::io::Write;
    use uuid::Uuid;

    fn tuning() -> ReaderTuning {
        ReaderTuning {
            max_concurrency: 2,
            max_read_retries: 2,
            read_retry_delay: Duration::from_millis(10),
            bytes_per_second_floor: 1024 * 1024,
            drop_log_sample: 5,
        }
    }

    fn valid_line(id: &str) -> String {
        let ts = Utc::now().to_rfc3339();
        format!(
            r#"{{"id":"{id}","timestamp":"{ts}","deviceId":"press-07","level":"info","message":"cycle"}}"#
        )
    }

    struct Rig {
        reader: Arc<FileReader>,
        catalog: Arc<FileCatalog>,
        queue_rx: crate::pipeline::queue::QueueReceiver,
    }

    fn rig() -> Rig {
        let catalog = Arc::new(FileCatalog::new(64));
        let (queue_tx, queue_rx) = batch_queue(1024);
        let reader = Arc::new(FileReader::new(
            tuning(),
            LineProcessor::new(Arc::new(SystemClock)),
            Arc::clone(&catalog),
            queue_tx,
            Arc::new(AgentHealth::new()),
        ));
        Rig {
            reader,
            catalog,
            queue_rx,
        }
    }

    fn stage_file(catalog: &FileCatalog, path: &Path) -> FileStable {
        let watch_id = Uuid::new_v4();
        catalog.observe(path, watch_id);
        catalog
            .compare_and_set(path, FileState::Observed, FileState::Stabilizing)
            .unwrap();
        FileStable {
            watch_id,
            path: path.to_path_buf(),
            epoch: 0,
            size: std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
        }
    }

    #[tokio::test]
    async fn reads_records_in_file_order() {
        let mut rig = rig();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        let mut file = std::fs::File::create(&path).unwrap();
        for i in 0..5 {
            writeln!(file, "{}", valid_line(&format!("r{i}"))).unwrap();
        }
        drop(file);

        let event = stage_file(&rig.catalog, &path);
        let token = CancellationToken::new();
        Arc::clone(&rig.reader).ingest_file(event, token).await;

        let records = rig
            .queue_rx
            .dequeue_up_to(16, Duration::from_millis(100))
            .await;
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["r0", "r1", "r2", "r3", "r4"]);
        for record in &records {
            assert_eq!(record.source_file.as_deref(), Some("a.jsonl"));
            assert!(record.processed_at.is_some());
        }
        assert_eq!(
            rig.catalog.get(&path).unwrap().state,
            FileState::Processed
        );
    }

    #[tokio::test]
    async fn mixed_validity_drops_bad_lines_only() {
        let mut rig = rig();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixed.jsonl");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{}", valid_line("r1")).unwrap();
        writeln!(file, "{{not json").unwrap();
        writeln!(
            file,
            r#"{{"id":"bad","timestamp":"3000-01-01T00:00:00Z","deviceId":"d","level":"info","message":"m"}}"#
        )
        .unwrap();
        writeln!(file, "{}", valid_line("r2")).unwrap();
        drop(file);

        let event = stage_file(&rig.catalog, &path);
        Arc::clone(&rig.reader)
            .ingest_file(event, CancellationToken::new())
            .await;

        let records = rig
            .queue_rx
            .dequeue_up_to(16, Duration::from_millis(100))
            .await;
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["r1", "r2"]);
        assert_eq!(
            rig.catalog.get(&path).unwrap().state,
            FileState::Processed
        );
    }

    #[tokio::test]
    async fn stale_epoch_is_ignored() {
        let rig = rig();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.jsonl");
        std::fs::write(&path, valid_line("r1") + "\n").unwrap();

        let mut event = stage_file(&rig.catalog, &path);
        rig.catalog.bump_epoch(&path);
        event.epoch = 0; // now stale
        Arc::clone(&rig.reader)
            .ingest_file(event, CancellationToken::new())
            .await;

        // Never claimed: still stabilizing, nothing read.
        assert_eq!(
            rig.catalog.get(&path).unwrap().state,
            FileState::Stabilizing
        );
    }

    #[tokio::test]
    async fn missing_file_marks_failed() {
        let rig = rig();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ghost.jsonl");
        std::fs::write(&path, valid_line("r1") + "\n").unwrap();
        let event = stage_file(&rig.catalog, &path);
        std::fs::remove_file(&path).unwrap();

        Arc::clone(&rig.reader)
            .ingest_file(event, CancellationToken::new())
            .await;
        assert_eq!(rig.catalog.get(&path).unwrap().state, FileState::Failed);
    }

    #[tokio::test]
    async fn utf16_file_with_bom_is_read() {
        let mut rig = rig();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide.jsonl");
        let body = format!("{}\n{}\n", valid_line("w1"), valid_line("w2"));
        let mut bytes = vec![0xFF, 0xFE];
        bytes.extend(body.encode_utf16().flat_map(|u| u.to_le_bytes()));
        std::fs::write(&path, &bytes).unwrap();

        let event = stage_file(&rig.catalog, &path);
        Arc::clone(&rig.reader)
            .ingest_file(event, CancellationToken::new())
            .await;

        let records = rig
            .queue_rx
            .dequeue_up_to(16, Duration::from_millis(100))
            .await;
        let ids: Vec<_> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["w1", "w2"]);
    }
}
