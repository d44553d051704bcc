//! # Retry Queue
//!
//! Durable, at-least-once delivery of outbound records.
//!
//! Records live in memory and are mirrored to a JSON array file. `enqueue`
//! appends the new element in place of the closing bracket and never touches
//! the network. A drain cycle changes memory only and compacts the file with a
//! single rewrite at the end of the cycle. Each record carries the
//! [`UploadTarget`] it is delivered to.
//!
//! ## File recovery
//!
//! A file that does not parse is copied to `<path>.corrupt` once, then the
//! longest parseable prefix of array elements is kept. Elements that are
//! not queue records (bare payloads) are adopted as new location records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Connectivity, UploadTarget, Uplinks};
use crate::error::Result;

/// Persisted unit of the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRecord {
    #[serde(default)]
    pub id: u64,
    /// Files written before targets existed hold location pings only
    #[serde(default)]
    pub target: UploadTarget,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    /// Failed delivery attempts, for observability only
    #[serde(default)]
    pub attempt_count: u32,
}

/// Outcome of one drain cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub failed: usize,
    pub dropped: usize,
    /// Records kept because no uplink serves their target
    pub unrouted: usize,
    /// Connectivity was absent when the cycle started
    pub offline: bool,
    /// A connectivity check failed mid-cycle and draining stopped
    pub interrupted: bool,
}

impl DrainReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed
    }

    fn changed(&self) -> bool {
        self.attempted() > 0 || self.dropped > 0
    }
}

#[derive(Debug)]
struct QueueState {
    records: Vec<QueuedRecord>,
    next_id: u64,
}

/// What is known about the file on disk
#[derive(Debug, Default)]
struct QueueFile {
    /// Offset of the closing `]` of a non-empty array, if appending is safe
    append_at: Option<u64>,
}

/// Disk-backed retry queue
#[derive(Debug)]
pub struct RetryQueue {
    path: PathBuf,
    min_payload_bytes: usize,
    state: Mutex<QueueState>,
    /// Serializes file writes; taken before `state` whenever both are needed
    file: tokio::sync::Mutex<QueueFile>,
    disk_writes: AtomicU64,
}

impl RetryQueue {
    /// Open the queue at `path`, recovering whatever the file holds
    ///
    /// A missing file is an empty queue.
    ///
    /// # Errors
    ///
    /// Returns error if the file exists but cannot be read, or the recovered
    /// queue cannot be written back.
    pub async fn open<P: AsRef<Path>>(path: P, min_payload_bytes: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut loaded = load_records(&path).await?;

        for (i, record) in loaded.records.iter_mut().enumerate() {
            record.id = i as u64 + 1;
        }
        let next_id = loaded.records.len() as u64 + 1;

        let queue = Self {
            path,
            min_payload_bytes,
            state: Mutex::new(QueueState {
                records: loaded.records,
                next_id,
            }),
            file: tokio::sync::Mutex::new(QueueFile {
                append_at: loaded.append_at,
            }),
            disk_writes: AtomicU64::new(0),
        };
        if loaded.rewrite {
            queue.persist().await?;
        }
        info!(
            "Opened retry queue {} with {} pending records",
            queue.path.display(),
            queue.len()
        );
        Ok(queue)
    }

    /// Queue `payload` for delivery to `target` and return its record id
    ///
    /// The record is kept in memory even if writing the file fails, so it is
    /// still retried.
    ///
    /// # Errors
    ///
    /// Returns `Io`/`Json` if the queue file cannot be written.
    pub async fn enqueue(&self, payload: Value, target: UploadTarget) -> Result<u64> {
        let mut file = self.file.lock().await;
        let record = {
            let mut state = self.lock();
            let record = QueuedRecord {
                id: state.next_id,
                target,
                payload,
                created_at: Utc::now(),
                attempt_count: 0,
            };
            state.next_id += 1;
            state.records.push(record.clone());
            debug!(
                "Queued {:?} record {} ({} pending)",
                target,
                record.id,
                state.records.len()
            );
            record
        };
        self.append(&mut file, &record).await?;
        Ok(record.id)
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }

    /// Copy of the pending records in insertion order
    pub fn records(&self) -> Vec<QueuedRecord> {
        let mut records = self.lock().records.clone();
        records.sort_by_key(|r| r.id);
        records
    }

    /// Number of writes made to the queue file since it was opened
    pub fn disk_writes(&self) -> u64 {
        self.disk_writes.load(Ordering::Relaxed)
    }

    /// Discard every pending record and return how many were dropped
    ///
    /// # Errors
    ///
    /// Returns error if the emptied queue cannot be written.
    pub async fn purge(&self) -> Result<usize> {
        let count = {
            let mut state = self.lock();
            let count = state.records.len();
            state.records.clear();
            count
        };
        self.persist().await?;
        warn!("Purged {} records from {}", count, self.path.display());
        Ok(count)
    }

    /// Run one drain cycle
    ///
    /// Records below the minimum payload size are dropped as corrupt.
    /// Records whose target has no uplink stay queued. After a failed
    /// delivery connectivity is checked again and the cycle ends if it is
    /// gone. The file is rewritten once, after the last record, if anything
    /// changed.
    ///
    /// # Errors
    ///
    /// Returns error only if the queue file cannot be updated.
    pub async fn drain(
        &self,
        uplinks: &Uplinks,
        connectivity: &dyn Connectivity,
    ) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        if self.is_empty() {
            return Ok(report);
        }
        if !connectivity.is_online().await {
            debug!("Offline, skipping drain of {} records", self.len());
            report.offline = true;
            return Ok(report);
        }

        for record in self.records() {
            let size = record.payload.to_string().len();
            if size < self.min_payload_bytes {
                warn!("Dropping undersized record {} ({} bytes)", record.id, size);
                self.remove(record.id);
                report.dropped += 1;
                continue;
            }

            let Some(uplink) = uplinks.route(record.target) else {
                report.unrouted += 1;
                continue;
            };

            match uplink.deliver(&record.payload).await {
                Ok(()) => {
                    self.remove(record.id);
                    report.delivered += 1;
                }
                Err(e) => {
                    self.record_failure(record.id);
                    report.failed += 1;
                    if e.is_transient() {
                        debug!("Delivery of record {} failed: {}", record.id, e);
                    } else {
                        warn!("Delivery of record {} failed: {}", record.id, e);
                    }

                    if !connectivity.is_online().await {
                        report.interrupted = true;
                        break;
                    }
                }
            }
        }

        if report.unrouted > 0 {
            debug!("{} records have no uplink for their target", report.unrouted);
        }
        if report.changed() {
            self.persist().await?;
        }
        Ok(report)
    }

    fn remove(&self, id: u64) {
        self.lock().records.retain(|r| r.id != id);
    }

    fn record_failure(&self, id: u64) {
        if let Some(record) = self.lock().records.iter_mut().find(|r| r.id == id) {
            record.attempt_count += 1;
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn persist(&self) -> Result<()> {
        let mut file = self.file.lock().await;
        self.rewrite(&mut file).await
    }

    /// Write `record` over the closing bracket, or rewrite the whole array
    /// when the file cannot be appended to
    async fn append(&self, file: &mut QueueFile, record: &QueuedRecord) -> Result<()> {
        let Some(offset) = file.append_at else {
            return self.rewrite(file).await;
        };

        let mut tail = vec![b','];
        serde_json::to_writer(&mut tail, record)?;
        tail.push(b']');

        // a failed append leaves the tail unknown; the next write compacts
        file.append_at = None;
        let mut handle = OpenOptions::new().write(true).open(&self.path).await?;
        handle.seek(SeekFrom::Start(offset)).await?;
        handle.write_all(&tail).await?;
        handle.flush().await?;
        self.disk_writes.fetch_add(1, Ordering::Relaxed);

        file.append_at = Some(offset + tail.len() as u64 - 1);
        Ok(())
    }

    /// Replace the file with the in-memory records (tmp file, then rename)
    async fn rewrite(&self, file: &mut QueueFile) -> Result<()> {
        let bytes = {
            let state = self.lock();
            serde_json::to_vec(&state.records)?
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        file.append_at = None;
        let tmp = sibling(&self.path, ".tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &self.path).await?;
        self.disk_writes.fetch_add(1, Ordering::Relaxed);

        file.append_at = closing_bracket(&bytes);
        Ok(())
    }
}

/// Drain loop: run a drain cycle every `interval` until cancelled
///
/// # Errors
///
/// Returns error if the queue file cannot be updated (disk failure).
pub async fn run_drain_loop(
    queue: Arc<RetryQueue>,
    uplinks: Uplinks,
    connectivity: Arc<dyn Connectivity>,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    info!("Starting drain loop every {:?}", interval);

    loop {
        match queue.drain(&uplinks, connectivity.as_ref()).await {
            Ok(report) if report.changed() => info!(
                "Drain cycle: {} delivered, {} failed, {} dropped, {} pending",
                report.delivered,
                report.failed,
                report.dropped,
                queue.len()
            ),
            Ok(_) => {}
            Err(e) => {
                error!("Retry queue update failed: {}", e);
                return Err(e);
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!("Drain loop stopped");
    Ok(())
}

#[derive(Debug, Default)]
struct Loaded {
    records: Vec<QueuedRecord>,
    /// The file must be rewritten before use (salvaged or adopted)
    rewrite: bool,
    append_at: Option<u64>,
}

async fn load_records(path: &Path) -> Result<Loaded> {
    let contents = match fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Loaded::default()),
        Err(e) => return Err(e.into()),
    };
    if contents.trim().is_empty() {
        return Ok(Loaded::default());
    }

    match serde_json::from_str::<Vec<Value>>(&contents) {
        Ok(values) => {
            let adopted = values.iter().any(|v| !is_record(v));
            Ok(Loaded {
                records: values.into_iter().map(into_record).collect(),
                rewrite: adopted,
                append_at: closing_bracket(contents.as_bytes()),
            })
        }
        Err(e) => {
            let backup = sibling(path, ".corrupt");
            warn!(
                "Queue file {} is malformed ({}), backing up to {}",
                path.display(),
                e,
                backup.display()
            );
            fs::copy(path, &backup).await?;
            let records: Vec<QueuedRecord> =
                salvage_prefix(&contents).into_iter().map(into_record).collect();
            info!("Salvaged {} records from {}", records.len(), path.display());
            Ok(Loaded {
                records,
                rewrite: true,
                append_at: None,
            })
        }
    }
}

/// Offset of the final `]` when `bytes` is a non-empty array ending in it
fn closing_bracket(bytes: &[u8]) -> Option<u64> {
    match (bytes.first(), bytes.last()) {
        (Some(b'['), Some(b']')) if bytes.len() > 2 => Some(bytes.len() as u64 - 1),
        _ => None,
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn is_record(value: &Value) -> bool {
    value.get("payload").is_some() && value.get("created_at").is_some()
}

fn into_record(value: Value) -> QueuedRecord {
    if is_record(&value) {
        if let Ok(record) = serde_json::from_value::<QueuedRecord>(value.clone()) {
            return record;
        }
    }
    QueuedRecord {
        id: 0,
        target: UploadTarget::Location,
        payload: value,
        created_at: Utc::now(),
        attempt_count: 0,
    }
}

/// Parse array elements one by one, stopping at the first broken one
fn salvage_prefix(contents: &str) -> Vec<Value> {
    let mut values = Vec::new();
    let Some(start) = contents.find('[') else {
        return values;
    };
    let mut rest = &contents[start + 1..];

    loop {
        rest = rest.trim_start();
        if rest.is_empty() || rest.starts_with(']') {
            break;
        }

        let mut stream = serde_json::Deserializer::from_str(rest).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                values.push(value);
                rest = &rest[stream.byte_offset()..];
            }
            _ => break,
        }

        rest = rest.trim_start();
        match rest.strip_prefix(',') {
            Some(after) => rest = after,
            None => break,
        }
    }

    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TelemetryError;
    use crate::uplink::{MockConnectivity, MockUplink};
    use serde_json::json;
    use std::fs as std_fs;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn ping(tag: &str) -> Value {
        json!({"date": "2026-10-14 15:35:19", "lat": "41.0", "lng": "29.0", "speed": tag})
    }

    fn image_info(file_name: &str) -> Value {
        json!({
            "file_name": file_name,
            "date": "2026-10-14 15:35:19",
            "lat": "41.0",
            "lng": "29.0",
            "id": "17",
        })
    }

    fn online() -> MockConnectivity {
        let mut connectivity = MockConnectivity::new();
        connectivity.expect_is_online().returning(|| true);
        connectivity
    }

    fn only(uplink: MockUplink) -> Uplinks {
        Uplinks::new(Arc::new(uplink))
    }

    fn failing() -> MockUplink {
        let mut uplink = MockUplink::new();
        uplink
            .expect_deliver()
            .returning(|_| Err(TelemetryError::Delivery("HTTP 500".to_string())));
        uplink
    }

    fn queue_path(dir: &TempDir) -> PathBuf {
        dir.path().join("uploads").join("queue.json")
    }

    async fn queue_in(dir: &TempDir) -> RetryQueue {
        RetryQueue::open(queue_path(dir), 8).await.unwrap()
    }

    async fn enqueue_pings(queue: &RetryQueue, tags: &[&str]) {
        for tag in tags {
            queue.enqueue(ping(tag), UploadTarget::Location).await.unwrap();
        }
    }

    fn on_disk(dir: &TempDir) -> Vec<QueuedRecord> {
        serde_json::from_str(&std_fs::read_to_string(queue_path(dir)).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_persists_record() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir).await;

        queue.enqueue(ping("1.0"), UploadTarget::Location).await.unwrap();
        assert_eq!(queue.len(), 1);

        let reopened = queue_in(&dir).await;
        let records = reopened.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload, ping("1.0"));
        assert_eq!(records[0].target, UploadTarget::Location);
        assert_eq!(records[0].attempt_count, 0);
    }

    #[tokio::test]
    async fn test_enqueue_appends_one_write_each() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir).await;
        assert_eq!(queue.disk_writes(), 0);

        enqueue_pings(&queue, &["1", "2", "3"]).await;
        assert_eq!(queue.disk_writes(), 3);

        let stored = on_disk(&dir);
        let tags: Vec<&str> = stored
            .iter()
            .map(|r| r.payload["speed"].as_str().unwrap())
            .collect();
        assert_eq!(tags, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_enqueue_appends_to_reopened_file() {
        let dir = TempDir::new().unwrap();
        enqueue_pings(&queue_in(&dir).await, &["1", "2"]).await;

        let reopened = queue_in(&dir).await;
        reopened.enqueue(image_info("a.jpg"), UploadTarget::ImageInfo).await.unwrap();

        let stored = on_disk(&dir);
        assert_eq!(stored.len(), 3);
        assert_eq!(stored[2].id, 3);
        assert_eq!(stored[2].target, UploadTarget::ImageInfo);
    }

    #[tokio::test]
    async fn test_drain_cycle_writes_file_once() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir).await;
        enqueue_pings(&queue, &["1", "2", "3", "4", "5"]).await;
        let before = queue.disk_writes();

        let report = queue.drain(&only(failing()), &online()).await.unwrap();
        assert_eq!(report.failed, 5);
        assert_eq!(queue.disk_writes(), before + 1);

        let attempts: Vec<u32> = on_disk(&dir).iter().map(|r| r.attempt_count).collect();
        assert_eq!(attempts, vec![1; 5]);
    }

    #[tokio::test]
    async fn test_idle_drain_cycles_do_not_write() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir).await;

        let mut uplink = MockUplink::new();
        uplink.expect_deliver().never();
        let uplinks = only(uplink);

        // empty
        queue.drain(&uplinks, &online()).await.unwrap();
        assert_eq!(queue.disk_writes(), 0);

        // offline
        enqueue_pings(&queue, &["1"]).await;
        let mut connectivity = MockConnectivity::new();
        connectivity.expect_is_online().returning(|| false);
        queue.drain(&uplinks, &connectivity).await.unwrap();
        assert_eq!(queue.disk_writes(), 1);
    }

    #[tokio::test]
    async fn test_successful_delivery_removes_exactly_matching_record() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir).await;
        enqueue_pings(&queue, &["P", "Q"]).await;

        let mut uplink = MockUplink::new();
        uplink.expect_deliver().returning(|payload| {
            if payload["speed"] == "P" {
                Ok(())
            } else {
                Err(TelemetryError::Delivery("HTTP 503".to_string()))
            }
        });

        let report = queue.drain(&only(uplink), &online()).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failed, 1);

        let remaining = queue.records();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].payload, ping("Q"));
        assert_eq!(remaining[0].attempt_count, 1);
        assert_eq!(on_disk(&dir), remaining);
    }

    #[tokio::test]
    async fn test_failed_delivery_increments_attempts_and_keeps_payload() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir).await;
        enqueue_pings(&queue, &["P"]).await;
        let uplinks = only(failing());

        for expected in 1..=3 {
            queue.drain(&uplinks, &online()).await.unwrap();
            let records = queue.records();
            assert_eq!(records.len(), 1);
            assert_eq!(records[0].attempt_count, expected);
            assert_eq!(records[0].payload, ping("P"));
        }

        // counts survive a restart
        assert_eq!(queue_in(&dir).await.records()[0].attempt_count, 3);
    }

    #[tokio::test]
    async fn test_drain_is_oldest_first() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir).await;
        enqueue_pings(&queue, &["1", "2", "3"]).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = order.clone();
        let mut uplink = MockUplink::new();
        uplink.expect_deliver().returning(move |payload| {
            seen.lock().unwrap().push(payload["speed"].as_str().unwrap().to_string());
            Ok(())
        });

        let report = queue.drain(&only(uplink), &online()).await.unwrap();
        assert_eq!(report.delivered, 3);
        assert!(queue.is_empty());
        assert!(on_disk(&dir).is_empty());
        assert_eq!(*order.lock().unwrap(), vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_drain_routes_each_target_to_its_uplink() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir).await;
        queue.enqueue(ping("P"), UploadTarget::Location).await.unwrap();
        queue.enqueue(image_info("a.jpg"), UploadTarget::ImageInfo).await.unwrap();
        queue.enqueue(image_info("b.jpg"), UploadTarget::ImageInfo).await.unwrap();

        let mut location = MockUplink::new();
        location
            .expect_deliver()
            .withf(|payload| payload["speed"] == "P")
            .times(1)
            .returning(|_| Ok(()));
        let mut images = MockUplink::new();
        images
            .expect_deliver()
            .withf(|payload| payload.get("file_name").is_some())
            .times(2)
            .returning(|payload| {
                if payload["file_name"] == "a.jpg" {
                    Ok(())
                } else {
                    Err(TelemetryError::Delivery("HTTP 502".to_string()))
                }
            });
        let uplinks = Uplinks::new(Arc::new(location)).with_image_info(Arc::new(images));

        let report = queue.drain(&uplinks, &online()).await.unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);

        let remaining = queue.records();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].target, UploadTarget::ImageInfo);
        assert_eq!(remaining[0].payload, image_info("b.jpg"));
    }

    #[tokio::test]
    async fn test_unrouted_target_stays_queued() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir).await;
        queue.enqueue(image_info("a.jpg"), UploadTarget::ImageInfo).await.unwrap();
        let before = queue.disk_writes();

        let mut uplink = MockUplink::new();
        uplink.expect_deliver().never();

        let report = queue.drain(&only(uplink), &online()).await.unwrap();
        assert_eq!(report.unrouted, 1);
        assert_eq!(queue.records()[0].attempt_count, 0);
        assert_eq!(queue.disk_writes(), before);
    }

    #[tokio::test]
    async fn test_offline_skips_drain_entirely() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir).await;
        enqueue_pings(&queue, &["P"]).await;

        let mut uplink = MockUplink::new();
        uplink.expect_deliver().never();
        let mut connectivity = MockConnectivity::new();
        connectivity.expect_is_online().returning(|| false);

        let report = queue.drain(&only(uplink), &connectivity).await.unwrap();
        assert!(report.offline);
        assert_eq!(queue.records()[0].attempt_count, 0);
    }

    #[tokio::test]
    async fn test_lost_connectivity_mid_cycle_stops_draining() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir).await;
        enqueue_pings(&queue, &["1", "2", "3"]).await;
        let before = queue.disk_writes();

        let mut uplink = MockUplink::new();
        uplink
            .expect_deliver()
            .times(1)
            .returning(|_| Err(TelemetryError::Delivery("timeout".to_string())));

        // first check succeeds, the one after the failure does not
        let checks = AtomicUsize::new(0);
        let mut connectivity = MockConnectivity::new();
        connectivity
            .expect_is_online()
            .returning(move || checks.fetch_add(1, Ordering::SeqCst) == 0);

        let report = queue.drain(&only(uplink), &connectivity).await.unwrap();
        assert!(report.interrupted);
        assert_eq!(report.failed, 1);
        assert_eq!(queue.len(), 3);

        let attempts: Vec<u32> = queue.records().iter().map(|r| r.attempt_count).collect();
        assert_eq!(attempts, vec![1, 0, 0]);
        // the interrupted cycle still compacts once
        assert_eq!(queue.disk_writes(), before + 1);
        assert_eq!(on_disk(&dir)[0].attempt_count, 1);
    }

    #[tokio::test]
    async fn test_undersized_records_are_dropped() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir).await;
        queue.enqueue(json!({}), UploadTarget::Location).await.unwrap();
        enqueue_pings(&queue, &["P"]).await;

        let mut uplink = MockUplink::new();
        uplink.expect_deliver().times(1).returning(|_| Ok(()));

        let report = queue.drain(&only(uplink), &online()).await.unwrap();
        assert_eq!(report.dropped, 1);
        assert_eq!(report.delivered, 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_records_keep_file_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        // created_at runs backwards relative to file position
        std_fs::write(
            &path,
            r#"[
                {"payload": {"tag": "first"}, "created_at": "2026-10-14T10:00:00Z"},
                {"payload": {"tag": "second"}, "created_at": "2026-10-14T09:00:00Z"}
            ]"#,
        )
        .unwrap();

        let queue = RetryQueue::open(&path, 8).await.unwrap();
        let tags: Vec<Value> = queue
            .records()
            .iter()
            .map(|r| r.payload["tag"].clone())
            .collect();
        assert_eq!(tags, vec![json!("first"), json!("second")]);
    }

    #[tokio::test]
    async fn test_record_without_target_loads_as_location() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        std_fs::write(
            &path,
            r#"[{"id": 1, "payload": {"lat": "41.0"},
                "created_at": "2026-10-14T10:00:00Z", "attempt_count": 2}]"#,
        )
        .unwrap();

        let queue = RetryQueue::open(&path, 8).await.unwrap();
        let records = queue.records();
        assert_eq!(records[0].target, UploadTarget::Location);
        assert_eq!(records[0].attempt_count, 2);
        // well-formed file, nothing to rewrite
        assert_eq!(queue.disk_writes(), 0);
    }

    #[tokio::test]
    async fn test_truncated_file_keeps_parseable_prefix() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        let good = serde_json::to_string(&QueuedRecord {
            id: 1,
            target: UploadTarget::Location,
            payload: ping("1"),
            created_at: Utc::now(),
            attempt_count: 4,
        })
        .unwrap();
        std_fs::write(&path, format!("[{}, {}, {{\"payload\": {{\"da", good, good)).unwrap();

        let queue = RetryQueue::open(&path, 8).await.unwrap();
        let records = queue.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].attempt_count, 4);

        // backed up once, rewritten as valid JSON
        assert!(dir.path().join("queue.json.corrupt").exists());
        let rewritten: Vec<QueuedRecord> =
            serde_json::from_str(&std_fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(rewritten.len(), 2);

        // appends continue from the rewritten array
        queue.enqueue(ping("2"), UploadTarget::Location).await.unwrap();
        let appended: Vec<QueuedRecord> =
            serde_json::from_str(&std_fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(appended.len(), 3);
    }

    #[tokio::test]
    async fn test_garbage_file_salvages_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        std_fs::write(&path, "not json at all").unwrap();

        let queue = RetryQueue::open(&path, 8).await.unwrap();
        assert!(queue.is_empty());
        assert!(dir.path().join("queue.json.corrupt").exists());
    }

    #[tokio::test]
    async fn test_bare_payload_array_is_adopted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("failed_locations.json");
        std_fs::write(&path, serde_json::to_string(&vec![ping("1"), ping("2")]).unwrap()).unwrap();

        let queue = RetryQueue::open(&path, 8).await.unwrap();
        let records = queue.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].payload, ping("1"));
        assert_eq!(records[1].payload, ping("2"));
        assert!(records.iter().all(|r| r.target == UploadTarget::Location));
        assert!(!dir.path().join("failed_locations.json.corrupt").exists());
    }

    #[tokio::test]
    async fn test_trailing_newline_falls_back_to_rewrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        std_fs::write(&path, format!("{}\n", serde_json::to_string(&vec![ping("1")]).unwrap()))
            .unwrap();

        let queue = RetryQueue::open(&path, 8).await.unwrap();
        queue.enqueue(ping("2"), UploadTarget::Location).await.unwrap();

        let stored: Vec<QueuedRecord> =
            serde_json::from_str(&std_fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(stored.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_file_is_empty_queue() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        std_fs::write(&path, "").unwrap();

        assert!(RetryQueue::open(&path, 8).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge() {
        let dir = TempDir::new().unwrap();
        let queue = queue_in(&dir).await;
        enqueue_pings(&queue, &["1", "2"]).await;

        assert_eq!(queue.purge().await.unwrap(), 2);
        assert!(queue_in(&dir).await.is_empty());

        // an emptied file is rewritten, not appended to
        enqueue_pings(&queue, &["3"]).await;
        assert_eq!(on_disk(&dir).len(), 1);
    }

    #[test]
    fn test_salvage_prefix() {
        assert_eq!(salvage_prefix("[]").len(), 0);
        assert_eq!(salvage_prefix("[1, 2, 3]").len(), 3);
        assert_eq!(salvage_prefix(r#"[{"a":1}, {"b":2}, {"c""#).len(), 2);
        assert_eq!(salvage_prefix(r#"[{"a":1} {"b":2}]"#).len(), 1);
        assert_eq!(salvage_prefix("garbage").len(), 0);
    }

    #[test]
    fn test_closing_bracket() {
        assert_eq!(closing_bracket(b"[]"), None);
        assert_eq!(closing_bracket(b"[1]"), Some(2));
        assert_eq!(closing_bracket(b"[1]\n"), None);
        assert_eq!(closing_bracket(b""), None);
    }

    #[tokio::test]
    async fn test_drain_loop_delivers_and_stops() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(queue_in(&dir).await);
        enqueue_pings(&queue, &["P"]).await;

        let mut uplink = MockUplink::new();
        uplink.expect_deliver().returning(|_| Ok(()));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run_drain_loop(
            queue.clone(),
            only(uplink),
            Arc::new(online()),
            Duration::from_secs(10),
            cancel.clone(),
        ));

        for _ in 0..100 {
            if queue.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(queue.is_empty());

        cancel.cancel();
        tokio_test::assert_ok!(handle.await.unwrap());
    }
}
