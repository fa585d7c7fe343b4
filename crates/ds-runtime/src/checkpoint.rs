use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use orion_error::prelude::*;
use tokio::io::AsyncWriteExt;

use ds_core::{CheckpointRecord, CoreReason, SharedGraph, Time};

use crate::error::{RuntimeError, RuntimeReason, RuntimeResult};

const FILE_PREFIX: &str = "checkpoint-";
const FILE_SUFFIX: &str = ".json";

// ---------------------------------------------------------------------------
// CheckpointStore
// ---------------------------------------------------------------------------

/// Durable home for checkpoint records.
///
/// A reader must only ever see complete records: `write` publishes a record
/// atomically or not at all.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Human-readable location, used in logs.
    fn location(&self) -> String;

    async fn write(&self, record: &CheckpointRecord) -> RuntimeResult<()>;

    /// The newest record, `None` when the store is empty. A newest record
    /// that cannot be parsed is a `Recovery` error.
    async fn read_latest(&self) -> RuntimeResult<Option<CheckpointRecord>>;

    /// Times of all stored records, oldest first.
    async fn list(&self) -> RuntimeResult<Vec<Time>>;
}

fn recovery_error(detail: String) -> RuntimeError {
    StructError::from(RuntimeReason::Core(CoreReason::Recovery)).with_detail(detail)
}

fn io_error(action: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> RuntimeError {
    let path = path.display().to_string();
    move |e| StructError::from(RuntimeReason::Checkpoint).with_detail(format!("failed to {action} {path}: {e}"))
}

// ---------------------------------------------------------------------------
// MemoryCheckpointStore
// ---------------------------------------------------------------------------

/// In-process store holding serialized records; shares nothing with disk.
pub struct MemoryCheckpointStore {
    records: Mutex<BTreeMap<Time, Vec<u8>>>,
    retain: usize,
}

impl MemoryCheckpointStore {
    pub fn new(retain: usize) -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            retain: retain.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<Time, Vec<u8>>> {
        self.records.lock().expect("checkpoint store lock poisoned")
    }
}

impl Default for MemoryCheckpointStore {
    fn default() -> Self {
        Self::new(3)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    fn location(&self) -> String {
        "memory".to_string()
    }

    async fn write(&self, record: &CheckpointRecord) -> RuntimeResult<()> {
        let bytes = record.to_json().err_conv()?;
        let mut records = self.lock();
        records.insert(record.time, bytes);
        while records.len() > self.retain {
            records.pop_first();
        }
        Ok(())
    }

    async fn read_latest(&self) -> RuntimeResult<Option<CheckpointRecord>> {
        let records = self.lock();
        match records.last_key_value() {
            Some((_, bytes)) => Ok(Some(CheckpointRecord::from_json(bytes).err_conv()?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> RuntimeResult<Vec<Time>> {
        Ok(self.lock().keys().copied().collect())
    }
}

// ---------------------------------------------------------------------------
// FileCheckpointStore
// ---------------------------------------------------------------------------

/// One JSON file per checkpoint, `checkpoint-<millis>.json`.
///
/// Records are written to a hidden temp file, synced, then renamed into
/// place. Only the newest `retain` files are kept.
pub struct FileCheckpointStore {
    dir: PathBuf,
    retain: usize,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, retain: usize) -> Self {
        Self {
            dir: dir.into(),
            retain: retain.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, time: Time) -> PathBuf {
        self.dir
            .join(format!("{FILE_PREFIX}{}{FILE_SUFFIX}", time.millis()))
    }

    async fn prune(&self) -> RuntimeResult<()> {
        let times = self.list().await?;
        if times.len() <= self.retain {
            return Ok(());
        }
        for time in &times[..times.len() - self.retain] {
            let path = self.path_for(*time);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                ds_warn!(ckpt, path = %path.display(), error = %e, "failed to remove old checkpoint");
            }
        }
        Ok(())
    }
}

fn parse_file_name(name: &str) -> Option<Time> {
    name.strip_prefix(FILE_PREFIX)?
        .strip_suffix(FILE_SUFFIX)?
        .parse::<u64>()
        .ok()
        .map(Time::from_millis)
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    fn location(&self) -> String {
        self.dir.display().to_string()
    }

    async fn write(&self, record: &CheckpointRecord) -> RuntimeResult<()> {
        let bytes = record.to_json().err_conv()?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(io_error("create", &self.dir))?;

        let target = self.path_for(record.time);
        let tmp = self
            .dir
            .join(format!(".{FILE_PREFIX}{}{FILE_SUFFIX}.tmp", record.time.millis()));
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(io_error("create", &tmp))?;
        file.write_all(&bytes).await.map_err(io_error("write", &tmp))?;
        file.sync_all().await.map_err(io_error("sync", &tmp))?;
        drop(file);
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(io_error("publish", &target))?;

        ds_debug!(ckpt, batch_time = record.time.millis(), path = %target.display(), "checkpoint written");
        self.prune().await
    }

    async fn read_latest(&self) -> RuntimeResult<Option<CheckpointRecord>> {
        let Some(time) = self.list().await?.last().copied() else {
            return Ok(None);
        };
        let path = self.path_for(time);
        let bytes = tokio::fs::read(&path).await.map_err(io_error("read", &path))?;
        let record = CheckpointRecord::from_json(&bytes)
            .map_err(|e| recovery_error(format!("{}: {e}", path.display())))?;
        if record.time != time {
            return Err(recovery_error(format!(
                "{} holds a record for {}",
                path.display(),
                record.time
            )));
        }
        Ok(Some(record))
    }

    async fn list(&self) -> RuntimeResult<Vec<Time>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("list", &self.dir)(e)),
        };
        let mut times = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io_error("list", &self.dir))?
        {
            if let Some(time) = entry.file_name().to_str().and_then(parse_file_name) {
                times.push(time);
            }
        }
        times.sort();
        Ok(times)
    }
}

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Decides when to checkpoint and writes graph snapshots to a store.
pub(crate) struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    interval: Duration,
    last: Option<Time>,
}

impl CheckpointManager {
    pub(crate) fn new(store: Arc<dyn CheckpointStore>, interval: Duration) -> Self {
        Self {
            store,
            interval,
            last: None,
        }
    }

    pub(crate) fn is_due(&self, time: Time) -> bool {
        time.is_boundary(self.interval)
    }

    /// Time of the newest checkpoint this manager wrote.
    pub(crate) fn last(&self) -> Option<Time> {
        self.last
    }

    /// Snapshot the graph as of `time` and persist it. Returns the write time.
    pub(crate) async fn checkpoint(
        &mut self,
        graph: &SharedGraph,
        time: Time,
    ) -> RuntimeResult<Duration> {
        let started = Instant::now();
        let record = graph
            .lock()
            .expect("stream graph lock poisoned")
            .snapshot(time);
        self.store.write(&record).await?;
        self.last = Some(time);
        Ok(started.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ds_core::checkpoint::CHECKPOINT_VERSION;

    fn record(ms: u64) -> CheckpointRecord {
        CheckpointRecord {
            version: CHECKPOINT_VERSION,
            time: Time::from_millis(ms),
            batch_duration_ms: 500,
            fingerprint: "0:input(queue)".into(),
            nodes: Vec::new(),
            sources: vec![serde_json::json!({ "consumed": ms / 500 })],
        }
    }

    #[test]
    fn parses_only_checkpoint_file_names() {
        assert_eq!(parse_file_name("checkpoint-1500.json"), Some(Time::from_millis(1500)));
        assert_eq!(parse_file_name(".checkpoint-1500.json.tmp"), None);
        assert_eq!(parse_file_name("checkpoint-x.json"), None);
        assert_eq!(parse_file_name("notes.txt"), None);
    }

    #[tokio::test]
    async fn memory_store_keeps_newest() {
        let store = MemoryCheckpointStore::new(2);
        assert!(store.read_latest().await.unwrap().is_none());
        for ms in [500, 1000, 1500] {
            store.write(&record(ms)).await.unwrap();
        }
        assert_eq!(
            store.list().await.unwrap(),
            vec![Time::from_millis(1000), Time::from_millis(1500)]
        );
        assert_eq!(store.read_latest().await.unwrap(), Some(record(1500)));
    }

    #[tokio::test]
    async fn file_store_writes_atomically_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("ckpt"), 2);
        assert!(store.read_latest().await.unwrap().is_none());
        for ms in [500, 1000, 1500] {
            store.write(&record(ms)).await.unwrap();
        }
        let mut names: Vec<String> = std::fs::read_dir(store.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["checkpoint-1000.json", "checkpoint-1500.json"]);
        assert_eq!(store.read_latest().await.unwrap(), Some(record(1500)));
    }

    #[tokio::test]
    async fn file_store_refuses_corrupt_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), 3);
        store.write(&record(500)).await.unwrap();
        std::fs::write(dir.path().join("checkpoint-1000.json"), b"{\"version\": 1,").unwrap();
        assert!(store.read_latest().await.is_err());
    }
}
