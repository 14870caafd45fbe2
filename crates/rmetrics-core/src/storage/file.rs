//! Memory backend with a JSON snapshot on disk.
//!
//! Lock order is always map, then file. Snapshots are taken while the map
//! lock is held, so a written snapshot always reflects a state the store
//! actually passed through.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{error, info, warn};

use crate::error::StorageError;
use crate::model::{MetricRecord, MetricSet};

use super::memory::{
    MemoryStorage, MetricMap, apply_batch_locked, apply_counter_locked, apply_gauge_locked,
    get_locked,
};
use super::{BatchOutcome, MetricStorage, SnapshotFile};

#[derive(Debug)]
pub struct FileStorage {
    memory: MemoryStorage,
    snapshots: Mutex<SnapshotFile>,
    /// Rewrite the snapshot after every successful update.
    sync_writes: bool,
}

impl FileStorage {
    /// Opens the snapshot file and, if `restore` is set, loads its content.
    ///
    /// An empty file restores to an empty store. Content that cannot be
    /// decoded is an error: the server must not silently start from scratch.
    pub fn open(path: &Path, restore: bool, sync_writes: bool) -> Result<Self, StorageError> {
        let mut snapshots = SnapshotFile::open(path)?;

        let memory = if restore {
            match snapshots.load()? {
                Some(set) => {
                    info!(
                        path = %path.display(),
                        gauges = set.gauges.len(),
                        counters = set.counters.len(),
                        "metrics restored from snapshot"
                    );
                    MemoryStorage::from_set(set)?
                }
                None => {
                    info!(path = %path.display(), "snapshot empty, starting with no metrics");
                    MemoryStorage::new()
                }
            }
        } else {
            MemoryStorage::new()
        };

        Ok(Self {
            memory,
            snapshots: Mutex::new(snapshots),
            sync_writes,
        })
    }

    fn snapshots(&self) -> MutexGuard<'_, SnapshotFile> {
        self.snapshots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_locked(&self, map: &MetricMap) -> Result<(), StorageError> {
        self.snapshots().write(&MetricSet::from_map(map))
    }

    /// Runs `f` under the map lock, then writes a snapshot if sync writes are
    /// enabled and `changed` says the update touched the map.
    ///
    /// The update is already applied when the write runs, so a failed write
    /// is logged rather than returned. The next successful write (or close)
    /// carries the full state.
    fn update<T>(
        &self,
        f: impl FnOnce(&mut MetricMap) -> T,
        changed: impl FnOnce(&T) -> bool,
    ) -> T {
        let mut map = self.memory.lock();
        let out = f(&mut map);
        if self.sync_writes
            && changed(&out)
            && let Err(e) = self.write_locked(&map)
        {
            error!(error = %e, "snapshot write after update failed");
        }
        out
    }
}

impl MetricStorage for FileStorage {
    fn apply_gauge(&self, name: &str, value: f64) -> Result<MetricRecord, StorageError> {
        self.update(|map| apply_gauge_locked(map, name, value), Result::is_ok)
    }

    fn apply_counter(&self, name: &str, delta: i64) -> Result<MetricRecord, StorageError> {
        self.update(|map| apply_counter_locked(map, name, delta), Result::is_ok)
    }

    fn apply_batch(&self, records: &[MetricRecord]) -> Result<BatchOutcome, StorageError> {
        Ok(self.update(
            |map| apply_batch_locked(map, records),
            |outcome| !outcome.applied.is_empty(),
        ))
    }

    fn get(&self, name: &str) -> Result<MetricRecord, StorageError> {
        get_locked(&self.memory.lock(), name)
    }

    fn snapshot(&self) -> Result<MetricSet, StorageError> {
        self.memory.snapshot()
    }

    fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn flush(&self) -> Result<(), StorageError> {
        let map = self.memory.lock();
        self.write_locked(&map)
    }

    fn close(&self) -> Result<(), StorageError> {
        let map = self.memory.lock();
        let result = self.write_locked(&map);
        match &result {
            Ok(()) => info!(
                path = %self.snapshots().path().display(),
                metrics = map.len(),
                "final snapshot written"
            ),
            Err(e) => warn!(error = %e, "final snapshot failed"),
        }
        result
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MetricValue;
    use tempfile::tempdir;

    #[test]
    fn restart_restores_all_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");

        let storage = FileStorage::open(&path, true, false).unwrap();
        storage.apply_gauge("Alloc", 1234.5).unwrap();
        storage.apply_counter("PollCount", 5).unwrap();
        storage.apply_counter("Zero", 0).unwrap();
        storage.close().unwrap();
        drop(storage);

        let restored = FileStorage::open(&path, true, false).unwrap();
        assert_eq!(restored.get("Alloc").unwrap().value, MetricValue::Gauge(1234.5));
        assert_eq!(restored.get("PollCount").unwrap().value, MetricValue::Counter(5));
        assert_eq!(restored.get("Zero").unwrap().value, MetricValue::Counter(0));

        // Counters keep accumulating on top of the restored total.
        restored.apply_counter("PollCount", 3).unwrap();
        assert_eq!(restored.get("PollCount").unwrap().value, MetricValue::Counter(8));
    }

    #[test]
    fn restore_disabled_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");

        let storage = FileStorage::open(&path, true, false).unwrap();
        storage.apply_gauge("g", 1.0).unwrap();
        storage.flush().unwrap();
        drop(storage);

        let fresh = FileStorage::open(&path, false, false).unwrap();
        assert!(fresh.snapshot().unwrap().is_empty());
    }

    #[test]
    fn sync_writes_persist_each_update() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");

        let storage = FileStorage::open(&path, true, true).unwrap();
        storage.apply_counter("c", 2).unwrap();
        storage.apply_counter("c", 3).unwrap();

        let mut file = SnapshotFile::open(&path).unwrap();
        let on_disk = file.load().unwrap().unwrap();
        assert_eq!(on_disk.counters.get("c"), Some(&5));
    }

    #[test]
    fn interval_mode_writes_only_on_flush() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");

        let storage = FileStorage::open(&path, true, false).unwrap();
        storage.apply_gauge("g", 2.5).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");

        storage.flush().unwrap();
        let mut file = SnapshotFile::open(&path).unwrap();
        assert_eq!(file.load().unwrap().unwrap().gauges.get("g"), Some(&2.5));
    }

    #[test]
    fn rejected_update_does_not_touch_snapshot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");

        let storage = FileStorage::open(&path, true, true).unwrap();
        storage.apply_gauge("m", 1.0).unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        assert!(storage.apply_counter("m", 1).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    #[test]
    fn corrupt_snapshot_fails_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        std::fs::write(&path, "[1, 2, 3").unwrap();

        assert!(FileStorage::open(&path, true, false).is_err());
        // Without restore the content is never read.
        assert!(FileStorage::open(&path, false, false).is_ok());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn failed_sync_write_keeps_applied_update() {
        // Every write to /dev/full fails with ENOSPC.
        let storage = FileStorage::open(Path::new("/dev/full"), false, true).unwrap();

        let total = storage.apply_counter("c", 2).unwrap();
        assert_eq!(total.value, MetricValue::Counter(2));
        let outcome = storage.apply_batch(&[MetricRecord::counter("c", 3)]).unwrap();
        assert_eq!(outcome.applied.len(), 1);
        assert_eq!(storage.get("c").unwrap().value, MetricValue::Counter(5));

        // An explicit flush still reports the failure.
        assert!(storage.flush().is_err());
    }

    #[test]
    fn batch_with_only_rejects_skips_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");

        let storage = FileStorage::open(&path, true, true).unwrap();
        storage.apply_gauge("g", 1.0).unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        let outcome = storage.apply_batch(&[MetricRecord::counter("g", 1)]).unwrap();
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }
}
