//! Snapshot file: the durable copy of an in-memory store.
//!
//! The file always holds one JSON object describing the whole store at some
//! past instant. Every write replaces the previous content (truncate, seek to
//! the start, one write), it never appends.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::StorageError;
use crate::fmt::format_bytes;
use crate::model::MetricSet;

/// Exclusive owner of the snapshot file handle.
#[derive(Debug)]
pub struct SnapshotFile {
    path: PathBuf,
    file: File,
}

impl SnapshotFile {
    /// Opens (creating if needed) the snapshot file.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the stored snapshot.
    ///
    /// An empty (or whitespace-only) file yields `None`: there is nothing to
    /// restore yet.
    pub fn load(&mut self) -> Result<Option<MetricSet>, StorageError> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut data = Vec::new();
        self.file.read_to_end(&mut data)?;
        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let set: MetricSet = serde_json::from_slice(&data)?;
        Ok(Some(set))
    }

    /// Replaces the file content with `set`.
    pub fn write(&mut self, set: &MetricSet) -> Result<(), StorageError> {
        let mut encoded = serde_json::to_vec(set)?;
        encoded.push(b'\n');

        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&encoded)?;
        self.file.flush()?;
        self.file.sync_data()?;

        debug!(
            path = %self.path.display(),
            metrics = set.len(),
            size = %format_bytes(encoded.len() as u64),
            "snapshot written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_set() -> MetricSet {
        let mut set = MetricSet::default();
        set.gauges.insert("Alloc".into(), 1234.5);
        set.gauges.insert("Neg".into(), -0.125);
        set.gauges.insert("Tiny".into(), 1e-300);
        set.counters.insert("PollCount".into(), 5);
        set.counters.insert("Zero".into(), 0);
        set.counters.insert("Below".into(), -42);
        set
    }

    #[test]
    fn new_file_loads_as_empty() {
        let dir = tempdir().unwrap();
        let mut file = SnapshotFile::open(dir.path().join("nested/metrics.json")).unwrap();
        assert!(file.load().unwrap().is_none());
    }

    #[test]
    fn write_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let set = sample_set();

        let mut file = SnapshotFile::open(&path).unwrap();
        file.write(&set).unwrap();
        drop(file);

        let mut reopened = SnapshotFile::open(&path).unwrap();
        assert_eq!(reopened.load().unwrap(), Some(set));
    }

    #[test]
    fn rewrite_replaces_previous_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        let mut file = SnapshotFile::open(&path).unwrap();

        let mut big = MetricSet::default();
        for i in 0..100 {
            big.gauges.insert(format!("gauge_{i}"), i as f64);
        }
        file.write(&big).unwrap();

        let mut small = MetricSet::default();
        small.counters.insert("only".into(), 1);
        file.write(&small).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert_eq!(raw, "{\"gauges\":{},\"counters\":{\"only\":1}}\n");
        assert_eq!(file.load().unwrap(), Some(small));
    }

    #[test]
    fn garbage_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        std::fs::write(&path, "{not json").unwrap();

        let mut file = SnapshotFile::open(&path).unwrap();
        assert!(matches!(file.load(), Err(StorageError::Snapshot(_))));
    }

    #[test]
    fn whitespace_only_file_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        std::fs::write(&path, "\n  \n").unwrap();

        let mut file = SnapshotFile::open(&path).unwrap();
        assert!(file.load().unwrap().is_none());
    }
}
