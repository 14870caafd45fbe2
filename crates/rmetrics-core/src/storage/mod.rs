//! Metric storage backends.
//!
//! All backends implement [`MetricStorage`] and are interchangeable; the
//! server picks one at startup through [`open`] and never inspects which one
//! it got.
//!
//! ```text
//!                 ┌──────────────────────┐
//!                 │ dyn MetricStorage    │
//!                 └──────────┬───────────┘
//!        ┌───────────────────┼────────────────────┐
//! ┌──────▼───────┐   ┌───────▼────────┐   ┌───────▼─────────┐
//! │ MemoryStorage│◄──┤  FileStorage   │   │ PostgresStorage │
//! │ Mutex<Map>   │   │ + SnapshotFile │   │ metrics table   │
//! └──────────────┘   └────────────────┘   └─────────────────┘
//! ```

pub mod file;
pub mod memory;
pub mod postgres;
pub mod snapshot;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::StorageError;
use crate::model::{MetricRecord, MetricSet, MetricValue};

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use postgres::PostgresStorage;
pub use snapshot::SnapshotFile;

/// A record of a batch that was not applied.
#[derive(Debug)]
pub struct Rejected {
    /// Position of the record in the submitted batch.
    pub index: usize,
    pub name: String,
    pub reason: StorageError,
}

/// Per-record result of [`MetricStorage::apply_batch`].
#[derive(Debug, Default)]
pub struct BatchOutcome {
    /// Post-update state of every applied record, in submission order.
    /// Counter entries carry the accumulated total, not the delta.
    pub applied: Vec<MetricRecord>,
    pub rejected: Vec<Rejected>,
}

/// Storage contract shared by all backends.
///
/// Implementations are blocking; async callers run them on
/// `tokio::task::spawn_blocking`.
pub trait MetricStorage: Send + Sync {
    /// Overwrites the gauge `name`. Fails only if `name` is a counter.
    fn apply_gauge(&self, name: &str, value: f64) -> Result<MetricRecord, StorageError>;

    /// Adds `delta` to the counter `name` (missing counters start at 0)
    /// and returns the new total.
    fn apply_counter(&self, name: &str, delta: i64) -> Result<MetricRecord, StorageError>;

    /// Applies every record independently.
    ///
    /// Record-level problems end up in [`BatchOutcome::rejected`]; an `Err`
    /// means the backend itself failed.
    fn apply_batch(&self, records: &[MetricRecord]) -> Result<BatchOutcome, StorageError>;

    /// Returns the stored record or [`StorageError::NotFound`].
    fn get(&self, name: &str) -> Result<MetricRecord, StorageError>;

    /// Returns a copy of every stored record.
    fn snapshot(&self) -> Result<MetricSet, StorageError>;

    /// Checks that the backend is usable.
    fn ping(&self) -> Result<(), StorageError>;

    /// Persists the current state, if the backend persists snapshots.
    fn flush(&self) -> Result<(), StorageError> {
        Ok(())
    }

    /// Final flush before shutdown.
    fn close(&self) -> Result<(), StorageError> {
        self.flush()
    }

    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Applies a single record according to its kind.
    fn apply(&self, record: &MetricRecord) -> Result<MetricRecord, StorageError> {
        match record.value {
            MetricValue::Gauge(v) => self.apply_gauge(&record.name, v),
            MetricValue::Counter(d) => self.apply_counter(&record.name, d),
        }
    }
}

/// Backend selection, resolved once at startup.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    Memory,
    File {
        path: PathBuf,
        /// Load the previous snapshot before serving.
        restore: bool,
        /// Rewrite the snapshot after every update.
        sync_writes: bool,
    },
    Postgres {
        dsn: String,
        connect_attempts: u32,
        retry_delay: Duration,
    },
}

impl StorageConfig {
    /// Default number of connection attempts at startup.
    pub const CONNECT_ATTEMPTS: u32 = 3;
    /// Fixed delay between connection attempts.
    pub const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

    /// Chooses a backend: a snapshot file if a path is given, otherwise
    /// PostgreSQL if a DSN is given, otherwise memory.
    pub fn select(
        file_path: Option<PathBuf>,
        restore: bool,
        store_interval: Duration,
        dsn: Option<String>,
    ) -> Self {
        if let Some(path) = file_path.filter(|p| !p.as_os_str().is_empty()) {
            StorageConfig::File {
                path,
                restore,
                sync_writes: store_interval.is_zero(),
            }
        } else if let Some(dsn) = dsn.filter(|d| !d.is_empty()) {
            StorageConfig::Postgres {
                dsn,
                connect_attempts: Self::CONNECT_ATTEMPTS,
                retry_delay: Self::CONNECT_RETRY_DELAY,
            }
        } else {
            StorageConfig::Memory
        }
    }
}

/// Opens the configured backend.
///
/// Errors are fatal for the caller: the server must not start without a
/// working store.
pub fn open(config: &StorageConfig) -> Result<Arc<dyn MetricStorage>, StorageError> {
    let storage: Arc<dyn MetricStorage> = match config {
        StorageConfig::Memory => Arc::new(MemoryStorage::new()),
        StorageConfig::File {
            path,
            restore,
            sync_writes,
        } => Arc::new(FileStorage::open(path, *restore, *sync_writes)?),
        StorageConfig::Postgres {
            dsn,
            connect_attempts,
            retry_delay,
        } => Arc::new(PostgresStorage::connect(
            dsn,
            *connect_attempts,
            *retry_delay,
        )?),
    };
    info!(backend = storage.name(), "storage opened");
    Ok(storage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn select_prefers_file_then_database() {
        let cfg = StorageConfig::select(
            Some("metrics.json".into()),
            true,
            Duration::from_secs(300),
            Some("postgres://localhost/db".into()),
        );
        assert!(matches!(
            cfg,
            StorageConfig::File {
                restore: true,
                sync_writes: false,
                ..
            }
        ));

        let cfg = StorageConfig::select(
            None,
            true,
            Duration::ZERO,
            Some("postgres://localhost/db".into()),
        );
        assert!(matches!(cfg, StorageConfig::Postgres { connect_attempts: 3, .. }));

        let cfg = StorageConfig::select(Some(PathBuf::new()), false, Duration::ZERO, Some(String::new()));
        assert!(matches!(cfg, StorageConfig::Memory));
    }

    #[test]
    fn zero_store_interval_means_sync_writes() {
        let cfg = StorageConfig::select(Some("m.json".into()), false, Duration::ZERO, None);
        assert!(matches!(cfg, StorageConfig::File { sync_writes: true, .. }));
    }

    #[test]
    fn open_builds_selected_backend() {
        let dir = tempdir().unwrap();
        let file = open(&StorageConfig::File {
            path: dir.path().join("metrics.json"),
            restore: true,
            sync_writes: false,
        })
        .unwrap();
        assert_eq!(file.name(), "file");

        let memory = open(&StorageConfig::Memory).unwrap();
        assert_eq!(memory.name(), "memory");
        assert!(memory.ping().is_ok());
    }

    #[test]
    fn apply_dispatches_on_kind() {
        let storage = MemoryStorage::new();
        storage.apply(&MetricRecord::counter("c", 2)).unwrap();
        let total = storage.apply(&MetricRecord::counter("c", 3)).unwrap();
        assert_eq!(total, MetricRecord::counter("c", 5));

        let g = storage.apply(&MetricRecord::gauge("g", 1.5)).unwrap();
        assert_eq!(g, MetricRecord::gauge("g", 1.5));
    }
}
