//! In-memory backend: one mutex-guarded map, lost on exit.
//!
//! The `*_locked` helpers operate on an already locked map so that the file
//! backend can apply updates and write snapshots under the same lock.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::StorageError;
use crate::model::{MetricKind, MetricRecord, MetricSet, MetricValue};

use super::{BatchOutcome, MetricStorage, Rejected};

pub(crate) type MetricMap = HashMap<String, MetricValue>;

#[derive(Debug, Default)]
pub struct MemoryStorage {
    metrics: Mutex<MetricMap>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-filled from a snapshot.
    pub fn from_set(set: MetricSet) -> Result<Self, StorageError> {
        Ok(Self {
            metrics: Mutex::new(set.into_map()?),
        })
    }

    /// Locks the map. A panic in another holder cannot leave the map half
    /// updated (every mutation is a single insert), so poisoning is ignored.
    pub(crate) fn lock(&self) -> MutexGuard<'_, MetricMap> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn apply_gauge_locked(
    map: &mut MetricMap,
    name: &str,
    value: f64,
) -> Result<MetricRecord, StorageError> {
    match map.get_mut(name) {
        Some(MetricValue::Gauge(stored)) => *stored = value,
        Some(other) => return Err(mismatch(name, other.kind(), MetricKind::Gauge)),
        None => {
            map.insert(name.to_string(), MetricValue::Gauge(value));
        }
    }
    Ok(MetricRecord::gauge(name, value))
}

pub(crate) fn apply_counter_locked(
    map: &mut MetricMap,
    name: &str,
    delta: i64,
) -> Result<MetricRecord, StorageError> {
    let total = match map.entry(name.to_string()) {
        Entry::Occupied(mut entry) => match entry.get_mut() {
            MetricValue::Counter(stored) => {
                *stored = stored
                    .checked_add(delta)
                    .ok_or_else(|| StorageError::CounterOverflow(name.to_string()))?;
                *stored
            }
            other => return Err(mismatch(name, other.kind(), MetricKind::Counter)),
        },
        Entry::Vacant(entry) => {
            entry.insert(MetricValue::Counter(delta));
            delta
        }
    };
    Ok(MetricRecord::counter(name, total))
}

pub(crate) fn apply_batch_locked(map: &mut MetricMap, records: &[MetricRecord]) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    for (index, record) in records.iter().enumerate() {
        let result = match record.value {
            MetricValue::Gauge(v) => apply_gauge_locked(map, &record.name, v),
            MetricValue::Counter(d) => apply_counter_locked(map, &record.name, d),
        };
        match result {
            Ok(applied) => outcome.applied.push(applied),
            Err(reason) => outcome.rejected.push(Rejected {
                index,
                name: record.name.clone(),
                reason,
            }),
        }
    }
    outcome
}

pub(crate) fn get_locked(map: &MetricMap, name: &str) -> Result<MetricRecord, StorageError> {
    map.get(name)
        .map(|value| MetricRecord {
            name: name.to_string(),
            value: *value,
        })
        .ok_or_else(|| StorageError::NotFound(name.to_string()))
}

fn mismatch(name: &str, stored: MetricKind, requested: MetricKind) -> StorageError {
    StorageError::KindMismatch {
        name: name.to_string(),
        stored,
        requested,
    }
}

impl MetricStorage for MemoryStorage {
    fn apply_gauge(&self, name: &str, value: f64) -> Result<MetricRecord, StorageError> {
        apply_gauge_locked(&mut self.lock(), name, value)
    }

    fn apply_counter(&self, name: &str, delta: i64) -> Result<MetricRecord, StorageError> {
        apply_counter_locked(&mut self.lock(), name, delta)
    }

    fn apply_batch(&self, records: &[MetricRecord]) -> Result<BatchOutcome, StorageError> {
        Ok(apply_batch_locked(&mut self.lock(), records))
    }

    fn get(&self, name: &str) -> Result<MetricRecord, StorageError> {
        get_locked(&self.lock(), name)
    }

    fn snapshot(&self) -> Result<MetricSet, StorageError> {
        Ok(MetricSet::from_map(&self.lock()))
    }

    fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
