//! Update service: validation and storage calls behind the HTTP handlers.
//!
//! Handlers speak [`MetricPayload`]s and path segments; the service turns them
//! into typed records and talks to whatever [`MetricStorage`] it was given.

use std::sync::Arc;

use tracing::debug;

use crate::error::{StorageError, ValidationError};
use crate::fmt::render_report;
use crate::model::{MetricKind, MetricPayload, MetricRecord, MetricSet};
use crate::storage::MetricStorage;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Clone)]
pub struct MetricService {
    storage: Arc<dyn MetricStorage>,
}

impl MetricService {
    pub fn new(storage: Arc<dyn MetricStorage>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<dyn MetricStorage> {
        &self.storage
    }

    /// Validates and applies one JSON update, returning the stored state.
    pub fn update(&self, payload: MetricPayload) -> Result<MetricPayload, ServiceError> {
        let record = payload.into_record()?;
        self.update_record(&record)
    }

    /// Applies an already validated record.
    pub fn update_record(&self, record: &MetricRecord) -> Result<MetricPayload, ServiceError> {
        let stored = self.storage.apply(record)?;
        Ok(MetricPayload::from(&stored))
    }

    /// Applies a batch.
    ///
    /// Every payload is validated and applied on its own: valid records are
    /// stored even when others are rejected. If anything was rejected the
    /// result is a [`ValidationError::Batch`] naming each rejected entry.
    /// Otherwise returns the post-update state of every record.
    pub fn update_batch(
        &self,
        payloads: Vec<MetricPayload>,
    ) -> Result<Vec<MetricPayload>, ServiceError> {
        if payloads.is_empty() {
            return Err(ValidationError::EmptyBatch.into());
        }
        let total = payloads.len();

        let mut rejected = Vec::new();
        let mut records = Vec::with_capacity(total);
        let mut positions = Vec::with_capacity(total);
        for (index, payload) in payloads.into_iter().enumerate() {
            match payload.into_record() {
                Ok(record) => {
                    records.push(record);
                    positions.push(index);
                }
                Err(e) => rejected.push((index, e.to_string())),
            }
        }

        let outcome = self.storage.apply_batch(&records)?;
        for r in outcome.rejected {
            rejected.push((positions[r.index], r.reason.to_string()));
        }
        debug!(
            total,
            applied = outcome.applied.len(),
            rejected = rejected.len(),
            "batch processed"
        );

        if rejected.is_empty() {
            return Ok(outcome.applied.iter().map(MetricPayload::from).collect());
        }
        rejected.sort_by_key(|(index, _)| *index);
        Err(ValidationError::Batch {
            total,
            rejected: rejected
                .into_iter()
                .map(|(index, reason)| format!("#{index}: {reason}"))
                .collect(),
        }
        .into())
    }

    /// Looks up a metric by kind and name.
    ///
    /// A name stored under the other kind is reported as not found.
    pub fn value(&self, kind: MetricKind, name: &str) -> Result<MetricRecord, ServiceError> {
        let record = self.storage.get(name)?;
        if record.kind() != kind {
            return Err(StorageError::NotFound(name.to_string()).into());
        }
        Ok(record)
    }

    /// Looks up the metric described by a JSON value request.
    pub fn value_of(&self, payload: &MetricPayload) -> Result<MetricPayload, ServiceError> {
        let (kind, name) = payload.lookup_key()?;
        let record = self.value(kind, name)?;
        Ok(MetricPayload::from(&record))
    }

    pub fn snapshot(&self) -> Result<MetricSet, ServiceError> {
        Ok(self.storage.snapshot()?)
    }

    /// HTML listing of every stored metric.
    pub fn report(&self) -> Result<String, ServiceError> {
        Ok(render_report(&self.snapshot()?))
    }

    pub fn ping(&self) -> Result<(), ServiceError> {
        Ok(self.storage.ping()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn service() -> MetricService {
        MetricService::new(Arc::new(MemoryStorage::new()))
    }

    fn payload(json: &str) -> MetricPayload {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn counter_update_returns_total() {
        let svc = service();
        svc.update(payload(r#"{"id":"hits","type":"counter","delta":10}"#))
            .unwrap();
        let out = svc
            .update(payload(r#"{"id":"hits","type":"counter","delta":5}"#))
            .unwrap();
        assert_eq!(out.delta, Some(15));
        assert_eq!(out.value, None);
    }

    #[test]
    fn lookup_of_other_kind_is_not_found() {
        let svc = service();
        svc.update_record(&MetricRecord::gauge("temperature", 23.5))
            .unwrap();
        assert!(matches!(
            svc.value(MetricKind::Counter, "temperature"),
            Err(ServiceError::Storage(StorageError::NotFound(_)))
        ));
        assert_eq!(
            svc.value(MetricKind::Gauge, "temperature").unwrap(),
            MetricRecord::gauge("temperature", 23.5)
        );
    }

    #[test]
    fn value_request_is_validated() {
        let svc = service();
        assert!(matches!(
            svc.value_of(&payload(r#"{"id":"x","type":"meter"}"#)),
            Err(ServiceError::Validation(ValidationError::InvalidKind(_)))
        ));
        assert!(matches!(
            svc.value_of(&payload(r#"{"type":"gauge"}"#)),
            Err(ServiceError::Validation(ValidationError::MissingName))
        ));
    }

    #[test]
    fn empty_batch_is_rejected() {
        assert!(matches!(
            service().update_batch(Vec::new()),
            Err(ServiceError::Validation(ValidationError::EmptyBatch))
        ));
    }

    #[test]
    fn batch_applies_valid_records_and_lists_rejects() {
        let svc = service();
        svc.update_record(&MetricRecord::gauge("g", 1.0)).unwrap();

        let batch: Vec<MetricPayload> = serde_json::from_str(
            r#"[
                {"id":"c","type":"counter","delta":2},
                {"id":"","type":"gauge","value":1},
                {"id":"g","type":"counter","delta":1},
                {"id":"a","type":"gauge","value":0.5}
            ]"#,
        )
        .unwrap();

        let (total, rejected) = match svc.update_batch(batch) {
            Err(ServiceError::Validation(ValidationError::Batch { total, rejected })) => {
                (total, rejected)
            }
            other => panic!("unexpected result: {other:?}"),
        };
        assert_eq!(total, 4);
        assert_eq!(rejected.len(), 2);
        assert!(rejected[0].starts_with("#1:"));
        assert!(rejected[1].starts_with("#2:"));

        let snap = svc.snapshot().unwrap();
        assert_eq!(snap.counters.get("c"), Some(&2));
        assert_eq!(snap.gauges.get("a"), Some(&0.5));
        assert_eq!(snap.gauges.get("g"), Some(&1.0));
    }

    #[test]
    fn clean_batch_returns_applied_records() {
        let svc = service();
        let batch = vec![
            MetricPayload::from(&MetricRecord::counter("PollCount", 3)),
            MetricPayload::from(&MetricRecord::gauge("Alloc", 100.0)),
        ];
        let applied = svc.update_batch(batch).unwrap();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[0].delta, Some(3));
        assert!(svc.report().unwrap().contains("<h1>Metrics (2)</h1>"));
        assert!(svc.ping().is_ok());
    }
}
