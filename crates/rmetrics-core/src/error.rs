//! Error types shared by the storage backends and the update service.

use crate::model::MetricKind;

/// A client-supplied record or lookup that cannot be accepted as is.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// The metric type is neither `gauge` nor `counter`.
    #[error("invalid metric type '{0}'")]
    InvalidKind(String),

    /// The metric name is empty.
    #[error("metric name is missing")]
    MissingName,

    /// The value field required by the metric type is absent.
    #[error("{kind} '{name}' has no {field}")]
    MissingValue {
        kind: MetricKind,
        name: String,
        field: &'static str,
    },

    /// The value could not be parsed, or is not a finite number.
    #[error("invalid {kind} value '{value}'")]
    InvalidValue { kind: MetricKind, value: String },

    /// A batch update carried no records.
    #[error("empty metrics batch")]
    EmptyBatch,

    /// Some records of a batch were rejected.
    #[error("{} of {total} records rejected: {}", .rejected.len(), .rejected.join("; "))]
    Batch { total: usize, rejected: Vec<String> },
}

/// Errors produced by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No record is stored under the requested name.
    #[error("metric '{0}' not found")]
    NotFound(String),

    /// The name is already stored with another kind.
    #[error("metric '{name}' is a {stored}, not a {requested}")]
    KindMismatch {
        name: String,
        stored: MetricKind,
        requested: MetricKind,
    },

    /// Adding the delta would overflow the 64-bit counter total.
    #[error("counter '{0}' overflow")]
    CounterOverflow(String),

    /// File I/O failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot content could not be encoded or decoded.
    #[error("snapshot encoding error: {0}")]
    Snapshot(#[from] serde_json::Error),

    /// Snapshot content decoded but is not a consistent metric set.
    #[error("corrupt snapshot: {0}")]
    Corrupt(String),

    /// PostgreSQL reported an error.
    #[error("database error: {0}")]
    Database(#[from] postgres::Error),

    /// The backend could not be reached at all.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    /// Returns true for errors caused by the request rather than the backend.
    ///
    /// Everything else means the backend itself is failing and must be
    /// reported as an internal error without leaking details.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            StorageError::NotFound(_)
                | StorageError::KindMismatch { .. }
                | StorageError::CounterOverflow(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_error_lists_rejected_records() {
        let err = ValidationError::Batch {
            total: 3,
            rejected: vec!["#1: metric name is missing".into(), "#2: bad".into()],
        };
        assert_eq!(
            err.to_string(),
            "2 of 3 records rejected: #1: metric name is missing; #2: bad"
        );
    }

    #[test]
    fn client_errors_are_classified() {
        assert!(StorageError::NotFound("x".into()).is_client_error());
        assert!(
            StorageError::KindMismatch {
                name: "x".into(),
                stored: MetricKind::Gauge,
                requested: MetricKind::Counter,
            }
            .is_client_error()
        );
        assert!(!StorageError::Unavailable("down".into()).is_client_error());
        assert!(!StorageError::Corrupt("dup".into()).is_client_error());
    }
}
