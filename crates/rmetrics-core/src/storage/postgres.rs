//! PostgreSQL backend.
//!
//! One row per metric name in the `metrics` table. Counters accumulate in the
//! database (`delta = metrics.delta + EXCLUDED.delta`), so concurrent servers
//! sharing a database never lose increments. The kind guard lives in the
//! upsert's `WHERE` clause: a conflicting row of the other kind is left
//! untouched and no row is returned.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use postgres::error::SqlState;
use postgres::{Client, GenericClient, NoTls};
use tracing::{debug, info, warn};

use crate::error::StorageError;
use crate::model::{MetricKind, MetricRecord, MetricSet, MetricValue};

use super::{BatchOutcome, MetricStorage, Rejected};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS metrics (
    name       TEXT PRIMARY KEY,
    type       TEXT NOT NULL,
    value      DOUBLE PRECISION,
    delta      BIGINT,
    updated_at TIMESTAMPTZ NOT NULL
)";

const UPSERT_GAUGE: &str = "
INSERT INTO metrics (name, type, value, updated_at) VALUES ($1, 'gauge', $2, $3)
ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value, updated_at = EXCLUDED.updated_at
WHERE metrics.type = 'gauge'
RETURNING value";

const UPSERT_COUNTER: &str = "
INSERT INTO metrics (name, type, delta, updated_at) VALUES ($1, 'counter', $2, $3)
ON CONFLICT (name) DO UPDATE SET delta = metrics.delta + EXCLUDED.delta, updated_at = EXCLUDED.updated_at
WHERE metrics.type = 'counter'
RETURNING delta";

const PING_TIMEOUT: Duration = Duration::from_secs(2);

pub struct PostgresStorage {
    client: Mutex<Client>,
}

impl PostgresStorage {
    /// Connects with a fixed delay between attempts and creates the schema.
    pub fn connect(dsn: &str, attempts: u32, retry_delay: Duration) -> Result<Self, StorageError> {
        let attempts = attempts.max(1);
        let mut attempt = 1;
        let mut client = loop {
            match Client::connect(dsn, NoTls) {
                Ok(client) => break client,
                Err(e) if attempt < attempts => {
                    warn!(
                        attempt,
                        attempts,
                        error = %format_postgres_error(&e),
                        "database connection failed, retrying"
                    );
                    thread::sleep(retry_delay);
                    attempt += 1;
                }
                Err(e) => {
                    return Err(StorageError::Unavailable(format!(
                        "could not connect after {attempts} attempts: {}",
                        format_postgres_error(&e)
                    )));
                }
            }
        };

        client.batch_execute(SCHEMA)?;
        info!(attempt, "connected to PostgreSQL");

        Ok(Self {
            client: Mutex::new(client),
        })
    }

    fn client(&self) -> MutexGuard<'_, Client> {
        self.client.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn upsert_gauge(
    client: &mut impl GenericClient,
    name: &str,
    value: f64,
    now: DateTime<Utc>,
) -> Result<MetricRecord, StorageError> {
    match client.query_opt(UPSERT_GAUGE, &[&name, &value, &now])? {
        Some(row) => Ok(MetricRecord::gauge(name, row.try_get(0)?)),
        None => Err(kind_conflict(client, name, MetricKind::Gauge)),
    }
}

fn upsert_counter(
    client: &mut impl GenericClient,
    name: &str,
    delta: i64,
    now: DateTime<Utc>,
) -> Result<MetricRecord, StorageError> {
    match client.query_opt(UPSERT_COUNTER, &[&name, &delta, &now]) {
        Ok(Some(row)) => Ok(MetricRecord::counter(name, row.try_get(0)?)),
        Ok(None) => Err(kind_conflict(client, name, MetricKind::Counter)),
        Err(e) if e.code() == Some(&SqlState::NUMERIC_VALUE_OUT_OF_RANGE) => {
            Err(StorageError::CounterOverflow(name.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

fn upsert(
    client: &mut impl GenericClient,
    record: &MetricRecord,
    now: DateTime<Utc>,
) -> Result<MetricRecord, StorageError> {
    match record.value {
        MetricValue::Gauge(v) => upsert_gauge(client, &record.name, v, now),
        MetricValue::Counter(d) => upsert_counter(client, &record.name, d, now),
    }
}

/// Builds the error for an upsert that matched a row of the other kind.
fn kind_conflict(client: &mut impl GenericClient, name: &str, requested: MetricKind) -> StorageError {
    let stored = match client.query_opt("SELECT type FROM metrics WHERE name = $1", &[&name]) {
        Ok(Some(row)) => row.try_get::<_, String>(0).map_err(StorageError::from),
        Ok(None) => {
            return StorageError::Unavailable(format!("upsert of '{name}' returned no row"));
        }
        Err(e) => return e.into(),
    };
    match stored.and_then(|s| {
        s.parse::<MetricKind>()
            .map_err(|_| StorageError::Corrupt(format!("'{name}' has unknown type '{s}'")))
    }) {
        Ok(stored) => StorageError::KindMismatch {
            name: name.to_string(),
            stored,
            requested,
        },
        Err(e) => e,
    }
}

fn row_to_record(row: &postgres::Row) -> Result<MetricRecord, StorageError> {
    let name: String = row.try_get(0)?;
    let kind: String = row.try_get(1)?;
    let value = match kind.as_str() {
        "gauge" => row
            .try_get::<_, Option<f64>>(2)?
            .map(MetricValue::Gauge),
        "counter" => row
            .try_get::<_, Option<i64>>(3)?
            .map(MetricValue::Counter),
        _ => None,
    };
    value
        .map(|value| MetricRecord {
            name: name.clone(),
            value,
        })
        .ok_or_else(|| StorageError::Corrupt(format!("row '{name}' has type '{kind}' without value")))
}

impl MetricStorage for PostgresStorage {
    fn apply_gauge(&self, name: &str, value: f64) -> Result<MetricRecord, StorageError> {
        upsert_gauge(&mut *self.client(), name, value, Utc::now())
    }

    fn apply_counter(&self, name: &str, delta: i64) -> Result<MetricRecord, StorageError> {
        upsert_counter(&mut *self.client(), name, delta, Utc::now())
    }

    /// Applies the batch in one transaction. Each record runs under its own
    /// savepoint, so a rejected record rolls back alone.
    fn apply_batch(&self, records: &[MetricRecord]) -> Result<BatchOutcome, StorageError> {
        let mut client = self.client();
        let mut tx = client.transaction()?;
        let now = Utc::now();
        let mut outcome = BatchOutcome::default();

        for (index, record) in records.iter().enumerate() {
            let mut savepoint = tx.transaction()?;
            match upsert(&mut savepoint, record, now) {
                Ok(applied) => {
                    savepoint.commit()?;
                    outcome.applied.push(applied);
                }
                Err(reason) if reason.is_client_error() => {
                    savepoint.rollback()?;
                    outcome.rejected.push(Rejected {
                        index,
                        name: record.name.clone(),
                        reason,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        tx.commit()?;
        debug!(
            applied = outcome.applied.len(),
            rejected = outcome.rejected.len(),
            "batch committed"
        );
        Ok(outcome)
    }

    fn get(&self, name: &str) -> Result<MetricRecord, StorageError> {
        let row = self
            .client()
            .query_opt(
                "SELECT name, type, value, delta FROM metrics WHERE name = $1",
                &[&name],
            )?
            .ok_or_else(|| StorageError::NotFound(name.to_string()))?;
        row_to_record(&row)
    }

    fn snapshot(&self) -> Result<MetricSet, StorageError> {
        let rows = self
            .client()
            .query("SELECT name, type, value, delta FROM metrics ORDER BY name", &[])?;
        let mut set = MetricSet::default();
        for row in &rows {
            let record = row_to_record(row)?;
            set.insert(record.name, record.value);
        }
        Ok(set)
    }

    fn ping(&self) -> Result<(), StorageError> {
        self.client().is_valid(PING_TIMEOUT)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

/// Shortens driver errors to the part worth logging.
pub(crate) fn format_postgres_error(e: &postgres::Error) -> String {
    if let Some(db_error) = e.as_db_error() {
        format!("{}: {}", db_error.severity(), db_error.message())
    } else {
        let msg = e.to_string();
        if msg.contains("Connection refused") {
            "connection refused".to_string()
        } else if msg.contains("password authentication failed") {
            "password authentication failed".to_string()
        } else {
            msg
        }
    }
}
