//! Metric data model.
//!
//! Internally every metric is a [`MetricRecord`] whose value is a tagged
//! [`MetricValue`], so "exactly one of gauge value / counter delta" holds by
//! construction. The optional-field JSON shape used on the wire lives in
//! [`MetricPayload`] and is converted (and validated) at the API boundary.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, ValidationError};

/// Metric type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Latest value replaces the stored one.
    Gauge,
    /// Value is a delta added to the stored total.
    Counter,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gauge" => Ok(MetricKind::Gauge),
            "counter" => Ok(MetricKind::Counter),
            other => Err(ValidationError::InvalidKind(other.to_string())),
        }
    }
}

/// Value of a metric, tagged by kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Gauge(f64),
    Counter(i64),
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Gauge(_) => MetricKind::Gauge,
            MetricValue::Counter(_) => MetricKind::Counter,
        }
    }

    /// Parses the textual value of a path-encoded update.
    pub fn parse(kind: MetricKind, raw: &str) -> Result<Self, ValidationError> {
        let invalid = || ValidationError::InvalidValue {
            kind,
            value: raw.to_string(),
        };
        match kind {
            MetricKind::Gauge => {
                let value: f64 = raw.parse().map_err(|_| invalid())?;
                if !value.is_finite() {
                    return Err(invalid());
                }
                Ok(MetricValue::Gauge(value))
            }
            MetricKind::Counter => raw.parse().map(MetricValue::Counter).map_err(|_| invalid()),
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Gauge(v) => write!(f, "{v}"),
            MetricValue::Counter(v) => write!(f, "{v}"),
        }
    }
}

/// A named metric value: the unit of exchange and storage.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    pub name: String,
    pub value: MetricValue,
}

impl MetricRecord {
    pub fn gauge(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            value: MetricValue::Gauge(value),
        }
    }

    pub fn counter(name: impl Into<String>, delta: i64) -> Self {
        Self {
            name: name.into(),
            value: MetricValue::Counter(delta),
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }

    /// Builds a record from the `/update/{type}/{name}/{value}` path segments.
    ///
    /// Checks run in the same order as for JSON payloads: type, name, value.
    pub fn from_path(kind: &str, name: &str, value: &str) -> Result<Self, ValidationError> {
        let kind: MetricKind = kind.parse()?;
        if name.is_empty() {
            return Err(ValidationError::MissingName);
        }
        Ok(Self {
            name: name.to_string(),
            value: MetricValue::parse(kind, value)?,
        })
    }
}

/// JSON wire shape of a metric: `{"id", "type", "delta"?, "value"?}`.
///
/// Fields default when absent so that a missing `type` or `id` is reported
/// by [`MetricPayload::into_record`] instead of failing deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricPayload {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl MetricPayload {
    /// Validates the type and name of a lookup request.
    pub fn lookup_key(&self) -> Result<(MetricKind, &str), ValidationError> {
        let kind: MetricKind = self.kind.parse()?;
        if self.id.is_empty() {
            return Err(ValidationError::MissingName);
        }
        Ok((kind, &self.id))
    }

    /// Validates an update and resolves it into a typed record.
    pub fn into_record(self) -> Result<MetricRecord, ValidationError> {
        let (kind, _) = self.lookup_key()?;
        let value = match kind {
            MetricKind::Gauge => match self.value {
                Some(v) if v.is_finite() => MetricValue::Gauge(v),
                Some(v) => {
                    return Err(ValidationError::InvalidValue {
                        kind,
                        value: v.to_string(),
                    });
                }
                None => {
                    return Err(ValidationError::MissingValue {
                        kind,
                        name: self.id,
                        field: "value",
                    });
                }
            },
            MetricKind::Counter => match self.delta {
                Some(d) => MetricValue::Counter(d),
                None => {
                    return Err(ValidationError::MissingValue {
                        kind,
                        name: self.id,
                        field: "delta",
                    });
                }
            },
        };
        Ok(MetricRecord {
            name: self.id,
            value,
        })
    }
}

impl From<&MetricRecord> for MetricPayload {
    fn from(record: &MetricRecord) -> Self {
        let (delta, value) = match record.value {
            MetricValue::Gauge(v) => (None, Some(v)),
            MetricValue::Counter(d) => (Some(d), None),
        };
        Self {
            id: record.name.clone(),
            kind: record.kind().as_str().to_string(),
            delta,
            value,
        }
    }
}

/// Point-in-time copy of a whole store.
///
/// This is also the on-disk snapshot format: one JSON object with a
/// `gauges` map and a `counters` map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSet {
    #[serde(default)]
    pub gauges: BTreeMap<String, f64>,
    #[serde(default)]
    pub counters: BTreeMap<String, i64>,
}

impl MetricSet {
    pub fn len(&self) -> usize {
        self.gauges.len() + self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gauges.is_empty() && self.counters.is_empty()
    }

    pub fn insert(&mut self, name: String, value: MetricValue) {
        match value {
            MetricValue::Gauge(v) => {
                self.gauges.insert(name, v);
            }
            MetricValue::Counter(d) => {
                self.counters.insert(name, d);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<MetricValue> {
        self.gauges
            .get(name)
            .map(|v| MetricValue::Gauge(*v))
            .or_else(|| self.counters.get(name).map(|d| MetricValue::Counter(*d)))
    }

    pub fn from_map(map: &HashMap<String, MetricValue>) -> Self {
        let mut set = Self::default();
        for (name, value) in map {
            set.insert(name.clone(), *value);
        }
        set
    }

    /// Converts back into a name-keyed map.
    ///
    /// A name present under both kinds cannot come from a valid store and
    /// is reported as corruption.
    pub fn into_map(self) -> Result<HashMap<String, MetricValue>, StorageError> {
        let mut map = HashMap::with_capacity(self.len());
        for (name, v) in self.gauges {
            if !v.is_finite() {
                return Err(StorageError::Corrupt(format!(
                    "gauge '{name}' has non-finite value"
                )));
            }
            map.insert(name, MetricValue::Gauge(v));
        }
        for (name, d) in self.counters {
            if map.contains_key(&name) {
                return Err(StorageError::Corrupt(format!(
                    "'{name}' stored as both gauge and counter"
                )));
            }
            map.insert(name, MetricValue::Counter(d));
        }
        Ok(map)
    }
}
