//! rmetrics-core - shared library for the rmetrics agent and server.
//!
//! Provides:
//! - `model`: metric records, kinds, the JSON wire payload and metric sets
//! - `error`: validation and storage error types
//! - `storage`: storage backends (memory, file snapshot, PostgreSQL)
//! - `service`: validation and application of incoming updates
//! - `collector`: runtime statistics sampler used by the agent
//! - `sender`: batch delivery with compression, signing and retries
//! - `integrity`: HMAC-SHA256 body signatures
//! - `fmt`: value and report formatting helpers

pub mod collector;
pub mod error;
pub mod fmt;
pub mod integrity;
pub mod model;
pub mod sender;
pub mod service;
pub mod storage;

pub use error::{StorageError, ValidationError};
pub use model::{MetricKind, MetricPayload, MetricRecord, MetricSet, MetricValue};

/// Crate version reported by both binaries at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// HTTP header carrying the hex-encoded HMAC-SHA256 of the uncompressed body.
pub const HASH_HEADER: &str = "HashSHA256";
