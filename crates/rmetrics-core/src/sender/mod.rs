//! Delivery pipeline: JSON batch → optional gzip → optional signature →
//! POST `/updates/` with bounded retries.
//!
//! Compression is used only after a capability probe (`GET /` with
//! `Accept-Encoding: gzip`) saw the collector answer with
//! `Content-Encoding: gzip`. A successful probe is remembered for the life of
//! the [`Sender`]; a failed one is retried on the next batch.

mod retry;

use std::io::Write;
use std::sync::OnceLock;
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE};
use tracing::{debug, info};

use crate::HASH_HEADER;
use crate::integrity::{self, IntegrityError};
use crate::model::{MetricPayload, MetricRecord};

pub use retry::{Exhausted, RetryPolicy, retry_with_backoff};

#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Collector address, `host:port` or a full `http://` URL.
    pub address: String,
    /// Shared secret for body signatures.
    pub key: Option<String>,
    pub retry: RetryPolicy,
    /// Per-attempt request timeout.
    pub timeout: Duration,
}

impl SenderConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            key: None,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(5),
        }
    }

    /// Base URL without a trailing slash.
    pub fn base_url(&self) -> String {
        let addr = self.address.trim_end_matches('/');
        if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.to_string()
        } else {
            format!("http://{addr}")
        }
    }
}

/// One report: the records of a single sampler batch.
#[derive(Debug, Clone)]
pub struct MetricBatch {
    /// Sequence number used in logs.
    pub seq: u64,
    pub records: Vec<MetricRecord>,
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("batch #{seq} not delivered after {attempts} attempts: {last}")]
    Exhausted { seq: u64, attempts: u32, last: String },

    /// The collector refused the batch with a client error. Part of it may
    /// have been applied, so it is never sent again.
    #[error("batch #{seq} rejected by collector: {status}")]
    Rejected { seq: u64, status: StatusCode },

    #[error("batch encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("batch compression failed: {0}")]
    Compress(#[from] std::io::Error),

    #[error("batch signing failed: {0}")]
    Sign(#[from] IntegrityError),

    #[error("http client setup failed: {0}")]
    Client(#[from] reqwest::Error),
}

/// Why a single POST attempt failed.
#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("collector answered {0}")]
    Status(StatusCode),
}

impl AttemptError {
    /// Transport failures and server errors may go away on their own.
    /// Anything else is the collector's final answer for this body.
    fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status(status) => status.is_server_error(),
        }
    }
}

/// Gzip-compresses `data`.
pub fn gzip(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

pub struct Sender {
    client: reqwest::Client,
    config: SenderConfig,
    base_url: String,
    gzip_supported: OnceLock<bool>,
}

impl Sender {
    pub fn new(config: SenderConfig) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            base_url: config.base_url(),
            config,
            gzip_supported: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    /// Whether batches go out compressed. Probes the collector until one
    /// probe succeeds.
    pub async fn gzip_supported(&self) -> bool {
        if let Some(supported) = self.gzip_supported.get() {
            return *supported;
        }
        match self.probe().await {
            Ok(supported) => {
                info!(gzip = supported, "collector capability probed");
                *self.gzip_supported.get_or_init(|| supported)
            }
            Err(e) => {
                debug!(error = %e, "capability probe failed, sending uncompressed");
                false
            }
        }
    }

    async fn probe(&self) -> Result<bool, AttemptError> {
        let response = self
            .client
            .get(format!("{}/", self.base_url))
            .header(ACCEPT_ENCODING, "gzip")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AttemptError::Status(response.status()));
        }
        Ok(response
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("gzip")))
    }

    /// Delivers one batch, retrying according to the configured policy.
    pub async fn send(&self, batch: &MetricBatch) -> Result<(), DeliveryError> {
        let payloads: Vec<MetricPayload> = batch.records.iter().map(MetricPayload::from).collect();
        let body = serde_json::to_vec(&payloads)?;
        let signature = match &self.config.key {
            Some(key) => Some(integrity::sign(key.as_bytes(), &body)?),
            None => None,
        };
        let compressed = self.gzip_supported().await;
        let wire = if compressed { gzip(&body)? } else { body };

        let url = format!("{}/updates/", self.base_url);
        let retry = &self.config.retry;
        let result = retry_with_backoff(retry, AttemptError::is_transient, |attempt| {
            let mut request = self
                .client
                .post(&url)
                .header(CONTENT_TYPE, "application/json")
                .body(wire.clone());
            if compressed {
                request = request.header(CONTENT_ENCODING, "gzip");
            }
            if let Some(sig) = &signature {
                request = request.header(HASH_HEADER, sig.as_str());
            }
            async move {
                let response = request.send().await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(AttemptError::Status(status));
                }
                debug!(attempt, %status, "batch accepted");
                Ok(())
            }
        })
        .await;

        match result {
            Ok(()) => {
                debug!(
                    seq = batch.seq,
                    records = batch.records.len(),
                    bytes = wire.len(),
                    gzip = compressed,
                    "batch delivered"
                );
                Ok(())
            }
            Err(Exhausted {
                last: AttemptError::Status(status),
                ..
            }) if status.is_client_error() => Err(DeliveryError::Rejected {
                seq: batch.seq,
                status,
            }),
            Err(Exhausted { attempts, last }) => {
                Err(DeliveryError::Exhausted {
                    seq: batch.seq,
                    attempts,
                    last: last.to_string(),
                })
            }
        }
    }
}
