//! Shared application state and the global allocator.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::sync::Arc;

use rmetrics_core::service::MetricService;

/// State handed to every handler. Cheap to clone.
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) service: MetricService,
}

impl AppState {
    pub(crate) fn new(service: MetricService) -> Self {
        Self { service }
    }
}

/// Shared secret for request verification and response signing.
#[derive(Clone)]
pub(crate) struct SigningKey(pub(crate) Arc<[u8]>);

impl SigningKey {
    pub(crate) fn new(key: &str) -> Self {
        Self(Arc::from(key.as_bytes()))
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}
