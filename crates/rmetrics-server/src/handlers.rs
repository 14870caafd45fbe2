//! HTTP request handlers for updates, lookups, the HTML report and ping.
//!
//! Storage calls are blocking and run on `spawn_blocking`. JSON bodies are
//! parsed by hand from the raw bytes so that malformed input maps to 400 with
//! the same error shape as validation failures.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Json, Response};
use serde::de::DeserializeOwned;
use tracing::{error, warn};

use rmetrics_core::service::{MetricService, ServiceError};
use rmetrics_core::{MetricKind, MetricPayload, MetricRecord, StorageError};

use crate::state::AppState;

// ============================================================
// Errors
// ============================================================

#[derive(Debug)]
pub(crate) enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal,
}

impl From<ServiceError> for ApiError {
    fn from(e: ServiceError) -> Self {
        match e {
            ServiceError::Validation(e) => ApiError::BadRequest(e.to_string()),
            ServiceError::Storage(StorageError::NotFound(name)) => {
                ApiError::NotFound(format!("metric '{name}' not found"))
            }
            ServiceError::Storage(e) if e.is_client_error() => ApiError::BadRequest(e.to_string()),
            ServiceError::Storage(e) => {
                error!(error = %e, "storage failure");
                ApiError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::Internal => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response()
            }
        }
    }
}

/// Runs a service call on the blocking pool.
async fn blocking<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&MetricService) -> Result<T, ServiceError> + Send + 'static,
{
    let service = state.service.clone();
    match tokio::task::spawn_blocking(move || f(&service)).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => {
            error!(error = %e, "storage task panicked");
            Err(ApiError::Internal)
        }
    }
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| {
        warn!(error = %e, "malformed JSON body");
        ApiError::BadRequest(format!("malformed JSON: {e}"))
    })
}

// ============================================================
// Updates
// ============================================================

/// `POST /update/{type}/{name}/{value}`: responds with the stored value as text.
pub(crate) async fn update_path(
    State(state): State<AppState>,
    Path((kind, name, value)): Path<(String, String, String)>,
) -> Result<String, ApiError> {
    let record = MetricRecord::from_path(&kind, &name, &value).map_err(ServiceError::from)?;
    let stored = blocking(&state, move |svc| svc.update_record(&record)).await?;
    Ok(stored_value(&stored))
}

/// `POST /update/`: one JSON record in, its post-update state out.
pub(crate) async fn update_json(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<MetricPayload>, ApiError> {
    let payload: MetricPayload = parse_json(&body)?;
    let stored = blocking(&state, move |svc| svc.update(payload)).await?;
    Ok(Json(stored))
}

/// `POST /updates/`: a JSON array of records.
pub(crate) async fn updates_json(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Vec<MetricPayload>>, ApiError> {
    let payloads: Vec<MetricPayload> = parse_json(&body)?;
    let applied = blocking(&state, move |svc| svc.update_batch(payloads)).await?;
    Ok(Json(applied))
}

fn stored_value(payload: &MetricPayload) -> String {
    match (payload.delta, payload.value) {
        (Some(delta), _) => delta.to_string(),
        (None, Some(value)) => value.to_string(),
        (None, None) => String::new(),
    }
}

// ============================================================
// Lookups
// ============================================================

/// `GET /value/{type}/{name}`: the stored value as plain text.
pub(crate) async fn value_path(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> Result<String, ApiError> {
    let kind = kind.parse::<MetricKind>().map_err(ServiceError::from)?;
    let record = blocking(&state, move |svc| svc.value(kind, &name)).await?;
    Ok(record.value.to_string())
}

/// `POST /value/`: `{id, type}` in, full JSON record out.
pub(crate) async fn value_json(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<MetricPayload>, ApiError> {
    let request: MetricPayload = parse_json(&body)?;
    let record = blocking(&state, move |svc| svc.value_of(&request)).await?;
    Ok(Json(record))
}

// ============================================================
// Report and ping
// ============================================================

/// `GET /`: HTML listing of all metrics.
pub(crate) async fn report(State(state): State<AppState>) -> Result<Html<String>, ApiError> {
    let html = blocking(&state, |svc| svc.report()).await?;
    Ok(Html(html))
}

/// `GET /ping`: storage liveness.
pub(crate) async fn ping(State(state): State<AppState>) -> Result<&'static str, ApiError> {
    blocking(&state, |svc| svc.ping()).await?;
    Ok("ok")
}
