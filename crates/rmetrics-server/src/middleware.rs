//! Request middleware: access log and body signatures.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{error, info, warn};

use rmetrics_core::integrity;

use crate::state::SigningKey;

/// Request bodies above this size are rejected before verification.
pub(crate) const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// [`rmetrics_core::HASH_HEADER`] in the lowercase form `from_static` needs.
const HASH_HEADER: HeaderName = HeaderName::from_static("hashsha256");

// ============================================================
// Access log
// ============================================================

#[derive(Clone)]
pub(crate) struct AccessLogLayer;

impl<S> tower::Layer<S> for AccessLogLayer {
    type Service = AccessLogService<S>;
    fn layer(&self, inner: S) -> Self::Service {
        AccessLogService { inner }
    }
}

#[derive(Clone)]
pub(crate) struct AccessLogService<S> {
    inner: S,
}

impl<S> tower::Service<Request> for AccessLogService<S>
where
    S: tower::Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        let client = req
            .extensions()
            .get::<axum::extract::ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip().to_string())
            .unwrap_or_else(|| "-".to_owned());
        let t0 = Instant::now();

        let mut inner = self.inner.clone();
        Box::pin(async move {
            let response = inner.call(req).await?;
            let latency_ms = t0.elapsed().as_millis() as u64;
            let status = response.status().as_u16();
            info!(client, status, latency_ms, "{method} {path}");
            Ok(response)
        })
    }
}

// ============================================================
// Body signatures
// ============================================================

/// Verifies the `HashSHA256` request header and signs the response body.
///
/// Runs inside request decompression and outside response compression, so
/// both signatures cover uncompressed bytes. Requests without the header (or
/// with an empty one) pass unverified.
pub(crate) async fn signature_middleware(
    State(key): State<SigningKey>,
    req: Request,
    next: Next,
) -> Response {
    let (parts, body) = req.into_parts();
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            warn!(path = %parts.uri.path(), error = %e, "failed to read request body");
            return (StatusCode::BAD_REQUEST, "unreadable request body").into_response();
        }
    };

    let signature = parts
        .headers
        .get(&HASH_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty());
    if let Some(signature) = signature
        && let Err(e) = integrity::verify(key.as_bytes(), &body, signature)
    {
        warn!(path = %parts.uri.path(), error = %e, "request signature rejected");
        return (StatusCode::BAD_REQUEST, "signature mismatch").into_response();
    }

    let response = next.run(Request::from_parts(parts, Body::from(body))).await;
    sign_response(&key, response).await
}

async fn sign_response(key: &SigningKey, response: Response) -> Response {
    let (mut parts, body) = response.into_parts();
    let body = match to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "failed to buffer response body");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    match integrity::sign(key.as_bytes(), &body)
        .ok()
        .and_then(|sig| HeaderValue::from_str(&sig).ok())
    {
        Some(value) => {
            parts.headers.insert(HASH_HEADER, value);
        }
        None => warn!("response left unsigned"),
    }
    Response::from_parts(parts, Body::from(body))
}
