//! Router assembly.

use axum::Router;
use axum::routing::{get, post};
use tower_http::compression::CompressionLayer;
use tower_http::decompression::RequestDecompressionLayer;

use crate::handlers;
use crate::middleware::{AccessLogLayer, signature_middleware};
use crate::state::{AppState, SigningKey};

/// Builds the full HTTP surface. JSON routes answer with and without the
/// trailing slash.
pub(crate) fn build_router(state: AppState, key: Option<SigningKey>) -> Router {
    let mut app = Router::new()
        .route("/", get(handlers::report))
        .route("/ping", get(handlers::ping))
        .route("/update/{kind}/{name}/{value}", post(handlers::update_path))
        .route("/update/", post(handlers::update_json))
        .route("/update", post(handlers::update_json))
        .route("/updates/", post(handlers::updates_json))
        .route("/updates", post(handlers::updates_json))
        .route("/value/{kind}/{name}", get(handlers::value_path))
        .route("/value/", post(handlers::value_json))
        .route("/value", post(handlers::value_json))
        .with_state(state);

    // Layers added later wrap earlier ones: requests are decompressed before
    // the signature check, responses are signed before compression.
    if let Some(key) = key {
        app = app.layer(axum::middleware::from_fn_with_state(
            key,
            signature_middleware,
        ));
    }

    app.layer(AccessLogLayer)
        .layer(RequestDecompressionLayer::new())
        .layer(CompressionLayer::new())
}
