//! Small helpers for uniform JSON API responses.
//!
//! Every `/api/*` response carries `Cache-Control: no-store`: these bodies
//! embed session and pairing state that must never be replayed from a cache.

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};

/// 200 response with a JSON body.
pub fn api_success(value: Value) -> Response {
    no_store((StatusCode::OK, Json(value)).into_response())
}

/// 200 response with the standard `{"status": "ok"}` body.
pub fn api_ok() -> Response {
    api_success(json!({ "status": "ok" }))
}

/// Marks a response uncacheable.
pub fn no_store(mut response: Response) -> Response {
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static("no-store"),
    );
    response
}
