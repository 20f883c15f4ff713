//! Serves the prebuilt browser SPA embedded at build time.
//!
//! Entrypoints (`/`, `/index.html`, `/sw.js`, `/manifest.webmanifest`) are
//! served with `Cache-Control: no-store` so UI updates land on the next
//! load; content-addressed assets under `/assets` keep default caching.

use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use rust_embed::RustEmbed;

/// SPA bundle produced by the web build and embedded into the binary.
#[derive(RustEmbed)]
#[folder = "webui/"]
struct WebUi;

/// Paths that must never be cached by the browser.
const NO_STORE_PATHS: &[&str] = &["index.html", "sw.js", "manifest.webmanifest"];

/// Fallback handler serving embedded SPA assets.
pub async fn serve(uri: Uri) -> Response {
    let path = uri.path().trim_start_matches('/');
    let path = if path.is_empty() { "index.html" } else { path };

    let Some(content) = WebUi::get(path) else {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    };

    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let mut response = (
        [(header::CONTENT_TYPE, mime.as_ref().to_string())],
        content.data.into_owned(),
    )
        .into_response();

    if NO_STORE_PATHS.contains(&path) {
        response.headers_mut().insert(
            header::CACHE_CONTROL,
            header::HeaderValue::from_static("no-store"),
        );
    }
    response
}
