//! File operation handlers: listing, streaming upload/download, delete,
//! mkdir and rename - all resolved beneath the shared folder root.
//!
//! Path policy: every `path` query parameter is split on `/`, each segment
//! trimmed, and rejected if empty, `.`, `..`, or containing `\`. Hidden
//! segments (leading `.`) are denied unless the host shows hidden files.
//! Handlers never touch the filesystem before the path has passed policy.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::error::{MediaBusError, MediaBusResult};
use crate::protocol_constants::{BODY_IDLE_TIMEOUT_SECS, TRANSFER_CHUNK_SIZE};
use crate::runtime::{BatchSpec, Direction, TransferTicket};
use crate::state::HostSettings;
use crate::utils::unique_name;

use super::http::require_session;
use super::response::api_success;
use super::zip_stream;
use super::AppState;

// ─────────────────────────────────────────────────────────────────────────────
// Path Policy
// ─────────────────────────────────────────────────────────────────────────────

/// Splits a `path` query value into validated segments.
///
/// An empty (or all-whitespace) value addresses the shared folder root.
pub(crate) fn parse_path_segments(raw: &str) -> MediaBusResult<Vec<String>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let mut segments = Vec::new();
    for part in trimmed.split('/') {
        let part = part.trim();
        if part.is_empty() || part == "." || part == ".." || part.contains('\\') {
            return Err(MediaBusError::Validation(format!(
                "invalid path segment {:?}",
                part
            )));
        }
        segments.push(part.to_string());
    }
    Ok(segments)
}

/// Rejects hidden segments when the host does not show hidden files.
pub(crate) fn ensure_visible<S: AsRef<str>>(
    segments: &[S],
    show_hidden: bool,
) -> MediaBusResult<()> {
    if show_hidden {
        return Ok(());
    }
    if segments.iter().any(|s| s.as_ref().starts_with('.')) {
        return Err(MediaBusError::PolicyDenied(
            "hidden entries are not accessible".into(),
        ));
    }
    Ok(())
}

/// Validates a single `name` query value (upload, mkdir, rename target).
pub(crate) fn validate_name(raw: &str, show_hidden: bool) -> MediaBusResult<String> {
    let name = raw.trim();
    if name.is_empty() || name == "." || name == ".." || name.contains('\\') || name.contains('/') {
        return Err(MediaBusError::Validation(format!("invalid name {:?}", raw)));
    }
    ensure_visible(&[name], show_hidden)?;
    Ok(name.to_string())
}

/// The shared folder root, or 500 when none is configured.
pub(crate) fn shared_root(settings: &HostSettings) -> MediaBusResult<PathBuf> {
    let root = settings
        .shared_folder_path
        .clone()
        .ok_or_else(|| MediaBusError::ResourceUnavailable("no shared folder configured".into()))?;
    if !root.is_dir() {
        return Err(MediaBusError::ResourceUnavailable(
            "shared folder is not readable".into(),
        ));
    }
    Ok(root)
}

/// Resolves validated segments beneath the root. Missing targets yield 404,
/// unless `create_if_missing` creates the directory chain (upload destination).
pub(crate) fn resolve(
    root: &Path,
    segments: &[String],
    create_if_missing: bool,
) -> MediaBusResult<PathBuf> {
    let mut path = root.to_path_buf();
    for segment in segments {
        path.push(segment);
    }
    if !path.exists() {
        if create_if_missing {
            std::fs::create_dir_all(&path)
                .map_err(|e| MediaBusError::Internal(format!("mkdir failed: {}", e)))?;
        } else {
            return Err(MediaBusError::NotFound(segments.join("/")));
        }
    }
    Ok(path)
}

fn rel_path(segments: &[String], name: &str) -> String {
    if segments.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", segments.join("/"), name)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Batch Headers
// ─────────────────────────────────────────────────────────────────────────────

const BATCH_ID_HEADER: &str = "x-mediabus-batch-id";
const BATCH_TOTAL_HEADER: &str = "x-mediabus-batch-total";
const BATCH_BYTES_HEADER: &str = "x-mediabus-batch-bytes";
const BATCH_COMPLETED_HEADER: &str = "x-mediabus-batch-completed";

/// Reads the optional batch accounting headers a client attaches.
pub(crate) fn batch_from_headers(headers: &HeaderMap) -> Option<BatchSpec> {
    let id = headers.get(BATCH_ID_HEADER)?.to_str().ok()?.to_string();
    let parse_u64 = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
    };
    Some(BatchSpec {
        id,
        total_files: parse_u64(BATCH_TOTAL_HEADER) as u32,
        total_bytes: parse_u64(BATCH_BYTES_HEADER),
        completed_files: parse_u64(BATCH_COMPLETED_HEADER) as u32,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Query Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(crate) struct PathQuery {
    #[serde(default)]
    pub path: String,
}

#[derive(Deserialize)]
pub(crate) struct PathNameQuery {
    #[serde(default)]
    pub path: String,
    pub name: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Listing
// ─────────────────────────────────────────────────────────────────────────────

/// GET /api/files/list?path=…
pub(crate) async fn list_files(
    State(state): State<AppState>,
    jar: CookieJar,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(query): Query<PathQuery>,
) -> MediaBusResult<Response> {
    let device = require_session(&state, &jar, &remote.ip().to_string())?;
    let settings = state.store.settings();

    let segments = parse_path_segments(&query.path)?;
    ensure_visible(&segments, settings.show_hidden_files)?;
    let root = shared_root(&settings)?;
    let dir = resolve(&root, &segments, false)?;
    if !dir.is_dir() {
        return Err(MediaBusError::Validation("path is not a directory".into()));
    }

    let mut items = Vec::new();
    let mut entries = tokio::fs::read_dir(&dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if !settings.show_hidden_files && name.starts_with('.') {
            continue;
        }
        let metadata = entry.metadata().await?;
        let last_modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        items.push(json!({
            "name": name,
            "path": rel_path(&segments, &name),
            "directory": metadata.is_dir(),
            "size": if metadata.is_dir() { 0u64 } else { metadata.len() },
            "lastModified": last_modified,
        }));
    }

    // Directories first, then case-insensitive by name.
    items.sort_by(|a, b| {
        let a_dir = a["directory"].as_bool().unwrap_or(false);
        let b_dir = b["directory"].as_bool().unwrap_or(false);
        b_dir.cmp(&a_dir).then_with(|| {
            let a_name = a["name"].as_str().unwrap_or("").to_lowercase();
            let b_name = b["name"].as_str().unwrap_or("").to_lowercase();
            a_name.cmp(&b_name)
        })
    });

    Ok(api_success(json!({
        "deviceId": device.device_id,
        "path": segments.join("/"),
        "items": items,
        "showHiddenFiles": settings.show_hidden_files,
    })))
}

// ─────────────────────────────────────────────────────────────────────────────
// Download
// ─────────────────────────────────────────────────────────────────────────────

/// Wraps a byte stream, reporting progress to a ticket and surfacing
/// cancellation before each read. Dropping the stream closes the ticket.
struct TicketStream<S> {
    inner: S,
    ticket: TransferTicket,
}

impl<S> Stream for TicketStream<S>
where
    S: Stream<Item = std::io::Result<Bytes>> + Unpin,
{
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.ticket.cancelled() {
            return Poll::Ready(Some(Err(std::io::Error::other("transfer cancelled"))));
        }
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.ticket.add_progress(chunk.len() as u64);
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}

/// GET /api/files/download?path=…
pub(crate) async fn download_file(
    State(state): State<AppState>,
    jar: CookieJar,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(query): Query<PathQuery>,
    headers: HeaderMap,
) -> MediaBusResult<Response> {
    let device = require_session(&state, &jar, &remote.ip().to_string())?;
    let settings = state.store.settings();
    if !settings.allow_download {
        return Err(MediaBusError::PolicyDenied("downloads are disabled".into()));
    }

    let segments = parse_path_segments(&query.path)?;
    ensure_visible(&segments, settings.show_hidden_files)?;
    let root = shared_root(&settings)?;
    let path = resolve(&root, &segments, false)?;
    if !path.is_file() {
        return Err(MediaBusError::Validation("path is not a file".into()));
    }

    let size = tokio::fs::metadata(&path).await?.len();
    let ticket = state
        .runtime
        .begin_transfer(
            &device.device_id,
            Direction::Downloading,
            size,
            batch_from_headers(&headers),
        )
        .await
        .ok_or(MediaBusError::NotAuthorized)?;

    let file_name = segments.last().cloned().unwrap_or_default();
    log::info!(
        "[Files] {} downloading '{}' ({} bytes)",
        device.display_name,
        file_name,
        size
    );

    let file = tokio::fs::File::open(&path).await?;
    let stream = TicketStream {
        inner: ReaderStream::with_capacity(file, TRANSFER_CHUNK_SIZE),
        ticket,
    };

    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    let response = Response::builder()
        .header(header::CONTENT_TYPE, mime.as_ref())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file_name.replace('"', "_")),
        )
        .header(header::CACHE_CONTROL, "no-store")
        .body(Body::from_stream(stream))
        .map_err(|e| MediaBusError::Internal(e.to_string()))?;
    Ok(response)
}

/// GET /api/files/download-zip?path=…
pub(crate) async fn download_zip(
    State(state): State<AppState>,
    jar: CookieJar,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(query): Query<PathQuery>,
    headers: HeaderMap,
) -> MediaBusResult<Response> {
    let device = require_session(&state, &jar, &remote.ip().to_string())?;
    let settings = state.store.settings();
    if !settings.allow_download {
        return Err(MediaBusError::PolicyDenied("downloads are disabled".into()));
    }

    let segments = parse_path_segments(&query.path)?;
    ensure_visible(&segments, settings.show_hidden_files)?;
    let root = shared_root(&settings)?;
    let dir = resolve(&root, &segments, false)?;
    if !dir.is_dir() {
        return Err(MediaBusError::Validation("path is not a directory".into()));
    }

    let plans = zip_stream::plan_directory(&dir, settings.show_hidden_files)?;
    let total_bytes: u64 = plans.iter().filter_map(|p| p.size).sum();
    let ticket = state
        .runtime
        .begin_transfer(
            &device.device_id,
            Direction::Downloading,
            total_bytes,
            batch_from_headers(&headers),
        )
        .await
        .ok_or(MediaBusError::NotAuthorized)?;

    let archive_name = segments
        .last()
        .cloned()
        .unwrap_or_else(|| "shared".to_string());
    log::info!(
        "[Files] {} downloading folder '{}' as ZIP ({} entries)",
        device.display_name,
        archive_name,
        plans.len()
    );
    Ok(zip_stream::zip_response(&archive_name, plans, ticket))
}

/// GET /api/files/download-zip-batch?path=…&path=…
pub(crate) async fn download_zip_batch(
    State(state): State<AppState>,
    jar: CookieJar,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    axum_extra::extract::Query(query): axum_extra::extract::Query<BatchZipQuery>,
    headers: HeaderMap,
) -> MediaBusResult<Response> {
    let device = require_session(&state, &jar, &remote.ip().to_string())?;
    let settings = state.store.settings();
    if !settings.allow_download {
        return Err(MediaBusError::PolicyDenied("downloads are disabled".into()));
    }
    if query.path.is_empty() {
        return Err(MediaBusError::Validation("no paths selected".into()));
    }

    let root = shared_root(&settings)?;
    let mut selection = Vec::new();
    for raw in &query.path {
        let segments = parse_path_segments(raw)?;
        ensure_visible(&segments, settings.show_hidden_files)?;
        let path = resolve(&root, &segments, false)?;
        let name = segments
            .last()
            .cloned()
            .ok_or_else(|| MediaBusError::Validation("cannot select the root".into()))?;
        selection.push((name, path));
    }

    let plans = zip_stream::plan_batch(&selection, settings.show_hidden_files)?;
    let total_bytes: u64 = plans.iter().filter_map(|p| p.size).sum();
    let ticket = state
        .runtime
        .begin_transfer(
            &device.device_id,
            Direction::Downloading,
            total_bytes,
            batch_from_headers(&headers),
        )
        .await
        .ok_or(MediaBusError::NotAuthorized)?;

    log::info!(
        "[Files] {} downloading {} selected item(s) as ZIP",
        device.display_name,
        selection.len()
    );
    Ok(zip_stream::zip_response("mediabus", plans, ticket))
}

#[derive(Deserialize)]
pub(crate) struct BatchZipQuery {
    #[serde(default)]
    pub path: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Upload
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of draining an upload body into the destination file.
enum UploadOutcome {
    Complete { received: u64 },
    Cancelled,
    Aborted { reason: String },
}

/// PUT /api/files/upload?path=…&name=…
///
/// Streams the request body into `path/name`, renaming on collision. The
/// body is read in buffered chunks with cancellation checked around every
/// read; an aborted upload deletes the partial file and answers 204 so a
/// mid-flight tab close never surfaces as a server error.
pub(crate) async fn upload_file(
    State(state): State<AppState>,
    jar: CookieJar,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(query): Query<PathNameQuery>,
    request: Request,
) -> MediaBusResult<Response> {
    let device = require_session(&state, &jar, &remote.ip().to_string())?;
    let settings = state.store.settings();
    if !settings.allow_upload {
        return Err(MediaBusError::PolicyDenied("uploads are disabled".into()));
    }

    let segments = parse_path_segments(&query.path)?;
    ensure_visible(&segments, settings.show_hidden_files)?;
    let name = validate_name(&query.name, settings.show_hidden_files)?;
    let root = shared_root(&settings)?;
    let dir = resolve(&root, &segments, true)?;

    let final_name = unique_name(&name, |candidate| dir.join(candidate).exists());
    let dest = dir.join(&final_name);

    let (parts, body) = request.into_parts();
    let content_length = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream");

    let ticket = state
        .runtime
        .begin_transfer(
            &device.device_id,
            Direction::Uploading,
            content_length.unwrap_or(0),
            batch_from_headers(&parts.headers),
        )
        .await
        .ok_or(MediaBusError::NotAuthorized)?;

    log::info!(
        "[Files] {} uploading '{}' ({} bytes, {})",
        device.display_name,
        final_name,
        content_length.unwrap_or(0),
        content_type
    );

    let outcome = drain_body(body, &dest, content_length, &ticket).await?;
    ticket.close();

    match outcome {
        UploadOutcome::Complete { received } => {
            log::info!(
                "[Files] Upload of '{}' complete ({} bytes)",
                final_name,
                received
            );
            Ok(api_success(json!({ "status": "ok", "name": final_name })))
        }
        UploadOutcome::Cancelled => {
            remove_partial(&dest).await;
            Err(MediaBusError::PolicyDenied("Transfer cancelled".into()))
        }
        UploadOutcome::Aborted { reason } => {
            remove_partial(&dest).await;
            log::info!("[Files] Upload of '{}' aborted: {}", final_name, reason);
            Ok(StatusCode::NO_CONTENT.into_response())
        }
    }
}

/// Streams the body into `dest`, checking cancellation before every read and
/// after each write.
///
/// A read timeout with the declared `Content-Length` already satisfied is a
/// clean completion; any other stall or stream error is a client abort.
async fn drain_body(
    body: Body,
    dest: &Path,
    content_length: Option<u64>,
    ticket: &TransferTicket,
) -> MediaBusResult<UploadOutcome> {
    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = body.into_data_stream();
    let mut received: u64 = 0;
    let satisfied = |received: u64| content_length.is_some_and(|expected| received >= expected);

    let outcome = loop {
        if ticket.cancelled() {
            break UploadOutcome::Cancelled;
        }

        let next = tokio::time::timeout(
            Duration::from_secs(BODY_IDLE_TIMEOUT_SECS),
            stream.next(),
        )
        .await;

        match next {
            Err(_elapsed) if satisfied(received) => break UploadOutcome::Complete { received },
            Err(_elapsed) => {
                break UploadOutcome::Aborted {
                    reason: "idle read timeout".into(),
                }
            }
            Ok(None) => {
                if content_length.is_none() || satisfied(received) {
                    break UploadOutcome::Complete { received };
                }
                break UploadOutcome::Aborted {
                    reason: format!(
                        "stream ended at {} of {} bytes",
                        received,
                        content_length.unwrap_or(0)
                    ),
                };
            }
            Ok(Some(Err(e))) => {
                break UploadOutcome::Aborted {
                    reason: e.to_string(),
                }
            }
            Ok(Some(Ok(chunk))) => {
                file.write_all(&chunk).await.map_err(|e| {
                    MediaBusError::Internal(format!("write to destination failed: {}", e))
                })?;
                received += chunk.len() as u64;
                ticket.add_progress(chunk.len() as u64);
                if ticket.cancelled() {
                    break UploadOutcome::Cancelled;
                }
                if satisfied(received) {
                    break UploadOutcome::Complete { received };
                }
            }
        }
    };

    if matches!(outcome, UploadOutcome::Complete { .. }) {
        file.flush().await?;
    }
    Ok(outcome)
}

async fn remove_partial(dest: &Path) {
    if let Err(e) = tokio::fs::remove_file(dest).await {
        log::warn!("[Files] Failed to remove partial upload {:?}: {}", dest, e);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Delete / Mkdir / Rename
// ─────────────────────────────────────────────────────────────────────────────

/// DELETE /api/files/delete?path=…
pub(crate) async fn delete_entry(
    State(state): State<AppState>,
    jar: CookieJar,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(query): Query<PathQuery>,
) -> MediaBusResult<Response> {
    let device = require_session(&state, &jar, &remote.ip().to_string())?;
    let settings = state.store.settings();
    if !settings.allow_delete {
        return Err(MediaBusError::PolicyDenied("deletion is disabled".into()));
    }

    let segments = parse_path_segments(&query.path)?;
    if segments.is_empty() {
        return Err(MediaBusError::Validation("cannot delete the root".into()));
    }
    ensure_visible(&segments, settings.show_hidden_files)?;
    let root = shared_root(&settings)?;
    let path = resolve(&root, &segments, false)?;

    if path.is_dir() {
        tokio::fs::remove_dir_all(&path).await?;
    } else {
        tokio::fs::remove_file(&path).await?;
    }
    log::info!(
        "[Files] {} deleted '{}'",
        device.display_name,
        segments.join("/")
    );
    Ok(api_success(json!({ "status": "ok" })))
}

/// POST /api/files/mkdir?path=…&name=…
pub(crate) async fn make_directory(
    State(state): State<AppState>,
    jar: CookieJar,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(query): Query<PathNameQuery>,
) -> MediaBusResult<Response> {
    let _device = require_session(&state, &jar, &remote.ip().to_string())?;
    let settings = state.store.settings();
    if !settings.allow_upload {
        return Err(MediaBusError::PolicyDenied("uploads are disabled".into()));
    }

    let segments = parse_path_segments(&query.path)?;
    ensure_visible(&segments, settings.show_hidden_files)?;
    let name = validate_name(&query.name, settings.show_hidden_files)?;
    let root = shared_root(&settings)?;
    let dir = resolve(&root, &segments, false)?;

    let target = dir.join(&name);
    if target.exists() {
        return Err(MediaBusError::Conflict(name));
    }
    tokio::fs::create_dir(&target).await?;
    Ok(api_success(json!({
        "status": "ok",
        "path": rel_path(&segments, &name),
    })))
}

/// POST /api/files/rename?path=…&name=…
pub(crate) async fn rename_entry(
    State(state): State<AppState>,
    jar: CookieJar,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(query): Query<PathNameQuery>,
) -> MediaBusResult<Response> {
    let _device = require_session(&state, &jar, &remote.ip().to_string())?;
    let settings = state.store.settings();
    if !settings.allow_upload {
        return Err(MediaBusError::PolicyDenied("uploads are disabled".into()));
    }

    let segments = parse_path_segments(&query.path)?;
    if segments.is_empty() {
        return Err(MediaBusError::Validation("cannot rename the root".into()));
    }
    ensure_visible(&segments, settings.show_hidden_files)?;
    let name = validate_name(&query.name, settings.show_hidden_files)?;
    let root = shared_root(&settings)?;
    let source = resolve(&root, &segments, false)?;

    let parent_segments = &segments[..segments.len() - 1];
    let target = source
        .parent()
        .map(|p| p.join(&name))
        .ok_or_else(|| MediaBusError::Validation("invalid rename target".into()))?;
    if target.exists() {
        return Err(MediaBusError::Conflict(name));
    }
    tokio::fs::rename(&source, &target).await?;

    Ok(api_success(json!({
        "status": "ok",
        "path": rel_path(parent_segments, &name),
        "renamed": name,
    })))
}
