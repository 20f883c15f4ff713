//! HTTP route handlers for pairing, sessions and the fixed REST surface.
//!
//! All handlers are thin - they decode the request, consult the runtime,
//! and shape the fixed JSON contract the browser SPA relies on.

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::Router;
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use qrcode::render::svg;
use qrcode::QrCode;
use serde::Deserialize;
use serde_json::json;

use crate::error::{MediaBusError, MediaBusResult};
use crate::protocol_constants::{
    ANON_COOKIE, ANON_COOKIE_MAX_AGE_DAYS, APP_NAME, QR_MODULE_SIZE, SESSION_COOKIE,
    SESSION_TTL_MS,
};
use crate::runtime::{PairedDevice, PairingPoll};
use crate::utils::random_token;

use super::response::{api_ok, api_success};
use super::{assets, files, AppState};

/// Creates the Axum router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/bootstrap", get(bootstrap))
        .route("/api/pair/status", get(pair_status))
        .route("/api/session/disconnect", post(disconnect_session))
        .route("/api/heartbeat", post(heartbeat))
        .route("/api/transfers/summary", get(transfer_summary))
        .route("/api/files/list", get(files::list_files))
        .route("/api/files/download", get(files::download_file))
        .route("/api/files/download-zip", get(files::download_zip))
        .route(
            "/api/files/download-zip-batch",
            get(files::download_zip_batch),
        )
        .route("/api/files/upload", put(files::upload_file))
        .route("/api/files/delete", delete(files::delete_entry))
        .route("/api/files/mkdir", post(files::make_directory))
        .route("/api/files/rename", post(files::rename_entry))
        .route("/api/qr", get(qr_svg))
        .fallback(assets::serve)
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Session Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Authenticates the session cookie, touching presence timestamps.
pub(crate) fn require_session(
    state: &AppState,
    jar: &CookieJar,
    ip: &str,
) -> MediaBusResult<PairedDevice> {
    let cookie = jar.get(SESSION_COOKIE).map(|c| c.value().to_string());
    state
        .runtime
        .authenticate_session(cookie.as_deref(), ip, true)
        .ok_or(MediaBusError::NotAuthorized)
}

fn session_cookie(value: String) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, value))
        .path("/")
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::milliseconds(SESSION_TTL_MS as i64))
        .build()
}

fn anon_cookie(value: String) -> Cookie<'static> {
    Cookie::build((ANON_COOKIE, value))
        .path("/")
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Lax)
        .max_age(time::Duration::days(ANON_COOKIE_MAX_AGE_DAYS))
        .build()
}

fn clear_session(jar: CookieJar) -> CookieJar {
    jar.remove(Cookie::build((SESSION_COOKIE, "")).path("/").build())
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Liveness probe; also tells native clients where the service lives.
async fn health_check(State(state): State<AppState>) -> Response {
    api_success(json!({
        "status": "ok",
        "host": state.hostname,
        "port": state.port,
    }))
}

/// GET /api/bootstrap
///
/// Paired browsers get their device identity and the host policy snapshot.
/// Unpaired browsers get (or keep) a pairing challenge bound to their
/// anonymous cookie; any stale session cookie is cleared in the same
/// response.
async fn bootstrap(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: axum::http::HeaderMap,
    jar: CookieJar,
) -> Response {
    let ip = remote.ip().to_string();
    let session = jar.get(SESSION_COOKIE).map(|c| c.value().to_string());

    if let Some(device) = state
        .runtime
        .authenticate_session(session.as_deref(), &ip, true)
    {
        let settings = state.store.settings();
        let body = api_success(json!({
            "paired": true,
            "device": { "id": device.device_id, "displayName": device.display_name },
            "host": state.hostname,
            "port": state.port,
            "showHiddenFiles": settings.show_hidden_files,
            "allowUpload": settings.allow_upload,
            "allowDownload": settings.allow_download,
            "allowDelete": settings.allow_delete,
        }));
        return (jar, body).into_response();
    }

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let (anon_id, jar) = match jar.get(ANON_COOKIE) {
        Some(cookie) => (cookie.value().to_string(), jar),
        None => {
            let id = random_token(18);
            let jar = jar.add(anon_cookie(id.clone()));
            (id, jar)
        }
    };
    let jar = clear_session(jar);

    let challenge = state
        .runtime
        .ensure_pending_challenge(&anon_id, user_agent, &ip);
    let qr_payload = format!(
        "mediabus://pair?token={}&code={}",
        utf8_percent_encode(&challenge.token, NON_ALPHANUMERIC),
        challenge.code,
    );

    let body = api_success(json!({
        "paired": false,
        "appName": APP_NAME,
        "pairCode": challenge.code,
        "pairToken": challenge.token,
        "pairExpiresAt": challenge.expires_at_ms,
        "pairQrPayload": qr_payload,
    }));
    (jar, body).into_response()
}

#[derive(Deserialize)]
struct PairStatusQuery {
    token: String,
}

/// GET /api/pair/status?token=…
///
/// The first poll that observes an admitted approval sets the session
/// cookie; later polls of the same token answer `not_found`.
async fn pair_status(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    jar: CookieJar,
    Query(query): Query<PairStatusQuery>,
) -> Response {
    let ip = remote.ip().to_string();
    match state.runtime.poll_pairing(&query.token, &ip) {
        PairingPoll::Pending { expires_at_ms } => api_success(json!({
            "status": "pending",
            "expiresAt": expires_at_ms,
        })),
        PairingPoll::Approved { session_token, .. } => {
            let jar = jar.add(session_cookie(session_token));
            (jar, api_success(json!({ "status": "approved" }))).into_response()
        }
        PairingPoll::Blocked => api_success(json!({
            "status": "blocked",
            "reason": "max_clients",
        })),
        PairingPoll::NotFound => api_success(json!({ "status": "not_found" })),
    }
}

/// POST /api/session/disconnect - idempotent.
async fn disconnect_session(State(state): State<AppState>, jar: CookieJar) -> Response {
    let cookie = jar.get(SESSION_COOKIE).map(|c| c.value().to_string());
    state.runtime.disconnect_session(cookie.as_deref());
    (clear_session(jar), api_ok()).into_response()
}

/// POST /api/heartbeat
///
/// Touches presence for a live session. A session whose device was revoked
/// gets exactly one `revoked` answer while the notice is fresh, so the SPA
/// can explain the disconnect instead of silently failing.
async fn heartbeat(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    jar: CookieJar,
) -> Response {
    let ip = remote.ip().to_string();
    let cookie = jar.get(SESSION_COOKIE).map(|c| c.value().to_string());

    match state
        .runtime
        .authenticate_session(cookie.as_deref(), &ip, true)
    {
        Some(device) => {
            state.runtime.heartbeat(&device.device_id, &ip);
            api_ok()
        }
        None => match state.runtime.consume_revocation_notice(cookie.as_deref()) {
            Some(message) => MediaBusError::Revoked(message).into_response(),
            None => MediaBusError::NotAuthorized.into_response(),
        },
    }
}

/// GET /api/transfers/summary - aggregate progress for the transfer HUD.
async fn transfer_summary(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    jar: CookieJar,
) -> MediaBusResult<Response> {
    require_session(&state, &jar, &remote.ip().to_string())?;
    let summary = serde_json::to_value(state.runtime.transfer_summary())
        .map_err(|e| MediaBusError::Internal(e.to_string()))?;
    Ok(api_success(summary))
}

#[derive(Deserialize)]
struct QrQuery {
    value: String,
}

/// GET /api/qr?value=… - SVG QR code for the pairing payload.
async fn qr_svg(Query(query): Query<QrQuery>) -> MediaBusResult<Response> {
    let code = QrCode::new(query.value.as_bytes())
        .map_err(|e| MediaBusError::Validation(format!("unencodable value: {}", e)))?;
    let rendered = code
        .render::<svg::Color>()
        .module_dimensions(QR_MODULE_SIZE, QR_MODULE_SIZE)
        .build();
    Ok((
        [(header::CONTENT_TYPE, "image/svg+xml")],
        rendered,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventEmitter;
    use crate::runtime::Runtime;
    use crate::store::DeviceStore;
    use axum::body::Body;
    use axum::extract::connect_info::MockConnectInfo;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct TestHost {
        router: Router,
        runtime: Arc<Runtime>,
        store: Arc<DeviceStore>,
        _data_dir: tempfile::TempDir,
        shared_dir: tempfile::TempDir,
    }

    fn test_host() -> TestHost {
        let data_dir = tempfile::tempdir().unwrap();
        let shared_dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DeviceStore::open(data_dir.path()).unwrap());
        store
            .update_settings(|s| s.shared_folder_path = Some(shared_dir.path().to_path_buf()))
            .unwrap();
        let runtime = Runtime::new(Arc::clone(&store), Arc::new(NoopEventEmitter)).unwrap();

        let state = AppState {
            runtime: Arc::clone(&runtime),
            store: Arc::clone(&store),
            hostname: "mediabus.local".to_string(),
            port: 8443,
        };
        let router = create_router(state)
            .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 4321))));

        TestHost {
            router,
            runtime,
            store,
            _data_dir: data_dir,
            shared_dir,
        }
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Vec<String>, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let cookies = response
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, cookies, body)
    }

    fn cookie_value(cookies: &[String], name: &str) -> Option<String> {
        cookies
            .iter()
            .find(|c| c.starts_with(&format!("{}=", name)))
            .and_then(|c| c.split(';').next())
            .map(|c| c.to_string())
    }

    /// Pairs a browser end to end, returning the `mb_session` cookie pair.
    async fn pair_session(host: &TestHost) -> String {
        let (status, cookies, body) = send(
            &host.router,
            Request::builder()
                .uri("/api/bootstrap")
                .header(header::USER_AGENT, "Mozilla/5.0 Chrome/1 Windows")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["paired"], Value::Bool(false));
        assert!(cookie_value(&cookies, ANON_COOKIE).is_some());

        let code = body["pairCode"].as_str().unwrap().to_string();
        let token = body["pairToken"].as_str().unwrap().to_string();
        assert_eq!(code.len(), 6);
        host.runtime.approve_by_code(&code).unwrap();

        let (status, cookies, body) = send(
            &host.router,
            Request::builder()
                .uri(format!("/api/pair/status?token={}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "approved");
        let session = cookie_value(&cookies, SESSION_COOKIE).expect("session cookie set");

        // One-shot approval: the same token is now gone.
        let (_, cookies, body) = send(
            &host.router,
            Request::builder()
                .uri(format!("/api/pair/status?token={}", token))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(body["status"], "not_found");
        assert!(cookie_value(&cookies, SESSION_COOKIE).is_none());

        session
    }

    #[tokio::test]
    async fn health_reports_host_and_port() {
        let host = test_host();
        let (status, _, body) = send(
            &host.router,
            Request::builder().uri("/health").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["host"], "mediabus.local");
        assert_eq!(body["port"], 8443);
    }

    #[tokio::test]
    async fn fresh_pairing_flow_grants_a_session() {
        let host = test_host();
        let session = pair_session(&host).await;

        let (status, _, body) = send(
            &host.router,
            Request::builder()
                .uri("/api/bootstrap")
                .header(header::COOKIE, &session)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["paired"], Value::Bool(true));
        assert_eq!(body["allowUpload"], Value::Bool(true));
    }

    #[tokio::test]
    async fn upload_then_list_with_collision_rename() {
        let host = test_host();
        let session = pair_session(&host).await;

        for expected in ["a.bin", "a (1).bin"] {
            let (status, _, body) = send(
                &host.router,
                Request::builder()
                    .method("PUT")
                    .uri("/api/files/upload?path=docs&name=a.bin")
                    .header(header::COOKIE, &session)
                    .header(header::CONTENT_LENGTH, "4")
                    .body(Body::from(&[0xDE, 0xAD, 0xBE, 0xEF][..]))
                    .unwrap(),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], "ok");
            assert_eq!(body["name"], expected);
        }

        let (status, _, body) = send(
            &host.router,
            Request::builder()
                .uri("/api/files/list?path=docs")
                .header(header::COOKIE, &session)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let items = body["items"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["name"], "a (1).bin");
        assert_eq!(items[0]["size"], 4);
        assert_eq!(items[1]["name"], "a.bin");
    }

    #[tokio::test]
    async fn upload_download_round_trip() {
        let host = test_host();
        let session = pair_session(&host).await;
        let payload = b"round trip payload".to_vec();

        let (status, _, _) = send(
            &host.router,
            Request::builder()
                .method("PUT")
                .uri("/api/files/upload?path=&name=f.bin")
                .header(header::COOKIE, &session)
                .header(header::CONTENT_LENGTH, payload.len().to_string())
                .body(Body::from(payload.clone()))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let response = host
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/files/download?path=f.bin")
                    .header(header::COOKIE, &session)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap()
            .contains("f.bin"));
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(bytes.to_vec(), payload);
    }

    #[tokio::test]
    async fn path_traversal_is_rejected_without_touching_disk() {
        let host = test_host();
        let session = pair_session(&host).await;

        for uri in [
            "/api/files/list?path=..",
            "/api/files/download?path=../secret",
            "/api/files/delete?path=a%5Cb",
        ] {
            let method = if uri.contains("delete") { "DELETE" } else { "GET" };
            let (status, _, _) = send(
                &host.router,
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header(header::COOKIE, &session)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{} should be 400", uri);
        }
    }

    #[tokio::test]
    async fn hidden_paths_gate_on_setting() {
        let host = test_host();
        let session = pair_session(&host).await;
        std::fs::create_dir(host.shared_dir.path().join(".secret")).unwrap();

        let request = || {
            Request::builder()
                .uri("/api/files/list?path=.secret")
                .header(header::COOKIE, &session)
                .body(Body::empty())
                .unwrap()
        };

        let (status, _, _) = send(&host.router, request()).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        host.store
            .update_settings(|s| s.show_hidden_files = true)
            .unwrap();
        let (status, _, _) = send(&host.router, request()).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn policy_toggles_deny_with_403() {
        let host = test_host();
        let session = pair_session(&host).await;
        host.store
            .update_settings(|s| {
                s.allow_upload = false;
                s.allow_download = false;
                s.allow_delete = false;
            })
            .unwrap();

        let cases = [
            ("PUT", "/api/files/upload?path=&name=x.bin"),
            ("POST", "/api/files/mkdir?path=&name=dir"),
            ("POST", "/api/files/rename?path=x&name=y"),
            ("GET", "/api/files/download?path=x.bin"),
            ("GET", "/api/files/download-zip?path="),
            ("DELETE", "/api/files/delete?path=x.bin"),
        ];
        for (method, uri) in cases {
            let (status, _, _) = send(
                &host.router,
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header(header::COOKIE, &session)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
            assert_eq!(status, StatusCode::FORBIDDEN, "{} {} should be 403", method, uri);
        }
    }

    #[tokio::test]
    async fn unauthenticated_file_access_is_401() {
        let host = test_host();
        let (status, _, _) = send(
            &host.router,
            Request::builder()
                .uri("/api/files/list?path=")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn heartbeat_reports_revocation_once() {
        let host = test_host();
        let session = pair_session(&host).await;

        let views = host.runtime.device_views();
        host.runtime.revoke_device(&views[0].device_id);

        let request = || {
            Request::builder()
                .method("POST")
                .uri("/api/heartbeat")
                .header(header::COOKIE, &session)
                .body(Body::empty())
                .unwrap()
        };

        let (status, _, body) = send(&host.router, request()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["status"], "revoked");

        let (status, _, body) = send(&host.router, request()).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_ne!(body["status"], "revoked");
    }

    #[tokio::test]
    async fn disconnect_twice_is_indistinguishable() {
        let host = test_host();
        let session = pair_session(&host).await;

        for _ in 0..2 {
            let (status, cookies, body) = send(
                &host.router,
                Request::builder()
                    .method("POST")
                    .uri("/api/session/disconnect")
                    .header(header::COOKIE, &session)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], "ok");
            // The clearing cookie is present both times.
            assert!(cookies.iter().any(|c| c.starts_with("mb_session=")));
        }
    }

    #[tokio::test]
    async fn mkdir_conflicts_with_409() {
        let host = test_host();
        let session = pair_session(&host).await;

        let request = || {
            Request::builder()
                .method("POST")
                .uri("/api/files/mkdir?path=&name=docs")
                .header(header::COOKIE, &session)
                .body(Body::empty())
                .unwrap()
        };
        let (status, _, body) = send(&host.router, request()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["path"], "docs");

        let (status, _, _) = send(&host.router, request()).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn qr_renders_svg() {
        let host = test_host();
        let response = host
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/api/qr?value=mediabus%3A%2F%2Fpair%3Ftoken%3Dabc%26code%3D123456")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "image/svg+xml"
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert!(std::str::from_utf8(&bytes).unwrap().contains("<svg"));
    }
}
