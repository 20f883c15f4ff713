//! HTTPS API layer.
//!
//! Thin handlers over the runtime plus the TLS-terminating server startup.
//! The layer is stateless between requests; the runtime owns all mutable
//! pairing/session/transfer state.

use std::net::SocketAddr;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use thiserror::Error;

use crate::runtime::Runtime;
use crate::store::DeviceStore;
use crate::tls_identity::TlsIdentity;

pub mod assets;
pub(crate) mod files;
pub mod http;
pub(crate) mod response;
pub(crate) mod zip_stream;

pub use http::create_router;

/// Errors that can occur when starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind the TCP listener.
    #[error("failed to bind listener: {0}")]
    Bind(std::io::Error),

    /// TLS configuration was rejected.
    #[error("TLS configuration failed: {0}")]
    Tls(std::io::Error),

    /// The accept loop failed.
    #[error("server error: {0}")]
    Serve(std::io::Error),
}

/// Shared application state for the API layer.
///
/// A thin handle bundle; all business logic lives in the runtime and store.
#[derive(Clone)]
pub struct AppState {
    /// Pairing, session and transfer state machine.
    pub runtime: Arc<Runtime>,
    /// Durable settings and paired-device persistence.
    pub store: Arc<DeviceStore>,
    /// Advertised hostname, e.g. `mediabus.local`.
    pub hostname: String,
    /// Bound TCP port.
    pub port: u16,
}

impl AppState {
    /// Bundles the shared services for the HTTP layer.
    pub fn new(
        runtime: Arc<Runtime>,
        store: Arc<DeviceStore>,
        hostname: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            runtime,
            store,
            hostname: hostname.into(),
            port,
        }
    }
}

/// Runs the TLS-terminating HTTP server on an already-bound listener.
///
/// The `handle` lets the supervisor stop the accept loop (and all open
/// connections) when the bind address changes or the host stops sharing.
pub async fn start_server(
    state: AppState,
    listener: std::net::TcpListener,
    identity: &TlsIdentity,
    handle: Handle,
) -> Result<(), ServerError> {
    let config = RustlsConfig::from_der(vec![identity.cert_der()], identity.key_der())
        .await
        .map_err(ServerError::Tls)?;

    let router = create_router(state);
    log::info!(
        "[Server] HTTPS surface listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".to_string())
    );

    axum_server::from_tcp_rustls(listener, config)
        .handle(handle)
        .serve(router.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(ServerError::Serve)?;
    Ok(())
}
