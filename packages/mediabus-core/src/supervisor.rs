//! Binds the HTTPS stack to a private IPv4 address and keeps it there.
//!
//! The supervisor selects the bind address, owns the server and mDNS
//! lifetimes, restarts the stack when the address changes, and publishes
//! the observable [`HostState`] the native UI renders.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum_server::Handle;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::api::{start_server, AppState};
use crate::events::{BroadcastEventBridge, HostEvent};
use crate::mdns_advertise::MdnsAdvertiser;
use crate::protocol_constants::{BIND_RETRY_DELAY_MS, SERVICE_HOST_LABEL, SERVICE_PORT};
use crate::runtime::Runtime;
use crate::state::HostState;
use crate::store::DeviceStore;
use crate::tls_identity::TlsIdentity;

struct SupervisorInner {
    server_handle: Option<Handle>,
    server_task: Option<JoinHandle<()>>,
    mdns: Option<MdnsAdvertiser>,
    bound_ip: Option<Ipv4Addr>,
}

/// Owns the network-facing lifetime of the host service.
pub struct Supervisor {
    runtime: Arc<Runtime>,
    store: Arc<DeviceStore>,
    events: Arc<BroadcastEventBridge>,
    host_state: watch::Sender<HostState>,
    inner: Mutex<SupervisorInner>,
}

impl Supervisor {
    /// Creates the supervisor and starts mirroring runtime events into the
    /// published host state.
    pub fn new(
        runtime: Arc<Runtime>,
        store: Arc<DeviceStore>,
        events: Arc<BroadcastEventBridge>,
    ) -> Arc<Self> {
        let initial = HostState {
            hostname: format!("{}.local", SERVICE_HOST_LABEL),
            port: SERVICE_PORT,
            status_text: "Stopped".to_string(),
            ..HostState::default()
        };
        let (host_state, _) = watch::channel(initial);

        let supervisor = Arc::new(Self {
            runtime,
            store,
            events,
            host_state,
            inner: Mutex::new(SupervisorInner {
                server_handle: None,
                server_task: None,
                mdns: None,
                bound_ip: None,
            }),
        });
        supervisor.spawn_event_loop();
        supervisor
    }

    /// Observable host state for the native UI.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<HostState> {
        self.host_state.subscribe()
    }

    /// Starts the TLS listener and mDNS advertisement on the chosen address.
    /// A failed bind is retried once after a short delay when the address is
    /// still held by a previous incarnation.
    pub async fn start(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner.server_task.is_some() {
            return;
        }
        self.publish(|s| {
            s.transitioning = true;
            s.error = None;
            s.status_text = "Starting".to_string();
        });

        let ips = Self::available_ips();
        self.publish(|s| s.available_ips = ips.clone());
        let Some(ip) = ips.first().copied() else {
            self.fail("No private IPv4 address available");
            return;
        };

        let hostname = format!("{}.local", SERVICE_HOST_LABEL);
        let identity = match TlsIdentity::acquire(self.store.data_dir(), &hostname) {
            Ok(identity) => identity,
            Err(e) => {
                self.fail(&format!("TLS identity unavailable: {}", e));
                return;
            }
        };

        let addr = SocketAddr::from((ip, SERVICE_PORT));
        let listener = match bind_with_retry(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.fail(&format!("Failed to bind {}: {}", addr, e));
                return;
            }
        };

        let handle = Handle::new();
        let state = AppState::new(
            Arc::clone(&self.runtime),
            Arc::clone(&self.store),
            hostname.clone(),
            SERVICE_PORT,
        );
        let server_handle = handle.clone();
        let server_task = tokio::spawn(async move {
            if let Err(e) = start_server(state, listener, &identity, server_handle).await {
                log::error!("[Supervisor] Server terminated: {}", e);
            }
        });

        let mdns = match MdnsAdvertiser::start(IpAddr::V4(ip), SERVICE_PORT, SERVICE_HOST_LABEL) {
            Ok(advertiser) => Some(advertiser),
            Err(e) => {
                log::warn!("[Supervisor] mDNS advertisement unavailable: {}", e);
                None
            }
        };

        inner.server_handle = Some(handle);
        inner.server_task = Some(server_task);
        inner.mdns = mdns;
        inner.bound_ip = Some(ip);
        drop(inner);

        log::info!(
            "[Supervisor] Sharing at https://{}:{} ({})",
            hostname,
            SERVICE_PORT,
            ip
        );
        self.publish(|s| {
            s.running = true;
            s.transitioning = false;
            s.ip_address = ip.to_string();
            s.status_text = format!("Sharing at https://{}:{}", hostname, SERVICE_PORT);
        });
        self.refresh_runtime_state();
    }

    /// Stops the listener and withdraws the mDNS advertisement.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if inner.server_task.is_none() && inner.mdns.is_none() {
            return;
        }
        self.publish(|s| {
            s.transitioning = true;
            s.status_text = "Stopping".to_string();
        });

        if let Some(mdns) = inner.mdns.take() {
            mdns.stop();
        }
        if let Some(handle) = inner.server_handle.take() {
            handle.graceful_shutdown(Some(Duration::from_secs(2)));
        }
        if let Some(task) = inner.server_task.take() {
            if let Err(e) = task.await {
                log::warn!("[Supervisor] Server task ended abnormally: {}", e);
            }
        }
        inner.bound_ip = None;
        drop(inner);

        log::info!("[Supervisor] Stopped");
        self.publish(|s| {
            s.running = false;
            s.transitioning = false;
            s.ip_address = String::new();
            s.status_text = "Stopped".to_string();
        });
    }

    /// Reacts to an OS-reported link change: if the preferred address moved,
    /// the stack is torn down and rebuilt on the new one.
    pub async fn handle_link_change(self: &Arc<Self>) {
        let ips = Self::available_ips();
        self.publish(|s| s.available_ips = ips.clone());
        let chosen = ips.first().copied();

        let bound = self.inner.lock().await.bound_ip;
        if bound == chosen {
            return;
        }

        log::info!(
            "[Supervisor] Bind address changed ({:?} -> {:?}), restarting stack",
            bound,
            chosen
        );
        self.stop().await;
        self.start().await;
    }

    /// Candidate bind addresses: private or link-local IPv4, sorted by their
    /// dotted-quad string. The lexicographic order is deliberate - it is not
    /// "best interface" selection, just a deterministic one.
    fn available_ips() -> Vec<Ipv4Addr> {
        match local_ip_address::list_afinet_netifas() {
            Ok(interfaces) => candidate_ips(interfaces.into_iter().map(|(_, ip)| ip)),
            Err(e) => {
                log::warn!("[Supervisor] Failed to enumerate interfaces: {}", e);
                Vec::new()
            }
        }
    }

    fn spawn_event_loop(self: &Arc<Self>) {
        let supervisor = Arc::clone(self);
        let mut rx = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(HostEvent::PairingRequested { code, .. }) => {
                        log::info!("[Supervisor] Pairing requested, code {}", code);
                        supervisor.refresh_runtime_state();
                    }
                    Ok(_) => supervisor.refresh_runtime_state(),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        log::debug!("[Supervisor] Event stream lagged by {}", skipped);
                        supervisor.refresh_runtime_state();
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn refresh_runtime_state(&self) {
        let devices = self.runtime.device_views();
        let summary = self.runtime.transfer_summary();
        self.publish(|s| {
            s.paired_devices = devices;
            s.transfer_summary = summary;
        });
    }

    fn fail(&self, message: &str) {
        log::error!("[Supervisor] {}", message);
        self.publish(|s| {
            s.running = false;
            s.transitioning = false;
            s.error = Some(message.to_string());
            s.status_text = "Error".to_string();
        });
    }

    fn publish<F: FnOnce(&mut HostState)>(&self, mutate: F) {
        self.host_state.send_modify(mutate);
    }
}

/// Filters and orders candidate bind addresses.
fn candidate_ips<I: IntoIterator<Item = IpAddr>>(interfaces: I) -> Vec<Ipv4Addr> {
    let mut ips: Vec<Ipv4Addr> = interfaces
        .into_iter()
        .filter_map(|ip| match ip {
            IpAddr::V4(v4) if v4.is_private() || v4.is_link_local() => Some(v4),
            _ => None,
        })
        .collect();
    ips.sort_by_key(|ip| ip.to_string());
    ips.dedup();
    ips
}

/// Binds the listener, retrying once when the address is still in use by a
/// previous incarnation that has not fully released it.
async fn bind_with_retry(addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
    match bind(addr) {
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            log::warn!("[Supervisor] {} in use, retrying once", addr);
            tokio::time::sleep(Duration::from_millis(BIND_RETRY_DELAY_MS)).await;
            bind(addr)
        }
        other => other,
    }
}

fn bind(addr: SocketAddr) -> std::io::Result<std::net::TcpListener> {
    let listener = std::net::TcpListener::bind(addr)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}
