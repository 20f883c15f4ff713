//! Application bootstrap and dependency wiring.
//!
//! The composition root: the single place where the store, runtime, event
//! bridge and supervisor are instantiated and wired together.

use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::events::BroadcastEventBridge;
use crate::runtime::Runtime;
use crate::store::{DeviceStore, StoreError};
use crate::supervisor::Supervisor;

/// Errors raised while wiring the core services.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("persistence unavailable: {0}")]
    Store(#[from] StoreError),
}

/// Container for all bootstrapped services.
pub struct BootstrappedServices {
    /// Durable settings/device persistence.
    pub store: Arc<DeviceStore>,
    /// Pairing, session and transfer state machine.
    pub runtime: Arc<Runtime>,
    /// Event bridge between the runtime and host-state observers.
    pub events: Arc<BroadcastEventBridge>,
    /// Network-facing lifecycle owner.
    pub supervisor: Arc<Supervisor>,
    presence_task: tokio::task::JoinHandle<()>,
}

impl BootstrappedServices {
    /// Stops the network stack and background loops.
    pub async fn shutdown(&self) {
        log::info!("[Bootstrap] Beginning graceful shutdown...");
        self.supervisor.stop().await;
        self.presence_task.abort();
        log::info!("[Bootstrap] Shutdown complete");
    }
}

/// Bootstraps the core services against a data directory.
///
/// Wiring order matters: store first (settings and signing secret), then the
/// runtime on top of it, then the supervisor observing both. Must run inside
/// a tokio runtime (the presence loop is spawned here).
pub fn bootstrap_services(data_dir: &Path) -> Result<BootstrappedServices, BootstrapError> {
    let store = Arc::new(DeviceStore::open(data_dir)?);
    let events = Arc::new(BroadcastEventBridge::new());
    let runtime = Runtime::new(Arc::clone(&store), Arc::clone(&events) as _)?;
    let presence_task = runtime.spawn_presence_loop();
    let supervisor = Supervisor::new(
        Arc::clone(&runtime),
        Arc::clone(&store),
        Arc::clone(&events),
    );

    Ok(BootstrappedServices {
        store,
        runtime,
        events,
        supervisor,
        presence_task,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bootstrap_wires_services_against_a_fresh_dir() {
        let dir = tempfile::tempdir().unwrap();
        let services = bootstrap_services(dir.path()).unwrap();
        assert!(services.runtime.device_views().is_empty());
        services.shutdown().await;
    }
}
