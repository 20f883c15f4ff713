//! mDNS service advertisement for network discovery.
//!
//! This is best-effort - failure is logged but doesn't prevent the service
//! from running. On hosts where multicast needs an explicit OS hold, the
//! platform layer acquires it around this advertiser's lifetime.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use mdns_sd::{ServiceDaemon, ServiceInfo};

use crate::protocol_constants::{MDNS_INSTANCE_NAME, MDNS_SERVICE_TYPE};

/// Advertises the MediaBus HTTPS service via mDNS/DNS-SD.
///
/// When created, registers the service with the local mDNS responder.
/// The service is automatically unregistered when dropped.
pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
    service_fullname: String,
    hostname: String,
    /// Tracks whether shutdown has been called to prevent double unregister.
    shutdown_called: AtomicBool,
}

impl MdnsAdvertiser {
    /// Creates and registers an mDNS advertisement for the bound address.
    ///
    /// # Errors
    /// Returns an error if the mDNS daemon cannot be created or the service
    /// cannot be registered (e.g., multicast unavailable on the system).
    pub fn start(
        advertise_ip: IpAddr,
        port: u16,
        host_label: &str,
    ) -> Result<Self, mdns_sd::Error> {
        let daemon = ServiceDaemon::new()?;
        let hostname = format!("{}.local", host_label);

        let mut txt = HashMap::new();
        txt.insert("path".to_string(), "/".to_string());
        txt.insert("host".to_string(), hostname.clone());

        let service = ServiceInfo::new(
            MDNS_SERVICE_TYPE,
            MDNS_INSTANCE_NAME,
            &format!("{}.", hostname),
            advertise_ip,
            port,
            Some(txt),
        )?;

        let fullname = service.get_fullname().to_string();
        daemon.register(service)?;

        log::info!(
            "[mDNS] Advertising '{}' as {} at {}:{}",
            MDNS_INSTANCE_NAME,
            hostname,
            advertise_ip,
            port
        );

        Ok(Self {
            daemon,
            service_fullname: fullname,
            hostname,
            shutdown_called: AtomicBool::new(false),
        })
    }

    /// The hostname browsers resolve for this advertisement.
    #[must_use]
    pub fn advertised_hostname(&self) -> &str {
        &self.hostname
    }

    /// Unregisters the service from mDNS.
    ///
    /// Called automatically on drop, but can be called manually for explicit
    /// cleanup. Safe to call multiple times - subsequent calls are no-ops.
    pub fn stop(&self) {
        // Only unregister once
        if self.shutdown_called.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.daemon.unregister(&self.service_fullname) {
            log::warn!("[mDNS] Failed to unregister service: {}", e);
        }
    }
}

impl Drop for MdnsAdvertiser {
    fn drop(&mut self) {
        self.stop();
    }
}
