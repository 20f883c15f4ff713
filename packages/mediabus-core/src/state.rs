//! Host configuration and host-facing observable state.
//!
//! [`HostSettings`] is the configuration snapshot the runtime observes; it is
//! mutated only by the controlling UI (through the device store, which
//! persists and republishes it). [`HostState`] is the aggregate view the host
//! UI renders, published on a watch channel by the supervisor.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::runtime::{DeviceView, TransferSummary};

/// Host policy and shared-folder configuration.
///
/// Defaults: hidden files off, all transfer permissions on, no folder shared.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct HostSettings {
    /// Absolute path of the folder granted to the service, if any.
    pub shared_folder_path: Option<PathBuf>,
    /// Whether dot-prefixed entries are visible and addressable.
    pub show_hidden_files: bool,
    /// Whether browsers may upload into the shared folder.
    pub allow_upload: bool,
    /// Whether browsers may download from the shared folder.
    pub allow_download: bool,
    /// Whether browsers may delete entries in the shared folder.
    pub allow_delete: bool,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            shared_folder_path: None,
            show_hidden_files: false,
            allow_upload: true,
            allow_download: true,
            allow_delete: true,
        }
    }
}

/// Aggregate host-facing state published by the supervisor.
///
/// Consumers (the native host UI) treat this as a read-only snapshot; a new
/// value is published after every relevant mutation.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostState {
    /// Whether the HTTPS surface is accepting connections.
    pub running: bool,
    /// True while the stack is being torn down or rebuilt (address change).
    pub transitioning: bool,
    /// Advertised hostname, e.g. `mediabus.local`.
    pub hostname: String,
    /// Currently bound IPv4 address, dotted-quad, empty when not running.
    pub ip_address: String,
    /// Bound TCP port.
    pub port: u16,
    /// Short human-readable status line.
    pub status_text: String,
    /// Last startup error, if any.
    pub error: Option<String>,
    /// All candidate private IPv4 addresses, sorted.
    pub available_ips: Vec<Ipv4Addr>,
    /// Paired devices with presence tags.
    pub paired_devices: Vec<DeviceView>,
    /// Aggregate transfer progress per direction.
    pub transfer_summary: TransferSummary,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_default_is_permissive_with_hidden_off() {
        let settings = HostSettings::default();
        assert!(settings.shared_folder_path.is_none());
        assert!(!settings.show_hidden_files);
        assert!(settings.allow_upload);
        assert!(settings.allow_download);
        assert!(settings.allow_delete);
    }

    #[test]
    fn settings_round_trip_via_json() {
        let mut settings = HostSettings::default();
        settings.shared_folder_path = Some(PathBuf::from("/srv/share"));
        settings.show_hidden_files = true;

        let encoded = serde_json::to_string(&settings).unwrap();
        let decoded: HostSettings = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, settings);
    }

    #[test]
    fn settings_tolerate_missing_fields() {
        let decoded: HostSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(decoded, HostSettings::default());
    }
}
