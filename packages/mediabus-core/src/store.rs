//! Durable persistence for paired devices, host settings and the signing secret.
//!
//! Everything lives as small JSON (or raw base64) files inside a data
//! directory restricted to the current user. Writes go through a temp file
//! with fsync and rename so a crash mid-write never leaves a torn file.
//! The runtime is the single writer; a process-local lock still serializes
//! concurrent saves defensively.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use rand::RngCore;
use thiserror::Error;
use tokio::sync::watch;

use crate::protocol_constants::SIGNING_SECRET_LEN;
use crate::runtime::PairedDevice;
use crate::state::HostSettings;
use crate::utils::now_millis;

const SETTINGS_FILE: &str = "settings.json";
const DEVICES_FILE: &str = "devices.json";
const SECRET_FILE: &str = "secret";

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("store encoding error: {0}")]
    Encoding(String),
}

/// Durable key-value style store backing the runtime.
pub struct DeviceStore {
    data_dir: PathBuf,
    write_lock: Mutex<()>,
    settings_tx: watch::Sender<HostSettings>,
}

impl DeviceStore {
    /// Opens (creating if needed) the store at `data_dir` and loads settings.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;
        restrict_dir_permissions(&data_dir);

        let settings = load_json_or_default::<HostSettings>(&data_dir.join(SETTINGS_FILE));
        let (settings_tx, _) = watch::channel(settings);

        Ok(Self {
            data_dir,
            write_lock: Mutex::new(()),
            settings_tx,
        })
    }

    /// Returns the current settings snapshot.
    #[must_use]
    pub fn settings(&self) -> HostSettings {
        self.settings_tx.borrow().clone()
    }

    /// Returns a receiver observing every settings change.
    #[must_use]
    pub fn watch_settings(&self) -> watch::Receiver<HostSettings> {
        self.settings_tx.subscribe()
    }

    /// Applies a mutation to the settings, persists and republishes them.
    pub fn update_settings<F>(&self, mutate: F) -> Result<HostSettings, StoreError>
    where
        F: FnOnce(&mut HostSettings),
    {
        let _guard = self.write_lock.lock();
        let mut settings = self.settings_tx.borrow().clone();
        mutate(&mut settings);

        let json = serde_json::to_vec_pretty(&settings)
            .map_err(|e| StoreError::Encoding(e.to_string()))?;
        atomic_write(&self.data_dir.join(SETTINGS_FILE), &json)?;

        self.settings_tx.send_replace(settings.clone());
        Ok(settings)
    }

    /// Loads the paired-device list, tolerating a missing or corrupt file.
    ///
    /// A corrupt file is moved aside (never silently deleted) and an empty
    /// list is returned, matching first-run behavior.
    pub fn load_devices(&self) -> Vec<PairedDevice> {
        let path = self.data_dir.join(DEVICES_FILE);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_slice(&data) {
            Ok(devices) => devices,
            Err(e) => {
                log::warn!("[Store] Failed to parse {}: {}", DEVICES_FILE, e);
                let backup = self
                    .data_dir
                    .join(format!("{}.corrupt.{}", DEVICES_FILE, now_millis()));
                if let Err(err) = fs::rename(&path, &backup) {
                    log::warn!("[Store] Failed to back up corrupt device list: {}", err);
                }
                Vec::new()
            }
        }
    }

    /// Persists the full paired-device list snapshot.
    ///
    /// The caller (the runtime) provides the list already sorted by
    /// `lastConnectedAtMs` descending; the store writes it verbatim.
    pub fn save_devices(&self, devices: &[PairedDevice]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock();
        let json = serde_json::to_vec_pretty(devices)
            .map_err(|e| StoreError::Encoding(e.to_string()))?;
        atomic_write(&self.data_dir.join(DEVICES_FILE), &json)
    }

    /// Loads the HMAC signing secret, generating and persisting it on first run.
    pub fn load_or_create_secret(&self) -> Result<Vec<u8>, StoreError> {
        let path = self.data_dir.join(SECRET_FILE);
        if let Ok(encoded) = fs::read_to_string(&path) {
            if let Ok(bytes) = URL_SAFE_NO_PAD.decode(encoded.trim()) {
                if bytes.len() == SIGNING_SECRET_LEN {
                    return Ok(bytes);
                }
            }
            log::warn!("[Store] Signing secret unreadable, regenerating");
        }

        let mut secret = vec![0u8; SIGNING_SECRET_LEN];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        let _guard = self.write_lock.lock();
        atomic_write(&path, URL_SAFE_NO_PAD.encode(&secret).as_bytes())?;
        log::info!("[Store] Generated new signing secret");
        Ok(secret)
    }

    /// The directory backing this store (also hosts the TLS identity).
    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

/// Writes `data` to `path` atomically: temp file, owner-only mode, fsync, rename.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, data)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        if let Err(e) = fs::set_permissions(&tmp_path, perms) {
            log::warn!("[Store] Failed to set permissions on {:?}: {}", tmp_path, e);
        }
    }

    let file = fs::File::open(&tmp_path)?;
    file.sync_all()?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn restrict_dir_permissions(dir: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o700);
        if let Err(e) = fs::set_permissions(dir, perms) {
            log::warn!("[Store] Failed to restrict data dir permissions: {}", e);
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}

fn load_json_or_default<T: serde::de::DeserializeOwned + Default>(path: &Path) -> T {
    match fs::read(path) {
        Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
            log::warn!("[Store] Failed to parse {:?}: {}", path, e);
            T::default()
        }),
        Err(_) => T::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str, last_connected: u64) -> PairedDevice {
        PairedDevice {
            device_id: id.to_string(),
            display_name: "Chrome on Windows".to_string(),
            user_agent: "Mozilla/5.0".to_string(),
            last_known_ip: "192.168.1.20".to_string(),
            created_at_ms: 1,
            last_connected_at_ms: last_connected,
        }
    }

    #[test]
    fn fresh_store_has_default_settings() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeviceStore::open(dir.path()).unwrap();
        assert_eq!(store.settings(), HostSettings::default());
        assert!(store.load_devices().is_empty());
    }

    #[test]
    fn settings_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DeviceStore::open(dir.path()).unwrap();
            store
                .update_settings(|s| s.show_hidden_files = true)
                .unwrap();
        }
        let store = DeviceStore::open(dir.path()).unwrap();
        assert!(store.settings().show_hidden_files);
    }

    #[test]
    fn settings_watch_observes_updates() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeviceStore::open(dir.path()).unwrap();
        let rx = store.watch_settings();

        store.update_settings(|s| s.allow_delete = false).unwrap();
        assert!(!rx.borrow().allow_delete);
    }

    #[test]
    fn devices_round_trip_preserving_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeviceStore::open(dir.path()).unwrap();

        let devices = vec![device("b", 200), device("a", 100)];
        store.save_devices(&devices).unwrap();

        let loaded = store.load_devices();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].device_id, "b");
        assert_eq!(loaded[1].device_id, "a");
    }

    #[test]
    fn corrupt_device_list_is_backed_up_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeviceStore::open(dir.path()).unwrap();
        fs::write(dir.path().join(DEVICES_FILE), b"{ not json").unwrap();

        assert!(store.load_devices().is_empty());
        let backups: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("corrupt"))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[test]
    fn secret_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeviceStore::open(dir.path()).unwrap();
        let first = store.load_or_create_secret().unwrap();
        let second = store.load_or_create_secret().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), SIGNING_SECRET_LEN);
    }

    #[test]
    fn truncated_secret_regenerates() {
        let dir = tempfile::tempdir().unwrap();
        let store = DeviceStore::open(dir.path()).unwrap();
        fs::write(dir.path().join(SECRET_FILE), b"c2hvcnQ").unwrap();

        let secret = store.load_or_create_secret().unwrap();
        assert_eq!(secret.len(), SIGNING_SECRET_LEN);
    }
}
