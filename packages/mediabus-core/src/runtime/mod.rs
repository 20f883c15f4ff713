//! The stateful heart of the host: pairing, sessions, presence and transfers.
//!
//! All mutable state lives behind a single process-wide lock; every
//! operation here completes in microseconds and never performs I/O while
//! holding it. Streaming transfers interact with the runtime only through
//! [`TransferTicket`] handles, whose progress calls briefly re-acquire the
//! lock. Per-device ordering is enforced by a separate fair lock that is
//! only ever acquired while the global lock is released (see `transfers`).

mod transfers;
mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Mutex as FairMutex;
use uuid::Uuid;

use crate::events::{EventEmitter, HostEvent};
use crate::protocol_constants::{
    CHALLENGE_TOKEN_LEN, CHALLENGE_TTL_MS, MAX_PAIRED_DEVICES, MAX_SESSION_DEVICES,
    PAIR_CODE_DIGITS, PRESENCE_TICK_MS, PRESENCE_WINDOW_MS, REVOCATION_NOTICE_TTL_MS,
    SESSION_ID_LEN, SESSION_TTL_MS,
};
use crate::store::{DeviceStore, StoreError};
use crate::token::{SessionClaims, TokenCodec};
use crate::utils::{friendly_device_name, now_millis, random_digit_code, random_token};

pub use transfers::TransferTicket;
pub use types::{
    ApprovalError, BatchAccounting, BatchSpec, CreateSession, DeviceView, Direction,
    DirectionProgress, PairChallenge, PairedDevice, PairingPoll, Presence, Session, Transfer,
    TransferSummary,
};

/// Per-device in-memory bookkeeping. Never persisted.
pub(crate) struct DeviceRuntime {
    pub(crate) queued_transfers: u32,
    pub(crate) active_transfers: u32,
    pub(crate) last_seen_at_ms: u64,
    /// Bumped on revocation; outstanding tickets compare against it.
    pub(crate) cancel_generation: u64,
    /// Fair FIFO lock serializing transfers for this device. Acquired only
    /// while the global runtime lock is released.
    pub(crate) transfer_lock: Arc<FairMutex<()>>,
}

impl DeviceRuntime {
    fn new(now: u64) -> Self {
        Self {
            queued_transfers: 0,
            active_transfers: 0,
            last_seen_at_ms: now,
            cancel_generation: 0,
            transfer_lock: Arc::new(FairMutex::new(())),
        }
    }
}

/// Per-direction accumulator for overall progress, reset on each batch run.
#[derive(Default)]
pub(crate) struct OverallProgress {
    pub(crate) transferred_bytes: u64,
}

pub(crate) struct RuntimeInner {
    pub(crate) devices: HashMap<String, PairedDevice>,
    /// Pending challenges keyed by anonymous cookie id.
    pub(crate) challenges: HashMap<String, PairChallenge>,
    /// Sessions keyed by session id.
    pub(crate) sessions: HashMap<String, Session>,
    /// Device id -> session id; at most one session per device.
    pub(crate) session_by_device: HashMap<String, String>,
    pub(crate) device_rt: HashMap<String, DeviceRuntime>,
    /// Transfers keyed by transfer id.
    pub(crate) transfers: HashMap<String, Transfer>,
    /// Batch singletons, one per direction.
    pub(crate) batches: [Option<BatchAccounting>; 2],
    pub(crate) overall: [OverallProgress; 2],
    /// Device id -> revocation timestamp.
    pub(crate) revocations: HashMap<String, u64>,
    /// Last published device views, used to suppress no-op presence events.
    last_views: Vec<DeviceView>,
}

/// The single owner of all pairing, session and transfer state.
pub struct Runtime {
    pub(crate) inner: Mutex<RuntimeInner>,
    store: Arc<DeviceStore>,
    codec: TokenCodec,
    pub(crate) emitter: Arc<dyn EventEmitter>,
}

impl Runtime {
    /// Loads persisted devices and the signing secret, returning a shared
    /// runtime handle.
    pub fn new(
        store: Arc<DeviceStore>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Result<Arc<Self>, StoreError> {
        let secret = store.load_or_create_secret()?;
        let devices: HashMap<String, PairedDevice> = store
            .load_devices()
            .into_iter()
            .map(|d| (d.device_id.clone(), d))
            .collect();

        log::info!("[Runtime] Loaded {} paired device(s)", devices.len());

        Ok(Arc::new(Self {
            inner: Mutex::new(RuntimeInner {
                devices,
                challenges: HashMap::new(),
                sessions: HashMap::new(),
                session_by_device: HashMap::new(),
                device_rt: HashMap::new(),
                transfers: HashMap::new(),
                batches: [None, None],
                overall: [OverallProgress::default(), OverallProgress::default()],
                revocations: HashMap::new(),
                last_views: Vec::new(),
            }),
            store,
            codec: TokenCodec::new(secret),
            emitter,
        }))
    }

    /// The token codec bound to this host's signing secret.
    #[must_use]
    pub fn codec(&self) -> &TokenCodec {
        &self.codec
    }

    // ─────────────────────────────────────────────────────────────────────
    // Pairing
    // ─────────────────────────────────────────────────────────────────────

    /// Returns the live challenge for this anonymous id, creating a fresh
    /// one if none exists or the previous one expired. Never yields two live
    /// challenges for the same anonymous id.
    pub fn ensure_pending_challenge(
        &self,
        anon_id: &str,
        user_agent: &str,
        ip: &str,
    ) -> PairChallenge {
        let mut inner = self.inner.lock();
        let now = now_millis();

        if let Some(existing) = inner.challenges.get(anon_id) {
            if existing.expires_at_ms > now {
                return existing.clone();
            }
        }

        let challenge = PairChallenge {
            token: random_token(CHALLENGE_TOKEN_LEN),
            code: random_digit_code(PAIR_CODE_DIGITS),
            user_agent: user_agent.to_string(),
            ip_address: ip.to_string(),
            created_at_ms: now,
            expires_at_ms: now + CHALLENGE_TTL_MS,
            approved_device_id: None,
        };
        inner
            .challenges
            .insert(anon_id.to_string(), challenge.clone());
        drop(inner);

        log::info!("[Runtime] Issued pairing challenge for {}", ip);
        self.emitter.emit(HostEvent::PairingRequested {
            code: challenge.code.clone(),
            expires_at_ms: challenge.expires_at_ms,
        });
        challenge
    }

    /// Approves the unexpired challenge carrying this code, provisioning a
    /// paired device.
    pub fn approve_by_code(&self, code: &str) -> Result<PairedDevice, ApprovalError> {
        self.approve_matching(|c| c.code == code)
    }

    /// Approves the unexpired challenge carrying this token.
    pub fn approve_by_token(&self, token: &str) -> Result<PairedDevice, ApprovalError> {
        self.approve_matching(|c| c.token == token)
    }

    fn approve_matching<F>(&self, matches: F) -> Result<PairedDevice, ApprovalError>
    where
        F: Fn(&PairChallenge) -> bool,
    {
        let mut inner = self.inner.lock();
        let now = now_millis();

        let key = inner
            .challenges
            .iter()
            .find(|(_, c)| matches(c))
            .map(|(k, _)| k.clone())
            .ok_or(ApprovalError::NotFound)?;

        let challenge = inner.challenges.get(&key).expect("key just found");
        if challenge.expires_at_ms <= now {
            inner.challenges.remove(&key);
            return Err(ApprovalError::Expired);
        }

        // Re-approving an already-approved challenge is idempotent.
        if let Some(device_id) = challenge.approved_device_id.clone() {
            return inner
                .devices
                .get(&device_id)
                .cloned()
                .ok_or(ApprovalError::NotFound);
        }

        let challenge = challenge.clone();
        let device = PairedDevice {
            device_id: Uuid::new_v4().to_string(),
            display_name: friendly_device_name(&challenge.user_agent),
            user_agent: challenge.user_agent.clone(),
            last_known_ip: challenge.ip_address.clone(),
            created_at_ms: now,
            last_connected_at_ms: now,
        };
        inner
            .devices
            .insert(device.device_id.clone(), device.clone());
        inner
            .device_rt
            .insert(device.device_id.clone(), DeviceRuntime::new(now));
        if let Some(ch) = inner.challenges.get_mut(&key) {
            ch.approved_device_id = Some(device.device_id.clone());
        }

        // LRU eviction beyond the paired cap, oldest first by creation time.
        while inner.devices.len() > MAX_PAIRED_DEVICES {
            let oldest = inner
                .devices
                .values()
                .min_by_key(|d| d.created_at_ms)
                .map(|d| d.device_id.clone())
                .expect("non-empty device map");
            log::info!("[Runtime] Evicting oldest paired device {}", oldest);
            self.remove_device_locked(&mut inner, &oldest);
        }

        self.persist_devices_locked(&inner);
        drop(inner);

        log::info!(
            "[Runtime] Approved pairing for '{}' ({})",
            device.display_name,
            device.last_known_ip
        );
        self.emitter.emit(HostEvent::DevicesChanged);
        Ok(device)
    }

    /// Polls a challenge by token. The first poll that observes an approval
    /// *and is admitted* consumes the challenge; an approval blocked by the
    /// concurrent-device cap leaves it pending so a later poll may succeed.
    pub fn poll_pairing(&self, token: &str, ip: &str) -> PairingPoll {
        let mut inner = self.inner.lock();
        let now = now_millis();

        let Some(key) = inner
            .challenges
            .iter()
            .find(|(_, c)| c.token == token)
            .map(|(k, _)| k.clone())
        else {
            return PairingPoll::NotFound;
        };

        let challenge = inner.challenges.get(&key).expect("key just found").clone();
        if challenge.expires_at_ms <= now {
            inner.challenges.remove(&key);
            return PairingPoll::NotFound;
        }

        let Some(device_id) = challenge.approved_device_id else {
            return PairingPoll::Pending {
                expires_at_ms: challenge.expires_at_ms,
            };
        };

        match self.create_session_locked(&mut inner, &device_id, ip, now) {
            CreateSession::Created { token } => {
                inner.challenges.remove(&key);
                let device = inner
                    .devices
                    .get(&device_id)
                    .expect("session created for known device")
                    .clone();
                drop(inner);
                self.emitter.emit(HostEvent::DevicesChanged);
                PairingPoll::Approved {
                    session_token: token,
                    device,
                }
            }
            CreateSession::Blocked => PairingPoll::Blocked,
            CreateSession::UnknownDevice => {
                // Device evicted between approval and poll.
                inner.challenges.remove(&key);
                PairingPoll::NotFound
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Sessions
    // ─────────────────────────────────────────────────────────────────────

    /// Creates (or replaces) the session for a paired device, enforcing the
    /// concurrent distinct-device cap.
    pub fn create_session_for_device(&self, device_id: &str, ip: &str) -> CreateSession {
        let mut inner = self.inner.lock();
        let now = now_millis();
        let outcome = self.create_session_locked(&mut inner, device_id, ip, now);
        drop(inner);
        if matches!(outcome, CreateSession::Created { .. }) {
            self.emitter.emit(HostEvent::DevicesChanged);
        }
        outcome
    }

    fn create_session_locked(
        &self,
        inner: &mut RuntimeInner,
        device_id: &str,
        ip: &str,
        now: u64,
    ) -> CreateSession {
        Self::gc_sessions_locked(inner, now);

        if !inner.devices.contains_key(device_id) {
            return CreateSession::UnknownDevice;
        }

        // A device replacing its own session does not count toward admission.
        let has_existing = inner.session_by_device.contains_key(device_id);
        if !has_existing && inner.session_by_device.len() >= MAX_SESSION_DEVICES {
            log::info!(
                "[Runtime] Session admission blocked for {}: {} devices connected",
                device_id,
                inner.session_by_device.len()
            );
            return CreateSession::Blocked;
        }

        if let Some(old_sid) = inner.session_by_device.remove(device_id) {
            inner.sessions.remove(&old_sid);
        }

        let session = Session {
            session_id: random_token(SESSION_ID_LEN),
            device_id: device_id.to_string(),
            expires_at_ms: now + SESSION_TTL_MS,
            last_seen_at_ms: now,
        };
        let claims = SessionClaims::new(&session.session_id, device_id, session.expires_at_ms);
        let token = self.codec.sign(&claims);

        inner
            .session_by_device
            .insert(device_id.to_string(), session.session_id.clone());
        inner.sessions.insert(session.session_id.clone(), session);

        if let Some(device) = inner.devices.get_mut(device_id) {
            device.last_known_ip = ip.to_string();
            device.last_connected_at_ms = now;
        }
        inner
            .device_rt
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceRuntime::new(now))
            .last_seen_at_ms = now;

        self.persist_devices_locked(inner);
        CreateSession::Created { token }
    }

    /// Verifies a session cookie against the signed claims and the in-memory
    /// session table. When `touch` is set, refreshes presence timestamps.
    pub fn authenticate_session(
        &self,
        cookie: Option<&str>,
        ip: &str,
        touch: bool,
    ) -> Option<PairedDevice> {
        let now = now_millis();
        let claims = self.codec.verify_session(cookie?, now)?;

        let mut inner = self.inner.lock();
        let session = inner.sessions.get_mut(&claims.sid)?;
        if session.device_id != claims.device_id || session.expires_at_ms <= now {
            return None;
        }
        if touch {
            session.last_seen_at_ms = now;
        }

        let device_id = claims.device_id;
        let device = inner.devices.get_mut(&device_id)?;
        if touch {
            device.last_known_ip = ip.to_string();
            device.last_connected_at_ms = now;
        }
        let device = device.clone();
        if touch {
            inner
                .device_rt
                .entry(device_id)
                .or_insert_with(|| DeviceRuntime::new(now))
                .last_seen_at_ms = now;
        }
        Some(device)
    }

    /// Removes the session carried by the cookie. Idempotent; a missing or
    /// invalid cookie is a no-op.
    pub fn disconnect_session(&self, cookie: Option<&str>) {
        let Some(cookie) = cookie else { return };
        let Some(claims) = self.codec.verify_session(cookie, now_millis()) else {
            return;
        };

        let mut inner = self.inner.lock();
        if let Some(session) = inner.sessions.remove(&claims.sid) {
            inner.session_by_device.remove(&session.device_id);
            drop(inner);
            log::info!("[Runtime] Session disconnected for {}", claims.device_id);
            self.emitter.emit(HostEvent::DevicesChanged);
        }
    }

    /// Refreshes device presence timestamps and persists the device list.
    pub fn heartbeat(&self, device_id: &str, ip: &str) {
        let mut inner = self.inner.lock();
        let now = now_millis();
        let Some(device) = inner.devices.get_mut(device_id) else {
            return;
        };
        device.last_known_ip = ip.to_string();
        device.last_connected_at_ms = now;
        inner
            .device_rt
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceRuntime::new(now))
            .last_seen_at_ms = now;
        self.persist_devices_locked(&inner);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Revocation
    // ─────────────────────────────────────────────────────────────────────

    /// Revokes a paired device: removes it with all its sessions and
    /// transfers, bumps the cancel generation so in-flight tickets observe
    /// cancellation, and records a consumable revocation notice.
    pub fn revoke_device(&self, device_id: &str) -> bool {
        let mut inner = self.inner.lock();
        if !inner.devices.contains_key(device_id) {
            return false;
        }
        let now = now_millis();
        self.remove_device_locked(&mut inner, device_id);
        inner.revocations.insert(device_id.to_string(), now);
        self.persist_devices_locked(&inner);
        drop(inner);

        log::info!("[Runtime] Revoked device {}", device_id);
        self.emitter.emit(HostEvent::DeviceRevoked {
            device_id: device_id.to_string(),
        });
        self.emitter.emit(HostEvent::DevicesChanged);
        true
    }

    /// Shared teardown for revocation and LRU eviction. Leaves the
    /// `DeviceRuntime` entry in place (with a bumped generation) so
    /// outstanding tickets can still observe cancellation; the presence tick
    /// garbage-collects it once idle.
    fn remove_device_locked(&self, inner: &mut RuntimeInner, device_id: &str) {
        inner.devices.remove(device_id);

        if let Some(sid) = inner.session_by_device.remove(device_id) {
            inner.sessions.remove(&sid);
        }

        // Drop the device's transfers and unwind their batch accounting.
        let doomed: Vec<Transfer> = inner
            .transfers
            .values()
            .filter(|t| t.device_id == device_id)
            .cloned()
            .collect();
        for transfer in doomed {
            inner.transfers.remove(&transfer.id);
            let idx = transfer.direction.index();
            if transfer.active {
                if let Some(batch) = inner.batches[idx].as_mut() {
                    if transfer.batch_id.as_deref() == Some(batch.batch_id.as_str()) {
                        batch.active_files = batch.active_files.saturating_sub(1);
                    }
                }
            }
        }

        // Challenges approved for this device can no longer be consumed.
        inner
            .challenges
            .retain(|_, c| c.approved_device_id.as_deref() != Some(device_id));

        if let Some(rt) = inner.device_rt.get_mut(device_id) {
            rt.cancel_generation += 1;
            rt.queued_transfers = 0;
            rt.active_transfers = 0;
        }
    }

    /// Decodes the cookie's device id and returns (clearing) a pending
    /// revocation notice, if one is present and unexpired.
    pub fn consume_revocation_notice(&self, cookie: Option<&str>) -> Option<String> {
        let claims = self.codec.verify_session(cookie?, now_millis())?;
        let mut inner = self.inner.lock();
        let now = now_millis();

        let revoked_at = *inner.revocations.get(&claims.device_id)?;
        inner.revocations.remove(&claims.device_id);
        if now.saturating_sub(revoked_at) > REVOCATION_NOTICE_TTL_MS {
            return None;
        }
        Some("Access to this host was revoked".to_string())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Presence & Maintenance
    // ─────────────────────────────────────────────────────────────────────

    /// Current host-UI view of paired devices with presence tags.
    #[must_use]
    pub fn device_views(&self) -> Vec<DeviceView> {
        let inner = self.inner.lock();
        Self::device_views_locked(&inner, now_millis())
    }

    fn device_views_locked(inner: &RuntimeInner, now: u64) -> Vec<DeviceView> {
        let mut views: Vec<DeviceView> = inner
            .devices
            .values()
            .map(|d| DeviceView {
                device_id: d.device_id.clone(),
                display_name: d.display_name.clone(),
                last_known_ip: d.last_known_ip.clone(),
                last_connected_at_ms: d.last_connected_at_ms,
                presence: Self::presence_locked(inner, &d.device_id, now),
            })
            .collect();
        views.sort_by(|a, b| b.last_connected_at_ms.cmp(&a.last_connected_at_ms));
        views
    }

    fn presence_locked(inner: &RuntimeInner, device_id: &str, now: u64) -> Presence {
        let rt = inner.device_rt.get(device_id);
        if let Some(rt) = rt {
            if rt.queued_transfers + rt.active_transfers > 0 {
                return Presence::Transferring;
            }
        }

        let live_session = inner
            .session_by_device
            .get(device_id)
            .and_then(|sid| inner.sessions.get(sid))
            .filter(|s| s.expires_at_ms > now);
        if let Some(session) = live_session {
            let last_seen = rt
                .map(|rt| rt.last_seen_at_ms.max(session.last_seen_at_ms))
                .unwrap_or(session.last_seen_at_ms);
            if now.saturating_sub(last_seen) <= PRESENCE_WINDOW_MS {
                return Presence::Connected;
            }
        }
        Presence::Disconnected
    }

    /// One presence/GC tick: expires challenges, sessions and notices,
    /// drops idle runtime entries for departed devices, and publishes a
    /// devices-changed event when the visible view moved.
    pub fn tick(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let now = now_millis();

        inner.challenges.retain(|_, c| c.expires_at_ms > now);
        Self::gc_sessions_locked(inner, now);
        inner
            .revocations
            .retain(|_, revoked_at| now.saturating_sub(*revoked_at) <= REVOCATION_NOTICE_TTL_MS);

        // Runtime entries for revoked/evicted devices linger only while
        // transfers are still draining.
        let devices = &inner.devices;
        let transfers = &inner.transfers;
        inner.device_rt.retain(|id, _| {
            devices.contains_key(id) || transfers.values().any(|t| &t.device_id == id)
        });

        let views = Self::device_views_locked(inner, now);
        let changed = views != inner.last_views;
        inner.last_views = views;
        drop(guard);

        if changed {
            self.emitter.emit(HostEvent::DevicesChanged);
        }
    }

    fn gc_sessions_locked(inner: &mut RuntimeInner, now: u64) {
        let expired: Vec<String> = inner
            .sessions
            .values()
            .filter(|s| s.expires_at_ms <= now)
            .map(|s| s.session_id.clone())
            .collect();
        for sid in expired {
            if let Some(session) = inner.sessions.remove(&sid) {
                inner.session_by_device.remove(&session.device_id);
            }
        }
    }

    /// Spawns the 1.5 s presence/GC loop. The returned handle is aborted on
    /// shutdown.
    pub fn spawn_presence_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(PRESENCE_TICK_MS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                runtime.tick();
            }
        })
    }

    /// Looks up a paired device by id.
    #[must_use]
    pub fn paired_device(&self, device_id: &str) -> Option<PairedDevice> {
        self.inner.lock().devices.get(device_id).cloned()
    }

    /// Persists the device list sorted by last connection, newest first.
    /// A write failure is logged; in-memory state stays authoritative.
    fn persist_devices_locked(&self, inner: &RuntimeInner) {
        let mut devices: Vec<PairedDevice> = inner.devices.values().cloned().collect();
        devices.sort_by(|a, b| b.last_connected_at_ms.cmp(&a.last_connected_at_ms));
        if let Err(e) = self.store.save_devices(&devices) {
            log::error!("[Runtime] Failed to persist device list: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventEmitter;

    fn test_runtime() -> (Arc<Runtime>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DeviceStore::open(dir.path()).unwrap());
        let runtime = Runtime::new(store, Arc::new(NoopEventEmitter)).unwrap();
        (runtime, dir)
    }

    fn pair(runtime: &Runtime, anon: &str) -> (String, String) {
        let challenge = runtime.ensure_pending_challenge(anon, "Mozilla/5.0 Chrome/1", "10.0.0.2");
        runtime.approve_by_code(&challenge.code).unwrap();
        match runtime.poll_pairing(&challenge.token, "10.0.0.2") {
            PairingPoll::Approved {
                session_token,
                device,
            } => (device.device_id, session_token),
            other => panic!("expected approval, got {:?}", other),
        }
    }

    #[test]
    fn challenge_is_reused_while_live() {
        let (runtime, _dir) = test_runtime();
        let first = runtime.ensure_pending_challenge("anon", "ua", "10.0.0.2");
        let second = runtime.ensure_pending_challenge("anon", "ua", "10.0.0.2");
        assert_eq!(first.token, second.token);
        assert_eq!(first.code, second.code);
    }

    #[test]
    fn expired_challenge_is_replaced_and_old_token_dies() {
        let (runtime, _dir) = test_runtime();
        let first = runtime.ensure_pending_challenge("anon", "ua", "10.0.0.2");

        runtime
            .inner
            .lock()
            .challenges
            .get_mut("anon")
            .unwrap()
            .expires_at_ms = 1;

        let second = runtime.ensure_pending_challenge("anon", "ua", "10.0.0.2");
        assert_ne!(first.token, second.token);
        assert!(matches!(
            runtime.poll_pairing(&first.token, "10.0.0.2"),
            PairingPoll::NotFound
        ));
    }

    #[test]
    fn approval_is_observable_exactly_once() {
        let (runtime, _dir) = test_runtime();
        let challenge = runtime.ensure_pending_challenge("anon", "ua", "10.0.0.2");

        assert!(matches!(
            runtime.poll_pairing(&challenge.token, "10.0.0.2"),
            PairingPoll::Pending { .. }
        ));

        runtime.approve_by_code(&challenge.code).unwrap();
        assert!(matches!(
            runtime.poll_pairing(&challenge.token, "10.0.0.2"),
            PairingPoll::Approved { .. }
        ));
        assert!(matches!(
            runtime.poll_pairing(&challenge.token, "10.0.0.2"),
            PairingPoll::NotFound
        ));
    }

    #[test]
    fn approve_unknown_and_expired_codes() {
        let (runtime, _dir) = test_runtime();
        assert_eq!(
            runtime.approve_by_code("000000").unwrap_err(),
            ApprovalError::NotFound
        );

        let challenge = runtime.ensure_pending_challenge("anon", "ua", "10.0.0.2");
        runtime
            .inner
            .lock()
            .challenges
            .get_mut("anon")
            .unwrap()
            .expires_at_ms = 1;
        assert_eq!(
            runtime.approve_by_code(&challenge.code).unwrap_err(),
            ApprovalError::Expired
        );
    }

    #[test]
    fn sixth_device_is_blocked_until_a_revoke() {
        let (runtime, _dir) = test_runtime();
        let mut devices = Vec::new();
        for i in 0..MAX_SESSION_DEVICES {
            devices.push(pair(&runtime, &format!("anon-{}", i)));
        }

        let challenge = runtime.ensure_pending_challenge("anon-extra", "ua", "10.0.0.9");
        runtime.approve_by_code(&challenge.code).unwrap();
        assert!(matches!(
            runtime.poll_pairing(&challenge.token, "10.0.0.9"),
            PairingPoll::Blocked
        ));

        assert!(runtime.revoke_device(&devices[0].0));
        assert!(matches!(
            runtime.poll_pairing(&challenge.token, "10.0.0.9"),
            PairingPoll::Approved { .. }
        ));
    }

    #[test]
    fn session_is_replaced_not_duplicated() {
        let (runtime, _dir) = test_runtime();
        let (device_id, first_cookie) = pair(&runtime, "anon");

        let outcome = runtime.create_session_for_device(&device_id, "10.0.0.3");
        let second_cookie = match outcome {
            CreateSession::Created { token } => token,
            other => panic!("expected created, got {:?}", other),
        };

        assert_eq!(runtime.inner.lock().sessions.len(), 1);
        assert!(runtime
            .authenticate_session(Some(&first_cookie), "10.0.0.3", false)
            .is_none());
        assert!(runtime
            .authenticate_session(Some(&second_cookie), "10.0.0.3", false)
            .is_some());
    }

    #[test]
    fn authenticate_touch_updates_presence() {
        let (runtime, _dir) = test_runtime();
        let (device_id, cookie) = pair(&runtime, "anon");

        let device = runtime
            .authenticate_session(Some(&cookie), "10.0.0.42", true)
            .unwrap();
        assert_eq!(device.last_known_ip, "10.0.0.42");

        let views = runtime.device_views();
        assert_eq!(views[0].device_id, device_id);
        assert_eq!(views[0].presence, Presence::Connected);
    }

    #[test]
    fn authenticate_rejects_garbage_and_missing_cookie() {
        let (runtime, _dir) = test_runtime();
        assert!(runtime.authenticate_session(None, "1.2.3.4", true).is_none());
        assert!(runtime
            .authenticate_session(Some("not.a.token"), "1.2.3.4", true)
            .is_none());
    }

    #[test]
    fn disconnect_is_idempotent() {
        let (runtime, _dir) = test_runtime();
        let (_, cookie) = pair(&runtime, "anon");

        runtime.disconnect_session(Some(&cookie));
        runtime.disconnect_session(Some(&cookie));
        assert!(runtime
            .authenticate_session(Some(&cookie), "10.0.0.2", false)
            .is_none());
    }

    #[test]
    fn revocation_notice_is_consumed_once() {
        let (runtime, _dir) = test_runtime();
        let (device_id, cookie) = pair(&runtime, "anon");

        assert!(runtime.revoke_device(&device_id));
        assert!(runtime
            .authenticate_session(Some(&cookie), "10.0.0.2", true)
            .is_none());

        assert!(runtime.consume_revocation_notice(Some(&cookie)).is_some());
        assert!(runtime.consume_revocation_notice(Some(&cookie)).is_none());
    }

    #[test]
    fn revoking_unknown_device_returns_false() {
        let (runtime, _dir) = test_runtime();
        assert!(!runtime.revoke_device("no-such-device"));
    }

    #[test]
    fn pairing_beyond_cap_evicts_oldest() {
        let (runtime, _dir) = test_runtime();
        let mut first_device = None;
        for i in 0..=MAX_PAIRED_DEVICES {
            // Sessions would hit the concurrency cap first, so pair without
            // polling: approve provisions the device directly.
            let anon = format!("anon-{}", i);
            let challenge = runtime.ensure_pending_challenge(&anon, "ua", "10.0.0.2");
            let device = runtime.approve_by_code(&challenge.code).unwrap();
            if i == 0 {
                first_device = Some(device.device_id.clone());
                // Make the first device strictly oldest.
                runtime
                    .inner
                    .lock()
                    .devices
                    .get_mut(&device.device_id)
                    .unwrap()
                    .created_at_ms = 1;
            }
        }

        let inner = runtime.inner.lock();
        assert_eq!(inner.devices.len(), MAX_PAIRED_DEVICES);
        assert!(!inner.devices.contains_key(&first_device.unwrap()));
    }

    #[test]
    fn tick_expires_sessions_and_notices() {
        let (runtime, _dir) = test_runtime();
        let (device_id, cookie) = pair(&runtime, "anon");

        {
            let mut inner = runtime.inner.lock();
            let sid = inner.session_by_device.get(&device_id).unwrap().clone();
            inner.sessions.get_mut(&sid).unwrap().expires_at_ms = 1;
            inner.revocations.insert("ghost".to_string(), 1);
        }

        runtime.tick();

        let inner = runtime.inner.lock();
        assert!(inner.sessions.is_empty());
        assert!(inner.session_by_device.is_empty());
        assert!(!inner.revocations.contains_key("ghost"));
        drop(inner);

        assert!(runtime
            .authenticate_session(Some(&cookie), "10.0.0.2", false)
            .is_none());
    }
}
