//! Data model for pairing, sessions and transfers.

use serde::{Deserialize, Serialize};

/// A browser that the host approved for access.
///
/// Created on approval, mutated only by the runtime, destroyed on explicit
/// revocation or LRU eviction.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PairedDevice {
    /// Stable UUID v4 assigned at approval.
    pub device_id: String,
    /// Human-readable name derived from the User-Agent.
    pub display_name: String,
    /// Verbatim User-Agent at pairing time.
    pub user_agent: String,
    /// Last IP the device was seen from.
    pub last_known_ip: String,
    /// Approval timestamp.
    pub created_at_ms: u64,
    /// Last successful authentication or heartbeat.
    pub last_connected_at_ms: u64,
}

/// A pending pairing request: opaque token plus a human-readable code.
#[derive(Debug, Clone)]
pub struct PairChallenge {
    /// URL-safe opaque token the browser polls with.
    pub token: String,
    /// Six-digit zero-padded code the host displays/approves.
    pub code: String,
    /// Requesting browser's User-Agent.
    pub user_agent: String,
    /// Requesting browser's IP.
    pub ip_address: String,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
    /// Set once the host approves; cleared from the pending map when the
    /// approval is consumed by a status poll.
    pub approved_device_id: Option<String>,
}

/// An authorized browser session, backed by a signed cookie.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub device_id: String,
    pub expires_at_ms: u64,
    pub last_seen_at_ms: u64,
}

/// Direction of a streaming transfer, from the browser's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    /// Browser sends bytes to the host.
    Uploading,
    /// Browser fetches bytes from the host.
    Downloading,
}

impl Direction {
    /// Index into per-direction accounting arrays.
    #[must_use]
    pub(crate) fn index(self) -> usize {
        match self {
            Self::Uploading => 0,
            Self::Downloading => 1,
        }
    }
}

/// An in-flight or queued streaming transfer.
#[derive(Debug, Clone)]
pub struct Transfer {
    pub id: String,
    pub device_id: String,
    pub direction: Direction,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
    /// False while queued behind the device's transfer lock.
    pub active: bool,
    /// Snapshot of the device's cancel generation at queue time.
    pub generation: u64,
    pub batch_id: Option<String>,
}

/// Client-declared grouping of transfers in one direction.
///
/// Used only for aggregate progress display; membership is by `batch_id`
/// match against the direction's current singleton.
#[derive(Debug, Clone)]
pub struct BatchAccounting {
    pub batch_id: String,
    pub total_files: u32,
    pub completed_files: u32,
    pub active_files: u32,
    pub total_bytes: u64,
}

/// Batch parameters a client attaches to `beginTransfer`.
#[derive(Debug, Clone)]
pub struct BatchSpec {
    pub id: String,
    pub total_files: u32,
    pub total_bytes: u64,
    pub completed_files: u32,
}

/// Presence tag recomputed by the presence tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Presence {
    /// Queued or active transfers exist for the device.
    Transferring,
    /// Session present and touched within the presence window.
    Connected,
    Disconnected,
}

/// Host-UI view of a paired device.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceView {
    pub device_id: String,
    pub display_name: String,
    pub last_known_ip: String,
    pub last_connected_at_ms: u64,
    pub presence: Presence,
}

/// Aggregate progress for one direction.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DirectionProgress {
    pub total_files: u32,
    pub completed_files: u32,
    pub active_files: u32,
    pub transferred_bytes: u64,
    pub total_bytes: u64,
}

/// Aggregate progress across both directions.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransferSummary {
    pub uploading: DirectionProgress,
    pub downloading: DirectionProgress,
}

/// Result of a pairing status poll.
#[derive(Debug)]
pub enum PairingPoll {
    /// Challenge exists and is not yet approved.
    Pending { expires_at_ms: u64 },
    /// Approval observed and a session was admitted; the challenge is now
    /// consumed and the signed cookie value returned.
    Approved {
        session_token: String,
        device: PairedDevice,
    },
    /// Approval observed but the concurrent-device cap is reached. The
    /// challenge stays pending so a later poll can succeed after a revoke.
    Blocked,
    /// Unknown, expired, or already-consumed token.
    NotFound,
}

/// Why an approval attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalError {
    /// The challenge exists but its TTL has elapsed.
    Expired,
    /// No challenge matches the code/token.
    NotFound,
}

/// Outcome of creating a session for a paired device.
#[derive(Debug)]
pub enum CreateSession {
    /// Session created (replacing any prior session for the device);
    /// carries the signed cookie value.
    Created { token: String },
    /// Admitting this device would exceed the concurrent-device cap.
    Blocked,
    /// The device is not (or no longer) paired.
    UnknownDevice,
}
