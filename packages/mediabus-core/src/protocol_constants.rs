//! Fixed protocol constants for the MediaBus wire contract.
//!
//! Browsers and the native host UI both depend on these values; changing
//! them breaks already-paired clients.

// ─────────────────────────────────────────────────────────────────────────────
// Service Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Application name reported in the unpaired bootstrap payload.
pub const APP_NAME: &str = "MediaBus";

/// Fixed TCP port for the HTTPS surface.
pub const SERVICE_PORT: u16 = 8443;

/// Host label advertised over mDNS; browsers reach `mediabus.local`.
pub const SERVICE_HOST_LABEL: &str = "mediabus";

/// mDNS service type registered for discovery.
pub const MDNS_SERVICE_TYPE: &str = "_https._tcp.local.";

/// mDNS instance name.
pub const MDNS_INSTANCE_NAME: &str = "MediaBus";

// ─────────────────────────────────────────────────────────────────────────────
// Cookies
// ─────────────────────────────────────────────────────────────────────────────

/// Signed session cookie; lifetime matches [`SESSION_TTL_MS`].
pub const SESSION_COOKIE: &str = "mb_session";

/// Anonymous pre-pairing cookie used to reuse a pending challenge.
pub const ANON_COOKIE: &str = "mb_anon";

/// Lifetime of the anonymous cookie in days.
pub const ANON_COOKIE_MAX_AGE_DAYS: i64 = 90;

// ─────────────────────────────────────────────────────────────────────────────
// Lifetimes (milliseconds unless noted)
// ─────────────────────────────────────────────────────────────────────────────

/// Session lifetime: 12 hours.
pub const SESSION_TTL_MS: u64 = 12 * 60 * 60 * 1000;

/// Pairing challenge lifetime: 2 minutes.
pub const CHALLENGE_TTL_MS: u64 = 120_000;

/// How long a revocation notice stays consumable.
pub const REVOCATION_NOTICE_TTL_MS: u64 = 60_000;

/// A device with a session counts as `Connected` if touched within this window.
pub const PRESENCE_WINDOW_MS: u64 = 12_000;

/// Interval of the presence/garbage-collection tick.
pub const PRESENCE_TICK_MS: u64 = 1_500;

/// Idle read timeout for request bodies (seconds).
pub const BODY_IDLE_TIMEOUT_SECS: u64 = 60;

/// Delay before the single bind retry when the address is in use.
pub const BIND_RETRY_DELAY_MS: u64 = 400;

// ─────────────────────────────────────────────────────────────────────────────
// Limits
// ─────────────────────────────────────────────────────────────────────────────

/// Paired devices beyond this count evict the oldest by creation time.
pub const MAX_PAIRED_DEVICES: usize = 20;

/// Maximum distinct devices holding concurrent sessions.
pub const MAX_SESSION_DEVICES: usize = 5;

/// Buffer size for streaming transfer I/O.
pub const TRANSFER_CHUNK_SIZE: usize = 8 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Token Material
// ─────────────────────────────────────────────────────────────────────────────

/// HMAC signing secret length in bytes.
pub const SIGNING_SECRET_LEN: usize = 32;

/// Random bytes behind a pairing challenge token.
pub const CHALLENGE_TOKEN_LEN: usize = 24;

/// Random bytes behind a session id.
pub const SESSION_ID_LEN: usize = 24;

/// Digits in the human-readable pairing code.
pub const PAIR_CODE_DIGITS: usize = 6;

// ─────────────────────────────────────────────────────────────────────────────
// QR Rendering
// ─────────────────────────────────────────────────────────────────────────────

/// Pixels per QR module in the rendered SVG.
pub const QR_MODULE_SIZE: u32 = 4;
