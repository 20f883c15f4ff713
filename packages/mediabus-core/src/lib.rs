//! MediaBus Core - shared library for the MediaBus host.
//!
//! This crate provides the host runtime for MediaBus, a single-host private
//! file-sharing service that exposes one shared local folder to browsers on
//! the same LAN over HTTPS. It is designed to be embedded by both the native
//! host app and the standalone headless server.
//!
//! # Architecture
//!
//! - [`runtime`]: Pairing, sessions, presence and transfer coordination
//! - [`api`]: TLS-terminating HTTP surface and embedded SPA assets
//! - [`supervisor`]: Bind-address selection and stack lifecycle
//! - [`store`]: Durable settings, paired devices and the signing secret
//! - [`token`]: HMAC-signed opaque tokens for session cookies
//! - [`tls_identity`]: Long-lived self-signed certificate
//! - [`mdns_advertise`]: `_https._tcp` DNS-SD advertisement
//! - [`events`]: Event bridge between runtime and host-state observers
//! - [`error`]: Centralized error types

#![warn(clippy::all)]

pub mod api;
pub mod bootstrap;
pub mod error;
pub mod events;
pub mod mdns_advertise;
pub mod protocol_constants;
pub mod runtime;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod tls_identity;
pub mod token;
pub mod utils;

// Re-export commonly used types at the crate root
pub use api::{create_router, AppState, ServerError};
pub use bootstrap::{bootstrap_services, BootstrapError, BootstrappedServices};
pub use error::{MediaBusError, MediaBusResult};
pub use events::{BroadcastEventBridge, EventEmitter, HostEvent, NoopEventEmitter};
pub use mdns_advertise::MdnsAdvertiser;
pub use runtime::{
    Direction, PairedDevice, PairingPoll, Presence, Runtime, TransferSummary, TransferTicket,
};
pub use state::{HostSettings, HostState};
pub use store::DeviceStore;
pub use supervisor::Supervisor;
pub use tls_identity::TlsIdentity;
pub use token::{SessionClaims, TokenCodec};
pub use utils::now_millis;
