//! Event system connecting the runtime to host-facing observers.
//!
//! The runtime depends on the [`EventEmitter`] trait rather than concrete
//! broadcast channels, enabling testing and alternative transports. The
//! supervisor subscribes through [`BroadcastEventBridge`] and recomputes the
//! published host state on every event.

use serde::Serialize;
use tokio::sync::broadcast;

/// Capacity of the host event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Domain events published after runtime mutations.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HostEvent {
    /// The paired-device set or a device's presence-relevant state changed.
    DevicesChanged,
    /// Transfer counters or batch accounting changed.
    TransfersChanged,
    /// A browser requested pairing; the host UI should surface the code.
    #[serde(rename_all = "camelCase")]
    PairingRequested { code: String, expires_at_ms: u64 },
    /// A device was revoked by the host.
    #[serde(rename_all = "camelCase")]
    DeviceRevoked { device_id: String },
}

/// Trait for emitting domain events without knowledge of transport.
pub trait EventEmitter: Send + Sync {
    /// Emits a host event.
    fn emit(&self, event: HostEvent);
}

/// No-op emitter for tests and embedded use without a host UI.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit(&self, _event: HostEvent) {
        // No-op: nothing observes host state in this configuration
    }
}

/// Bridges domain events onto a tokio broadcast channel.
///
/// Send errors mean no subscriber is currently listening, which is normal
/// before the supervisor starts; they are silently ignored.
pub struct BroadcastEventBridge {
    tx: broadcast::Sender<HostEvent>,
}

impl BroadcastEventBridge {
    /// Creates a bridge with a fresh channel.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Creates a bridge around an existing sender.
    #[must_use]
    pub fn with_sender(tx: broadcast::Sender<HostEvent>) -> Self {
        Self { tx }
    }

    /// Subscribes to the event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl EventEmitter for BroadcastEventBridge {
    fn emit(&self, event: HostEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bridge_delivers_to_subscribers() {
        let bridge = BroadcastEventBridge::new();
        let mut rx = bridge.subscribe();

        bridge.emit(HostEvent::DevicesChanged);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, HostEvent::DevicesChanged));
    }

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bridge = BroadcastEventBridge::new();
        bridge.emit(HostEvent::TransfersChanged);
    }
}
