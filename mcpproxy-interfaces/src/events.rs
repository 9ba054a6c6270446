//! Event definitions and the event bus interface
//!
//! The core publishes state changes and auto-disable decisions; embedders
//! subscribe to drive UIs, persistence, or alerting. Publication is
//! fire-and-forget: a bus must never block the caller.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Events emitted by the upstream connection core
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyEvent {
    /// A server's runtime or persisted state changed
    ServerStateChanged {
        server: String,
        old_state: String,
        new_state: String,
        /// Serialized connection snapshot at the time of the change
        snapshot: serde_json::Value,
    },

    /// A server crossed its failure threshold and was auto-disabled
    ServerAutoDisabled { server: String, reason: String },

    /// An OAuth flow needs the user to visit a URL (headless environments)
    OAuthAuthorizationPending {
        server: String,
        authorization_url: String,
    },
}

impl ProxyEvent {
    /// The server this event concerns
    pub fn server(&self) -> &str {
        match self {
            ProxyEvent::ServerStateChanged { server, .. }
            | ProxyEvent::ServerAutoDisabled { server, .. }
            | ProxyEvent::OAuthAuthorizationPending { server, .. } => server,
        }
    }
}

/// Fan-out interface for [`ProxyEvent`]s
pub trait EventBus: Send + Sync {
    /// Publish an event. Must not block; slow subscribers lose events.
    fn publish(&self, event: ProxyEvent);
}

/// Broadcast-channel bus. Lossy by design: when a subscriber lags past the
/// channel capacity it skips ahead rather than applying backpressure to the
/// connection core.
pub struct BroadcastEventBus {
    tx: broadcast::Sender<ProxyEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Subscribe to future events
    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: ProxyEvent) {
        // Send fails only when there are no subscribers; that is fine.
        let _ = self.tx.send(event);
    }
}

/// Bus that discards everything; useful in tests and minimal embedders
#[derive(Default)]
pub struct NullEventBus;

impl EventBus for NullEventBus {
    fn publish(&self, _event: ProxyEvent) {}
}

/// Callback invoked when the core auto-disables a server.
///
/// Arguments are `(server_name, reason)`. The embedder must persist the
/// change (`enabled = false`, `auto_disabled = true`, the reason) and must
/// suppress the next reload triggered by its own write: a file watcher on
/// the persisted configuration has to skip exactly one event after a
/// programmatic write, or the restart it triggers re-enters the same
/// failure cycle.
pub type ServerAutoDisableCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_bus_delivers() {
        let bus = BroadcastEventBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(ProxyEvent::ServerAutoDisabled {
            server: "gh".to_string(),
            reason: "7 consecutive failures".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.server(), "gh");
    }

    #[test]
    fn test_publish_without_subscribers_is_ok() {
        let bus = BroadcastEventBus::new(8);
        bus.publish(ProxyEvent::OAuthAuthorizationPending {
            server: "notion".to_string(),
            authorization_url: "https://example.com/authorize".to_string(),
        });
    }
}
