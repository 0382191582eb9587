//! Lifecycle events for external observers.
//!
//! The server publishes connection and state-change events on a broadcast
//! channel that any number of subscribers (metrics collectors, test
//! harnesses) may tap. Publishing never blocks the data path: if no
//! subscriber is listening, events are dropped after being logged.

use crate::connection::CloseReason;
use crate::server::ServerState;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Capacity of the broadcast channel. Slow subscribers that fall more
/// than this many events behind see `RecvError::Lagged`.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A lifecycle event.
#[derive(Debug, Clone)]
pub enum Event {
    /// A connection was accepted and registered.
    ConnectionOpened {
        /// Connection identifier.
        id: u64,
        /// Remote peer address.
        peer: SocketAddr,
        /// When the connection was accepted.
        opened_at: DateTime<Utc>,
    },
    /// A connection was closed.
    ConnectionClosed {
        /// Connection identifier.
        id: u64,
        /// Remote peer address.
        peer: SocketAddr,
        /// Why the connection closed.
        reason: CloseReason,
        /// Total bytes read from the peer.
        bytes_read: u64,
        /// Total bytes echoed back.
        bytes_written: u64,
    },
    /// The server controller changed state.
    ServerStateChanged {
        /// State before the transition.
        from: ServerState,
        /// State after the transition.
        to: ServerState,
    },
}

/// Fan-out publisher for lifecycle events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a new event bus.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        EventBus { tx }
    }

    /// Subscribe to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish an event, logging it as a side effect.
    pub fn publish(&self, event: Event) {
        match &event {
            Event::ConnectionOpened { id, peer, .. } => {
                debug!(id, peer = %peer, "Connection opened");
            }
            Event::ConnectionClosed {
                id,
                peer,
                reason,
                bytes_read,
                bytes_written,
            } => {
                debug!(
                    id,
                    peer = %peer,
                    reason = ?reason,
                    bytes_read,
                    bytes_written,
                    "Connection closed"
                );
            }
            Event::ServerStateChanged { from, to } => {
                info!(from = ?from, to = ?to, "Server state changed");
            }
        }

        // Err means no active subscribers, which is fine.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(Event::ServerStateChanged {
            from: ServerState::Created,
            to: ServerState::Starting,
        });

        match rx.recv().await.unwrap() {
            Event::ServerStateChanged { from, to } => {
                assert_eq!(from, ServerState::Created);
                assert_eq!(to, ServerState::Starting);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish(Event::ServerStateChanged {
            from: ServerState::Running,
            to: ServerState::Stopping,
        });
    }
}
