//! Registry of live connections.
//!
//! Tracks every accepted connection from registration until close so the
//! controller can enforce the concurrency limit, account for what is in
//! flight, and coordinate shutdown. Entries are slab-allocated; the slab
//! key identifies the slot while a monotonic connection id identifies the
//! connection itself (slot keys are recycled, ids never are).
//!
//! The registry also owns the process-wide shutdown signal: a watch
//! channel that flips once from `false` to `true` and is observed by the
//! listener and every handler.

use crate::error::ServerError;
use chrono::{DateTime, Utc};
use slab::Slab;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

/// Per-connection handle kept by the registry.
///
/// The registry never owns the socket; it holds just enough to identify
/// the connection and to force it closed after a drain timeout.
#[derive(Debug)]
pub struct ConnHandle {
    /// Monotonic connection identifier.
    pub id: u64,
    /// Remote peer address.
    pub peer: SocketAddr,
    /// Force-close trigger; the handler task selects on this.
    pub close: Arc<Notify>,
}

/// Result of a successful registration.
#[derive(Debug)]
pub struct Registration {
    /// Slab slot key, needed to deregister.
    pub key: usize,
    /// Connection identifier assigned by the registry.
    pub id: u64,
    /// Timestamp recorded at registration.
    pub opened_at: DateTime<Utc>,
}

/// Thread-safe registry of active connections.
pub struct Registry {
    /// Registered connection handles, keyed by slab slot.
    slots: Mutex<Slab<ConnHandle>>,
    /// Maximum number of concurrent connections.
    max_connections: usize,
    /// Connection id counter.
    next_id: AtomicU64,
    /// Process-wide shutdown signal, set once.
    shutdown: watch::Sender<bool>,
    /// Woken on every deregistration so drain waiters can re-check.
    drained: Notify,
}

impl Registry {
    /// Create a registry enforcing the given connection limit.
    pub fn new(max_connections: usize) -> Self {
        let (shutdown, _) = watch::channel(false);
        Registry {
            slots: Mutex::new(Slab::with_capacity(max_connections)),
            max_connections,
            next_id: AtomicU64::new(1),
            shutdown,
            drained: Notify::new(),
        }
    }

    /// Register a new connection.
    ///
    /// Fails with `CapacityExceeded` when the connection limit is
    /// reached; the caller then closes the socket without serving it.
    pub fn register(
        &self,
        peer: SocketAddr,
        close: Arc<Notify>,
    ) -> Result<Registration, ServerError> {
        let mut slots = self.slots.lock().unwrap();
        if slots.len() >= self.max_connections {
            return Err(ServerError::CapacityExceeded {
                max: self.max_connections,
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let opened_at = Utc::now();
        let key = slots.insert(ConnHandle { id, peer, close });

        trace!(id, key, peer = %peer, live = slots.len(), "Connection registered");
        Ok(Registration { key, id, opened_at })
    }

    /// Remove a connection, returning its handle if it was registered.
    ///
    /// Safe to call with a stale key; deregistration happens exactly once
    /// per connection even if close paths race.
    pub fn deregister(&self, key: usize) -> Option<ConnHandle> {
        let removed = {
            let mut slots = self.slots.lock().unwrap();
            if slots.contains(key) {
                Some(slots.remove(key))
            } else {
                None
            }
        };

        if let Some(ref handle) = removed {
            trace!(id = handle.id, peer = %handle.peer, key, "Connection deregistered");
            self.drained.notify_waiters();
        }
        removed
    }

    /// Number of currently registered connections.
    pub fn count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    /// Flip the process-wide shutdown signal. Idempotent.
    pub fn broadcast_shutdown(&self) {
        debug!(live = self.count(), "Broadcasting shutdown");
        self.shutdown.send_replace(true);
    }

    /// Obtain a receiver for the shutdown signal.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Wait until every connection has deregistered, or the timeout
    /// elapses with connections still open.
    pub async fn await_drain(&self, timeout: Duration) -> Result<(), ServerError> {
        let deadline = Instant::now() + timeout;

        loop {
            // Arm the waiter before checking the count so a deregistration
            // between the check and the await cannot be missed.
            let mut notified = pin!(self.drained.notified());
            notified.as_mut().enable();

            if self.count() == 0 {
                return Ok(());
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Err(ServerError::DrainTimeout {
                    remaining: self.count(),
                });
            }
        }
    }

    /// Signal every remaining connection to close immediately.
    ///
    /// Returns the number of connections signaled. Entries are removed by
    /// their handlers as they unwind, not here.
    pub fn force_close_all(&self) -> usize {
        let slots = self.slots.lock().unwrap();
        for (_, handle) in slots.iter() {
            handle.close.notify_one();
        }
        slots.len()
    }
}
