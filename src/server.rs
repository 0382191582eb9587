//! Server controller.
//!
//! Orchestrates the listener, the registry, and per-connection handler
//! tasks through an explicit lifecycle:
//!
//! `Created → Starting → Running → Stopping → Stopped`
//!
//! Startup binds the socket and dispatches the accept loop; shutdown
//! broadcasts the stop signal, waits for connections to drain, and
//! force-closes whatever is left when the drain timeout elapses.
//! `Stopped` is terminal.

use crate::config::Config;
use crate::connection::{CloseReason, Connection};
use crate::error::ServerError;
use crate::events::{Event, EventBus};
use crate::listener::{Accepted, Listener};
use crate::registry::Registry;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Extra time granted to force-closed handlers to unwind and deregister.
const FORCE_CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Controller lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Constructed, not yet started.
    Created,
    /// Binding the listener.
    Starting,
    /// Accepting and serving connections.
    Running,
    /// Shutdown in progress; no new accepts.
    Stopping,
    /// Fully shut down. Terminal.
    Stopped,
}

/// Server instance
pub struct Server {
    config: Config,
    registry: Arc<Registry>,
    events: EventBus,
    state: Mutex<ServerState>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
    /// Create a new server instance in the `Created` state.
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(Registry::new(config.max_connections));

        Server {
            config,
            registry,
            events: EventBus::new(),
            state: Mutex::new(ServerState::Created),
            accept_task: Mutex::new(None),
        }
    }

    /// Current lifecycle state, for tests.
    #[cfg(test)]
    pub fn state(&self) -> ServerState {
        *self.state.lock().unwrap()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.registry.count()
    }

    /// Subscribe to lifecycle events.
    #[allow(dead_code)]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Bind the listener and start accepting connections.
    ///
    /// Only valid in the `Created` state. A bind failure returns the
    /// controller to `Created` along with the error.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        self.transition(ServerState::Created, ServerState::Starting, "start")?;

        let shutdown = self.registry.subscribe_shutdown();
        let listener = match Listener::bind(&self.config.listen, shutdown).await {
            Ok(listener) => listener,
            Err(e) => {
                self.transition(ServerState::Starting, ServerState::Created, "start")?;
                return Err(e);
            }
        };

        let addr = listener.local_addr();

        let registry = Arc::clone(&self.registry);
        let events = self.events.clone();
        let config = self.config.clone();
        let task = tokio::spawn(accept_loop(listener, registry, events, config));
        *self.accept_task.lock().unwrap() = Some(task);

        self.transition(ServerState::Starting, ServerState::Running, "start")?;
        Ok(addr)
    }

    /// Shut the server down gracefully.
    ///
    /// Stops accepting, signals every handler, waits up to the configured
    /// drain timeout, then force-closes whatever remains. Only valid in
    /// the `Running` state; always ends in `Stopped` once entered.
    pub async fn stop(&self) -> Result<(), ServerError> {
        self.transition(ServerState::Running, ServerState::Stopping, "stop")?;

        // The same broadcast stops the accept loop and the handlers
        self.registry.broadcast_shutdown();

        let task = self.accept_task.lock().unwrap().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!(error = %e, "Accept loop task failed");
            }
        }

        if let Err(e) = self.registry.await_drain(self.config.drain_timeout()).await {
            warn!(error = %e, "Connections did not drain in time");
            let forced = self.registry.force_close_all();
            warn!(forced, "Force-closing remaining connections");
            let _ = self.registry.await_drain(FORCE_CLOSE_GRACE).await;
        }

        self.transition(ServerState::Stopping, ServerState::Stopped, "stop")?;
        info!("Server stopped");
        Ok(())
    }

    /// Atomically move `from → to`, failing with `InvalidState` if the
    /// controller is not in `from`.
    fn transition(
        &self,
        from: ServerState,
        to: ServerState,
        operation: &'static str,
    ) -> Result<(), ServerError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != from {
                return Err(ServerError::InvalidState {
                    operation,
                    state: *state,
                });
            }
            *state = to;
        }
        self.events.publish(Event::ServerStateChanged { from, to });
        Ok(())
    }
}

/// Accept connections until shutdown closes the listener.
async fn accept_loop(
    mut listener: Listener,
    registry: Arc<Registry>,
    events: EventBus,
    config: Config,
) {
    loop {
        match listener.accept().await {
            Ok(Accepted::Connection { stream, peer }) => {
                dispatch(stream, peer, &registry, &events, &config);
            }
            Ok(Accepted::Closed) => {
                debug!("Listener closed");
                break;
            }
            Err(e) => {
                // Per-accept failures do not take the loop down
                error!(error = %e, "Failed to accept connection");
            }
        }
    }
}

/// Register an accepted socket and spawn its handler task.
///
/// At capacity the socket is accepted (keeping the kernel backlog clear)
/// and immediately dropped without being served.
fn dispatch(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &Arc<Registry>,
    events: &EventBus,
    config: &Config,
) {
    let close = Arc::new(Notify::new());
    let registration = match registry.register(peer, Arc::clone(&close)) {
        Ok(registration) => registration,
        Err(e) => {
            warn!(peer = %peer, error = %e, "Connection refused");
            drop(stream);
            return;
        }
    };

    events.publish(Event::ConnectionOpened {
        id: registration.id,
        peer,
        opened_at: registration.opened_at,
    });

    let registry = Arc::clone(registry);
    let events = events.clone();
    let shutdown = registry.subscribe_shutdown();
    let buffer_size = config.buffer_size;
    let idle_timeout = config.idle_timeout();

    tokio::spawn(async move {
        let mut conn = Connection::new(registration.id, peer, registration.opened_at, stream);

        let reason = tokio::select! {
            reason = conn.serve(shutdown, buffer_size, idle_timeout) => reason,
            _ = close.notified() => CloseReason::ForceClosed,
        };
        if reason == CloseReason::ForceClosed {
            conn.close().await;
        }

        // Publish before deregistering: once the count drops, observers
        // may assume the close event is already visible
        events.publish(Event::ConnectionClosed {
            id: conn.id,
            peer: conn.peer,
            reason,
            bytes_read: conn.bytes_read,
            bytes_written: conn.bytes_written,
        });
        registry.deregister(registration.key);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_config(max_connections: usize, drain_timeout_secs: u64) -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            max_connections,
            buffer_size: 1024,
            idle_timeout_secs: 0,
            drain_timeout_secs,
            workers: None,
            log_level: "info".to_string(),
        }
    }

    async fn wait_for_count(server: &Server, target: usize) {
        for _ in 0..500 {
            if server.connection_count() == target {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "connection count stuck at {}, wanted {}",
            server.connection_count(),
            target
        );
    }

    async fn echo_roundtrip(client: &mut TcpStream, payload: &[u8]) {
        client.write_all(payload).await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, payload);
    }

    #[tokio::test]
    async fn test_echo_session_lifecycle() {
        let server = Server::new(test_config(8, 5));
        let addr = server.start().await.unwrap();
        assert_eq!(server.state(), ServerState::Running);

        let mut client = TcpStream::connect(addr).await.unwrap();
        echo_roundtrip(&mut client, b"ping").await;
        assert_eq!(server.connection_count(), 1);

        // Closing the write side ends the session; registry drains to 0
        drop(client);
        wait_for_count(&server, 0).await;

        server.stop().await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn test_capacity_refusal() {
        let server = Server::new(test_config(2, 5));
        let addr = server.start().await.unwrap();

        let mut c1 = TcpStream::connect(addr).await.unwrap();
        echo_roundtrip(&mut c1, b"one").await;
        let mut c2 = TcpStream::connect(addr).await.unwrap();
        echo_roundtrip(&mut c2, b"two").await;
        assert_eq!(server.connection_count(), 2);

        // Third connection is accepted then closed without echoing
        let mut c3 = TcpStream::connect(addr).await.unwrap();
        let _ = c3.write_all(b"x").await;
        let mut buf = [0u8; 1];
        match c3.read(&mut buf).await {
            Ok(0) => {}
            Ok(n) => panic!("refused connection echoed {} bytes", n),
            Err(_) => {} // reset by server is also a refusal
        }
        assert_eq!(server.connection_count(), 2);

        // The surviving connections still echo
        echo_roundtrip(&mut c1, b"still here").await;

        drop(c1);
        drop(c2);
        wait_for_count(&server, 0).await;
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_forced_close_after_drain_timeout() {
        // Zero drain timeout: any live connection trips the forced path
        let server = Server::new(test_config(8, 0));
        let addr = server.start().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        echo_roundtrip(&mut client, b"hold").await;
        assert_eq!(server.connection_count(), 1);

        // Client stays idle; stop must force-close it and still finish
        server.stop().await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.connection_count(), 0);

        let mut buf = [0u8; 1];
        match client.read(&mut buf).await {
            Ok(0) | Err(_) => {}
            Ok(n) => panic!("read {} bytes after forced close", n),
        }
    }

    #[tokio::test]
    async fn test_no_accepts_after_stop() {
        let server = Server::new(test_config(8, 1));
        let addr = server.start().await.unwrap();
        server.stop().await.unwrap();

        // The listening socket is gone; connects are refused outright
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_start_is_single_shot() {
        let server = Server::new(test_config(8, 1));
        server.start().await.unwrap();

        match server.start().await {
            Err(ServerError::InvalidState { operation, state }) => {
                assert_eq!(operation, "start");
                assert_eq!(state, ServerState::Running);
            }
            other => panic!("expected InvalidState, got {:?}", other),
        }

        server.stop().await.unwrap();
        assert!(matches!(
            server.start().await,
            Err(ServerError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_requires_running() {
        let server = Server::new(test_config(8, 1));
        match server.stop().await {
            Err(ServerError::InvalidState { operation, state }) => {
                assert_eq!(operation, "stop");
                assert_eq!(state, ServerState::Created);
            }
            other => panic!("expected InvalidState, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bind_failure_returns_to_created() {
        let config = Config {
            listen: "256.0.0.1:0".to_string(),
            ..test_config(8, 1)
        };
        let server = Server::new(config);

        match server.start().await {
            Err(ServerError::Bind(_)) => {}
            other => panic!("expected Bind error, got {:?}", other.map(|_| ())),
        }
        assert_eq!(server.state(), ServerState::Created);
    }

    #[tokio::test]
    async fn test_lifecycle_events_published() {
        let server = Server::new(test_config(8, 5));
        let mut events = server.subscribe();

        let addr = server.start().await.unwrap();
        let mut client = TcpStream::connect(addr).await.unwrap();
        echo_roundtrip(&mut client, b"ping").await;
        drop(client);
        wait_for_count(&server, 0).await;
        server.stop().await.unwrap();

        let mut opened = false;
        let mut closed_clean = false;
        let mut states = Vec::new();
        while let Ok(event) = events.try_recv() {
            match event {
                Event::ConnectionOpened { .. } => opened = true,
                Event::ConnectionClosed {
                    reason,
                    bytes_read,
                    bytes_written,
                    ..
                } => {
                    assert_eq!(reason, CloseReason::PeerClosed);
                    assert_eq!(bytes_read, 4);
                    assert_eq!(bytes_written, 4);
                    closed_clean = true;
                }
                Event::ServerStateChanged { from, to } => states.push((from, to)),
            }
        }

        assert!(opened, "missing ConnectionOpened");
        assert!(closed_clean, "missing ConnectionClosed");
        assert_eq!(
            states,
            vec![
                (ServerState::Created, ServerState::Starting),
                (ServerState::Starting, ServerState::Running),
                (ServerState::Running, ServerState::Stopping),
                (ServerState::Stopping, ServerState::Stopped),
            ]
        );
    }
}
