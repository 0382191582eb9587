//! Listening socket owner.
//!
//! Wraps the bound `TcpListener` and turns the raw accept call into a
//! shutdown-aware one: `accept` yields connections until the shutdown
//! signal flips, then yields a terminal `Closed` instead of blocking
//! forever. Accept failures are reported per call so the caller can log
//! and keep the loop alive.

use crate::error::ServerError;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::info;

/// Outcome of one accept call.
pub enum Accepted {
    /// A new connection arrived.
    Connection {
        /// The accepted socket.
        stream: TcpStream,
        /// Remote peer address.
        peer: SocketAddr,
    },
    /// Shutdown was signaled; no further connections will be yielded.
    Closed,
}

/// Owner of the bound listening socket.
pub struct Listener {
    socket: TcpListener,
    local_addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
}

impl Listener {
    /// Bind the listening socket.
    pub async fn bind(listen: &str, shutdown: watch::Receiver<bool>) -> Result<Self, ServerError> {
        let socket = TcpListener::bind(listen).await.map_err(ServerError::Bind)?;
        let local_addr = socket.local_addr().map_err(ServerError::Bind)?;
        info!(address = %local_addr, "Server listening");

        Ok(Listener {
            socket,
            local_addr,
            shutdown,
        })
    }

    /// The address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept the next connection, or `Closed` once shutdown is signaled.
    pub async fn accept(&mut self) -> Result<Accepted, ServerError> {
        if *self.shutdown.borrow() {
            return Ok(Accepted::Closed);
        }

        tokio::select! {
            result = self.socket.accept() => match result {
                Ok((stream, peer)) => Ok(Accepted::Connection { stream, peer }),
                Err(e) => Err(ServerError::Accept(e)),
            },
            // Err means the sender is gone, which also ends accepting
            _ = self.shutdown.changed() => Ok(Accepted::Closed),
        }
    }
}
