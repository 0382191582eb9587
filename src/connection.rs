//! Per-connection state and the echo handler loop.
//!
//! Each accepted socket is owned by exactly one `Connection`, served by
//! its own task. The handler reads up to the configured buffer size,
//! writes the same bytes straight back, and exits on peer close, error,
//! idle timeout, or shutdown. Errors here never propagate past the
//! connection that hit them.

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Why a connection stopped being served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed its write side; clean EOF.
    PeerClosed,
    /// A socket read failed.
    ReadError,
    /// Echoing bytes back failed.
    WriteError,
    /// No data arrived within the idle timeout.
    IdleTimeout,
    /// Shutdown was signaled; the handler stopped between reads.
    ShutdownClosed,
    /// The connection was force-closed after a drain timeout.
    ForceClosed,
}

/// One accepted connection.
///
/// Owns the socket for its whole life; the registry only ever holds the
/// connection's id and close handle.
pub struct Connection {
    /// Connection identifier assigned at registration.
    pub id: u64,
    /// Remote peer address.
    pub peer: SocketAddr,
    /// When the connection was accepted.
    pub opened_at: DateTime<Utc>,
    /// Total bytes read from the peer.
    pub bytes_read: u64,
    /// Total bytes echoed back.
    pub bytes_written: u64,
    stream: TcpStream,
    closed: bool,
}

impl Connection {
    /// Wrap an accepted socket.
    pub fn new(id: u64, peer: SocketAddr, opened_at: DateTime<Utc>, stream: TcpStream) -> Self {
        Connection {
            id,
            peer,
            opened_at,
            bytes_read: 0,
            bytes_written: 0,
            stream,
            closed: false,
        }
    }

    /// Serve the connection until it closes.
    ///
    /// Shutdown is observed cooperatively: the signal is checked between
    /// read cycles, so an in-flight read or write always completes (or
    /// fails) on its own before the handler exits. Byte counters are
    /// updated as data flows, so they stay accurate even if this future
    /// is cancelled by a force close.
    pub async fn serve(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
        buffer_size: usize,
        idle_timeout: Option<Duration>,
    ) -> CloseReason {
        let reason = echo_loop(
            &mut self.stream,
            &mut shutdown,
            buffer_size,
            idle_timeout,
            &mut self.bytes_read,
            &mut self.bytes_written,
        )
        .await;

        self.close().await;
        let session_ms = (Utc::now() - self.opened_at).num_milliseconds();
        trace!(id = self.id, peer = %self.peer, ?reason, session_ms, "Session ended");
        reason
    }

    /// Close the connection. Idempotent; later calls are no-ops.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // Best effort; the peer may already be gone.
        let _ = self.stream.shutdown().await;
    }
}

/// Core echo loop, generic over the stream for testability.
///
/// Reads at most `buffer_size` bytes per cycle and writes back exactly
/// the bytes read, in order. A read that fills the whole buffer just
/// continues the loop; only a zero-length read means EOF.
async fn echo_loop<S>(
    stream: &mut S,
    shutdown: &mut watch::Receiver<bool>,
    buffer_size: usize,
    idle_timeout: Option<Duration>,
    bytes_read: &mut u64,
    bytes_written: &mut u64,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(buffer_size);

    loop {
        if *shutdown.borrow() {
            return CloseReason::ShutdownClosed;
        }

        buffer.clear();
        let read = match idle_timeout {
            Some(limit) => match timeout(limit, stream.read_buf(&mut buffer)).await {
                Ok(result) => result,
                Err(_) => {
                    debug!("Connection idle past timeout");
                    return CloseReason::IdleTimeout;
                }
            },
            None => stream.read_buf(&mut buffer).await,
        };

        match read {
            Ok(0) => {
                // Peer closed its write side
                return CloseReason::PeerClosed;
            }
            Ok(n) => {
                *bytes_read += n as u64;
                if let Err(e) = stream.write_all(&buffer[..n]).await {
                    debug!(error = %e, "Echo write failed");
                    return CloseReason::WriteError;
                }
                *bytes_written += n as u64;
            }
            Err(e) => {
                debug!(error = %e, "Read failed");
                return CloseReason::ReadError;
            }
        }
    }
}
