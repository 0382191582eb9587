//! Server error types.
//!
//! Errors fall into two tiers:
//! - `ServerError` covers everything that surfaces through the controller
//!   API: bind failures, accept failures, capacity refusal, drain timeout,
//!   and state-machine misuse.
//! - Per-connection read/write failures never propagate this far; they are
//!   recorded as a close reason on the connection that hit them.

use crate::server::ServerState;

/// Errors surfaced by the server controller and its collaborators.
#[derive(Debug)]
pub enum ServerError {
    /// Binding the listening socket failed. Fatal at startup.
    Bind(std::io::Error),
    /// Accepting a connection failed. Logged; the accept loop continues.
    Accept(std::io::Error),
    /// The configured connection limit is reached; the new socket is
    /// closed without being served.
    CapacityExceeded {
        /// The configured maximum.
        max: usize,
    },
    /// Active connections did not drain within the shutdown timeout.
    DrainTimeout {
        /// Connections still registered when the timeout elapsed.
        remaining: usize,
    },
    /// A controller method was called in a state that does not permit it.
    InvalidState {
        /// The operation that was attempted.
        operation: &'static str,
        /// The state the controller was in.
        state: ServerState,
    },
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind(e) => write!(f, "Failed to bind listening socket: {}", e),
            ServerError::Accept(e) => write!(f, "Failed to accept connection: {}", e),
            ServerError::CapacityExceeded { max } => {
                write!(f, "Connection limit reached ({} connections)", max)
            }
            ServerError::DrainTimeout { remaining } => {
                write!(
                    f,
                    "Shutdown drain timed out with {} connections still open",
                    remaining
                )
            }
            ServerError::InvalidState { operation, state } => {
                write!(f, "Cannot {} while server is {:?}", operation, state)
            }
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind(e) | ServerError::Accept(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let e = ServerError::CapacityExceeded { max: 2 };
        assert_eq!(e.to_string(), "Connection limit reached (2 connections)");

        let e = ServerError::DrainTimeout { remaining: 3 };
        assert!(e.to_string().contains("3 connections still open"));

        let e = ServerError::InvalidState {
            operation: "start",
            state: ServerState::Running,
        };
        assert_eq!(e.to_string(), "Cannot start while server is Running");
    }

    #[test]
    fn test_io_source_preserved() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use");
        let e = ServerError::Bind(io);
        assert!(std::error::Error::source(&e).is_some());
    }
}
