//! Basic type definitions for the chat server
//!
//! Provides newtype wrappers for type safety:
//! - `SessionKey`: the socket descriptor that identifies a session
//! - `Generation`: accept counter distinguishing sessions on a reused descriptor
//! - `PeerAddress`: a peer's `(host, port)`, resolved once at accept time

use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};

/// Session identity (newtype over the connection's socket descriptor)
///
/// Two sessions are the same session iff their descriptors match.
/// Implements Hash and Eq for use as a lookup key in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey(pub RawFd);

impl SessionKey {
    /// Key for the descriptor behind `socket`
    pub fn of<S: AsRawFd>(socket: &S) -> Self {
        Self(socket.as_raw_fd())
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fd {}", self.0)
    }
}

/// Accept sequence number of a session
///
/// Not part of session identity; only used to discard readiness events
/// meant for an earlier session on the same descriptor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(pub u64);

impl Generation {
    /// The generation after this one
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

/// Cached peer address
///
/// Kept as strings so it stays printable after the socket is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub host: String,
    pub port: String,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: port.into(),
        }
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port().to_string())
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\"{}\":{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_address_display_quotes_host() {
        let addr = PeerAddress::new("1.2.3.4", "5555");
        assert_eq!(addr.to_string(), "\"1.2.3.4\":5555");
    }

    #[test]
    fn test_peer_address_from_socket_addr() {
        let addr: SocketAddr = "[::1]:8080".parse().unwrap();
        let peer = PeerAddress::from(addr);
        assert_eq!(peer.host, "::1");
        assert_eq!(peer.port, "8080");
    }

    #[test]
    fn test_generation_advances() {
        let first = Generation::default().next();
        assert_eq!(first, Generation(1));
        assert!(first.next() > first);
    }

    #[test]
    fn test_session_key_equality() {
        assert_eq!(SessionKey(7), SessionKey(7));
        assert_ne!(SessionKey(7), SessionKey(8));
    }
}
