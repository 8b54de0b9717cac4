//! Error types for the chat server
//!
//! Split along how far a failure reaches: startup errors are fatal,
//! accept errors cost one connection attempt, session errors cost one session.
//! Uses thiserror for ergonomic error definitions.

use std::io;

use thiserror::Error;

/// Fatal startup errors
///
/// Propagated to the process entry point, which exits with a failure status.
#[derive(Debug, Error)]
pub enum StartupError {
    /// Host/port could not be resolved
    #[error("Failed to resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: String,
        #[source]
        source: io::Error,
    },

    /// Resolution succeeded but yielded nothing to bind to
    #[error("No address found for {host}:{port}")]
    NoAddress { host: String, port: String },

    /// bind() failed
    #[error("bind() failed: {0}")]
    Bind(#[source] io::Error),

    /// listen() failed
    #[error("listen() failed: {0}")]
    Listen(#[source] io::Error),

    /// The listening socket could not be registered with the reactor
    #[error("Failed to register listener: {0}")]
    Register(#[source] io::Error),
}

/// Per-connection-attempt errors
///
/// Logged by the accept handler; the server keeps running.
#[derive(Debug, Error)]
pub enum AcceptError {
    /// accept() failed
    #[error("accept() failed: {0}")]
    Accept(#[source] io::Error),

    /// The peer address of an accepted socket could not be resolved
    #[error("Failed to resolve peer address: {0}")]
    PeerAddress(#[source] io::Error),

    /// The accepted socket could not be registered with the reactor
    #[error("Failed to register connection: {0}")]
    Register(#[source] io::Error),
}

/// Per-session errors
///
/// Always resolved by disconnecting exactly the affected session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The peer closed the connection (recv returned 0)
    #[error("Connection closed")]
    ConnectionClosed,

    /// recv() failed
    #[error("recv() failed: {0}")]
    Receive(#[source] io::Error),

    /// send() failed or wrote nothing
    #[error("send() failed: {0}")]
    Send(#[source] io::Error),
}
