//! Server configuration
//!
//! The listening address is fixed at startup. The binary accepts an optional
//! `PORT` or `HOST:PORT` argument; everything else uses the defaults below.

/// Default listening port
pub const DEFAULT_PORT: &str = "1234";

/// Listen backlog for the server socket
pub const LISTEN_BACKLOG: u32 = 128;

/// Where the chat server listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind; `None` binds all interfaces
    pub host: Option<String>,
    /// Port or service number, e.g. "1234" ("0" picks an ephemeral port)
    pub port: String,
}

impl ServerConfig {
    pub fn new(host: Option<String>, port: impl Into<String>) -> Self {
        Self {
            host,
            port: port.into(),
        }
    }

    /// Parse a `PORT` or `HOST:PORT` argument
    ///
    /// IPv6 hosts must be bracketed (`[::1]:1234`).
    pub fn from_arg(arg: &str) -> Self {
        match arg.rsplit_once(':') {
            Some((host, port)) => {
                let host = host.trim_start_matches('[').trim_end_matches(']');
                let host = (!host.is_empty()).then(|| host.to_string());
                Self::new(host, port)
            }
            None => Self::new(None, arg),
        }
    }

    /// Host string passed to the resolver
    pub fn bind_host(&self) -> &str {
        self.host.as_deref().unwrap_or("0.0.0.0")
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(None, DEFAULT_PORT)
    }
}
