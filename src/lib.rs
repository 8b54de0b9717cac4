//! Line-oriented TCP Chat Server Library
//!
//! A multi-client chat server where every line a client sends is either a
//! command or a chat message broadcast to everyone else.
//!
//! # Features
//! - Newline-delimited UTF-8 protocol over plain TCP
//! - Commands: `/exit`, `/who`, `/whoami`, `/name <newName>`, `/stopserver`
//! - Join, leave and rename notices from `Server`
//! - Failed clients are dropped without disturbing anyone else
//!
//! # Architecture
//! A single-threaded readiness reactor:
//! - Each socket has an `EventSource` whose watcher task posts an `Event`
//!   to one queue when the socket becomes readable
//! - `ChatServer::run` handles those events one at a time, so the registry
//!   and every session are mutated without locks
//! - Broadcasts and shutdown walk a snapshot of the registry, since sending
//!   can disconnect sessions
//!
//! # Example
//! ```ignore
//! use line_chat::{ChatServer, ServerConfig};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() {
//!     let mut server = ChatServer::new(ServerConfig::default());
//!     server.start().await.unwrap();
//!     server.run().await;
//! }
//! ```

pub mod command;
pub mod config;
pub mod error;
pub mod framer;
pub mod reactor;
pub mod registry;
pub mod server;
pub mod session;
pub mod types;

// Re-export main types for convenience
pub use command::Command;
pub use config::ServerConfig;
pub use error::{AcceptError, SessionError, StartupError};
pub use reactor::{Event, EventSource};
pub use registry::Registry;
pub use server::ChatServer;
pub use session::{Identity, Session};
pub use types::{Generation, PeerAddress, SessionKey};
