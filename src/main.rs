//! Line Chat Server - Entry Point
//!
//! Starts the chat server and runs its reactor on a single thread.

use std::env;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use line_chat::{ChatServer, ServerConfig};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=line_chat=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("line_chat=info")),
        )
        .init();

    // Optional PORT or HOST:PORT argument
    let config = env::args()
        .nth(1)
        .map(|arg| ServerConfig::from_arg(&arg))
        .unwrap_or_default();

    let mut server = ChatServer::new(config);
    if let Err(e) = server.start().await {
        error!("Error: {}", e);
        return Err(e.into());
    }

    if let Some(addr) = server.local_addr() {
        info!("Chat server listening on port {}", addr.port());
    }

    server.run().await;
    Ok(())
}
