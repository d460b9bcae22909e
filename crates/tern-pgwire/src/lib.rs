//! PostgreSQL wire protocol server for Tern.
//!
//! Speaks protocol version 3.0: startup (with the SSL-probe `'N'`
//! refusal), the Simple Query Protocol, and the Extended Query Protocol
//! (Parse/Bind/Describe/Execute/Close/Flush/Sync), so any standard
//! Postgres client can connect to the embedded engine.
//!
//! # Architecture
//!
//! - [`codec`]: stateless message framing and per-message encoders
//! - [`protocol`]: message-type bytes, SQLSTATEs, parameter OIDs
//! - [`portal`]: prepared-statement/portal state per connection
//! - [`connection`]: the per-connection message loop
//!
//! Query semantics (classification, catalog shim, directives) live in
//! `tern-core`; this crate only moves bytes.

pub mod codec;
pub mod connection;
pub mod portal;
pub mod protocol;

use std::sync::Arc;

use tern_core::Dispatcher;

/// Configuration for the pgwire server.
#[derive(Debug, Clone)]
pub struct PgWireConfig {
    /// TCP bind address (e.g., "0.0.0.0:5433")
    pub bind_addr: String,
    /// Maximum concurrent connections
    pub max_connections: usize,
}

impl Default for PgWireConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5433".to_string(),
            max_connections: 100,
        }
    }
}

/// Start the pgwire server.
///
/// Listens on the configured address and accepts PostgreSQL wire
/// protocol connections. The accept loop never blocks on per-connection
/// work: each connection runs in its own tokio task.
pub async fn start_server(
    dispatcher: Arc<Dispatcher>,
    config: PgWireConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("pgwire server listening on {}", config.bind_addr);

    let semaphore = Arc::new(tokio::sync::Semaphore::new(config.max_connections));

    loop {
        let (stream, addr) = listener.accept().await?;
        tracing::debug!("pgwire connection from {addr}");

        let dispatcher = dispatcher.clone();
        let permit = semaphore.clone().acquire_owned().await?;

        tokio::spawn(async move {
            if let Err(e) = connection::handle_connection(stream, dispatcher).await {
                tracing::warn!("pgwire connection error from {addr}: {e}");
            }
            drop(permit);
        });
    }
}
