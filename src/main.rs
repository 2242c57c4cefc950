//! WebSocket resource server.
//!
//! # Architecture Overview
//!
//! ```text
//!                 ┌──────────────────────────────────────────────────────────┐
//!                 │                  WEBSOCKET RESOURCE SERVER               │
//!                 │                                                          │
//!   Upgrade       │  ┌─────────┐   ┌─────────┐   ┌──────────────────────┐    │
//!   ──────────────┼─▶│  http   │──▶│  auth   │──▶│ session (state, ctx) │    │
//!                 │  │ server  │   │ (once)  │   └──────────┬───────────┘    │
//!                 │  └─────────┘   └─────────┘              ▼                │
//!                 │                              ┌──────────────────────┐    │
//!   Frames        │                              │  net::socket driver  │    │
//!   ◀────────────▶┼─────────────────────────────▶│  read loop / writer  │    │
//!                 │                              └───┬──────────────┬───┘    │
//!                 │                                  ▼              ▼        │
//!                 │                        ┌──────────────┐ ┌─────────────┐  │
//!                 │                        │ correlation  │ │  dispatch   │  │
//!                 │                        │    table     │ │  (router)   │  │
//!                 │                        └──────────────┘ └─────────────┘  │
//!                 │                                                          │
//!                 │  cross-cutting: config, observability, lifecycle         │
//!                 └──────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;

use websocket_resources::auth::{BasicAuthenticator, CredentialStore};
use websocket_resources::config::{load_config, ConfigWatcher, ServerConfig};
use websocket_resources::dispatch::ResourceRouter;
use websocket_resources::lifecycle::{shutdown_signal, Shutdown};
use websocket_resources::observability::{logging, metrics, RequestLogger, TracingSink};
use websocket_resources::WebSocketServer;

#[derive(Parser)]
#[command(name = "websocket-resources")]
#[command(about = "WebSocket request/response resource server", long_about = None)]
struct Args {
    /// Path to a TOML config file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };

    logging::init_logging(&config.observability)?;
    tracing::info!("websocket-resources v{} starting", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        path = %config.websocket.path,
        credentials = config.auth.credentials.len(),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics exporter");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let credentials = CredentialStore::from_config(&config.auth);
    let authenticator = Arc::new(BasicAuthenticator::new(credentials.clone()));
    let dispatcher = Arc::new(ResourceRouter::new().with_builtin_routes());
    let (logger, log_task) =
        RequestLogger::spawn(TracingSink, config.observability.request_log_buffer);

    // Credential hot reload; the watcher stops when dropped.
    let _watcher = match &args.config {
        Some(path) => {
            let (watcher, mut updates) = ConfigWatcher::new(path);
            let watcher = watcher.run()?;
            tokio::spawn(async move {
                while let Some(config) = updates.recv().await {
                    credentials.replace(&config.auth);
                }
            });
            Some(watcher)
        }
        None => None,
    };

    let listener = TcpListener::bind(&config.listener.bind_address).await?;
    tracing::info!(address = %listener.local_addr()?, "Listening for connections");

    let shutdown = Shutdown::new();
    let server = WebSocketServer::new(config, authenticator, dispatcher, logger);
    let server_task = tokio::spawn(server.run(listener, shutdown.subscribe()));

    shutdown_signal().await;
    shutdown.trigger();
    server_task.await??;
    // Flush queued request-log records.
    let _ = tokio::time::timeout(Duration::from_secs(1), log_task).await;

    tracing::info!("Shutdown complete");
    Ok(())
}
