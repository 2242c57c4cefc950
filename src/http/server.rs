//! HTTP server setup.
//!
//! # Responsibilities
//! - Create the Axum Router (upgrade path + health)
//! - Wire up tracing middleware
//! - Bind server to listener
//! - On shutdown: stop accepting, close sockets with 1001, drain

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use crate::auth::Authenticator;
use crate::config::{ServerConfig, WebSocketConfig};
use crate::dispatch::Dispatcher;
use crate::http::websocket::websocket_handler;
use crate::lifecycle::shutdown::Shutdown;
use crate::net::connection::ConnectionTracker;
use crate::net::registry::ConnectionRegistry;
use crate::observability::request_log::RequestLogger;

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub authenticator: Arc<dyn Authenticator>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub logger: RequestLogger,
    pub tracker: ConnectionTracker,
    pub registry: ConnectionRegistry,
    pub websocket: WebSocketConfig,
    pub max_connections: usize,
    /// Fans the server shutdown out to every open socket.
    pub shutdown: Arc<Shutdown>,
}

#[derive(Debug, Serialize)]
struct HealthReport {
    status: &'static str,
    connections: u64,
    authenticated: u64,
    anonymous: u64,
}

/// WebSocket resource server.
pub struct WebSocketServer {
    router: Router,
    config: ServerConfig,
    state: AppState,
}

impl WebSocketServer {
    pub fn new(
        config: ServerConfig,
        authenticator: Arc<dyn Authenticator>,
        dispatcher: Arc<dyn Dispatcher>,
        logger: RequestLogger,
    ) -> Self {
        let state = AppState {
            authenticator,
            dispatcher,
            logger,
            tracker: ConnectionTracker::new(),
            registry: ConnectionRegistry::new(),
            websocket: config.websocket.clone(),
            max_connections: config.listener.max_connections,
            shutdown: Arc::new(Shutdown::new()),
        };
        let router = Self::build_router(&config, state.clone());
        Self {
            router,
            config,
            state,
        }
    }

    fn build_router(config: &ServerConfig, state: AppState) -> Router {
        Router::new()
            .route(&config.websocket.path, get(websocket_handler))
            .route("/health", get(health_handler))
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Live connections by principal, for server-initiated requests.
    pub fn registry(&self) -> ConnectionRegistry {
        self.state.registry.clone()
    }

    pub fn tracker(&self) -> ConnectionTracker {
        self.state.tracker.clone()
    }

    /// Serve until `shutdown` fires, then drain open sockets.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            path = %self.config.websocket.path,
            allow_anonymous = self.config.websocket.allow_anonymous,
            "WebSocket server starting"
        );

        let connections = Arc::clone(&self.state.shutdown);
        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received, closing connections");
                connections.trigger();
            })
            .await?;

        let grace = self.config.websocket.close_grace() + Duration::from_secs(1);
        if !self.state.tracker.wait_for_shutdown(grace).await {
            tracing::warn!(
                remaining = self.state.tracker.active_count(),
                "Connections still open after grace period"
            );
        }
        tracing::info!("WebSocket server stopped");
        Ok(())
    }
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthReport {
        status: "ok",
        connections: state.tracker.active_count(),
        authenticated: state.tracker.authenticated_count(),
        anonymous: state.tracker.anonymous_count(),
    })
}
