//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from TOML. Every field
//! has a default so a minimal (even empty) file is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the WebSocket resource server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, connection cap).
    pub listener: ListenerConfig,

    /// Sub-protocol settings.
    pub websocket: WebSocketConfig,

    /// Static credential table.
    pub auth: AuthConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,

    /// Maximum concurrent sockets; further upgrades get 503.
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            max_connections: 10_000,
        }
    }
}

/// WebSocket sub-protocol settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Upgrade path.
    pub path: String,

    /// Accept connections that present no credentials.
    pub allow_anonymous: bool,

    /// Default wait for a response to an outbound request.
    pub request_timeout_secs: u64,

    /// Ping and expiry-sweep period. Zero disables both.
    pub keepalive_interval_secs: u64,

    /// How long a closing connection waits for pending exchanges.
    pub close_grace_secs: u64,

    /// Largest accepted frame, in bytes.
    pub max_message_size: usize,

    /// Outbound frame queue depth per connection.
    pub outbound_queue: usize,

    /// Inbound requests dispatched at once per connection.
    pub max_concurrent_dispatch: usize,

    /// Outstanding outbound requests per connection.
    pub max_pending_requests: usize,
}

impl WebSocketConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_secs(self.close_grace_secs)
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            path: "/v1/websocket/".to_string(),
            allow_anonymous: true,
            request_timeout_secs: 30,
            keepalive_interval_secs: 30,
            close_grace_secs: 5,
            max_message_size: 1024 * 1024,
            outbound_queue: 64,
            max_concurrent_dispatch: 32,
            max_pending_requests: 1024,
        }
    }
}

/// Static credential table.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub credentials: Vec<CredentialConfig>,
}

/// One account/device credential.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CredentialConfig {
    pub account: String,

    #[serde(default = "default_device_id")]
    pub device_id: u32,

    pub password: String,
}

fn default_device_id() -> u32 {
    1
}

/// Log output format.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    pub log_format: LogFormat,

    /// Enable Prometheus metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,

    /// Request log queue depth; records beyond it are dropped.
    pub request_log_buffer: usize,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
            request_log_buffer: 1024,
        }
    }
}
