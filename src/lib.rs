//! WebSocket sub-protocol layer.
//!
//! Multiplexes request/response exchanges in both directions over one
//! long-lived WebSocket, with the connection's principal bound once at
//! upgrade time.

pub mod auth;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod protocol;
pub mod session;

pub use config::ServerConfig;
pub use error::ProtocolError;
pub use http::WebSocketServer;
pub use lifecycle::Shutdown;
