//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, tracing layer)
//!     → websocket.rs (connection cap, authentication, upgrade)
//!     → net::socket (connection driver)
//! ```

pub mod server;
pub mod websocket;

pub use server::{AppState, WebSocketServer};
