//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Upgraded socket (axum on the server, tungstenite on the client)
//!     → transport.rs (library messages ⇄ Frame)
//!     → socket.rs    (connection driver: read loop, writer task, dispatch)
//!     → connection.rs (ids, open-socket accounting)
//!     → registry.rs  (principal → live connection)
//!
//! Connection States:
//!     Connecting → Authenticated | Anonymous → Open → Closing → Closed
//! ```
//!
//! # Design Decisions
//! - The driver is generic over any Stream/Sink of frames
//! - Each connection tracked for graceful shutdown
//! - At most one live connection per principal

pub mod client;
pub mod connection;
pub mod registry;
pub mod socket;
pub mod transport;

pub use client::{connect, ClientConfig, ClientConnection, ClientError};
pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use registry::ConnectionRegistry;
pub use socket::{Connection, ConnectionHandle, ConnectionOptions};
pub use transport::{close_code, split_tungstenite, CloseReason, Frame};
