//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → shutdown_signal() resolves
//!
//! Shutdown (shutdown.rs):
//!     trigger() → server stops accepting
//!               → every connection closes with 1001
//!               → pending exchanges drained or failed
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, close sockets, drain
//! - Shutdown has timeout: sockets still open after the grace are abandoned

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::shutdown_signal;
