//! Session bookkeeping subsystem.
//!
//! # Data Flow
//! ```text
//! handshake accepted
//!     → state.rs     (Connecting → Authenticated | Anonymous → Open)
//!     → context.rs   (principal + attributes, immutable after bind)
//!
//! outbound request                      inbound response
//!     → correlation.rs next_id/register     → correlation.rs resolve
//!     → await PendingResponse  ◀────────────────┘
//! ```
//!
//! # Design Decisions
//! - One correlation table per connection; never shared
//! - Principal fixed at context construction, read without locks
//! - Closing refuses new waits but still resolves pending ones

pub mod context;
pub mod correlation;
pub mod state;

pub use context::{ConnectionAttributes, Principal, SessionContext};
pub use correlation::{CorrelationTable, PendingResponse, Resolution};
pub use state::{ConnectionState, StateMachine};
