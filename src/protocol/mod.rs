//! Envelope codec subsystem.
//!
//! # Data Flow
//! ```text
//! binary WebSocket frame
//!     → envelope.rs decode (protobuf via message.rs)
//!     → Envelope::Request  → dispatcher
//!     → Envelope::Response → correlation table
//!     → Envelope::Unknown  → logged and dropped
//! ```
//!
//! # Design Decisions
//! - One envelope per binary frame; the frame supplies the length prefix
//! - Optional fields keep explicit presence (absent id ≠ id 0)
//! - Header lines stay raw; maps are built on demand

pub mod envelope;
pub mod message;

pub use envelope::{decode, encode, Envelope, RequestMessage, ResponseMessage, MAX_REQUEST_ID};
