//! Protocol-level error taxonomy.
//!
//! Framing, correlation and state failures share one enum so the caller
//! of a request sees exactly one failure kind. Unmatched responses are not
//! errors; see [`crate::session::correlation::Resolution`].

use thiserror::Error;

use crate::session::state::ConnectionState;

/// Errors raised by the envelope codec, the correlation table and the
/// connection state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The frame could not be decoded into an envelope.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The request id is already outstanding on this connection.
    #[error("request id {0} is already outstanding")]
    DuplicateId(u64),

    /// No response arrived before the deadline.
    #[error("timed out waiting for response")]
    Timeout,

    /// The connection is closing or closed; carries the close reason.
    #[error("connection closing: {0}")]
    ConnectionClosing(String),

    /// The caller cancelled the request explicitly.
    #[error("request cancelled")]
    Cancelled,

    /// Too many locally initiated requests are awaiting responses.
    #[error("too many pending requests (limit {0})")]
    TooManyPending(usize),

    /// A frame or transition arrived in a state that does not allow it.
    #[error("not allowed in state {0}")]
    InvalidState(ConnectionState),
}

impl ProtocolError {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        ProtocolError::InvalidMessage(reason.into())
    }
}
