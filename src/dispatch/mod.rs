//! Application dispatch seam.
//!
//! # Data Flow
//! ```text
//! inbound Request envelope
//!     → Dispatcher::dispatch(context, request)
//!     → Ok(DispatchResponse)   → Response { status, message, headers, body }
//!     → Err(DispatchError)     → Response { error status, reason }
//!     → panic                  → Response { 500 }
//! ```
//!
//! # Design Decisions
//! - Dispatchers see the immutable session context, never the socket
//! - Fire-and-forget requests are dispatched but nothing is written back
//! - A failing dispatcher never tears down the connection

pub mod router;

use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::{self, BoxFuture, FutureExt};
use thiserror::Error;

use crate::protocol::{RequestMessage, ResponseMessage};
use crate::session::SessionContext;

pub use router::ResourceRouter;

/// Handles requests arriving from the remote peer.
pub trait Dispatcher: Send + Sync + 'static {
    fn dispatch(
        &self,
        context: Arc<SessionContext>,
        request: RequestMessage,
    ) -> BoxFuture<'_, Result<DispatchResponse, DispatchError>>;
}

/// Answers every request with 404. For peers that serve nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDispatcher;

impl Dispatcher for NoDispatcher {
    fn dispatch(
        &self,
        _context: Arc<SessionContext>,
        _request: RequestMessage,
    ) -> BoxFuture<'_, Result<DispatchResponse, DispatchError>> {
        future::ready(Err(DispatchError::NotFound)).boxed()
    }
}

/// Result of a successful dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchResponse {
    pub status: i32,
    pub message: String,
    pub headers: Vec<String>,
    pub body: Option<Bytes>,
}

impl DispatchResponse {
    pub fn new(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(200, "OK")
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push(format!("{}: {}", name, value));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Attach the request id to form the wire response.
    pub fn into_response(self, id: u64) -> ResponseMessage {
        ResponseMessage {
            id,
            status: self.status,
            message: self.message,
            headers: self.headers,
            body: self.body,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("Not Found")]
    NotFound,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Method Not Allowed")]
    MethodNotAllowed,

    #[error("{status} {message}")]
    Status { status: i32, message: String },

    #[error("Internal Server Error: {0}")]
    Internal(String),
}

impl DispatchError {
    pub fn status(&self) -> i32 {
        match self {
            DispatchError::NotFound => 404,
            DispatchError::Unauthorized => 401,
            DispatchError::MethodNotAllowed => 405,
            DispatchError::Status { status, .. } => *status,
            DispatchError::Internal(_) => 500,
        }
    }

    /// The failure response sent back to the peer. Internal details stay in
    /// the log.
    pub fn into_response(self) -> DispatchResponse {
        let status = self.status();
        match self {
            DispatchError::Status { message, .. } => DispatchResponse::new(status, message),
            DispatchError::Internal(_) => DispatchResponse::new(status, "Internal Server Error"),
            other => DispatchResponse::new(status, other.to_string()),
        }
    }
}
