//! Live connections by principal.
//!
//! One connection per principal: registering a second one closes the first
//! with 4409 (connected elsewhere). Anonymous connections are never listed.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::ProtocolError;
use crate::net::connection::ConnectionId;
use crate::net::socket::ConnectionHandle;
use crate::net::transport::close_code;
use crate::protocol::RequestMessage;
use crate::session::Principal;

#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<Principal, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handle` for `principal`, displacing any previous connection.
    pub fn register(&self, principal: Principal, handle: ConnectionHandle) {
        let id = handle.id();
        if let Some(previous) = self.connections.insert(principal.clone(), handle) {
            if previous.id() != id {
                tracing::info!(
                    principal = %principal,
                    previous = %previous.id(),
                    current = %id,
                    "Displacing older connection"
                );
                previous.close(close_code::CONNECTED_ELSEWHERE, "Connected elsewhere");
            }
        }
    }

    /// Remove the entry only if it still belongs to connection `id`.
    pub fn unregister(&self, principal: &Principal, id: ConnectionId) -> bool {
        self.connections
            .remove_if(principal, |_, handle| handle.id() == id)
            .is_some()
    }

    pub fn get(&self, principal: &Principal) -> Option<ConnectionHandle> {
        self.connections.get(principal).map(|entry| entry.value().clone())
    }

    /// Close the principal's connection, if any.
    pub fn disconnect(&self, principal: &Principal) -> bool {
        match self.connections.remove(principal) {
            Some((_, handle)) => {
                handle.close(close_code::NORMAL, "Disconnected");
                true
            }
            None => false,
        }
    }

    /// Fire-and-forget request to the principal's connection.
    pub async fn push(&self, principal: &Principal, request: RequestMessage) -> Result<bool, ProtocolError> {
        match self.get(principal) {
            Some(handle) => handle.push(request).await.map(|()| true),
            None => Ok(false),
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
