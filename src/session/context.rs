//! Per-connection session context.
//!
//! Built once, when the authentication decision is made, and shared
//! read-only with the dispatcher for the life of the connection.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::net::connection::ConnectionId;
use crate::net::socket::ConnectionHandle;

/// Attribute set when the client sends `X-Receive-Stories: true`.
pub const RECEIVE_STORIES: &str = "receive_stories";
/// Attribute holding the client's `User-Agent`.
pub const USER_AGENT: &str = "user_agent";

/// The authenticated identity of a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Principal {
    pub account: String,
    pub device_id: u32,
}

impl Principal {
    pub fn new(account: impl Into<String>, device_id: u32) -> Self {
        Self {
            account: account.into(),
            device_id,
        }
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.account, self.device_id)
    }
}

/// Opaque key-value bag captured at handshake time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionAttributes {
    entries: BTreeMap<String, String>,
}

impl ConnectionAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Whether the client opted into story delivery.
    pub fn receive_stories(&self) -> bool {
        self.get(RECEIVE_STORIES) == Some("true")
    }
}

/// Identity and bookkeeping for one connection.
pub struct SessionContext {
    connection_id: ConnectionId,
    principal: Option<Principal>,
    attributes: ConnectionAttributes,
    remote_addr: Option<SocketAddr>,
    handle: ConnectionHandle,
}

impl SessionContext {
    pub(crate) fn new(
        connection_id: ConnectionId,
        principal: Option<Principal>,
        attributes: ConnectionAttributes,
        remote_addr: Option<SocketAddr>,
        handle: ConnectionHandle,
    ) -> Self {
        Self {
            connection_id,
            principal,
            attributes,
            remote_addr,
            handle,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    /// `None` for anonymous connections.
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.principal.is_some()
    }

    pub fn attributes(&self) -> &ConnectionAttributes {
        &self.attributes
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Handle for pushing server-initiated requests on this connection.
    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Tag used in request logs: the principal, or `anonymous`.
    pub fn log_tag(&self) -> String {
        match &self.principal {
            Some(principal) => principal.to_string(),
            None => "anonymous".to_string(),
        }
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("connection_id", &self.connection_id)
            .field("principal", &self.principal)
            .field("attributes", &self.attributes)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn principal_display() {
        assert_eq!(Principal::new("alice", 2).to_string(), "alice.2");
    }

    #[test]
    fn receive_stories_flag() {
        let mut attrs = ConnectionAttributes::new();
        assert!(!attrs.receive_stories());
        attrs.insert(RECEIVE_STORIES, "true");
        assert!(attrs.receive_stories());
        attrs.insert(RECEIVE_STORIES, "false");
        assert!(!attrs.receive_stories());
    }
}
