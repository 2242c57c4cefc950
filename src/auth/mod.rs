//! Upgrade authentication subsystem.
//!
//! # Data Flow
//! ```text
//! WebSocket upgrade request (method, path, query, headers)
//!     → HandshakeRequest
//!     → Authenticator::authenticate (exactly once per connection)
//!         Ok(Some(principal)) → AUTHENTICATED
//!         Ok(None)            → ANONYMOUS (no credentials supplied)
//!         Err(InvalidCredentials) → handshake refused with 401
//! ```
//!
//! # Design Decisions
//! - Missing credentials are a normal outcome, not an error
//! - Supplied-but-wrong credentials always refuse the handshake
//! - Authenticators are injected, never looked up globally

pub mod basic;

use std::net::SocketAddr;

use axum::http::{HeaderMap, Method, Uri};
use futures_util::future::BoxFuture;
use thiserror::Error;

use crate::session::context::{ConnectionAttributes, Principal, RECEIVE_STORIES, USER_AGENT};

pub use basic::{BasicAuthenticator, CredentialStore};

/// Header toggling story delivery for the connection.
pub const X_RECEIVE_STORIES: &str = "x-receive-stories";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Credentials were supplied but are malformed or wrong.
    #[error("invalid credentials")]
    InvalidCredentials,
    /// The credential backend could not answer.
    #[error("authentication unavailable: {0}")]
    Unavailable(String),
}

/// Establishes the principal of a connection from its handshake.
pub trait Authenticator: Send + Sync {
    fn authenticate<'a>(
        &'a self,
        handshake: &'a HandshakeRequest,
    ) -> BoxFuture<'a, Result<Option<Principal>, AuthError>>;
}

/// The parts of the upgrade request an authenticator may inspect.
#[derive(Debug, Clone, Default)]
pub struct HandshakeRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    /// Header pairs with lower-cased names.
    headers: Vec<(String, String)>,
    pub remote_addr: Option<SocketAddr>,
}

impl HandshakeRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    /// Build from the HTTP parts of an upgrade request.
    pub fn from_http(
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        // Non-UTF-8 values are kept lossily: a garbled Authorization header
        // must fail authentication, never read as absent.
        let headers = headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        Self {
            method: method.to_string(),
            path: uri.path().to_string(),
            query: uri.query().map(str::to_string),
            headers,
            remote_addr,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// First value of the named header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// First value of the named query parameter, percent-decoded.
    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.query.as_deref()?;
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    }

    /// Per-connection attributes declared by the client.
    pub fn attributes(&self) -> ConnectionAttributes {
        let mut attributes = ConnectionAttributes::new();
        if let Some(value) = self.header(X_RECEIVE_STORIES) {
            let enabled = value.trim().eq_ignore_ascii_case("true");
            attributes.insert(RECEIVE_STORIES, enabled.to_string());
        }
        if let Some(agent) = self.header("user-agent") {
            attributes.insert(USER_AGENT, agent);
        }
        attributes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_http_lowercases_names() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Receive-Stories", "TRUE".parse().unwrap());
        headers.insert("User-Agent", "tests/1.0".parse().unwrap());
        let uri: Uri = "/v1/websocket/?login=alice&password=p%40ss".parse().unwrap();

        let handshake = HandshakeRequest::from_http(&Method::GET, &uri, &headers, None);
        assert_eq!(handshake.path, "/v1/websocket/");
        assert_eq!(handshake.header("x-receive-stories"), Some("TRUE"));
        assert_eq!(handshake.query_param("password").as_deref(), Some("p@ss"));

        let attributes = handshake.attributes();
        assert!(attributes.receive_stories());
        assert_eq!(attributes.get(USER_AGENT), Some("tests/1.0"));
    }

    #[tokio::test]
    async fn garbled_authorization_is_refused() {
        use axum::http::HeaderValue;

        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_bytes(b"Basic \xff\xfe").unwrap());
        let uri: Uri = "/v1/websocket/".parse().unwrap();
        let handshake = HandshakeRequest::from_http(&Method::GET, &uri, &headers, None);
        assert!(handshake.header("authorization").is_some());

        let authenticator = BasicAuthenticator::new(CredentialStore::default());
        assert_eq!(
            authenticator.authenticate(&handshake).await,
            Err(AuthError::InvalidCredentials)
        );
    }

    #[test]
    fn stories_disabled_without_header() {
        let handshake = HandshakeRequest::new("GET", "/v1/websocket/");
        assert!(!handshake.attributes().receive_stories());
        assert_eq!(handshake.query_param("login"), None);
    }
}
