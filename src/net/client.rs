//! Client side of the sub-protocol.
//!
//! Opens the upgrade with tungstenite, presenting Basic credentials and the
//! story opt-in header, then runs the same connection driver as the server.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::{self, http::StatusCode};
use url::Url;

use crate::auth::basic::{basic_header, parse_username};
use crate::auth::X_RECEIVE_STORIES;
use crate::dispatch::Dispatcher;
use crate::net::socket::{Connection, ConnectionHandle, ConnectionOptions};
use crate::net::transport::split_tungstenite;
use crate::observability::request_log::RequestLogger;
use crate::session::ConnectionAttributes;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("server rejected the credentials")]
    InvalidCredentials,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `ws://` URL of the upgrade path. TLS is not built in.
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub receive_stories: bool,
    pub options: ConnectionOptions,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            receive_stories: false,
            options: ConnectionOptions::default(),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_receive_stories(mut self, receive_stories: bool) -> Self {
        self.receive_stories = receive_stories;
        self
    }

    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }
}

/// A running client connection.
pub struct ClientConnection {
    pub handle: ConnectionHandle,
    /// Completes when the connection closes.
    pub task: JoinHandle<()>,
}

/// Connect, authenticate and start driving the connection.
pub async fn connect(
    config: ClientConfig,
    dispatcher: Arc<dyn Dispatcher>,
    logger: RequestLogger,
) -> Result<ClientConnection, ClientError> {
    let url = Url::parse(&config.url).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
    match url.scheme() {
        "ws" => {}
        "wss" => {
            return Err(ClientError::InvalidUrl(
                "wss is not supported; this client is built without TLS".into(),
            ))
        }
        other => return Err(ClientError::InvalidUrl(format!("unsupported scheme: {}", other))),
    }

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| ClientError::Handshake(e.to_string()))?;

    let principal = match (&config.username, &config.password) {
        (Some(username), Some(password)) => {
            let value = HeaderValue::from_str(&basic_header(username, password))
                .map_err(|_| ClientError::InvalidCredentials)?;
            request.headers_mut().insert(header::AUTHORIZATION, value);
            Some(parse_username(username).map_err(|_| ClientError::InvalidCredentials)?)
        }
        _ => None,
    };
    if config.receive_stories {
        request
            .headers_mut()
            .insert(X_RECEIVE_STORIES, HeaderValue::from_static("true"));
    }

    let (socket, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| match e {
            tungstenite::Error::Http(response) if response.status() == StatusCode::UNAUTHORIZED => {
                ClientError::InvalidCredentials
            }
            tungstenite::Error::Io(e) => ClientError::Io(e),
            other => ClientError::Handshake(other.to_string()),
        })?;
    tracing::info!(url = %url, principal = ?principal, "Connected");

    let mut attributes = ConnectionAttributes::new();
    if config.receive_stories {
        attributes.insert(crate::session::context::RECEIVE_STORIES, "true");
    }
    let connection = Connection::new(principal, attributes, None, dispatcher, logger, config.options);
    let handle = connection.handle();
    let (stream, sink) = split_tungstenite(socket);
    let task = tokio::spawn(connection.run(stream, sink));

    Ok(ClientConnection { handle, task })
}
