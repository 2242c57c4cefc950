//! WebSocket upgrade handling.
//!
//! # Responsibilities
//! - Enforce the connection cap before upgrading
//! - Authenticate the upgrade exactly once
//! - Refuse bad credentials (401) and unavailable backends (503)
//! - Hand the upgraded socket to the connection driver
//!
//! # Data Flow
//! ```text
//! GET {path} + Upgrade
//!     → connection cap check ─────────────▶ 503
//!     → Connection::establish
//!         InvalidCredentials ─────────────▶ 401
//!         Unavailable ────────────────────▶ 503
//!         anonymous && !allow_anonymous ──▶ 401
//!     → reserve a tracker slot ───────────▶ 503 when full
//!     → 101 Switching Protocols
//!     → register principal, run driver, unregister
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use futures_util::{future, SinkExt, StreamExt};

use crate::auth::{AuthError, HandshakeRequest};
use crate::http::server::AppState;
use crate::net::connection::ConnectionGuard;
use crate::net::socket::{Connection, ConnectionOptions};
use crate::net::transport::{CloseReason, Frame};
use crate::observability::metrics;

fn from_axum(message: Message) -> Frame {
    match message {
        Message::Binary(data) => Frame::Binary(data),
        Message::Text(text) => Frame::Text(text.as_str().to_owned()),
        Message::Ping(data) => Frame::Ping(data),
        Message::Pong(data) => Frame::Pong(data),
        Message::Close(frame) => Frame::Close(frame.map(|f| CloseReason {
            code: f.code,
            reason: f.reason.as_str().to_owned(),
        })),
    }
}

fn into_axum(frame: Frame) -> Message {
    match frame {
        Frame::Binary(data) => Message::Binary(data),
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Ping(data) => Message::Ping(data),
        Frame::Pong(data) => Message::Pong(data),
        Frame::Close(reason) => Message::Close(reason.map(|r| CloseFrame {
            code: r.code,
            reason: r.reason.into(),
        })),
    }
}

pub async fn websocket_handler(
    State(state): State<AppState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    if state.tracker.active_count() >= state.max_connections as u64 {
        tracing::warn!(remote_addr = %remote_addr, "Connection limit reached");
        metrics::record_connection("over_capacity");
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    }

    let handshake = HandshakeRequest::from_http(&method, &uri, &headers, Some(remote_addr));
    let connection = match Connection::establish(
        state.authenticator.as_ref(),
        &handshake,
        Arc::clone(&state.dispatcher),
        state.logger.clone(),
        ConnectionOptions::from(&state.websocket),
    )
    .await
    {
        Ok(connection) => connection,
        Err(AuthError::InvalidCredentials) => {
            return (StatusCode::UNAUTHORIZED, "Invalid credentials").into_response();
        }
        Err(AuthError::Unavailable(_)) => {
            return (StatusCode::SERVICE_UNAVAILABLE, "Authentication unavailable").into_response();
        }
    };

    if !connection.context().is_authenticated() && !state.websocket.allow_anonymous {
        connection.refuse("anonymous connections disabled");
        return (StatusCode::UNAUTHORIZED, "Credentials required").into_response();
    }

    // The slot is held from here until the socket closes.
    let Some(guard) = state.tracker.try_track(
        connection.id(),
        connection.context().is_authenticated(),
        state.max_connections as u64,
    ) else {
        connection.refuse("connection limit reached");
        metrics::record_connection("over_capacity");
        return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
    };

    let connection = connection.with_shutdown(state.shutdown.subscribe());
    upgrade
        .max_message_size(state.websocket.max_message_size)
        .on_upgrade(move |socket| serve_socket(state, connection, guard, socket))
}

async fn serve_socket(
    state: AppState,
    connection: Connection,
    _guard: ConnectionGuard,
    socket: WebSocket,
) {
    let context = Arc::clone(connection.context());
    if let Some(principal) = context.principal() {
        state.registry.register(principal.clone(), connection.handle());
    }

    let (sink, stream) = socket.split();
    let stream = stream.map(|message| message.map(from_axum));
    let sink = sink.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(into_axum(frame))));
    connection.run(stream, sink).await;

    if let Some(principal) = context.principal() {
        state.registry.unregister(principal, context.connection_id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn frames_convert_both_ways() {
        let frames = vec![
            Frame::Binary(Bytes::from_static(b"\x08\x01")),
            Frame::Text("hello".into()),
            Frame::Ping(Bytes::new()),
            Frame::Close(Some(CloseReason::new(1001, "Server shutting down"))),
            Frame::Close(None),
        ];
        for frame in frames {
            assert_eq!(from_axum(into_axum(frame.clone())), frame);
        }
    }
}
