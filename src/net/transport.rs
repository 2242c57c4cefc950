//! Transport-neutral frames and the tungstenite adapter.
//!
//! The connection driver reads a `Stream` of [`Frame`]s and writes a `Sink`
//! of them. Each transport (axum on the server, tungstenite on the client
//! and in tests) converts its own message type at the edge.

use bytes::Bytes;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

/// Close codes used by this layer.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const INTERNAL_ERROR: u16 = 1011;
    /// The principal opened a newer connection.
    pub const CONNECTED_ELSEWHERE: u16 = 4409;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub code: u16,
    pub reason: String,
}

impl CloseReason {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.reason)
    }
}

/// One WebSocket message, independent of the transport library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Binary(Bytes),
    Text(String),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseReason>),
}

impl Frame {
    /// Raw tungstenite frames never surface from a read; they map to `None`.
    pub fn from_tungstenite(message: Message) -> Option<Self> {
        Some(match message {
            Message::Binary(data) => Frame::Binary(data),
            Message::Text(text) => Frame::Text(text.as_str().to_owned()),
            Message::Ping(data) => Frame::Ping(data),
            Message::Pong(data) => Frame::Pong(data),
            Message::Close(frame) => Frame::Close(frame.map(|f| CloseReason {
                code: u16::from(f.code),
                reason: f.reason.as_str().to_owned(),
            })),
            Message::Frame(_) => return None,
        })
    }

    pub fn into_tungstenite(self) -> Message {
        match self {
            Frame::Binary(data) => Message::Binary(data),
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Ping(data) => Message::Ping(data),
            Frame::Pong(data) => Message::Pong(data),
            Frame::Close(reason) => Message::Close(reason.map(|r| CloseFrame {
                code: CloseCode::from(r.code),
                reason: r.reason.into(),
            })),
        }
    }
}

/// Split a tungstenite socket into a frame stream and a frame sink.
pub fn split_tungstenite<S>(
    socket: WebSocketStream<S>,
) -> (
    impl Stream<Item = Result<Frame, tungstenite::Error>> + Unpin + Send,
    impl Sink<Frame, Error = tungstenite::Error> + Unpin + Send,
)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = socket.split();
    let stream = stream.filter_map(|message| {
        future::ready(match message {
            Ok(message) => Frame::from_tungstenite(message).map(Ok),
            Err(e) => Some(Err(e)),
        })
    });
    let sink = sink.with(|frame: Frame| future::ready(Ok::<_, tungstenite::Error>(frame.into_tungstenite())));
    (stream, sink)
}
