//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use websocket_resources::auth::{BasicAuthenticator, CredentialStore};
use websocket_resources::config::{CredentialConfig, ServerConfig};
use websocket_resources::dispatch::{DispatchError, DispatchResponse, Dispatcher, ResourceRouter};
use websocket_resources::net::{
    split_tungstenite, Connection, ConnectionHandle, ConnectionOptions, ConnectionRegistry,
    ConnectionTracker,
};
use websocket_resources::observability::{MemorySink, RequestLogger};
use websocket_resources::protocol::{Envelope, RequestMessage};
use websocket_resources::session::{ConnectionAttributes, SessionContext};
use websocket_resources::{Shutdown, WebSocketServer};

/// Config with two known credentials and a short close grace.
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.websocket.close_grace_secs = 1;
    config.auth.credentials = vec![
        CredentialConfig {
            account: "alice".into(),
            device_id: 1,
            password: "secret".into(),
        },
        CredentialConfig {
            account: "alice".into(),
            device_id: 2,
            password: "tablet".into(),
        },
    ];
    config
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: ConnectionRegistry,
    pub tracker: ConnectionTracker,
    pub shutdown: Shutdown,
    pub log: Arc<MemorySink>,
    pub task: JoinHandle<std::io::Result<()>>,
}

impl TestServer {
    pub fn url(&self) -> String {
        format!("ws://{}/v1/websocket/", self.addr)
    }
}

/// Start a server on an ephemeral port.
pub async fn start_server(config: ServerConfig, router: ResourceRouter) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let authenticator = Arc::new(BasicAuthenticator::new(CredentialStore::from_config(&config.auth)));
    let log = MemorySink::new();
    let (logger, _) = RequestLogger::spawn(log.clone(), 256);
    let server = WebSocketServer::new(config, authenticator, Arc::new(router), logger);
    let registry = server.registry();
    let tracker = server.tracker();

    let shutdown = Shutdown::new();
    let task = tokio::spawn(server.run(listener, shutdown.subscribe()));

    TestServer {
        addr,
        registry,
        tracker,
        shutdown,
        log,
        task,
    }
}

/// Poll `condition` for up to two seconds.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn request_frame(request: RequestMessage) -> Message {
    Message::Binary(Envelope::Request(request).encode())
}

/// Next binary frame on a raw socket, decoded. Skips control frames.
pub async fn next_envelope<S>(socket: &mut WebSocketStream<S>) -> Envelope
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket ended")
            .expect("socket error");
        match message {
            Message::Binary(data) => return Envelope::decode(&data).unwrap(),
            Message::Close(frame) => panic!("unexpected close: {:?}", frame),
            _ => continue,
        }
    }
}

/// Read until a Close frame arrives and return its code.
pub async fn next_close_code<S>(socket: &mut WebSocketStream<S>) -> Option<u16>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for close")?
            .ok()?;
        if let Message::Close(frame) = message {
            return frame.map(|f| u16::from(f.code));
        }
    }
}

/// Forwards every request to a channel and answers `200 ready`.
pub struct RecordingDispatcher {
    tx: mpsc::UnboundedSender<RequestMessage>,
}

impl RecordingDispatcher {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RequestMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl Dispatcher for RecordingDispatcher {
    fn dispatch(
        &self,
        _context: Arc<SessionContext>,
        request: RequestMessage,
    ) -> BoxFuture<'_, Result<DispatchResponse, DispatchError>> {
        let _ = self.tx.send(request);
        futures_util::future::ready(Ok(DispatchResponse::ok().with_body(&b"ready"[..]))).boxed()
    }
}

/// Two connections joined by an in-memory duplex pipe.
pub struct Pair {
    pub client: ConnectionHandle,
    pub server: ConnectionHandle,
    pub client_task: JoinHandle<()>,
    pub server_task: JoinHandle<()>,
}

pub struct PairOptions {
    pub client: ConnectionOptions,
    pub server: ConnectionOptions,
    pub client_logger: RequestLogger,
    pub server_logger: RequestLogger,
}

impl Default for PairOptions {
    fn default() -> Self {
        Self {
            client: fast_options(),
            server: fast_options(),
            client_logger: RequestLogger::disabled(),
            server_logger: RequestLogger::disabled(),
        }
    }
}

/// Options with sub-second timings.
pub fn fast_options() -> ConnectionOptions {
    ConnectionOptions {
        request_timeout: Duration::from_secs(2),
        keepalive_interval: None,
        close_grace: Duration::from_millis(200),
        outbound_queue: 16,
        max_concurrent_dispatch: 8,
        max_pending_requests: 64,
    }
}

pub async fn pair(
    server_dispatcher: Arc<dyn Dispatcher>,
    client_dispatcher: Arc<dyn Dispatcher>,
    options: PairOptions,
) -> Pair {
    let (server_io, client_io) = tokio::io::duplex(64 * 1024);
    let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
    let client_ws = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

    let server = Connection::new(
        None,
        ConnectionAttributes::new(),
        None,
        server_dispatcher,
        options.server_logger,
        options.server,
    );
    let client = Connection::new(
        None,
        ConnectionAttributes::new(),
        None,
        client_dispatcher,
        options.client_logger,
        options.client,
    );
    let server_handle = server.handle();
    let client_handle = client.handle();

    let (stream, sink) = split_tungstenite(server_ws);
    let server_task = tokio::spawn(server.run(stream, sink));
    let (stream, sink) = split_tungstenite(client_ws);
    let client_task = tokio::spawn(client.run(stream, sink));

    Pair {
        client: client_handle,
        server: server_handle,
        client_task,
        server_task,
    }
}

/// Send raw bytes on a socket as one binary frame.
pub async fn send_raw<S>(socket: &mut WebSocketStream<S>, data: &'static [u8])
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    socket
        .send(Message::Binary(bytes::Bytes::from_static(data)))
        .await
        .unwrap();
}
