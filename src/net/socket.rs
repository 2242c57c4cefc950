//! Per-connection protocol driver.
//!
//! # Data Flow
//! ```text
//! transport stream ──▶ read loop ──▶ decode
//!                         │            ├─ Request  → spawn dispatch → Response ─┐
//!                         │            ├─ Response → CorrelationTable::resolve  │
//!                         │            └─ Unknown / malformed → log, drop       │
//!                         ├─ keepalive tick → ping + expire_overdue             │
//!                         └─ close / shutdown → Closing → grace → Closed        │
//!                                                                               ▼
//! ConnectionHandle::send_request / push ──▶ outbound queue ──▶ writer task ──▶ transport sink
//! ```
//!
//! # Design Decisions
//! - One writer task owns the sink; everything else enqueues frames
//! - Dispatch runs on spawned tasks, bounded per connection
//! - Per-frame failures are logged and dropped; the connection stays up
//! - Entering Closed completes every pending waiter

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::auth::{AuthError, Authenticator, HandshakeRequest};
use crate::config::WebSocketConfig;
use crate::dispatch::{DispatchResponse, Dispatcher};
use crate::error::ProtocolError;
use crate::net::connection::ConnectionId;
use crate::net::transport::{close_code, CloseReason, Frame};
use crate::observability::metrics;
use crate::observability::request_log::{Direction, ExchangeRecord, RequestLogger};
use crate::protocol::{Envelope, RequestMessage, ResponseMessage};
use crate::session::{
    ConnectionAttributes, ConnectionState, CorrelationTable, PendingResponse, Principal,
    Resolution, SessionContext, StateMachine,
};

/// Per-connection tunables.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub request_timeout: Duration,
    /// `None` disables pings and the periodic expiry sweep.
    pub keepalive_interval: Option<Duration>,
    pub close_grace: Duration,
    pub outbound_queue: usize,
    pub max_concurrent_dispatch: usize,
    pub max_pending_requests: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self::from(&WebSocketConfig::default())
    }
}

impl From<&WebSocketConfig> for ConnectionOptions {
    fn from(config: &WebSocketConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            keepalive_interval: config.keepalive_interval(),
            close_grace: config.close_grace(),
            outbound_queue: config.outbound_queue.max(1),
            max_concurrent_dispatch: config.max_concurrent_dispatch.max(1),
            max_pending_requests: config.max_pending_requests,
        }
    }
}

struct Shared {
    id: ConnectionId,
    tag: String,
    remote_addr: Option<SocketAddr>,
    table: CorrelationTable,
    outbound: mpsc::Sender<Frame>,
    machine: Mutex<StateMachine>,
    state_tx: watch::Sender<ConnectionState>,
    close_request: Mutex<Option<CloseReason>>,
    close_notify: Notify,
    options: ConnectionOptions,
    logger: RequestLogger,
}

impl Shared {
    fn machine(&self) -> MutexGuard<'_, StateMachine> {
        self.machine.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn update<R>(&self, f: impl FnOnce(&mut StateMachine) -> R) -> R {
        let mut machine = self.machine();
        let result = f(&mut machine);
        let state = machine.state();
        drop(machine);
        self.state_tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
        result
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn begin_closing(&self) {
        if self.update(StateMachine::begin_closing) {
            self.table.begin_closing();
            tracing::debug!(connection_id = %self.id, pending = self.table.len(), "Connection closing");
        }
    }

    async fn enqueue(&self, frame: Frame) -> Result<(), ProtocolError> {
        self.outbound
            .send(frame)
            .await
            .map_err(|_| ProtocolError::ConnectionClosing("connection closed".into()))
    }

    fn record(&self, direction: Direction, request: &RequestMessage, started: Instant) -> ExchangeRecord {
        ExchangeRecord {
            connection_id: self.id,
            direction,
            verb: request.verb.clone(),
            path: request.path.clone(),
            status: None,
            request_length: request.body.as_ref().map(Bytes::len),
            response_length: None,
            remote_addr: self.remote_addr,
            duration: started.elapsed(),
            tag: self.tag.clone(),
        }
    }
}

/// Cloneable handle for talking to the remote peer.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Outbound requests still awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.table.len()
    }

    /// Send a request and wait for its response using the default timeout.
    pub async fn send_request(&self, request: RequestMessage) -> Result<ResponseMessage, ProtocolError> {
        self.send_request_with_timeout(request, self.shared.options.request_timeout)
            .await
    }

    pub async fn send_request_with_timeout(
        &self,
        request: RequestMessage,
        timeout: Duration,
    ) -> Result<ResponseMessage, ProtocolError> {
        let started = Instant::now();
        let mut record = self.shared.record(Direction::Outbound, &request, started);
        let pending = self.start_request(request, Some(timeout)).await?;
        let result = pending.wait().await;

        record.duration = started.elapsed();
        if let Ok(response) = &result {
            record.status = Some(response.status);
            record.response_length = response.body.as_ref().map(Bytes::len);
        }
        self.shared.logger.log(record);
        result
    }

    /// Assign an id, register the waiter and enqueue the request. The caller
    /// decides when to await; `timeout` of `None` waits until close.
    pub async fn start_request(
        &self,
        mut request: RequestMessage,
        timeout: Option<Duration>,
    ) -> Result<PendingResponse, ProtocolError> {
        let id = self.shared.table.next_id();
        request.id = Some(id);
        let pending = self.shared.table.register_wait(id, timeout)?;

        let frame = Frame::Binary(Envelope::Request(request).encode());
        if let Err(e) = self.shared.enqueue(frame).await {
            self.shared.table.cancel(id);
            return Err(e);
        }
        Ok(pending)
    }

    /// Cancel a pending request. A later response for it is discarded.
    pub fn cancel(&self, id: u64) -> bool {
        self.shared.table.cancel(id)
    }

    /// Send a fire-and-forget request. Any id on `request` is dropped.
    pub async fn push(&self, mut request: RequestMessage) -> Result<(), ProtocolError> {
        if matches!(self.state(), ConnectionState::Closing | ConnectionState::Closed) {
            return Err(ProtocolError::ConnectionClosing("connection closing".into()));
        }
        let started = Instant::now();
        request.id = None;
        let record = self.shared.record(Direction::Outbound, &request, started);

        self.shared
            .enqueue(Frame::Binary(Envelope::Request(request).encode()))
            .await?;
        self.shared.logger.log(record);
        Ok(())
    }

    /// Ask the driver to close. Pending requests get `close_grace` to finish.
    pub fn close(&self, code: u16, reason: &str) {
        {
            let mut request = self
                .shared
                .close_request
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if request.is_none() {
                *request = Some(CloseReason::new(code, reason));
            }
        }
        self.shared.close_notify.notify_one();
    }

    /// Resolves once the connection has reached `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.shared.state_tx.subscribe();
        let _ = rx.wait_for(|state| *state == ConnectionState::Closed).await;
    }

    pub(crate) fn requested_close(&self) -> Option<CloseReason> {
        self.shared
            .close_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.shared.id)
            .field("tag", &self.shared.tag)
            .field("state", &self.state())
            .finish()
    }
}

enum Exit {
    /// Peer sent Close or the stream ended.
    Remote(String),
    /// We sent (or will send) a Close frame.
    Local(CloseReason),
}

/// An authenticated connection, ready to run over a transport.
pub struct Connection {
    shared: Arc<Shared>,
    context: Arc<SessionContext>,
    dispatcher: Arc<dyn Dispatcher>,
    outbound_rx: mpsc::Receiver<Frame>,
    shutdown: Option<broadcast::Receiver<()>>,
    dispatch_limit: Arc<Semaphore>,
}

impl Connection {
    /// Run the authenticator once and bind the result to a new connection.
    pub async fn establish(
        authenticator: &dyn Authenticator,
        handshake: &HandshakeRequest,
        dispatcher: Arc<dyn Dispatcher>,
        logger: RequestLogger,
        options: ConnectionOptions,
    ) -> Result<Self, AuthError> {
        match authenticator.authenticate(handshake).await {
            Ok(principal) => {
                metrics::record_connection(if principal.is_some() {
                    "authenticated"
                } else {
                    "anonymous"
                });
                Ok(Self::new(
                    principal,
                    handshake.attributes(),
                    handshake.remote_addr,
                    dispatcher,
                    logger,
                    options,
                ))
            }
            Err(e) => {
                metrics::record_connection(match e {
                    AuthError::InvalidCredentials => "refused",
                    AuthError::Unavailable(_) => "unavailable",
                });
                tracing::info!(
                    remote_addr = ?handshake.remote_addr,
                    error = %e,
                    state = %ConnectionState::Closed,
                    "Handshake refused"
                );
                Err(e)
            }
        }
    }

    /// Bind an already-decided principal. Used by clients and tests.
    pub fn new(
        principal: Option<Principal>,
        attributes: ConnectionAttributes,
        remote_addr: Option<SocketAddr>,
        dispatcher: Arc<dyn Dispatcher>,
        logger: RequestLogger,
        options: ConnectionOptions,
    ) -> Self {
        let id = ConnectionId::new();
        let mut machine = StateMachine::new();
        // A fresh machine is in Connecting, so bind cannot fail.
        let _ = machine.bind(principal.is_some());
        let (state_tx, _) = watch::channel(machine.state());
        let (outbound, outbound_rx) = mpsc::channel(options.outbound_queue.max(1));
        let tag = principal
            .as_ref()
            .map_or_else(|| "anonymous".to_string(), ToString::to_string);

        let shared = Arc::new(Shared {
            id,
            tag,
            remote_addr,
            table: CorrelationTable::new(options.max_pending_requests),
            outbound,
            machine: Mutex::new(machine),
            state_tx,
            close_request: Mutex::new(None),
            close_notify: Notify::new(),
            options: options.clone(),
            logger,
        });
        let handle = ConnectionHandle {
            shared: Arc::clone(&shared),
        };
        let context = Arc::new(SessionContext::new(id, principal, attributes, remote_addr, handle));

        Self {
            shared,
            context,
            dispatcher,
            outbound_rx,
            shutdown: None,
            dispatch_limit: Arc::new(Semaphore::new(options.max_concurrent_dispatch.max(1))),
        }
    }

    /// Close with 1001 when `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: broadcast::Receiver<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.context
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.context.handle().clone()
    }

    /// Drop a connection refused after authentication.
    pub fn refuse(self, reason: &str) {
        self.shared.update(StateMachine::close);
        tracing::info!(connection_id = %self.shared.id, reason, "Connection refused");
    }

    /// Drive the connection until it closes.
    pub async fn run<St, Si, E>(self, mut inbound: St, mut sink: Si)
    where
        St: Stream<Item = Result<Frame, E>> + Unpin + Send,
        Si: Sink<Frame, Error = E> + Unpin + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let Connection {
            shared,
            context,
            dispatcher,
            outbound_rx,
            mut shutdown,
            dispatch_limit,
        } = self;

        if let Err(e) = shared.update(StateMachine::open) {
            tracing::warn!(connection_id = %shared.id, error = %e, "Connection cannot open");
            let close = CloseReason::new(close_code::INTERNAL_ERROR, "Connection initialization failed");
            let reason = close.to_string();
            if let Err(e) = sink.send(Frame::Close(Some(close))).await {
                tracing::debug!(connection_id = %shared.id, error = %e, "Close frame not written");
            }
            let _ = sink.close().await;
            shared.update(StateMachine::close);
            shared.table.cancel_all(&reason);
            return;
        }
        tracing::info!(
            connection_id = %shared.id,
            principal = %shared.tag,
            remote_addr = ?shared.remote_addr,
            "Connection open"
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        let writer = tokio::spawn(write_loop(shared.id, outbound_rx, sink, stop_rx));

        let mut keepalive = shared.options.keepalive_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut closing_deadline: Option<Instant> = None;

        let exit = loop {
            if closing_deadline.is_some() && shared.table.is_empty() {
                break Exit::Local(take_close_request(&shared));
            }

            tokio::select! {
                frame = inbound.next() => match frame {
                    Some(Ok(Frame::Binary(data))) => {
                        handle_binary(&shared, &context, &dispatcher, &dispatch_limit, data);
                    }
                    Some(Ok(Frame::Text(_))) => {
                        tracing::debug!(connection_id = %shared.id, "Dropping text frame");
                        metrics::record_frame_dropped("text");
                    }
                    Some(Ok(Frame::Ping(_))) | Some(Ok(Frame::Pong(_))) => {}
                    Some(Ok(Frame::Close(reason))) => {
                        let reason = reason.map_or_else(|| "peer closed".to_string(), |r| r.to_string());
                        break Exit::Remote(reason);
                    }
                    Some(Err(e)) => {
                        tracing::warn!(connection_id = %shared.id, error = %e, "Transport error");
                        break Exit::Remote(format!("transport error: {}", e));
                    }
                    None => break Exit::Remote("stream ended".to_string()),
                },
                _ = shared.close_notify.notified(), if closing_deadline.is_none() => {
                    shared.begin_closing();
                    closing_deadline = Some(Instant::now() + shared.options.close_grace);
                }
                _ = recv_shutdown(&mut shutdown), if closing_deadline.is_none() => {
                    shutdown = None;
                    ConnectionHandle { shared: Arc::clone(&shared) }
                        .close(close_code::GOING_AWAY, "Server shutting down");
                    shared.begin_closing();
                    closing_deadline = Some(Instant::now() + shared.options.close_grace);
                }
                _ = sleep_until(closing_deadline) => {
                    tracing::debug!(
                        connection_id = %shared.id,
                        pending = shared.table.len(),
                        "Close grace elapsed"
                    );
                    break Exit::Local(take_close_request(&shared));
                }
                _ = tick(&mut keepalive) => {
                    let expired = shared.table.expire_overdue();
                    if expired > 0 {
                        tracing::debug!(connection_id = %shared.id, expired, "Expired overdue requests");
                    }
                    let _ = shared.outbound.try_send(Frame::Ping(Bytes::new()));
                }
            }
        };

        let reason = match exit {
            Exit::Local(close) => {
                let reason = close.to_string();
                let frame = Frame::Close(Some(close));
                if shared
                    .outbound
                    .send_timeout(frame, shared.options.close_grace)
                    .await
                    .is_err()
                {
                    tracing::debug!(connection_id = %shared.id, "Close frame not queued");
                }
                reason
            }
            Exit::Remote(reason) => {
                shared.begin_closing();
                reason
            }
        };

        let _ = stop_tx.send(());
        if tokio::time::timeout(shared.options.close_grace, writer).await.is_err() {
            tracing::debug!(connection_id = %shared.id, "Writer did not finish within grace");
        }

        shared.update(StateMachine::close);
        let released = shared.table.cancel_all(&reason);
        tracing::info!(
            connection_id = %shared.id,
            principal = %shared.tag,
            reason = %reason,
            released,
            "Connection closed"
        );
    }
}

fn take_close_request(shared: &Shared) -> CloseReason {
    shared
        .close_request
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
        .unwrap_or_else(|| CloseReason::new(close_code::NORMAL, "Normal closure"))
}

async fn recv_shutdown(shutdown: &mut Option<broadcast::Receiver<()>>) {
    match shutdown {
        Some(rx) => {
            let _ = rx.recv().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn write_loop<Si, E>(
    id: ConnectionId,
    mut outbound: mpsc::Receiver<Frame>,
    mut sink: Si,
    mut stop: oneshot::Receiver<()>,
) where
    Si: Sink<Frame, Error = E> + Unpin,
    E: std::fmt::Display,
{
    loop {
        let frame = tokio::select! {
            biased;
            frame = outbound.recv() => frame,
            _ = &mut stop => None,
        };
        let Some(frame) = frame else {
            break;
        };

        let is_close = matches!(frame, Frame::Close(_));
        if let Err(e) = sink.send(frame).await {
            tracing::debug!(connection_id = %id, error = %e, "Write failed");
            break;
        }
        if is_close {
            break;
        }
    }
    if let Err(e) = sink.close().await {
        tracing::trace!(connection_id = %id, error = %e, "Sink close failed");
    }
}

fn handle_binary(
    shared: &Arc<Shared>,
    context: &Arc<SessionContext>,
    dispatcher: &Arc<dyn Dispatcher>,
    dispatch_limit: &Arc<Semaphore>,
    data: Bytes,
) {
    let accepts_requests = {
        let machine = shared.machine();
        if let Err(e) = machine.check_frame() {
            tracing::warn!(connection_id = %shared.id, error = %e, "Dropping frame");
            metrics::record_frame_dropped("state");
            return;
        }
        machine.accepts_requests()
    };

    let envelope = match Envelope::decode(&data) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(connection_id = %shared.id, error = %e, len = data.len(), "Dropping malformed frame");
            metrics::record_frame_dropped("malformed");
            return;
        }
    };

    match envelope {
        Envelope::Request(request) => {
            if !accepts_requests {
                tracing::debug!(
                    connection_id = %shared.id,
                    verb = %request.verb,
                    path = %request.path,
                    "Dropping request received while closing"
                );
                metrics::record_frame_dropped("closing");
                return;
            }
            match Arc::clone(dispatch_limit).try_acquire_owned() {
                Ok(permit) => {
                    tokio::spawn(dispatch_request(
                        Arc::clone(shared),
                        Arc::clone(context),
                        Arc::clone(dispatcher),
                        request,
                        permit,
                    ));
                }
                Err(_) => reject_busy(shared, request),
            }
        }
        Envelope::Response(response) => {
            let id = response.id;
            match shared.table.resolve_response(response) {
                Resolution::Matched => {}
                Resolution::Late => {
                    tracing::debug!(connection_id = %shared.id, id, "Discarding late response");
                    metrics::record_unmatched_response("late");
                }
                Resolution::Unmatched => {
                    tracing::warn!(connection_id = %shared.id, id, "Discarding unmatched response");
                    metrics::record_unmatched_response("unmatched");
                }
            }
        }
        Envelope::Unknown => {
            tracing::debug!(connection_id = %shared.id, "Dropping envelope of unknown type");
            metrics::record_frame_dropped("unknown");
        }
    }
}

fn reject_busy(shared: &Shared, request: RequestMessage) {
    tracing::warn!(
        connection_id = %shared.id,
        verb = %request.verb,
        path = %request.path,
        "Dispatch limit reached; rejecting request"
    );
    let Some(id) = request.id else {
        metrics::record_frame_dropped("busy");
        return;
    };

    let mut record = shared.record(Direction::Inbound, &request, Instant::now());
    let response = ResponseMessage::new(id, 503, "Too many concurrent requests");
    record.status = Some(response.status);
    if shared
        .outbound
        .try_send(Frame::Binary(Envelope::Response(response).encode()))
        .is_err()
    {
        tracing::debug!(connection_id = %shared.id, id, "Outbound queue full; busy response dropped");
    }
    shared.logger.log(record);
}

async fn dispatch_request(
    shared: Arc<Shared>,
    context: Arc<SessionContext>,
    dispatcher: Arc<dyn Dispatcher>,
    request: RequestMessage,
    _permit: OwnedSemaphorePermit,
) {
    let started = Instant::now();
    let id = request.id;
    let mut record = shared.record(Direction::Inbound, &request, started);

    let outcome = AssertUnwindSafe(dispatcher.dispatch(context, request))
        .catch_unwind()
        .await;
    let response = match outcome {
        Ok(Ok(response)) => response,
        Ok(Err(e)) => {
            tracing::debug!(connection_id = %shared.id, path = %record.path, error = %e, "Dispatch failed");
            e.into_response()
        }
        Err(_) => {
            tracing::error!(connection_id = %shared.id, path = %record.path, "Dispatcher panicked");
            DispatchResponse::new(500, "Internal Server Error")
        }
    };

    record.duration = started.elapsed();
    match id {
        Some(id) => {
            record.status = Some(response.status);
            record.response_length = response.body.as_ref().map(Bytes::len);
            let frame = Frame::Binary(Envelope::Response(response.into_response(id)).encode());
            if shared.enqueue(frame).await.is_err() {
                tracing::debug!(connection_id = %shared.id, id, "Connection closed before response was written");
            }
        }
        None => {
            tracing::trace!(connection_id = %shared.id, path = %record.path, "Fire-and-forget request handled");
        }
    }
    shared.logger.log(record);
}

/// A context whose connection is never run.
#[cfg(test)]
pub(crate) fn detached_context(principal: Option<Principal>) -> Arc<SessionContext> {
    let connection = Connection::new(
        principal,
        ConnectionAttributes::new(),
        None,
        Arc::new(crate::dispatch::NoDispatcher),
        RequestLogger::disabled(),
        ConnectionOptions::default(),
    );
    Arc::clone(connection.context())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{BasicAuthenticator, CredentialStore};
    use crate::config::{AuthConfig, CredentialConfig};

    fn authenticator() -> BasicAuthenticator {
        BasicAuthenticator::new(CredentialStore::from_config(&AuthConfig {
            credentials: vec![CredentialConfig {
                account: "alice".into(),
                device_id: 1,
                password: "secret".into(),
            }],
        }))
    }

    async fn establish(handshake: HandshakeRequest) -> Result<Connection, AuthError> {
        Connection::establish(
            &authenticator(),
            &handshake,
            Arc::new(crate::dispatch::NoDispatcher),
            RequestLogger::disabled(),
            ConnectionOptions::default(),
        )
        .await
    }

    #[tokio::test]
    async fn establish_binds_principal_and_attributes() {
        let handshake = HandshakeRequest::new("GET", "/v1/websocket/")
            .with_header("Authorization", crate::auth::basic::basic_header("alice", "secret"))
            .with_header("X-Receive-Stories", "true");
        let connection = establish(handshake).await.unwrap();

        let context = connection.context();
        assert_eq!(context.principal(), Some(&Principal::new("alice", 1)));
        assert!(context.attributes().receive_stories());
        assert_eq!(connection.handle().state(), ConnectionState::Authenticated);
    }

    #[tokio::test]
    async fn establish_anonymous() {
        let connection = establish(HandshakeRequest::new("GET", "/v1/websocket/"))
            .await
            .unwrap();
        assert!(!connection.context().is_authenticated());
        assert_eq!(connection.handle().state(), ConnectionState::Anonymous);
    }

    #[tokio::test]
    async fn establish_refuses_bad_credentials() {
        let handshake = HandshakeRequest::new("GET", "/v1/websocket/")
            .with_header("Authorization", crate::auth::basic::basic_header("alice", "nope"));
        assert_eq!(establish(handshake).await.err(), Some(AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn push_strips_id() {
        let connection = Connection::new(
            None,
            ConnectionAttributes::new(),
            None,
            Arc::new(crate::dispatch::NoDispatcher),
            RequestLogger::disabled(),
            ConnectionOptions::default(),
        );
        let handle = connection.handle();
        let Connection { mut outbound_rx, .. } = connection;

        handle
            .push(RequestMessage::new("PUT", "/v1/queue/empty").with_id(9))
            .await
            .unwrap();
        assert_eq!(handle.pending_requests(), 0);

        let Some(Frame::Binary(data)) = outbound_rx.recv().await else {
            panic!("expected a binary frame");
        };
        match Envelope::decode(&data).unwrap() {
            Envelope::Request(request) => assert_eq!(request.id, None),
            other => panic!("unexpected envelope {:?}", other),
        }
    }

    #[tokio::test]
    async fn requests_get_sequential_ids_from_zero() {
        let connection = Connection::new(
            None,
            ConnectionAttributes::new(),
            None,
            Arc::new(crate::dispatch::NoDispatcher),
            RequestLogger::disabled(),
            ConnectionOptions::default(),
        );
        let handle = connection.handle();
        let Connection { mut outbound_rx, .. } = connection;

        let first = handle.start_request(RequestMessage::new("GET", "/a"), None).await.unwrap();
        let second = handle.start_request(RequestMessage::new("GET", "/b"), None).await.unwrap();
        assert_eq!((first.id(), second.id()), (0, 1));
        assert_eq!(handle.pending_requests(), 2);

        assert!(handle.cancel(first.id()));
        assert_eq!(first.wait().await, Err(ProtocolError::Cancelled));
        assert!(outbound_rx.recv().await.is_some());
    }

    type Inbound = std::pin::Pin<Box<dyn Stream<Item = Result<Frame, std::io::Error>> + Send>>;

    /// Inbound frames fed from a channel.
    fn channel_stream() -> (mpsc::UnboundedSender<Frame>, Inbound) {
        let (tx, rx) = mpsc::unbounded_channel::<Frame>();
        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|frame| (Ok(frame), rx))
        });
        (tx, Box::pin(stream))
    }

    fn bare_connection(options: ConnectionOptions) -> Connection {
        Connection::new(
            None,
            ConnectionAttributes::new(),
            None,
            Arc::new(crate::dispatch::NoDispatcher),
            RequestLogger::disabled(),
            options,
        )
    }

    #[tokio::test]
    async fn peer_close_passes_through_closing() {
        let options = ConnectionOptions {
            keepalive_interval: None,
            close_grace: Duration::from_millis(300),
            ..ConnectionOptions::default()
        };
        let connection = bare_connection(options);
        let handle = connection.handle();
        let (inbound_tx, inbound) = channel_stream();
        // A sink that never finishes a write keeps the writer busy.
        let sink = Box::pin(futures_util::sink::unfold((), |(), _frame: Frame| async {
            std::future::pending::<Result<(), std::io::Error>>().await
        }));
        let task = tokio::spawn(connection.run(inbound, sink));

        handle.push(RequestMessage::new("PUT", "/v1/queue/empty")).await.unwrap();
        inbound_tx.send(Frame::Close(None)).unwrap();

        let mut states = handle.shared.state_tx.subscribe();
        tokio::time::timeout(
            Duration::from_secs(1),
            states.wait_for(|state| *state == ConnectionState::Closing),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(matches!(
            handle.start_request(RequestMessage::new("GET", "/v1/ping"), None).await,
            Err(ProtocolError::ConnectionClosing(_))
        ));
        assert!(matches!(
            handle.push(RequestMessage::new("PUT", "/v1/queue/empty")).await,
            Err(ProtocolError::ConnectionClosing(_))
        ));

        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert_eq!(handle.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn failed_open_closes_with_internal_error() {
        let connection = bare_connection(ConnectionOptions::default());
        let handle = connection.handle();
        connection.shared.update(StateMachine::close);

        let (written_tx, mut written) = mpsc::unbounded_channel::<Frame>();
        let sink = Box::pin(futures_util::sink::unfold(written_tx, |tx, frame: Frame| async move {
            let _ = tx.send(frame);
            Ok::<_, std::io::Error>(tx)
        }));
        let (_inbound_tx, inbound) = channel_stream();
        connection.run(inbound, sink).await;

        match written.recv().await {
            Some(Frame::Close(Some(reason))) => assert_eq!(reason.code, close_code::INTERNAL_ERROR),
            other => panic!("expected a close frame, got {:?}", other),
        }
        assert_eq!(handle.state(), ConnectionState::Closed);
        assert!(matches!(
            handle.start_request(RequestMessage::new("GET", "/v1/ping"), None).await,
            Err(ProtocolError::ConnectionClosing(_))
        ));
    }

    #[test]
    fn close_keeps_first_reason() {
        let context = detached_context(None);
        let handle = context.handle();
        handle.close(close_code::CONNECTED_ELSEWHERE, "Connected elsewhere");
        handle.close(close_code::NORMAL, "bye");
        assert_eq!(
            handle.requested_close(),
            Some(CloseReason::new(close_code::CONNECTED_ELSEWHERE, "Connected elsewhere"))
        );
    }
}
