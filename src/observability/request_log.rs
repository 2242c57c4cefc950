//! Per-exchange request log.
//!
//! # Responsibilities
//! - One record per completed exchange, in either direction
//! - Hand records to a background writer through a bounded queue
//! - Never block or fail the protocol path
//!
//! Absent values (no status for a push, no body) render as `-`.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;

use crate::net::connection::ConnectionId;
use crate::observability::metrics;

/// Which peer initiated the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Remote peer sent the request; we dispatched it.
    Inbound,
    /// We sent the request (server push or client call).
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeRecord {
    pub connection_id: ConnectionId,
    pub direction: Direction,
    pub verb: String,
    pub path: String,
    pub status: Option<i32>,
    pub request_length: Option<usize>,
    pub response_length: Option<usize>,
    pub remote_addr: Option<SocketAddr>,
    pub duration: Duration,
    /// Principal of the connection, or `anonymous`.
    pub tag: String,
}

struct OrDash<T>(Option<T>);

impl<T: std::fmt::Display> std::fmt::Display for OrDash<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            Some(value) => value.fmt(f),
            None => f.write_str("-"),
        }
    }
}

impl std::fmt::Display for ExchangeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} \"{} {}\" {} {} {} {} {}ms",
            OrDash(self.remote_addr),
            self.tag,
            self.connection_id,
            self.verb,
            self.path,
            self.direction,
            OrDash(self.status),
            OrDash(self.request_length),
            OrDash(self.response_length),
            self.duration.as_millis()
        )
    }
}

/// Destination for exchange records.
pub trait ExchangeSink: Send + Sync + 'static {
    fn write(&self, record: &ExchangeRecord);
}

impl<T: ExchangeSink> ExchangeSink for Arc<T> {
    fn write(&self, record: &ExchangeRecord) {
        (**self).write(record)
    }
}

/// Writes records as `tracing` events on the `request_log` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ExchangeSink for TracingSink {
    fn write(&self, record: &ExchangeRecord) {
        tracing::info!(
            target: "request_log",
            connection_id = %record.connection_id,
            direction = %record.direction,
            verb = %record.verb,
            path = %record.path,
            status = ?record.status,
            duration_ms = record.duration.as_millis() as u64,
            "{}",
            record
        );
    }
}

/// Keeps records in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<ExchangeRecord>>,
}

impl MemorySink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<ExchangeRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

impl ExchangeSink for MemorySink {
    fn write(&self, record: &ExchangeRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
    }
}

/// Cloneable handle feeding the background log writer.
#[derive(Clone, Debug)]
pub struct RequestLogger {
    tx: Option<mpsc::Sender<ExchangeRecord>>,
}

impl RequestLogger {
    /// Start the writer task. Must be called inside a tokio runtime.
    pub fn spawn(sink: impl ExchangeSink, buffer: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<ExchangeRecord>(buffer.max(1));
        let task = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                sink.write(&record);
            }
        });
        (Self { tx: Some(tx) }, task)
    }

    /// A logger that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Queue a record. Drops it if the buffer is full.
    pub fn log(&self, record: ExchangeRecord) {
        metrics::record_exchange(record.direction, record.status, record.duration);

        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => metrics::record_request_log_dropped(),
            Err(TrySendError::Closed(_)) => {}
        }
    }
}
