//! Per-connection correlation of requests and responses.
//!
//! # Responsibilities
//! - Generate ids for locally initiated requests
//! - Hold one pending waiter per outstanding id
//! - Complete waiters on response, cancellation, timeout or close
//!
//! Ids of remotely initiated requests never enter this table; they are
//! echoed back verbatim in the response.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::ProtocolError;
use crate::protocol::ResponseMessage;

/// How many expired ids are remembered for late-response classification.
const RECENTLY_EXPIRED: usize = 256;

type ResultSlot = oneshot::Sender<Result<ResponseMessage, ProtocolError>>;

struct PendingExchange {
    created_at: Instant,
    deadline: Option<Instant>,
    result_slot: ResultSlot,
}

#[derive(Default)]
struct TableState {
    next_id: u64,
    pending: HashMap<u64, PendingExchange>,
    /// Set once the connection begins closing; carries the reason.
    closing: Option<String>,
    expired: VecDeque<u64>,
}

impl TableState {
    fn remember_expired(&mut self, id: u64) {
        if self.expired.len() == RECENTLY_EXPIRED {
            self.expired.pop_front();
        }
        self.expired.push_back(id);
    }
}

/// Outcome of matching an inbound response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// A waiter was completed.
    Matched,
    /// The id timed out recently; the response arrived too late.
    Late,
    /// No waiter ever existed for the id, or it was cancelled.
    Unmatched,
}

/// Map from request id to pending waiter, scoped to one connection.
#[derive(Clone)]
pub struct CorrelationTable {
    inner: Arc<Mutex<TableState>>,
    max_pending: usize,
}

impl CorrelationTable {
    pub fn new(max_pending: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TableState::default())),
            max_pending,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TableState> {
        lock_state(&self.inner)
    }

    /// Next id for a locally initiated request. Starts at 0, never reused.
    pub fn next_id(&self) -> u64 {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        id
    }

    /// Insert a waiter for `id`.
    pub fn register_wait(
        &self,
        id: u64,
        timeout: Option<Duration>,
    ) -> Result<PendingResponse, ProtocolError> {
        let mut state = self.lock();
        if let Some(reason) = &state.closing {
            return Err(ProtocolError::ConnectionClosing(reason.clone()));
        }
        if state.pending.contains_key(&id) {
            return Err(ProtocolError::DuplicateId(id));
        }
        if state.pending.len() >= self.max_pending {
            tracing::warn!(
                pending = state.pending.len(),
                max_pending = self.max_pending,
                "Too many pending requests; refusing new request"
            );
            return Err(ProtocolError::TooManyPending(self.max_pending));
        }

        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let deadline = timeout.map(|t| now + t);
        state.pending.insert(
            id,
            PendingExchange {
                created_at: now,
                deadline,
                result_slot: tx,
            },
        );

        Ok(PendingResponse {
            id,
            deadline,
            rx,
            table: Arc::downgrade(&self.inner),
        })
    }

    /// Complete the waiter for `response.id`. Returns false if none matched.
    pub fn resolve(&self, response: ResponseMessage) -> bool {
        self.resolve_response(response) == Resolution::Matched
    }

    pub fn resolve_response(&self, response: ResponseMessage) -> Resolution {
        let id = response.id;
        let mut state = self.lock();
        let entry = match state.pending.remove(&id) {
            Some(entry) => entry,
            None if state.expired.contains(&id) => return Resolution::Late,
            None => return Resolution::Unmatched,
        };

        // Sent under the lock; a waiter past its deadline relies on it.
        if entry.result_slot.send(Ok(response)).is_err() {
            state.remember_expired(id);
            return Resolution::Late;
        }
        drop(state);

        tracing::trace!(
            id,
            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
            "Response matched pending request"
        );
        Resolution::Matched
    }

    /// Drop interest in one id. A later response for it is unmatched.
    pub fn cancel(&self, id: u64) -> bool {
        let mut state = self.lock();
        match state.pending.remove(&id) {
            Some(entry) => {
                let _ = entry.result_slot.send(Err(ProtocolError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// Refuse new registrations while keeping existing waiters.
    pub fn begin_closing(&self) {
        let mut state = self.lock();
        if state.closing.is_none() {
            state.closing = Some("connection is closing".to_string());
        }
    }

    /// Fail every outstanding waiter with `reason`. Returns how many were
    /// released.
    pub fn cancel_all(&self, reason: &str) -> usize {
        let mut state = self.lock();
        state.closing = Some(reason.to_string());
        let count = state.pending.len();
        for (_, entry) in state.pending.drain() {
            let _ = entry
                .result_slot
                .send(Err(ProtocolError::ConnectionClosing(reason.to_string())));
        }
        count
    }

    /// Complete every waiter whose deadline has passed with `Timeout`.
    pub fn expire_overdue(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let overdue: Vec<u64> = state
            .pending
            .iter()
            .filter(|(_, entry)| entry.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();

        for id in &overdue {
            if let Some(entry) = state.pending.remove(id) {
                state.remember_expired(*id);
                let _ = entry.result_slot.send(Err(ProtocolError::Timeout));
            }
        }
        overdue.len()
    }

    pub fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().pending.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.lock().pending.contains_key(&id)
    }

    /// Ids currently outstanding, sorted (for diagnostics).
    pub fn pending_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.lock().pending.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

fn lock_state(inner: &Mutex<TableState>) -> MutexGuard<'_, TableState> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The receiving half of a registered wait.
#[derive(Debug)]
pub struct PendingResponse {
    id: u64,
    deadline: Option<Instant>,
    rx: oneshot::Receiver<Result<ResponseMessage, ProtocolError>>,
    table: Weak<Mutex<TableState>>,
}

impl PendingResponse {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the matching response, a timeout, a cancellation or the
    /// connection closing.
    pub async fn wait(mut self) -> Result<ResponseMessage, ProtocolError> {
        let Some(deadline) = self.deadline else {
            return flatten((&mut self.rx).await);
        };

        match tokio::time::timeout_at(deadline, &mut self.rx).await {
            Ok(result) => flatten(result),
            Err(_) => {
                let removed = match self.table.upgrade() {
                    Some(inner) => {
                        let mut state = lock_state(&inner);
                        let removed = state.pending.remove(&self.id).is_some();
                        if removed {
                            state.remember_expired(self.id);
                        }
                        removed
                    }
                    None => true,
                };

                if removed {
                    return Err(ProtocolError::Timeout);
                }
                // Completed concurrently with the deadline; the resolver
                // filled the slot before releasing the lock.
                self.rx.try_recv().unwrap_or(Err(ProtocolError::Timeout))
            }
        }
    }
}

/// Dropping a wait without awaiting it cancels the request.
impl Drop for PendingResponse {
    fn drop(&mut self) {
        if let Some(inner) = self.table.upgrade() {
            lock_state(&inner).pending.remove(&self.id);
        }
    }
}

fn flatten(
    result: Result<Result<ResponseMessage, ProtocolError>, oneshot::error::RecvError>,
) -> Result<ResponseMessage, ProtocolError> {
    result.unwrap_or_else(|_| Err(ProtocolError::ConnectionClosing("connection dropped".into())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(id: u64) -> ResponseMessage {
        ResponseMessage::new(id, 200, "OK")
    }

    #[test]
    fn ids_increase_from_zero() {
        let table = CorrelationTable::new(16);
        assert_eq!(table.next_id(), 0);
        assert_eq!(table.next_id(), 1);
        assert_eq!(table.next_id(), 2);
    }

    #[test]
    fn duplicate_id_rejected() {
        let table = CorrelationTable::new(16);
        let _first = table.register_wait(5, None).unwrap();
        assert_eq!(
            table.register_wait(5, None).unwrap_err(),
            ProtocolError::DuplicateId(5)
        );
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn unmatched_resolve_leaves_table_alone() {
        let table = CorrelationTable::new(16);
        let _pending = table.register_wait(1, None).unwrap();
        assert!(!table.resolve(response(99)));
        assert_eq!(table.pending_ids(), vec![1]);
        assert_eq!(table.resolve_response(response(98)), Resolution::Unmatched);
    }

    #[test]
    fn pending_limit() {
        let table = CorrelationTable::new(2);
        let _a = table.register_wait(0, None).unwrap();
        let _b = table.register_wait(1, None).unwrap();
        assert_eq!(
            table.register_wait(2, None).unwrap_err(),
            ProtocolError::TooManyPending(2)
        );
    }

    #[tokio::test]
    async fn resolve_completes_waiter() {
        let table = CorrelationTable::new(16);
        let id = table.next_id();
        let pending = table.register_wait(id, Some(Duration::from_secs(5))).unwrap();

        assert!(table.resolve(response(id).with_body(&b"pong"[..])));
        let got = pending.wait().await.unwrap();
        assert_eq!(got.status, 200);
        assert_eq!(got.body.as_deref(), Some(&b"pong"[..]));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn out_of_order_responses_match_by_id() {
        let table = CorrelationTable::new(16);
        let first = table.register_wait(0, None).unwrap();
        let second = table.register_wait(1, None).unwrap();

        assert!(table.resolve(ResponseMessage::new(1, 201, "Created")));
        assert!(table.resolve(ResponseMessage::new(0, 200, "OK")));

        assert_eq!(first.wait().await.unwrap().status, 200);
        assert_eq!(second.wait().await.unwrap().status, 201);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_times_out_and_is_removed() {
        let table = CorrelationTable::new(16);
        let pending = table.register_wait(3, Some(Duration::from_secs(5))).unwrap();
        let start = Instant::now();

        assert_eq!(pending.wait().await.unwrap_err(), ProtocolError::Timeout);
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(!table.contains(3));

        // The late reply is classified, not matched.
        assert_eq!(table.resolve_response(response(3)), Resolution::Late);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_expires_only_overdue_waiters() {
        let table = CorrelationTable::new(16);
        let short = table.register_wait(0, Some(Duration::from_secs(1))).unwrap();
        let _long = table.register_wait(1, Some(Duration::from_secs(10))).unwrap();
        let _forever = table.register_wait(2, None).unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(table.expire_overdue(), 1);
        assert_eq!(table.pending_ids(), vec![1, 2]);
        assert_eq!(short.wait().await.unwrap_err(), ProtocolError::Timeout);
    }

    #[tokio::test]
    async fn cancel_all_releases_every_waiter() {
        let table = CorrelationTable::new(16);
        let waiters: Vec<_> = (0..3)
            .map(|_| table.register_wait(table.next_id(), None).unwrap())
            .collect();

        assert_eq!(table.cancel_all("peer went away"), 3);
        assert!(table.is_empty());

        for waiter in waiters {
            assert_eq!(
                waiter.wait().await.unwrap_err(),
                ProtocolError::ConnectionClosing("peer went away".into())
            );
        }
        assert!(matches!(
            table.register_wait(10, None),
            Err(ProtocolError::ConnectionClosing(_))
        ));
    }

    #[tokio::test]
    async fn closing_refuses_new_waits_but_resolves_pending() {
        let table = CorrelationTable::new(16);
        let pending = table.register_wait(0, None).unwrap();

        table.begin_closing();
        assert!(matches!(
            table.register_wait(1, None),
            Err(ProtocolError::ConnectionClosing(_))
        ));
        assert!(table.resolve(response(0)));
        assert!(pending.wait().await.is_ok());
    }

    #[test]
    fn dropped_waits_free_their_slots() {
        let table = CorrelationTable::new(2);
        drop(table.register_wait(0, None).unwrap());
        drop(table.register_wait(1, None).unwrap());
        assert!(table.is_empty());

        let _a = table.register_wait(2, None).unwrap();
        let _b = table.register_wait(3, None).unwrap();
        assert_eq!(table.pending_ids(), vec![2, 3]);
        assert_eq!(table.resolve_response(response(0)), Resolution::Unmatched);
    }

    #[tokio::test]
    async fn abandoned_wait_is_removed() {
        let table = CorrelationTable::new(16);
        let pending = table.register_wait(7, None).unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(10), pending.wait()).await;
        assert!(waited.is_err());
        assert!(!table.contains(7));
    }

    #[tokio::test(start_paused = true)]
    async fn response_resolved_at_deadline_is_delivered() {
        let table = CorrelationTable::new(16);
        let pending = table.register_wait(8, Some(Duration::from_secs(1))).unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        // Resolved after the deadline passed but before the waiter ran.
        assert_eq!(table.resolve_response(response(8)), Resolution::Matched);
        assert_eq!(pending.wait().await.unwrap().status, 200);
    }

    #[tokio::test]
    async fn cancelled_id_does_not_resurrect() {
        let table = CorrelationTable::new(16);
        let pending = table.register_wait(4, None).unwrap();

        assert!(table.cancel(4));
        assert!(!table.cancel(4));
        assert_eq!(pending.wait().await.unwrap_err(), ProtocolError::Cancelled);
        assert_eq!(table.resolve_response(response(4)), Resolution::Unmatched);
    }
}
