//! Correlation Table - maps outstanding request ids to their waiting callers.
//!
//! # Flow
//!
//! 1. A caller registers a request and gets back `(id, PendingResponse)`
//! 2. The request is written to the transport with that id
//! 3. The caller awaits the `PendingResponse`
//! 4. The read loop hands the matching response to `complete()`
//! 5. The table removes the entry and delivers the outcome through a oneshot
//!
//! Every entry is removed exactly once: by a response, a timeout, a
//! cancellation, or `flush_all()` when the transport closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::api::types::ApiError;
use crate::protocols::codec::{RequestId, Response};

type Completion = Result<Value, ApiError>;

/// An outstanding request awaiting its response
struct PendingRequest {
    /// Allocation order, for diagnostics
    seq: i64,
    method: String,
    issued_at: Instant,
    /// Oneshot sender to deliver the outcome
    tx: oneshot::Sender<Completion>,
}

/// Table of outstanding requests for one transport instance.
pub struct CorrelationTable {
    next_id: AtomicI64,
    pending: Mutex<HashMap<RequestId, PendingRequest>>,
}

impl CorrelationTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicI64::new(1),
            pending: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new outbound request.
    ///
    /// # Arguments
    /// * `method` - Method name, kept for diagnostics and error messages
    /// * `timeout` - Optional deadline; `None` waits until response or flush
    ///
    /// # Returns
    /// The freshly allocated id and a handle resolving with the outcome.
    pub fn register(
        self: &Arc<Self>,
        method: &str,
        timeout: Option<Duration>,
    ) -> (RequestId, PendingResponse) {
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = RequestId::Number(seq);
        let (tx, rx) = oneshot::channel();

        let mut pending = self.lock();
        pending.insert(
            id.clone(),
            PendingRequest {
                seq,
                method: method.to_string(),
                issued_at: Instant::now(),
                tx,
            },
        );
        log::trace!(
            "Registered request: id={id}, method={method}, outstanding={}",
            pending.len()
        );
        drop(pending);

        let handle = PendingResponse {
            id: id.clone(),
            method: method.to_string(),
            timeout,
            rx,
            table: Arc::downgrade(self),
        };
        (id, handle)
    }

    fn take(&self, id: &RequestId) -> Option<PendingRequest> {
        self.lock().remove(id)
    }

    fn deliver(&self, id: &RequestId, outcome: Completion) -> bool {
        let Some(entry) = self.take(id) else {
            log::warn!("Completion for unknown request id={id} ignored (late or duplicate response)");
            return false;
        };
        log::debug!(
            "Request completed: id={id}, method={}, ok={}, elapsed_ms={}",
            entry.method,
            outcome.is_ok(),
            entry.issued_at.elapsed().as_millis()
        );
        if entry.tx.send(outcome).is_err() {
            log::debug!(
                "Caller abandoned request before completion: id={id}, method={}",
                entry.method
            );
        }
        true
    }

    /// Resolve a pending request with its result.
    ///
    /// Returns `false` (and does nothing else) when the id is unknown.
    pub fn resolve(&self, id: &RequestId, result: Value) -> bool {
        self.deliver(id, Ok(result))
    }

    /// Reject a pending request with an error.
    ///
    /// Returns `false` (and does nothing else) when the id is unknown.
    pub fn reject(&self, id: &RequestId, error: ApiError) -> bool {
        self.deliver(id, Err(error))
    }

    /// Route a wire response to `resolve` or `reject`.
    ///
    /// Error responses become `ApiError::Remote` with the peer's code,
    /// message and data intact.
    pub fn complete(&self, response: Response) -> bool {
        let Response { id, result } = response;
        match result {
            Ok(value) => self.resolve(&id, value),
            Err(error) => self.reject(
                &id,
                ApiError::Remote {
                    code: error.code,
                    message: error.message,
                    data: error.data,
                },
            ),
        }
    }

    /// Drop interest in a pending request without sending anything to the peer.
    ///
    /// Returns `true` if the request was still outstanding.
    pub fn cancel(&self, id: &RequestId) -> bool {
        let removed = self.take(id);
        if let Some(entry) = &removed {
            log::debug!("Request cancelled by caller: id={id}, method={}", entry.method);
        }
        removed.is_some()
    }

    /// Reject every outstanding request with `error`.
    ///
    /// Returns the number of requests flushed.
    pub fn flush_all(&self, error: ApiError) -> usize {
        let drained: Vec<(RequestId, PendingRequest)> = self.lock().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            log::debug!("Flushing request: id={id}, method={}", entry.method);
            let _ = entry.tx.send(Err(error.clone()));
        }
        if count > 0 {
            log::info!("Flushed {count} outstanding request(s): {error}");
        }
        count
    }

    /// Number of outstanding requests.
    pub fn outstanding(&self) -> usize {
        self.lock().len()
    }

    /// Methods of the outstanding requests, oldest first.
    pub fn pending_methods(&self) -> Vec<String> {
        let pending = self.lock();
        let mut entries: Vec<(i64, &String)> = pending
            .values()
            .map(|entry| (entry.seq, &entry.method))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, method)| method.clone()).collect()
    }
}

/// Awaitable outcome of a registered request.
pub struct PendingResponse {
    id: RequestId,
    method: String,
    timeout: Option<Duration>,
    rx: oneshot::Receiver<Completion>,
    table: std::sync::Weak<CorrelationTable>,
}

impl PendingResponse {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the response, the deadline, or a flush.
    pub async fn wait(self) -> Result<Value, ApiError> {
        let PendingResponse {
            id,
            method,
            timeout,
            rx,
            table,
        } = self;

        let received = match timeout {
            None => rx.await,
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    if let Some(table) = table.upgrade() {
                        table.take(&id);
                    }
                    log::warn!(
                        "Request timed out: id={id}, method={method}, timeout_ms={}",
                        limit.as_millis()
                    );
                    return Err(ApiError::Timeout {
                        method,
                        timeout_ms: limit.as_millis() as u64,
                    });
                }
            },
        };

        match received {
            Ok(outcome) => outcome,
            // Entry removed without an outcome (cancelled, or table dropped)
            Err(_) => Err(ApiError::disconnected(format!(
                "request {method} abandoned before completion"
            ))),
        }
    }
}
