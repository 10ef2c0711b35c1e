use crate::error::SupervisorError;
use crate::process::ExitInfo;
use crate::protocol::{RemoteError, Response};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub type CallResult = Result<Value, SupervisorError>;

/// Monotonic request id source.
///
/// Shared by every process incarnation of one launch session, so a response
/// from a dead process can never carry an id that a newer request owns.
#[derive(Debug, Clone)]
pub struct IdSequence(Arc<AtomicU64>);

impl Default for IdSequence {
    fn default() -> Self {
        Self(Arc::new(AtomicU64::new(1)))
    }
}

impl IdSequence {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Why the correlator stopped accepting requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Crashed(ExitInfo),
    Stopped,
}

impl CloseReason {
    pub fn to_error(self) -> SupervisorError {
        match self {
            CloseReason::Crashed(exit) => SupervisorError::ProcessCrash { exit },
            CloseReason::Stopped => SupervisorError::Cancelled,
        }
    }
}

pub struct PendingRequest {
    pub method: String,
    pub issued_at: Instant,
    pub deadline: Instant,
    completion: oneshot::Sender<CallResult>,
}

/// Snapshot of an outstanding request, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSummary {
    pub id: u64,
    pub method: String,
    pub age: Duration,
    pub remaining: Duration,
}

#[derive(Default)]
struct Inner {
    pending: HashMap<u64, PendingRequest>,
    closed: Option<CloseReason>,
}

/// Matches responses to waiting callers by id.
///
/// Removing an entry from the pending map is the single point where a request
/// is decided: whoever removes it (response, timeout, crash, stop) completes
/// it, and everybody else finds it gone. That is what makes every issued call
/// complete exactly once.
pub struct RequestCorrelator {
    ids: IdSequence,
    inner: Mutex<Inner>,
}

impl RequestCorrelator {
    pub fn new(ids: IdSequence) -> Arc<Self> {
        Arc::new(Self {
            ids,
            inner: Mutex::new(Inner::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate an id and register a waiter with the given deadline
    pub fn issue(
        self: &Arc<Self>,
        method: &str,
        timeout: Duration,
    ) -> Result<PendingCall, SupervisorError> {
        let (completion, receiver) = oneshot::channel();
        let mut inner = self.lock();
        if let Some(reason) = inner.closed {
            return Err(reason.to_error());
        }

        let id = self.ids.next();
        let issued_at = Instant::now();
        inner.pending.insert(
            id,
            PendingRequest {
                method: method.to_string(),
                issued_at,
                deadline: issued_at + timeout,
                completion,
            },
        );
        drop(inner);

        Ok(PendingCall {
            id,
            method: method.to_string(),
            timeout,
            receiver,
            correlator: self.clone(),
        })
    }

    fn take(&self, id: u64) -> Option<PendingRequest> {
        self.lock().pending.remove(&id)
    }

    pub fn resolve(&self, id: u64, result: Value) -> bool {
        self.complete_with(id, Ok(result))
    }

    pub fn reject(&self, id: u64, error: RemoteError) -> bool {
        self.complete_with(id, Err(SupervisorError::Remote(error)))
    }

    /// Route a parsed response; unknown ids are dropped
    pub fn complete(&self, response: Response) -> bool {
        let id = response.id;
        self.complete_with(id, response.outcome.map_err(SupervisorError::Remote))
    }

    fn complete_with(&self, id: u64, result: CallResult) -> bool {
        match self.take(id) {
            Some(request) => {
                debug!(
                    id,
                    method = %request.method,
                    elapsed = ?request.issued_at.elapsed(),
                    "request completed"
                );
                // receiver may have been dropped by a cancelled caller
                let _ = request.completion.send(result);
                true
            }
            None => {
                warn!(id, "discarding response with no matching request");
                false
            }
        }
    }

    /// Remove a request whose deadline elapsed. Returns false if it was
    /// already completed by someone else.
    pub fn expire(&self, id: u64) -> bool {
        match self.take(id) {
            Some(request) => {
                debug!(id, method = %request.method, "request timed out");
                true
            }
            None => false,
        }
    }

    /// Drop a request without completing it (caller went away)
    pub fn forget(&self, id: u64) {
        self.lock().pending.remove(&id);
    }

    /// Reject every outstanding request and refuse new ones.
    ///
    /// The first close reason sticks; later calls only drain.
    pub fn fail_all(&self, reason: CloseReason) -> usize {
        let drained: Vec<(u64, PendingRequest)> = {
            let mut inner = self.lock();
            inner.closed.get_or_insert(reason);
            inner.pending.drain().collect()
        };
        let count = drained.len();
        for (id, request) in drained {
            debug!(id, method = %request.method, ?reason, "failing outstanding request");
            let _ = request.completion.send(Err(reason.to_error()));
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed.is_some()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lock().closed
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn outstanding(&self) -> Vec<PendingSummary> {
        let now = Instant::now();
        let mut summary: Vec<PendingSummary> = self
            .lock()
            .pending
            .iter()
            .map(|(id, request)| PendingSummary {
                id: *id,
                method: request.method.clone(),
                age: now.saturating_duration_since(request.issued_at),
                remaining: request.deadline.saturating_duration_since(now),
            })
            .collect();
        summary.sort_by_key(|s| s.id);
        summary
    }
}

/// Waiter for one issued request.
///
/// Dropping it before completion unregisters the request, so an abandoned
/// call never lingers in the pending map.
pub struct PendingCall {
    id: u64,
    method: String,
    timeout: Duration,
    receiver: oneshot::Receiver<CallResult>,
    correlator: Arc<RequestCorrelator>,
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub async fn wait(mut self) -> CallResult {
        match tokio::time::timeout(self.timeout, &mut self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SupervisorError::Cancelled),
            Err(_) => {
                if self.correlator.expire(self.id) {
                    return Err(SupervisorError::RequestTimeout {
                        id: self.id,
                        method: self.method.clone(),
                        timeout: self.timeout,
                    });
                }
                // completed concurrently with the deadline; the result is already sent
                match (&mut self.receiver).await {
                    Ok(result) => result,
                    Err(_) => Err(SupervisorError::Cancelled),
                }
            }
        }
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.correlator.forget(self.id);
    }
}
