//! Pending-request registry: correlates outbound requests with replies.
//!
//! A concurrent map from request id to an unsettled completion sink. Every
//! entry is removed exactly once -- by matching reply, by timeout sweep, or
//! by cancellation; whichever removes the entry owns the sink and later
//! attempts are silently dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::BusError;
use crate::headers::keys;
use crate::message::{AnyMessage, DecodeFn};
use crate::serializer::{Envelope, Payload};

/// Completion side of one in-flight request.
pub(crate) type SettleResult = Result<AnyMessage, BusError>;

struct PendingRequest {
    deadline: Option<Instant>,
    timeout_ms: u64,
    decode: DecodeFn,
    sink: oneshot::Sender<SettleResult>,
}

/// Concurrent registry of in-flight request/response exchanges.
pub struct PendingRequestStore {
    entries: DashMap<String, PendingRequest>,
    /// Smallest timeout registered so far, in milliseconds. The sweeper
    /// clamps its tick to half of this.
    min_timeout_ms: AtomicU64,
    /// Wakes the sweeper when a registration tightens the minimum timeout,
    /// so a short deadline is not stuck behind a long sleep.
    deadline_changed: Notify,
}

impl PendingRequestStore {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            entries: DashMap::new(),
            min_timeout_ms: AtomicU64::new(u64::MAX),
            deadline_changed: Notify::new(),
        }
    }

    /// Resolves when a newly registered deadline may have tightened the
    /// sweeper tick.
    pub(crate) async fn deadline_changed(&self) {
        self.deadline_changed.notified().await;
    }

    /// Register an in-flight request. Fails when the id is already taken.
    pub(crate) fn register(
        &self,
        request_id: String,
        decode: DecodeFn,
        timeout: Option<Duration>,
    ) -> Result<oneshot::Receiver<SettleResult>, BusError> {
        let (sink, receiver) = oneshot::channel();
        let timeout_ms = timeout.map_or(u64::MAX, |t| t.as_millis() as u64);
        let entry = PendingRequest {
            deadline: timeout.map(|t| Instant::now() + t),
            timeout_ms,
            decode,
            sink,
        };
        match self.entries.entry(request_id) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => Err(BusError::Configuration(
                format!("request id {} is already in flight", occupied.key()),
            )),
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(entry);
                if timeout.is_some()
                    && self.min_timeout_ms.fetch_min(timeout_ms, Ordering::Relaxed) > timeout_ms
                {
                    self.deadline_changed.notify_one();
                }
                Ok(receiver)
            }
        }
    }

    /// Settle a request from a reply envelope. A non-empty `Error` header
    /// completes the request with a handler failure; otherwise the payload
    /// is decoded with the registered response decoder. Returns `false`
    /// when no entry matched (already settled, timed out, or cancelled).
    ///
    /// Transports call this from their reply-delivery path.
    pub fn settle(&self, request_id: &str, envelope: Envelope) -> bool {
        let Some((_, entry)) = self.entries.remove(request_id) else {
            trace!(request_id, "dropping reply with no pending request");
            return false;
        };
        let result = match envelope.headers.get_str(keys::ERROR) {
            Some(error) if !error.is_empty() => Err(BusError::Handler(error.to_string())),
            _ => match envelope.payload {
                Payload::Bytes(bytes) => (entry.decode)(&bytes),
                Payload::Value(value) => Ok(value),
            },
        };
        // The caller may have stopped awaiting; a dead sink is not an error.
        let _ = entry.sink.send(result);
        true
    }

    /// Complete a request with the given reason and remove its entry.
    pub(crate) fn cancel(&self, request_id: &str, reason: BusError) -> bool {
        let Some((_, entry)) = self.entries.remove(request_id) else {
            return false;
        };
        let _ = entry.sink.send(Err(reason));
        true
    }

    /// Cancel every outstanding request with `BusStopped`.
    pub(crate) fn cancel_all_stopped(&self) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.cancel(&id, BusError::BusStopped);
        }
    }

    /// Cancel every entry whose deadline has passed. Returns how many were
    /// timed out.
    pub(crate) fn sweep(&self, now: Instant) -> usize {
        let expired: Vec<(String, u64)> = self
            .entries
            .iter()
            .filter(|e| e.deadline.is_some_and(|d| d <= now))
            .map(|e| (e.key().clone(), e.timeout_ms))
            .collect();
        let count = expired.len();
        for (id, timeout_ms) in expired {
            if self.cancel(&id, BusError::RequestTimeout { timeout_ms }) {
                debug!(request_id = %id, timeout_ms, "pending request timed out");
            }
        }
        count
    }

    /// Effective sweeper tick: the configured granularity, clamped to half
    /// of the smallest registered timeout.
    pub(crate) fn sweep_tick(&self, configured: Duration) -> Duration {
        let min_ms = self.min_timeout_ms.load(Ordering::Relaxed);
        if min_ms == u64::MAX {
            return configured;
        }
        configured.min(Duration::from_millis((min_ms / 2).max(1)))
    }

    /// Number of in-flight requests.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
