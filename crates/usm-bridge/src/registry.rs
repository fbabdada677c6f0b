//! Correlation Registry - pending-reply slots keyed by correlation id
//!
//! One slot per in-flight request: at most one waiter, at most one delivered
//! payload. Late or unmatched replies are dropped, never an error.

use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

use usm_common::{CorrelationId, ReplyEnvelope, Result, UsmError};

/// Wait handle for a single registered correlation id
pub struct PendingReply {
    id: CorrelationId,
    rx: oneshot::Receiver<ReplyEnvelope>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> CorrelationId {
        self.id
    }
}

/// Thread-safe map from correlation id to its single-slot wait handle
#[derive(Default)]
pub struct CorrelationRegistry {
    pending: DashMap<CorrelationId, oneshot::Sender<ReplyEnvelope>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and store a wait slot for `id`.
    /// Fails when the id already has a registered waiter.
    pub fn register(&self, id: CorrelationId) -> Result<PendingReply> {
        match self.pending.entry(id) {
            Entry::Occupied(_) => Err(UsmError::DuplicateCorrelation(id)),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(tx);
                Ok(PendingReply { id, rx })
            }
        }
    }

    /// Deliver `reply` to the waiter registered for its correlation id.
    /// Returns whether a waiter received it; an unknown id just drops the
    /// reply. Removal and delivery are a single atomic step, so a waiter
    /// that timed out concurrently can never be woken twice.
    pub fn complete(&self, reply: ReplyEnvelope) -> bool {
        let id = reply.correlation_id;
        match self.pending.remove(&id) {
            Some((_, tx)) => tx.send(reply).is_ok(),
            None => {
                debug!(correlation_id = %id, "no waiter registered, dropping reply");
                false
            }
        }
    }

    /// Block the calling task until the reply for `pending` arrives or
    /// `timeout` elapses. On timeout the slot is removed first, so a late
    /// reply is dropped rather than handed to a future waiter.
    pub async fn await_reply(
        &self,
        pending: PendingReply,
        timeout: Duration,
    ) -> Result<ReplyEnvelope> {
        let id = pending.id;
        match tokio::time::timeout(timeout, pending.rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(UsmError::transport(format!(
                "reply slot for {} dropped before delivery",
                id
            ))),
            Err(_) => {
                self.pending.remove(&id);
                Err(UsmError::Timeout { correlation_id: id })
            }
        }
    }

    /// Remove a registered slot without waking it, e.g. when publish failed
    /// after registration
    pub fn deregister(&self, id: CorrelationId) {
        self.pending.remove(&id);
    }

    /// Number of requests currently awaiting a reply
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}
