//! Lock-free pending request management using `scc::HashMap`.
//!
//! Tracks outgoing requests awaiting a correlated reply. Entries survive
//! reconnects; they leave the table when the reply arrives, when the caller
//! gives up on its deadline, or when the session shuts down.

use std::time::Instant;

use tokio::sync::oneshot;

use crate::{
    error::{RtmError, RtmResult},
    event::Reply,
    types::RequestId,
};

/// A pending request awaiting a reply.
pub struct PendingRequest {
    /// Channel to deliver the reply.
    pub reply_tx: oneshot::Sender<RtmResult<Reply>>,
    /// When this request was registered.
    pub created_at: Instant,
}

/// Lock-free store for pending requests.
pub struct PendingRequestStore {
    requests: scc::HashMap<RequestId, PendingRequest>,
    max_pending: usize,
}

impl PendingRequestStore {
    /// Create a new pending request store.
    pub fn new(max_pending: usize) -> Self {
        Self {
            requests: scc::HashMap::new(),
            max_pending,
        }
    }

    /// Register a waiter for `id`.
    ///
    /// Returns `None` if capacity is exceeded or `id` is already outstanding.
    pub fn add(&self, id: RequestId) -> Option<oneshot::Receiver<RtmResult<Reply>>> {
        if self.requests.len() >= self.max_pending {
            return None;
        }

        let (tx, rx) = oneshot::channel();
        let pending = PendingRequest {
            reply_tx: tx,
            created_at: Instant::now(),
        };

        // Insert returns Err if key already exists
        if self.requests.insert_sync(id, pending).is_err() {
            return None;
        }

        Some(rx)
    }

    /// Deliver a result to the waiter for `id`.
    ///
    /// Returns `true` if a waiter was registered, `false` otherwise.
    pub fn resolve(&self, id: &RequestId, result: RtmResult<Reply>) -> bool {
        if let Some((_, pending)) = self.requests.remove_sync(id) {
            // Receiver may have dropped
            let _ = pending.reply_tx.send(result);
            return true;
        }
        false
    }

    /// Remove a pending request without notifying the receiver.
    pub fn remove(&self, id: &RequestId) -> bool {
        self.requests.remove_sync(id).is_some()
    }

    /// Check if there's capacity for more requests.
    pub fn has_capacity(&self) -> bool {
        self.requests.len() < self.max_pending
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Fail every waiter with [`RtmError::ConnectionClosed`].
    pub fn clear_with_error(&self, reason: &str) {
        let mut ids = Vec::new();
        self.requests.retain_sync(|id, _| {
            ids.push(*id);
            true
        });

        for id in ids {
            if let Some((_, pending)) = self.requests.remove_sync(&id) {
                let _ = pending
                    .reply_tx
                    .send(Err(RtmError::connection_closed(Some(reason.to_string()))));
            }
        }
    }
}
