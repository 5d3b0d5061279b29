//! Response multiplexer: activity id → pending waiter.
//!
//! Each request sent on a connection registers a single-fulfillment waiter
//! here before its bytes hit the wire. The connection's read loop completes
//! waiters as responses arrive, in whatever order the node answers. When
//! the connection dies, [`ResponseMux::fail_all`] resolves every still
//! pending waiter with [`TransportError::ConnectionClosed`] — a waiter is
//! resolved exactly once and never silently abandoned.
//!
//! A response with no matching waiter is logged and dropped rather than
//! escalated: the node may legitimately answer a request this side already
//! gave up on after a timeout or cancellation.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{TransportError, TransportResult};
use crate::wire::Response;

/// Receiving half of a registered waiter.
pub(crate) type Waiter = oneshot::Receiver<TransportResult<Response>>;

#[derive(Default)]
struct MuxInner {
    pending: HashMap<Uuid, oneshot::Sender<TransportResult<Response>>>,
    closed: bool,
}

/// Pending-request table for one connection.
#[derive(Default)]
pub(crate) struct ResponseMux {
    inner: Mutex<MuxInner>,
}

impl ResponseMux {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for the given activity id.
    ///
    /// Fails with [`TransportError::ConnectionClosed`] once the connection
    /// has been torn down, so a send racing teardown can never strand a
    /// waiter that `fail_all` no longer sees.
    pub(crate) fn register(&self, activity_id: Uuid) -> TransportResult<Waiter> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(TransportError::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        if inner.pending.insert(activity_id, tx).is_some() {
            // Activity ids are freshly generated v4 UUIDs, so a collision
            // among in-flight requests should not happen.
            warn!(%activity_id, "duplicate in-flight activity id; replaced older waiter");
        }
        Ok(rx)
    }

    /// Resolve the waiter matching a response, if one is still registered.
    pub(crate) fn complete(&self, response: Response) {
        let activity_id = response.activity_id;
        let sender = self.lock().pending.remove(&activity_id);
        match sender {
            Some(tx) => {
                if tx.send(Ok(response)).is_err() {
                    debug!(%activity_id, "waiter gone before response arrived; dropping");
                }
            }
            None => {
                debug!(%activity_id, "response without a matching waiter; dropping");
            }
        }
    }

    /// Remove a waiter without resolving it (cancellation or timeout).
    ///
    /// Returns `true` if a waiter was still registered.
    pub(crate) fn remove(&self, activity_id: Uuid) -> bool {
        self.lock().pending.remove(&activity_id).is_some()
    }

    /// Fail every pending waiter with `ConnectionClosed` and refuse all
    /// future registrations. Called by the connection exactly once, on the
    /// transition into its closed state.
    pub(crate) fn fail_all(&self) {
        let drained: Vec<_> = {
            let mut inner = self.lock();
            inner.closed = true;
            inner.pending.drain().collect()
        };
        if !drained.is_empty() {
            debug!(waiters = drained.len(), "failing pending waiters on teardown");
        }
        for (_, tx) in drained {
            let _ = tx.send(Err(TransportError::ConnectionClosed));
        }
    }

    /// Number of requests currently in flight.
    pub(crate) fn len(&self) -> usize {
        self.lock().pending.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MuxInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
