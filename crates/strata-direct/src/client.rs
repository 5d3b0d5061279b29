//! Transport client façade and connection pool.
//!
//! ```text
//! caller ──► TransportClient::invoke
//!                │
//!                ├── pool lookup (endpoint identity) ── reuse-or-create
//!                │        one connection is created per cold endpoint;
//!                │        concurrent callers await the same connect
//!                │
//!                ├── Connection::send ──► frame ──► socket
//!                │
//!                └── waiter future ◄── read loop ◄── socket
//! ```
//!
//! The client owns the endpoint→connection map — the one structure shared
//! across arbitrary callers. Creation is single-winner: the pool lock is
//! held only to insert the new connection, and every other caller for the
//! same cold endpoint awaits the winner's state channel instead of opening
//! its own socket.
//!
//! Endpoint health is advisory here: an endpoint already marked unhealthy
//! is still attempted, but with a shortened fail-fast connect timeout so a
//! still-dead node costs callers little. Routing away from bad nodes is
//! the caller's job, fed by the pushed health events.
//!
//! Every failure surfaces to the original caller unmodified; nothing is
//! retried inside the transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::debug;

use crate::config::TransportConfig;
use crate::connection::Connection;
use crate::error::{TransportError, TransportResult};
use crate::health::{Endpoint, EndpointHealth, HealthEvent, HealthRegistry};
use crate::wire::{Request, Response};

/// Client for the direct binary transport to storage nodes.
///
/// Cheap to clone; all clones share one pool and one health registry.
/// Must be created inside a Tokio runtime — the client spawns a background
/// sweep that evicts idle and dead pooled connections.
#[derive(Clone)]
pub struct TransportClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: Arc<TransportConfig>,
    pool: StdMutex<HashMap<Endpoint, Arc<Connection>>>,
    health: Arc<HealthRegistry>,
}

impl TransportClient {
    /// Create a client with the given configuration.
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        let sweep_interval = config.idle_sweep_interval;
        let inner = Arc::new(ClientInner {
            config: Arc::new(config),
            pool: StdMutex::new(HashMap::new()),
            health: Arc::new(HealthRegistry::new()),
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(Self::sweep_loop(weak, sweep_interval));

        Self { inner }
    }

    /// Send a request to an endpoint with the configured default deadline.
    ///
    /// # Errors
    ///
    /// Propagates transport failures unchanged: `NegotiationRejected`,
    /// `Framing`, `Decode`, `ConnectionClosed`, `Timeout`, `Io`. Retry
    /// policy belongs to the caller.
    pub async fn invoke(
        &self,
        endpoint: &Endpoint,
        request: Request,
    ) -> TransportResult<Response> {
        self.invoke_with_timeout(endpoint, request, self.inner.config.request_timeout)
            .await
    }

    /// Send a request with a caller-specified deadline.
    ///
    /// On timeout the pending waiter is removed and the request abandoned;
    /// the connection itself is left undisturbed — a slow response is not
    /// evidence of a dead connection.
    pub async fn invoke_with_timeout(
        &self,
        endpoint: &Endpoint,
        request: Request,
        deadline: Duration,
    ) -> TransportResult<Response> {
        let connection = self.connection_for(endpoint).await?;
        let activity_id = request.activity_id;
        let waiter = connection.send(&request).await?;

        match tokio::time::timeout(deadline, waiter).await {
            Ok(Ok(result)) => result,
            // The sender vanished without resolving; only teardown does that.
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => {
                connection.cancel(activity_id);
                Err(TransportError::Timeout {
                    operation: "request",
                    elapsed: deadline,
                })
            }
        }
    }

    /// Current recorded health of an endpoint.
    #[must_use]
    pub fn endpoint_health(&self, endpoint: &Endpoint) -> EndpointHealth {
        self.inner.health.health_of(endpoint)
    }

    /// Subscribe to endpoint health transitions.
    ///
    /// Push interface for routing logic: each subscriber receives every
    /// health change reported after the call.
    #[must_use]
    pub fn subscribe_health(&self) -> mpsc::UnboundedReceiver<HealthEvent> {
        self.inner.health.subscribe()
    }

    /// Drain and drop the pooled connection for one endpoint, if any.
    pub async fn evict(&self, endpoint: &Endpoint) {
        let connection = self.inner.lock_pool().remove(endpoint);
        if let Some(connection) = connection {
            debug!(endpoint = %endpoint, "evicting pooled connection");
            connection.drain().await;
        }
    }

    /// Drain and drop every pooled connection.
    ///
    /// In-flight requests are allowed to finish; new invocations after
    /// shutdown open fresh connections.
    pub async fn shutdown(&self) {
        let connections: Vec<Arc<Connection>> =
            self.inner.lock_pool().drain().map(|(_, c)| c).collect();
        for connection in connections {
            connection.drain().await;
        }
    }

    /// Look up or create the pooled connection for `endpoint` and wait for
    /// it to become ready.
    async fn connection_for(&self, endpoint: &Endpoint) -> TransportResult<Arc<Connection>> {
        let connection = {
            let mut pool = self.inner.lock_pool();
            let existing = pool.get(endpoint).filter(|c| c.is_usable()).cloned();
            match existing {
                Some(connection) => connection,
                None => {
                    debug!(endpoint = %endpoint, "opening connection");
                    let created = Connection::open(
                        endpoint.clone(),
                        Arc::clone(&self.inner.config),
                        Arc::clone(&self.inner.health),
                    );
                    pool.insert(endpoint.clone(), Arc::clone(&created));
                    created
                }
            }
        };

        match connection.wait_ready().await {
            Ok(()) => Ok(connection),
            Err(e) => {
                remove_if_same(&mut self.inner.lock_pool(), endpoint, &connection);
                Err(e)
            }
        }
    }

    async fn sweep_loop(inner: Weak<ClientInner>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            inner.sweep().await;
        }
    }
}

impl ClientInner {
    fn lock_pool(&self) -> MutexGuard<'_, HashMap<Endpoint, Arc<Connection>>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Evict idle-expired connections and drop dead pool entries.
    async fn sweep(&self) {
        let snapshot: Vec<(Endpoint, Arc<Connection>)> = self
            .lock_pool()
            .iter()
            .map(|(endpoint, connection)| (endpoint.clone(), Arc::clone(connection)))
            .collect();

        for (endpoint, connection) in &snapshot {
            if connection.is_idle_expired() {
                debug!(endpoint = %endpoint, "idle window elapsed; draining connection");
                connection.drain().await;
            }
        }

        let mut pool = self.lock_pool();
        for (endpoint, connection) in snapshot {
            if !connection.is_usable() {
                remove_if_same(&mut pool, &endpoint, &connection);
            }
        }
    }
}

/// Remove the pool entry for `endpoint` only if it still holds this exact
/// connection — a replacement raced in otherwise.
fn remove_if_same(
    pool: &mut HashMap<Endpoint, Arc<Connection>>,
    endpoint: &Endpoint,
    connection: &Arc<Connection>,
) {
    let same = pool
        .get(endpoint)
        .is_some_and(|current| Arc::ptr_eq(current, connection));
    if same {
        pool.remove(endpoint);
    }
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("pooled", &self.inner.lock_pool().len())
            .finish_non_exhaustive()
    }
}
