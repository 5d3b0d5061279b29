//! Endpoint identity and connection-independent health tracking.
//!
//! Health belongs to the endpoint, not to any single connection: many
//! connections can share one endpoint, and a transient failure on one
//! should influence future attempts against the same node. The registry is
//! fed by socket-level events (connect failure, reset, read/write error)
//! independent of any request's outcome, so a node that dies while nothing
//! is in flight is still downgraded immediately.
//!
//! Transitions are edge-triggered: a change is recorded and pushed to
//! subscribers exactly once. Upstream routing logic consumes the pushed
//! [`HealthEvent`]s; nothing here polls.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, warn};

/// How a connection to an endpoint is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportScheme {
    /// Plain TCP.
    Tcp,
    /// TLS over TCP.
    Tls,
}

impl fmt::Display for TransportScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Tls => write!(f, "tls"),
        }
    }
}

/// Identity of one storage node.
///
/// Equality over `(host, port, scheme)` makes this the key for both the
/// connection pool and the health registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// Node hostname or address literal.
    pub host: String,
    /// Node port.
    pub port: u16,
    /// Transport carrying the connection.
    pub scheme: TransportScheme,
}

impl Endpoint {
    /// An endpoint reached over plain TCP.
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            scheme: TransportScheme::Tcp,
        }
    }

    /// An endpoint reached over TLS.
    #[must_use]
    pub fn tls(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            scheme: TransportScheme::Tls,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

/// Coarse health of an endpoint, used by routing logic to prefer or avoid
/// a node. Advisory: an `Unhealthy` endpoint may still be attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EndpointHealth {
    /// No contact attempted yet.
    #[default]
    Unknown,
    /// Last contact succeeded.
    Connected,
    /// Last contact failed at the socket or negotiation level.
    Unhealthy,
}

impl fmt::Display for EndpointHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Connected => write!(f, "connected"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// A pushed health transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthEvent {
    /// Endpoint whose health changed.
    pub endpoint: Endpoint,
    /// New health state.
    pub health: EndpointHealth,
}

#[derive(Default)]
struct RegistryInner {
    states: HashMap<Endpoint, EndpointHealth>,
    subscribers: Vec<mpsc::UnboundedSender<HealthEvent>>,
}

/// Process-wide endpoint health registry.
///
/// Entries are created lazily on first report and persist for the
/// registry's lifetime.
#[derive(Default)]
pub struct HealthRegistry {
    inner: Mutex<RegistryInner>,
}

impl HealthRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current health of an endpoint; `Unknown` if never contacted.
    #[must_use]
    pub fn health_of(&self, endpoint: &Endpoint) -> EndpointHealth {
        self.lock().states.get(endpoint).copied().unwrap_or_default()
    }

    /// Record a health observation, notifying subscribers only when the
    /// state actually changes.
    pub fn report(&self, endpoint: &Endpoint, health: EndpointHealth) {
        let mut inner = self.lock();
        let current = inner.states.entry(endpoint.clone()).or_default();
        if *current == health {
            return;
        }
        *current = health;

        match health {
            EndpointHealth::Unhealthy => {
                warn!(endpoint = %endpoint, "endpoint marked unhealthy");
            }
            _ => debug!(endpoint = %endpoint, health = %health, "endpoint health changed"),
        }

        let event = HealthEvent {
            endpoint: endpoint.clone(),
            health,
        };
        inner
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Subscribe to health transitions.
    ///
    /// Each subscriber receives every change reported after the call.
    /// Dropped receivers are pruned on the next report.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<HealthEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untouched_endpoint_is_unknown() {
        let registry = HealthRegistry::new();
        let endpoint = Endpoint::tcp("node-1.strata.internal", 14100);
        assert_eq!(registry.health_of(&endpoint), EndpointHealth::Unknown);
    }

    #[test]
    fn transitions_are_edge_triggered() {
        let registry = HealthRegistry::new();
        let endpoint = Endpoint::tcp("node-1.strata.internal", 14100);
        let mut events = registry.subscribe();

        registry.report(&endpoint, EndpointHealth::Unhealthy);
        registry.report(&endpoint, EndpointHealth::Unhealthy);
        registry.report(&endpoint, EndpointHealth::Unhealthy);

        let event = events.try_recv().expect("one event");
        assert_eq!(event.health, EndpointHealth::Unhealthy);
        assert!(events.try_recv().is_err(), "repeat reports must not notify");
    }

    #[test]
    fn each_change_is_pushed() {
        let registry = HealthRegistry::new();
        let endpoint = Endpoint::tls("node-2.strata.internal", 14100);
        let mut events = registry.subscribe();

        registry.report(&endpoint, EndpointHealth::Connected);
        registry.report(&endpoint, EndpointHealth::Unhealthy);
        registry.report(&endpoint, EndpointHealth::Connected);

        let healths: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.health)
            .collect();
        assert_eq!(
            healths,
            vec![
                EndpointHealth::Connected,
                EndpointHealth::Unhealthy,
                EndpointHealth::Connected
            ]
        );
    }

    #[test]
    fn endpoints_with_different_schemes_are_distinct() {
        let registry = HealthRegistry::new();
        let plain = Endpoint::tcp("node-3.strata.internal", 14100);
        let tls = Endpoint::tls("node-3.strata.internal", 14100);

        registry.report(&plain, EndpointHealth::Unhealthy);
        assert_eq!(registry.health_of(&plain), EndpointHealth::Unhealthy);
        assert_eq!(registry.health_of(&tls), EndpointHealth::Unknown);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let registry = HealthRegistry::new();
        let endpoint = Endpoint::tcp("node-4.strata.internal", 14100);

        let events = registry.subscribe();
        drop(events);

        // Must not panic or grow the subscriber list forever.
        registry.report(&endpoint, EndpointHealth::Connected);
        registry.report(&endpoint, EndpointHealth::Unhealthy);
    }
}
