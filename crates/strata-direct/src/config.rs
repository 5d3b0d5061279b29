//! Transport client configuration.

use std::sync::Arc;
use std::time::Duration;

use tokio_rustls::rustls;

use crate::framing::DEFAULT_MAX_FRAME_SIZE;

/// Default TCP connect timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default TLS handshake timeout.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default context negotiation timeout.
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Default per-request deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Shortened connect timeout used against endpoints already marked
/// unhealthy, so callers fail fast if the node is still dead.
const FAIL_FAST_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Default interval between idle-connection sweeps.
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Consecutive response decode failures tolerated before the connection is
/// treated as corrupt and torn down.
const DECODE_FAILURE_THRESHOLD: u32 = 3;

/// Configuration for a [`TransportClient`](crate::client::TransportClient).
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// TCP connect timeout.
    pub connect_timeout: Duration,

    /// TLS handshake timeout, on top of the TCP connect.
    pub tls_handshake_timeout: Duration,

    /// Deadline for the context exchange on a new connection.
    pub negotiation_timeout: Duration,

    /// Default deadline for a single request, from send to response.
    pub request_timeout: Duration,

    /// Connect timeout applied when the target endpoint is already marked
    /// unhealthy.
    pub fail_fast_connect_timeout: Duration,

    /// Maximum frame body size accepted or produced.
    pub max_frame_size: usize,

    /// Consecutive undecodable response frames before teardown.
    pub decode_failure_threshold: u32,

    /// Interval between sweeps that evict idle pooled connections.
    pub idle_sweep_interval: Duration,

    /// Client identifier sent during context negotiation.
    pub client_agent: String,

    /// TLS client configuration, required for `Tls` endpoints.
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            tls_handshake_timeout: TLS_HANDSHAKE_TIMEOUT,
            negotiation_timeout: NEGOTIATION_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
            fail_fast_connect_timeout: FAIL_FAST_CONNECT_TIMEOUT,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            decode_failure_threshold: DECODE_FAILURE_THRESHOLD,
            idle_sweep_interval: IDLE_SWEEP_INTERVAL,
            client_agent: format!("strata-direct/{}", env!("CARGO_PKG_VERSION")),
            tls: None,
        }
    }
}

impl TransportConfig {
    /// Create a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the TCP connect timeout.
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the context negotiation timeout.
    #[must_use]
    pub const fn with_negotiation_timeout(mut self, timeout: Duration) -> Self {
        self.negotiation_timeout = timeout;
        self
    }

    /// Set the default per-request deadline.
    #[must_use]
    pub const fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the maximum frame body size.
    #[must_use]
    pub const fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Set the decode failure threshold.
    #[must_use]
    pub const fn with_decode_failure_threshold(mut self, threshold: u32) -> Self {
        self.decode_failure_threshold = threshold;
        self
    }

    /// Set the idle sweep interval.
    #[must_use]
    pub const fn with_idle_sweep_interval(mut self, interval: Duration) -> Self {
        self.idle_sweep_interval = interval;
        self
    }

    /// Set the client agent string.
    #[must_use]
    pub fn with_client_agent(mut self, agent: impl Into<String>) -> Self {
        self.client_agent = agent.into();
        self
    }

    /// Set the TLS client configuration used for `Tls` endpoints.
    #[must_use]
    pub fn with_tls(mut self, tls: Arc<rustls::ClientConfig>) -> Self {
        self.tls = Some(tls);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = TransportConfig::default();
        assert!(config.fail_fast_connect_timeout < config.connect_timeout);
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert!(config.client_agent.starts_with("strata-direct/"));
        assert!(config.tls.is_none());
    }

    #[test]
    fn builder_overrides() {
        let config = TransportConfig::new()
            .with_connect_timeout(Duration::from_millis(250))
            .with_request_timeout(Duration::from_secs(2))
            .with_decode_failure_threshold(1)
            .with_client_agent("orders-service/3.1");

        assert_eq!(config.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.request_timeout, Duration::from_secs(2));
        assert_eq!(config.decode_failure_threshold, 1);
        assert_eq!(config.client_agent, "orders-service/3.1");
    }
}
