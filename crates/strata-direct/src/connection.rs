//! One pooled connection to a storage node.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized → Connecting → NegotiatingContext → Ready → Draining → Closed
//!                     │               │                │
//!                     └───────────────┴────────────────┴──────────────► Closed
//! ```
//!
//! A connection opens its socket lazily on first use, sends the
//! `ContextRequest` as the very first frame, and becomes `Ready` only after
//! a successful `Context` arrives. From `Ready` it accepts any number of
//! concurrently in-flight requests: each send registers a waiter keyed by a
//! fresh activity id, and the read loop completes waiters in whatever order
//! the node answers.
//!
//! The state is published through a watch channel so any number of callers
//! can await readiness of the same in-flight connect, and so the pool can
//! observe failure without polling.
//!
//! On the transition into `Closed` — whatever the cause — every still
//! pending waiter is failed with `ConnectionClosed`. No waiter is ever
//! silently abandoned; this is the load-bearing failure-propagation rule
//! of the whole transport.
//!
//! The read loop doubles as the connection's socket listener: it is always
//! pending on the socket, so a reset or close is observed and reported to
//! the health registry even when zero requests are in flight.

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{Mutex, watch};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::TransportConfig;
use crate::context::{Context, ContextNegotiation};
use crate::error::{DecodeError, FramingError, TransportError, TransportResult};
use crate::framing::FrameCodec;
use crate::health::{Endpoint, EndpointHealth, HealthRegistry};
use crate::mux::{ResponseMux, Waiter};
use crate::stream::{self, NodeStream};
use crate::wire::{self, Request};

type FrameSink = SplitSink<Framed<NodeStream, FrameCodec>, Bytes>;
type FrameSource = SplitStream<Framed<NodeStream, FrameCodec>>;

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Created, socket not yet opened.
    #[default]
    Uninitialized,
    /// TCP (and TLS, when configured) establishment in progress.
    Connecting,
    /// Socket open, context exchange in progress.
    NegotiatingContext,
    /// Context negotiated; operation requests accepted.
    Ready,
    /// No new requests accepted; in-flight requests may finish.
    Draining,
    /// Torn down. Terminal.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Connecting => write!(f, "connecting"),
            Self::NegotiatingContext => write!(f, "negotiating"),
            Self::Ready => write!(f, "ready"),
            Self::Draining => write!(f, "draining"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// Why a connection reached `Closed`.
///
/// Kept clonable so every caller awaiting readiness can receive the
/// underlying cause, not a generic failure.
#[derive(Debug, Clone)]
pub(crate) enum CloseReason {
    /// Node refused the context handshake.
    Rejected { status: u32, message: String },
    /// Socket-level failure.
    Io { kind: io::ErrorKind, message: String },
    /// Framing desync.
    Framing(FramingError),
    /// Protocol violation or corrupt stream.
    Protocol(DecodeError),
    /// A connection-establishment deadline elapsed.
    Timeout {
        operation: &'static str,
        elapsed: Duration,
    },
    /// Drain completed, idle eviction, or client shutdown.
    Graceful,
}

impl CloseReason {
    fn from_error(error: &TransportError) -> Self {
        match error {
            TransportError::Framing(e) => Self::Framing(e.clone()),
            TransportError::NegotiationRejected { status, message } => Self::Rejected {
                status: *status,
                message: message.clone(),
            },
            TransportError::Decode(e) => Self::Protocol(e.clone()),
            TransportError::Encode(e) => Self::Protocol(DecodeError::Context(e.to_string())),
            TransportError::Timeout { operation, elapsed } => Self::Timeout {
                operation: *operation,
                elapsed: *elapsed,
            },
            TransportError::ConnectionClosed => Self::Io {
                kind: io::ErrorKind::ConnectionAborted,
                message: "connection closed".to_owned(),
            },
            TransportError::Io(e) => Self::Io {
                kind: e.kind(),
                message: e.to_string(),
            },
        }
    }

    fn to_error(&self) -> TransportError {
        match self {
            Self::Rejected { status, message } => TransportError::NegotiationRejected {
                status: *status,
                message: message.clone(),
            },
            Self::Io { kind, message } => {
                TransportError::Io(io::Error::new(*kind, message.clone()))
            }
            Self::Framing(e) => TransportError::Framing(e.clone()),
            Self::Protocol(e) => TransportError::Decode(e.clone()),
            Self::Timeout { operation, elapsed } => TransportError::Timeout {
                operation: *operation,
                elapsed: *elapsed,
            },
            Self::Graceful => TransportError::ConnectionClosed,
        }
    }

    const fn is_failure(&self) -> bool {
        !matches!(self, Self::Graceful)
    }
}

/// One multiplexed connection to a storage node.
///
/// Owned by the transport client's pool; requests borrow it transiently.
/// The socket write half lives behind a mutex on the send path; the read
/// half is consumed by the spawned read loop. The waiter map is the only
/// other state shared between the two.
pub(crate) struct Connection {
    endpoint: Endpoint,
    config: Arc<TransportConfig>,
    health: Arc<HealthRegistry>,
    mux: ResponseMux,
    state: watch::Sender<ConnectionState>,
    writer: Mutex<Option<FrameSink>>,
    close_reason: StdMutex<Option<CloseReason>>,
    negotiated: OnceLock<Context>,
    last_activity: StdMutex<Instant>,
}

impl Connection {
    /// Create a connection and start establishing it in the background.
    ///
    /// Returns immediately; callers await readiness via
    /// [`wait_ready`](Self::wait_ready).
    pub(crate) fn open(
        endpoint: Endpoint,
        config: Arc<TransportConfig>,
        health: Arc<HealthRegistry>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Uninitialized);
        let connection = Arc::new(Self {
            endpoint,
            config,
            health,
            mux: ResponseMux::new(),
            state,
            writer: Mutex::new(None),
            close_reason: StdMutex::new(None),
            negotiated: OnceLock::new(),
            last_activity: StdMutex::new(Instant::now()),
        });
        tokio::spawn(Self::establish(Arc::clone(&connection)));
        connection
    }

    /// Current lifecycle state.
    pub(crate) fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// `true` while the connection is establishing or ready — i.e. worth
    /// handing out from the pool.
    pub(crate) fn is_usable(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::Uninitialized
                | ConnectionState::Connecting
                | ConnectionState::NegotiatingContext
                | ConnectionState::Ready
        )
    }

    /// The context negotiated with the node, once `Ready`.
    pub(crate) fn context(&self) -> Option<&Context> {
        self.negotiated.get()
    }

    /// Number of requests currently in flight.
    pub(crate) fn in_flight(&self) -> usize {
        self.mux.len()
    }

    /// Wait until the connection is `Ready`, or fail with the cause of its
    /// closure. Any number of callers may wait concurrently; all observe
    /// the same outcome.
    pub(crate) async fn wait_ready(&self) -> TransportResult<()> {
        let mut rx = self.state.subscribe();
        loop {
            match *rx.borrow_and_update() {
                ConnectionState::Ready => return Ok(()),
                ConnectionState::Closed => return Err(self.terminal_error()),
                ConnectionState::Draining => return Err(TransportError::ConnectionClosed),
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(self.terminal_error());
            }
        }
    }

    /// Send a request on a `Ready` connection, registering its waiter
    /// before the bytes reach the wire.
    ///
    /// Returns the waiter future; the response (or failure) arrives through
    /// it. Multiple sends may be in flight at once — responses are matched
    /// by activity id, not arrival order.
    pub(crate) async fn send(&self, request: &Request) -> TransportResult<Waiter> {
        if self.state() != ConnectionState::Ready {
            return Err(self.terminal_error());
        }

        let frame = wire::encode_request(request)?;
        if frame.len() > self.config.max_frame_size {
            // Rejected before anything is written; the connection stays up.
            return Err(FramingError::FrameTooLarge {
                length: frame.len(),
                max: self.config.max_frame_size,
            }
            .into());
        }

        let waiter = self.mux.register(request.activity_id)?;

        let mut writer = self.writer.lock().await;
        let Some(sink) = writer.as_mut() else {
            drop(writer);
            self.mux.remove(request.activity_id);
            return Err(self.terminal_error());
        };

        if let Err(e) = sink.send(frame).await {
            drop(writer);
            self.mux.remove(request.activity_id);
            warn!(
                endpoint = %self.endpoint,
                activity_id = %request.activity_id,
                error = %e,
                "request write failed"
            );
            self.health.report(&self.endpoint, EndpointHealth::Unhealthy);
            self.close(CloseReason::from_error(&e)).await;
            return Err(e);
        }

        self.touch();
        debug!(
            endpoint = %self.endpoint,
            activity_id = %request.activity_id,
            operation = ?request.operation,
            "request written"
        );
        Ok(waiter)
    }

    /// Abandon a pending request (caller timeout or cancellation).
    ///
    /// Best-effort: if the response is already in flight it will arrive as
    /// an unmatched activity id and be dropped. Other in-flight requests
    /// are unaffected, and the connection itself is left undisturbed.
    pub(crate) fn cancel(&self, activity_id: Uuid) {
        if self.mux.remove(activity_id) {
            debug!(
                endpoint = %self.endpoint,
                %activity_id,
                "pending request abandoned"
            );
        }
    }

    /// Stop accepting new requests and close once in-flight requests have
    /// finished. Closes immediately when nothing is in flight. Also closes
    /// a connection still establishing.
    pub(crate) async fn drain(&self) {
        let entered = self.state.send_if_modified(|s| {
            if *s == ConnectionState::Ready {
                *s = ConnectionState::Draining;
                true
            } else {
                false
            }
        });
        if entered {
            debug!(
                endpoint = %self.endpoint,
                in_flight = self.in_flight(),
                "connection draining"
            );
        } else if matches!(
            self.state(),
            ConnectionState::Uninitialized
                | ConnectionState::Connecting
                | ConnectionState::NegotiatingContext
        ) {
            self.close(CloseReason::Graceful).await;
            return;
        }

        if self.state() == ConnectionState::Draining && self.mux.is_empty() {
            self.close(CloseReason::Graceful).await;
        }
    }

    /// `true` when the negotiated idle window has elapsed with nothing in
    /// flight. Connections without an advertised idle limit never expire.
    pub(crate) fn is_idle_expired(&self) -> bool {
        let Some(limit) = self
            .context()
            .filter(|c| c.idle_timeout_secs > 0)
            .map(|c| Duration::from_secs(c.idle_timeout_secs))
        else {
            return false;
        };
        self.mux.is_empty() && self.idle_for() > limit
    }

    /// Tear the connection down.
    ///
    /// Idempotent; the first caller wins and records the reason. Fails all
    /// pending waiters — this is the single transition into `Closed`.
    pub(crate) async fn close(&self, reason: CloseReason) {
        {
            let mut guard = self
                .close_reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if guard.is_some() {
                return;
            }
            *guard = Some(reason.clone());
        }

        let prior = self.state.send_replace(ConnectionState::Closed);
        if let Some(sink) = self.writer.lock().await.take() {
            drop(sink);
        }
        self.mux.fail_all();

        if reason.is_failure() {
            warn!(
                endpoint = %self.endpoint,
                prior_state = %prior,
                reason = ?reason,
                "connection closed"
            );
        } else {
            debug!(endpoint = %self.endpoint, prior_state = %prior, "connection closed");
        }
    }

    fn terminal_error(&self) -> TransportError {
        self.close_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(TransportError::ConnectionClosed, CloseReason::to_error)
    }

    /// Move to `next` unless already closed. Returns `false` when the
    /// connection was closed concurrently.
    fn transition(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|s| {
            if *s == ConnectionState::Closed {
                false
            } else {
                *s = next;
                true
            }
        })
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    async fn establish(self: Arc<Self>) {
        if !self.transition(ConnectionState::Connecting) {
            return;
        }

        let fail_fast = self.health.health_of(&self.endpoint) == EndpointHealth::Unhealthy;
        let connect_timeout = if fail_fast {
            self.config.fail_fast_connect_timeout
        } else {
            self.config.connect_timeout
        };
        debug!(endpoint = %self.endpoint, fail_fast, "connecting to storage node");

        let socket = match stream::connect(&self.endpoint, &self.config, connect_timeout).await {
            Ok(socket) => socket,
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "connect failed");
                self.health.report(&self.endpoint, EndpointHealth::Unhealthy);
                self.close(CloseReason::from_error(&e)).await;
                return;
            }
        };

        if !self.transition(ConnectionState::NegotiatingContext) {
            return;
        }

        let codec = FrameCodec::with_max_frame_size(self.config.max_frame_size);
        let mut framed = Framed::new(socket, codec);
        let mut negotiation = ContextNegotiation::new(self.config.client_agent.clone());

        let hello = match negotiation.request().to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.close(CloseReason::from_error(&TransportError::from(e)))
                    .await;
                return;
            }
        };

        if let Err(e) = framed.send(hello).await {
            warn!(endpoint = %self.endpoint, error = %e, "failed to send context request");
            self.health.report(&self.endpoint, EndpointHealth::Unhealthy);
            self.close(CloseReason::from_error(&e)).await;
            return;
        }

        let first = match timeout(self.config.negotiation_timeout, framed.next()).await {
            Err(_) => {
                warn!(endpoint = %self.endpoint, "context negotiation timed out");
                self.health.report(&self.endpoint, EndpointHealth::Unhealthy);
                self.close(CloseReason::Timeout {
                    operation: "context negotiation",
                    elapsed: self.config.negotiation_timeout,
                })
                .await;
                return;
            }
            Ok(None) => {
                warn!(endpoint = %self.endpoint, "node closed the connection during negotiation");
                self.health.report(&self.endpoint, EndpointHealth::Unhealthy);
                self.close(CloseReason::Io {
                    kind: io::ErrorKind::UnexpectedEof,
                    message: "node closed the connection during context negotiation".to_owned(),
                })
                .await;
                return;
            }
            Ok(Some(Err(e))) => {
                warn!(endpoint = %self.endpoint, error = %e, "read failed during negotiation");
                self.health.report(&self.endpoint, EndpointHealth::Unhealthy);
                self.close(CloseReason::from_error(&e)).await;
                return;
            }
            Ok(Some(Ok(body))) => body,
        };

        let context = match negotiation.process_frame(&first) {
            Ok(context) => context,
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "context negotiation failed");
                self.health.report(&self.endpoint, EndpointHealth::Unhealthy);
                self.close(CloseReason::from_error(&e)).await;
                return;
            }
        };

        info!(
            endpoint = %self.endpoint,
            server_agent = %context.server_agent,
            server_version = %context.server_version,
            idle_timeout_secs = context.idle_timeout_secs,
            "context negotiated"
        );
        let _ = self.negotiated.set(context);

        let (sink, source) = framed.split();
        *self.writer.lock().await = Some(sink);
        self.touch();

        if !self.transition(ConnectionState::Ready) {
            // Closed while negotiating (client shutdown); release the socket.
            self.writer.lock().await.take();
            return;
        }
        self.health.report(&self.endpoint, EndpointHealth::Connected);

        self.read_loop(source).await;
    }

    async fn read_loop(self: Arc<Self>, mut source: FrameSource) {
        let threshold = self.config.decode_failure_threshold.max(1);
        let mut decode_failures: u32 = 0;
        let mut state_rx = self.state.subscribe();

        loop {
            let item = tokio::select! {
                item = source.next() => item,
                // Closed externally (drain, eviction, shutdown): release the
                // read half so the socket actually closes.
                _ = state_rx.wait_for(|state| *state == ConnectionState::Closed) => return,
            };
            match item {
                None => {
                    if self.state() == ConnectionState::Draining {
                        self.close(CloseReason::Graceful).await;
                    } else {
                        warn!(endpoint = %self.endpoint, "node closed the connection");
                        self.health.report(&self.endpoint, EndpointHealth::Unhealthy);
                        self.close(CloseReason::Io {
                            kind: io::ErrorKind::UnexpectedEof,
                            message: "node closed the connection".to_owned(),
                        })
                        .await;
                    }
                    return;
                }
                Some(Err(e)) => {
                    warn!(endpoint = %self.endpoint, error = %e, "read failed");
                    self.health.report(&self.endpoint, EndpointHealth::Unhealthy);
                    self.close(CloseReason::from_error(&e)).await;
                    return;
                }
                Some(Ok(body)) => {
                    self.touch();
                    match wire::decode_response(body) {
                        Ok(response) => {
                            decode_failures = 0;
                            self.mux.complete(response);
                        }
                        Err(e) => {
                            decode_failures += 1;
                            warn!(
                                endpoint = %self.endpoint,
                                error = %e,
                                consecutive = decode_failures,
                                "failed to decode response frame"
                            );
                            if decode_failures >= threshold {
                                // A stream this corrupt is as bad as a dead one.
                                self.health.report(&self.endpoint, EndpointHealth::Unhealthy);
                                self.close(CloseReason::Protocol(e)).await;
                                return;
                            }
                        }
                    }
                    if self.state() == ConnectionState::Draining && self.mux.is_empty() {
                        self.close(CloseReason::Graceful).await;
                        return;
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish_non_exhaustive()
    }
}
