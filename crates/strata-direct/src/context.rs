//! Context negotiation for new node connections.
//!
//! Every connection must complete exactly one successful context exchange
//! before any operation request may be sent on it:
//!
//! ```text
//! Client                                         Node
//!   |                                              |
//!   |  -- ContextRequest { version, agent } -->    |
//!   |                                              |
//!   |  <-- Context { status, agent, idle } --------|
//!   |                                              |
//! ```
//!
//! The client's `ContextRequest` is the first frame written on the wire; the
//! node's `Context` must be the first frame read back. Anything else at that
//! point is a protocol violation and the connection is torn down. A
//! `Context` with a non-success status is a negotiation rejection: the
//! connection is unusable, closed immediately, and the rejection surfaces to
//! whoever asked for the connection. Rejections are never retried at this
//! layer.
//!
//! Context messages are self-describing JSON so that version negotiation
//! itself never depends on the version being negotiated.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DecodeError, EncodeError, TransportError, TransportResult};

/// Protocol version spoken by this client.
pub const PROTOCOL_VERSION: u32 = 1;

/// Status code for an accepted context request.
pub const CONTEXT_STATUS_OK: u32 = 200;

/// Capability handshake sent by the client as the first frame on a new
/// connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ContextRequest {
    /// Correlation id for the handshake exchange.
    pub activity_id: Uuid,

    /// Protocol version requested by the client.
    pub protocol_version: u32,

    /// Client identifier for logging and diagnostics, e.g.
    /// `"strata-direct/0.1.0"`.
    pub client_agent: String,
}

impl ContextRequest {
    /// Create a context request for the current protocol version.
    #[must_use]
    pub fn new(client_agent: impl Into<String>) -> Self {
        Self {
            activity_id: Uuid::new_v4(),
            protocol_version: PROTOCOL_VERSION,
            client_agent: client_agent.into(),
        }
    }

    /// Serialize to a frame body.
    pub fn to_bytes(&self) -> Result<Bytes, EncodeError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| EncodeError::Context(e.to_string()))
    }

    /// Parse from a frame body.
    pub fn from_bytes(body: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(body).map_err(|e| DecodeError::Context(e.to_string()))
    }
}

/// The node's reply to a [`ContextRequest`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Context {
    /// Outcome of the negotiation; `2xx` is success.
    pub status: u32,

    /// Node identifier for logging and diagnostics.
    pub server_agent: String,

    /// Node software version.
    pub server_version: String,

    /// Idle window the node grants this connection. The node may close a
    /// connection that stays idle past this; the client evicts it first.
    /// Zero means the node imposes no idle limit.
    pub idle_timeout_secs: u64,

    /// Rejection detail, present when `status` is not a success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Context {
    /// Returns `true` when the negotiation succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Serialize to a frame body.
    pub fn to_bytes(&self) -> Result<Bytes, EncodeError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| EncodeError::Context(e.to_string()))
    }

    /// Parse from a frame body.
    pub fn from_bytes(body: &[u8]) -> Result<Self, DecodeError> {
        serde_json::from_slice(body).map_err(|e| DecodeError::Context(e.to_string()))
    }
}

/// Negotiation progress on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NegotiationState {
    /// Request sent (or about to be), waiting for the node's `Context`.
    #[default]
    AwaitingContext,

    /// Negotiation completed successfully.
    Completed,

    /// Negotiation failed; the connection must not be used.
    Failed,
}

/// Client-side negotiation state machine.
///
/// Produces the `ContextRequest` to send and validates the first frame read
/// back. Exactly one successful [`process_frame`](Self::process_frame) call
/// moves it to [`NegotiationState::Completed`]; every failure is terminal.
#[derive(Debug)]
pub struct ContextNegotiation {
    request: ContextRequest,
    state: NegotiationState,
    context: Option<Context>,
}

impl ContextNegotiation {
    /// Create a negotiation for the given client agent string.
    #[must_use]
    pub fn new(client_agent: impl Into<String>) -> Self {
        Self {
            request: ContextRequest::new(client_agent),
            state: NegotiationState::AwaitingContext,
            context: None,
        }
    }

    /// The request to send as the connection's first frame.
    #[must_use]
    pub const fn request(&self) -> &ContextRequest {
        &self.request
    }

    /// Process the first frame read from the node.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Decode`] if the frame is not a `Context` — a
    ///   protocol violation the connection escalates to teardown.
    /// - [`TransportError::NegotiationRejected`] if the node answered with a
    ///   non-success status.
    pub fn process_frame(&mut self, body: &[u8]) -> TransportResult<Context> {
        if self.state != NegotiationState::AwaitingContext {
            self.state = NegotiationState::Failed;
            return Err(DecodeError::Context(
                "context frame after negotiation already settled".to_owned(),
            )
            .into());
        }

        let context = match Context::from_bytes(body) {
            Ok(context) => context,
            Err(e) => {
                self.state = NegotiationState::Failed;
                return Err(e.into());
            }
        };

        if !context.is_success() {
            self.state = NegotiationState::Failed;
            return Err(TransportError::NegotiationRejected {
                status: context.status,
                message: context
                    .message
                    .unwrap_or_else(|| "no reason given".to_owned()),
            });
        }

        self.state = NegotiationState::Completed;
        self.context = Some(context.clone());
        Ok(context)
    }

    /// Returns the current negotiation state.
    #[must_use]
    pub const fn state(&self) -> NegotiationState {
        self.state
    }

    /// Returns the negotiated context once completed.
    #[must_use]
    pub const fn context(&self) -> Option<&Context> {
        self.context.as_ref()
    }

    /// Returns `true` once the negotiation completed successfully.
    #[must_use]
    pub const fn is_completed(&self) -> bool {
        matches!(self.state, NegotiationState::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accepted_context() -> Context {
        Context {
            status: CONTEXT_STATUS_OK,
            server_agent: "strata-node/2.4.1".to_owned(),
            server_version: "2.4.1".to_owned(),
            idle_timeout_secs: 600,
            message: None,
        }
    }

    #[test]
    fn context_request_round_trip() {
        let request = ContextRequest::new("strata-direct/0.1.0");
        let bytes = request.to_bytes().expect("encode");
        let parsed = ContextRequest::from_bytes(&bytes).expect("decode");
        assert_eq!(parsed, request);
        assert_eq!(parsed.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn context_round_trip() {
        let context = accepted_context();
        let bytes = context.to_bytes().expect("encode");
        let parsed = Context::from_bytes(&bytes).expect("decode");
        assert_eq!(parsed, context);
        assert!(parsed.is_success());
    }

    #[test]
    fn successful_negotiation_completes() {
        let mut negotiation = ContextNegotiation::new("test-client/1.0");
        assert_eq!(negotiation.state(), NegotiationState::AwaitingContext);

        let body = accepted_context().to_bytes().expect("encode");
        let context = negotiation.process_frame(&body).expect("accepted");

        assert!(negotiation.is_completed());
        assert_eq!(context.idle_timeout_secs, 600);
        assert_eq!(negotiation.context(), Some(&context));
    }

    #[test]
    fn rejection_surfaces_status_and_reason() {
        let mut negotiation = ContextNegotiation::new("test-client/1.0");
        let rejection = Context {
            status: 401,
            message: Some("client agent not authorized".to_owned()),
            ..accepted_context()
        };

        let err = negotiation
            .process_frame(&rejection.to_bytes().expect("encode"))
            .expect_err("rejected");
        assert!(matches!(
            err,
            TransportError::NegotiationRejected { status: 401, ref message }
                if message == "client agent not authorized"
        ));
        assert_eq!(negotiation.state(), NegotiationState::Failed);
    }

    #[test]
    fn garbage_first_frame_is_a_protocol_violation() {
        let mut negotiation = ContextNegotiation::new("test-client/1.0");
        let err = negotiation
            .process_frame(b"\x01\x02\x03 not json")
            .expect_err("violation");
        assert!(matches!(err, TransportError::Decode(DecodeError::Context(_))));
        assert_eq!(negotiation.state(), NegotiationState::Failed);
    }

    #[test]
    fn second_frame_after_completion_fails() {
        let mut negotiation = ContextNegotiation::new("test-client/1.0");
        let body = accepted_context().to_bytes().expect("encode");
        negotiation.process_frame(&body).expect("accepted");

        let err = negotiation.process_frame(&body).expect_err("settled");
        assert!(matches!(err, TransportError::Decode(_)));
        assert_eq!(negotiation.state(), NegotiationState::Failed);
    }
}
