//! Error types for the direct transport.
//!
//! The taxonomy distinguishes failures by what they mean for the connection
//! that produced them:
//!
//! - [`FramingError`] — the byte stream itself is unusable; always fatal to
//!   the connection.
//! - [`TransportError::NegotiationRejected`] — the node refused the context
//!   handshake; fatal to that connection attempt, never retried here.
//! - [`DecodeError`] — a single frame body failed to parse; fatal only when
//!   repeated past the configured threshold.
//! - [`TransportError::ConnectionClosed`] — delivered to every pending
//!   request when a connection is torn down, whatever the cause.
//! - [`TransportError::Timeout`] — a deadline elapsed; the affected request
//!   is abandoned but the connection is left undisturbed.
//! - [`TransportError::Io`] — socket-level failure; always triggers a
//!   health downgrade and teardown.
//!
//! All of these surface to the original caller unmodified. Retry and
//! backoff policy live with the caller, not in this crate.

use std::time::Duration;

use thiserror::Error;

/// Result alias for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Failures of the length-prefixed framing layer.
///
/// Framing errors mean the stream position can no longer be trusted, so the
/// connection is always torn down.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// The length prefix describes a frame larger than the configured
    /// maximum. Validated before any allocation.
    #[error("frame length {length} exceeds maximum {max}")]
    FrameTooLarge {
        /// Length announced by the prefix (or submitted for encoding).
        length: usize,
        /// Configured maximum frame size.
        max: usize,
    },
}

/// Failures while parsing a single frame body.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// The body ended before the named field was complete.
    #[error("frame body truncated reading {field}")]
    Truncated {
        /// Field being read when the body ran out.
        field: &'static str,
    },

    /// The message kind discriminant is not part of the protocol.
    #[error("unknown message kind {0:#04x}")]
    UnknownMessageKind(u8),

    /// A known message kind arrived where a different one was required.
    #[error("unexpected message kind {actual:#04x}, expected {expected:#04x}")]
    UnexpectedMessageKind {
        /// Kind required at this point in the exchange.
        expected: u8,
        /// Kind actually present in the body header.
        actual: u8,
    },

    /// The operation type discriminant is not part of the protocol.
    #[error("unknown operation type {0:#06x}")]
    UnknownOperation(u16),

    /// The resource type discriminant is not part of the protocol.
    #[error("unknown resource type {0:#06x}")]
    UnknownResource(u16),

    /// A string field was not valid UTF-8.
    #[error("{field} is not valid UTF-8")]
    NotUtf8 {
        /// Field that failed UTF-8 validation.
        field: &'static str,
    },

    /// Bytes remained after the last declared field.
    #[error("{count} trailing bytes after frame body")]
    TrailingBytes {
        /// Number of unconsumed bytes.
        count: usize,
    },

    /// A context-negotiation message failed to parse.
    #[error("malformed context message: {0}")]
    Context(String),
}

/// Failures while building a frame body.
///
/// Encoding fails before anything is written, so an encode error never
/// disturbs the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// Resource address does not fit its length field.
    #[error("resource address length {length} exceeds {max}")]
    AddressTooLong {
        /// Byte length of the address.
        length: usize,
        /// Maximum representable length.
        max: usize,
    },

    /// Too many headers for the count field.
    #[error("header count {count} exceeds {max}")]
    TooManyHeaders {
        /// Number of headers supplied.
        count: usize,
        /// Maximum representable count.
        max: usize,
    },

    /// A header key or value does not fit its length field.
    #[error("header entry length {length} exceeds {max}")]
    HeaderTooLong {
        /// Byte length of the offending key or value.
        length: usize,
        /// Maximum representable length.
        max: usize,
    },

    /// Payload does not fit its length field.
    #[error("payload length {length} exceeds {max}")]
    PayloadTooLarge {
        /// Byte length of the payload.
        length: usize,
        /// Maximum representable length.
        max: usize,
    },

    /// A context-negotiation message failed to serialize.
    #[error("context message serialization: {0}")]
    Context(String),
}

/// Top-level error type surfaced by the transport client.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The framing layer lost stream sync. Fatal to the connection.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// The node refused the context handshake. Fatal to the connection
    /// attempt; not retried at this layer.
    #[error("context negotiation rejected by node (status {status}): {message}")]
    NegotiationRejected {
        /// Status code from the node's context response.
        status: u32,
        /// Reason supplied by the node, if any.
        message: String,
    },

    /// A frame body failed to parse.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A frame body could not be built.
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    /// The connection was torn down while the request was pending, or was
    /// already unusable when the request arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// A deadline elapsed.
    #[error("{operation} timed out after {elapsed:?}")]
    Timeout {
        /// Operation that was abandoned.
        operation: &'static str,
        /// The deadline that elapsed.
        elapsed: Duration,
    },

    /// Socket-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
