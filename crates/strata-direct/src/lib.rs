//! Direct binary transport client for Strata storage nodes.
//!
//! Talks to storage nodes over raw TCP (optionally TLS), bypassing the
//! HTTP gateway path: a length-prefixed binary framing protocol, a
//! mandatory context-negotiation handshake per connection, and multiplexed
//! request/response correlation so many requests can be pipelined on one
//! shared connection.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            TransportClient              │  pool, health, deadlines
//! ├─────────────────────────────────────────┤
//! │              Connection                 │  lifecycle, read loop, mux
//! ├─────────────────────────────────────────┤
//! │      Context / Request codecs           │  handshake + body headers
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  [u32 LE length][body]
//! ├─────────────────────────────────────────┤
//! │            TCP (· TLS)                  │  socket
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use strata_direct::{
//!     Endpoint, OperationType, Request, ResourceType, TransportClient, TransportConfig,
//! };
//!
//! let client = TransportClient::new(TransportConfig::default());
//! let endpoint = Endpoint::tcp("node-1.strata.internal", 14100);
//!
//! let request = Request::new(OperationType::Read, ResourceType::Document, "docs/42")
//!     .with_header("x-strata-consistency", "session");
//! let response = client.invoke(&endpoint, request).await?;
//! ```
//!
//! Failures surface as typed [`TransportError`]s, unmodified: retry and
//! backoff, like node selection, are the caller's concern. Endpoint health
//! transitions are pushed to [`TransportClient::subscribe_health`]
//! subscribers for exactly that purpose.

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod framing;
pub mod health;
pub mod wire;

mod connection;
mod mux;
mod stream;

pub use client::TransportClient;
pub use config::TransportConfig;
pub use connection::ConnectionState;
pub use context::{CONTEXT_STATUS_OK, Context, ContextRequest, PROTOCOL_VERSION};
pub use error::{DecodeError, EncodeError, FramingError, TransportError, TransportResult};
pub use framing::FrameCodec;
pub use health::{Endpoint, EndpointHealth, HealthEvent, HealthRegistry, TransportScheme};
pub use wire::{OperationType, Request, ResourceType, Response};
