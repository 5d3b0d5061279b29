//! In-process mock storage node.
//!
//! Listens on an ephemeral TCP port and speaks the direct transport wire
//! format: length-prefixed frames, a context exchange first, operation
//! request/response frames after. Behavior per connection is scripted by
//! [`NodeBehavior`] so tests can exercise rejection, faults, reordering,
//! and silence as well as the happy path.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use uuid::Uuid;

use strata_direct::context::{CONTEXT_STATUS_OK, Context, ContextRequest};
use strata_direct::framing::FrameCodec;
use strata_direct::wire::{self, Request, Response};
use strata_direct::Endpoint;

/// Scripted behavior of a mock node, applied per connection.
#[derive(Debug, Clone)]
pub enum NodeBehavior {
    /// Accept negotiation, answer every request with `status` and the
    /// request's payload (or its address) echoed back.
    Echo { status: u32 },

    /// Refuse the context handshake with the given status.
    RejectNegotiation { status: u32, reason: &'static str },

    /// Accept negotiation, collect `batch` requests, then answer them in
    /// reverse arrival order.
    Reversed { batch: usize },

    /// Accept negotiation, read `count` request frames without answering,
    /// then drop the connection.
    CloseAfterRequests { count: usize },

    /// Accept negotiation, then read and ignore everything.
    Silent,

    /// Accept negotiation; before answering the first request, emit a
    /// response with an activity id nobody asked for.
    StrayThenEcho,
}

/// A running mock node.
pub struct MockNode {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    accept_task: JoinHandle<()>,
}

impl MockNode {
    /// Bind an ephemeral port and start accepting connections. The
    /// advertised context grants no idle limit.
    pub async fn start(behavior: NodeBehavior) -> Self {
        Self::start_with_idle(behavior, 0).await
    }

    /// Like [`start`](Self::start), advertising `idle_timeout_secs` in the
    /// negotiated context.
    pub async fn start_with_idle(behavior: NodeBehavior, idle_timeout_secs: u64) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock node");
        let addr = listener.local_addr().expect("mock node addr");
        let connections = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&connections);
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(handle_connection(behavior.clone(), socket, idle_timeout_secs));
            }
        });

        Self {
            addr,
            connections,
            accept_task,
        }
    }

    /// Endpoint pointing at this node.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::tcp("127.0.0.1", self.addr.port())
    }

    /// Number of connections accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

fn accepted_context(idle_timeout_secs: u64) -> Context {
    Context {
        status: CONTEXT_STATUS_OK,
        server_agent: "strata-node/sim".to_owned(),
        server_version: "0.0.0-sim".to_owned(),
        idle_timeout_secs,
        message: None,
    }
}

fn echo_response(request: &Request, status: u32) -> Response {
    let payload = request
        .payload
        .clone()
        .unwrap_or_else(|| Bytes::from(request.address.clone()));
    Response::new(request.activity_id, status)
        .with_header("x-strata-server", "sim")
        .with_payload(payload)
}

async fn handle_connection(behavior: NodeBehavior, socket: TcpStream, idle_timeout_secs: u64) {
    let mut framed = Framed::new(socket, FrameCodec::new());

    // Context exchange comes first on every connection.
    let Some(Ok(first)) = framed.next().await else {
        return;
    };
    let Ok(_context_request) = ContextRequest::from_bytes(&first) else {
        panic!("first frame was not a context request");
    };

    if let NodeBehavior::RejectNegotiation { status, reason } = behavior {
        let rejection = Context {
            status,
            message: Some(reason.to_owned()),
            ..accepted_context(idle_timeout_secs)
        };
        let _ = framed
            .send(rejection.to_bytes().expect("encode rejection"))
            .await;
        return;
    }

    framed
        .send(
            accepted_context(idle_timeout_secs)
                .to_bytes()
                .expect("encode context"),
        )
        .await
        .expect("send context");

    match behavior {
        NodeBehavior::Echo { status } => {
            while let Some(Ok(frame)) = framed.next().await {
                let request = wire::decode_request(frame).expect("decode request");
                let body = wire::encode_response(&echo_response(&request, status))
                    .expect("encode response");
                if framed.send(body).await.is_err() {
                    return;
                }
            }
        }
        NodeBehavior::Reversed { batch } => {
            let mut requests = Vec::with_capacity(batch);
            while requests.len() < batch {
                let Some(Ok(frame)) = framed.next().await else {
                    return;
                };
                requests.push(wire::decode_request(frame).expect("decode request"));
            }
            for request in requests.iter().rev() {
                let body =
                    wire::encode_response(&echo_response(request, 200)).expect("encode response");
                if framed.send(body).await.is_err() {
                    return;
                }
            }
            // Hold the connection open for any follow-up traffic.
            while let Some(Ok(_)) = framed.next().await {}
        }
        NodeBehavior::CloseAfterRequests { count } => {
            for _ in 0..count {
                if framed.next().await.is_none() {
                    return;
                }
            }
            // Dropping the framed stream resets the connection.
        }
        NodeBehavior::Silent => {
            while let Some(Ok(_)) = framed.next().await {}
        }
        NodeBehavior::StrayThenEcho => {
            let mut stray_sent = false;
            while let Some(Ok(frame)) = framed.next().await {
                let request = wire::decode_request(frame).expect("decode request");
                if !stray_sent {
                    stray_sent = true;
                    let stray = Response::new(Uuid::new_v4(), 200)
                        .with_payload(Bytes::from_static(b"nobody asked"));
                    let body = wire::encode_response(&stray).expect("encode stray");
                    if framed.send(body).await.is_err() {
                        return;
                    }
                }
                let body = wire::encode_response(&echo_response(&request, 200))
                    .expect("encode response");
                if framed.send(body).await.is_err() {
                    return;
                }
            }
        }
        NodeBehavior::RejectNegotiation { .. } => unreachable!("handled above"),
    }
}
