//! Wire codec for operation requests and responses.
//!
//! After context negotiation, every frame body starts with a fixed binary
//! header carrying the correlation id:
//!
//! ```text
//! +---------------------+-----------+
//! | Activity id (16 B)  | Kind (1B) |
//! +---------------------+-----------+
//! ```
//!
//! followed by, for requests:
//!
//! ```text
//! | Operation (u16) | Resource (u16) | Addr len (u16) | Addr bytes |
//! ```
//!
//! and for responses:
//!
//! ```text
//! | Status (u32) |
//! ```
//!
//! Both then carry a compact header block —
//! `count (u16)` then `key len (u16), key, value len (u16), value` per entry
//! — and `payload len (u32)` plus the payload bytes. All integers are
//! little-endian. A zero payload length means no payload.
//!
//! The activity id is the correlation key: responses are matched to their
//! request by id, never by arrival order, which is what makes pipelining on
//! a shared connection possible.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::error::{DecodeError, EncodeError};

/// Byte length of the activity id on the wire.
pub const ACTIVITY_ID_SIZE: usize = 16;

/// Message kind for an operation request.
pub const KIND_REQUEST: u8 = 0x01;

/// Message kind for an operation response.
pub const KIND_RESPONSE: u8 = 0x02;

const MAX_U16_LEN: usize = u16::MAX as usize;
const MAX_U32_LEN: usize = u32::MAX as usize;

/// Operation requested of the storage node.
///
/// Discriminants are explicitly assigned for wire stability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum OperationType {
    /// Point read of a single item.
    Read = 0x0001,
    /// Query over a collection.
    Query = 0x0002,
    /// Create a new item.
    Create = 0x0003,
    /// Replace an existing item.
    Replace = 0x0004,
    /// Create or replace an item.
    Upsert = 0x0005,
    /// Delete an item.
    Delete = 0x0006,
    /// Partial update of an item.
    Patch = 0x0007,
}

impl OperationType {
    /// Converts a raw discriminant to an operation type.
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::Read),
            0x0002 => Some(Self::Query),
            0x0003 => Some(Self::Create),
            0x0004 => Some(Self::Replace),
            0x0005 => Some(Self::Upsert),
            0x0006 => Some(Self::Delete),
            0x0007 => Some(Self::Patch),
            _ => None,
        }
    }

    /// Returns the wire discriminant.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Kind of resource an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ResourceType {
    /// A database.
    Database = 0x0001,
    /// A collection within a database.
    Collection = 0x0002,
    /// A document within a collection.
    Document = 0x0003,
}

impl ResourceType {
    /// Converts a raw discriminant to a resource type.
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0x0001 => Some(Self::Database),
            0x0002 => Some(Self::Collection),
            0x0003 => Some(Self::Document),
            _ => None,
        }
    }

    /// Returns the wire discriminant.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

/// An operation request bound for one storage node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Correlation id, unique among in-flight requests on a connection.
    pub activity_id: Uuid,
    /// Operation to perform.
    pub operation: OperationType,
    /// Resource kind being addressed.
    pub resource: ResourceType,
    /// Resource address, e.g. `"dbs/orders/colls/by-day/docs/2024-11-02"`.
    pub address: String,
    /// Request headers.
    pub headers: Vec<(String, String)>,
    /// Optional request body.
    pub payload: Option<Bytes>,
}

impl Request {
    /// Create a request with a fresh activity id and no headers or payload.
    #[must_use]
    pub fn new(
        operation: OperationType,
        resource: ResourceType,
        address: impl Into<String>,
    ) -> Self {
        Self {
            activity_id: Uuid::new_v4(),
            operation,
            resource,
            address: address.into(),
            headers: Vec::new(),
            payload: None,
        }
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// A storage node's reply to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Activity id of the request this answers.
    pub activity_id: Uuid,
    /// Outcome status code; `2xx` is success.
    pub status: u32,
    /// Response headers.
    pub headers: Vec<(String, String)>,
    /// Optional response body.
    pub payload: Option<Bytes>,
}

impl Response {
    /// Create a response correlated to the given activity id.
    #[must_use]
    pub fn new(activity_id: Uuid, status: u32) -> Self {
        Self {
            activity_id,
            status,
            headers: Vec::new(),
            payload: None,
        }
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Attach a payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Bytes) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Returns `true` for a `2xx` status.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }
}

/// Encode a request into a frame body.
pub fn encode_request(request: &Request) -> Result<Bytes, EncodeError> {
    if request.address.len() > MAX_U16_LEN {
        return Err(EncodeError::AddressTooLong {
            length: request.address.len(),
            max: MAX_U16_LEN,
        });
    }

    let mut buf = BytesMut::with_capacity(
        ACTIVITY_ID_SIZE + 16 + request.address.len() + encoded_extras_len(request),
    );
    buf.put_slice(request.activity_id.as_bytes());
    buf.put_u8(KIND_REQUEST);
    buf.put_u16_le(request.operation.as_u16());
    buf.put_u16_le(request.resource.as_u16());
    buf.put_u16_le(request.address.len() as u16);
    buf.put_slice(request.address.as_bytes());
    put_headers(&mut buf, &request.headers)?;
    put_payload(&mut buf, request.payload.as_ref())?;
    Ok(buf.freeze())
}

/// Encode a response into a frame body.
pub fn encode_response(response: &Response) -> Result<Bytes, EncodeError> {
    let mut buf =
        BytesMut::with_capacity(ACTIVITY_ID_SIZE + 8 + response.headers.len() * 16);
    buf.put_slice(response.activity_id.as_bytes());
    buf.put_u8(KIND_RESPONSE);
    buf.put_u32_le(response.status);
    put_headers(&mut buf, &response.headers)?;
    put_payload(&mut buf, response.payload.as_ref())?;
    Ok(buf.freeze())
}

/// Decode a request frame body.
pub fn decode_request(mut body: Bytes) -> Result<Request, DecodeError> {
    let activity_id = take_activity_id(&mut body)?;
    expect_kind(&mut body, KIND_REQUEST)?;

    let raw_operation = take_u16(&mut body, "operation type")?;
    let operation =
        OperationType::from_u16(raw_operation).ok_or(DecodeError::UnknownOperation(raw_operation))?;

    let raw_resource = take_u16(&mut body, "resource type")?;
    let resource =
        ResourceType::from_u16(raw_resource).ok_or(DecodeError::UnknownResource(raw_resource))?;

    let address = take_string(&mut body, "resource address")?;
    let headers = take_headers(&mut body)?;
    let payload = take_payload(&mut body)?;
    reject_trailing(&body)?;

    Ok(Request {
        activity_id,
        operation,
        resource,
        address,
        headers,
        payload,
    })
}

/// Decode a response frame body.
pub fn decode_response(mut body: Bytes) -> Result<Response, DecodeError> {
    let activity_id = take_activity_id(&mut body)?;
    expect_kind(&mut body, KIND_RESPONSE)?;

    let status = take_u32(&mut body, "status")?;
    let headers = take_headers(&mut body)?;
    let payload = take_payload(&mut body)?;
    reject_trailing(&body)?;

    Ok(Response {
        activity_id,
        status,
        headers,
        payload,
    })
}

fn encoded_extras_len(request: &Request) -> usize {
    request
        .headers
        .iter()
        .map(|(k, v)| 4 + k.len() + v.len())
        .sum::<usize>()
        + request.payload.as_ref().map_or(0, Bytes::len)
        + 8
}

fn put_headers(buf: &mut BytesMut, headers: &[(String, String)]) -> Result<(), EncodeError> {
    if headers.len() > MAX_U16_LEN {
        return Err(EncodeError::TooManyHeaders {
            count: headers.len(),
            max: MAX_U16_LEN,
        });
    }
    buf.put_u16_le(headers.len() as u16);
    for (key, value) in headers {
        for part in [key, value] {
            if part.len() > MAX_U16_LEN {
                return Err(EncodeError::HeaderTooLong {
                    length: part.len(),
                    max: MAX_U16_LEN,
                });
            }
            buf.put_u16_le(part.len() as u16);
            buf.put_slice(part.as_bytes());
        }
    }
    Ok(())
}

fn put_payload(buf: &mut BytesMut, payload: Option<&Bytes>) -> Result<(), EncodeError> {
    match payload {
        Some(payload) => {
            if payload.len() > MAX_U32_LEN {
                return Err(EncodeError::PayloadTooLarge {
                    length: payload.len(),
                    max: MAX_U32_LEN,
                });
            }
            buf.put_u32_le(payload.len() as u32);
            buf.put_slice(payload);
        }
        None => buf.put_u32_le(0),
    }
    Ok(())
}

fn take_activity_id(body: &mut Bytes) -> Result<Uuid, DecodeError> {
    if body.remaining() < ACTIVITY_ID_SIZE {
        return Err(DecodeError::Truncated {
            field: "activity id",
        });
    }
    let mut raw = [0u8; ACTIVITY_ID_SIZE];
    body.copy_to_slice(&mut raw);
    Ok(Uuid::from_bytes(raw))
}

fn expect_kind(body: &mut Bytes, expected: u8) -> Result<(), DecodeError> {
    if body.remaining() < 1 {
        return Err(DecodeError::Truncated {
            field: "message kind",
        });
    }
    let actual = body.get_u8();
    if actual != KIND_REQUEST && actual != KIND_RESPONSE {
        return Err(DecodeError::UnknownMessageKind(actual));
    }
    if actual != expected {
        return Err(DecodeError::UnexpectedMessageKind { expected, actual });
    }
    Ok(())
}

fn take_u16(body: &mut Bytes, field: &'static str) -> Result<u16, DecodeError> {
    if body.remaining() < 2 {
        return Err(DecodeError::Truncated { field });
    }
    Ok(body.get_u16_le())
}

fn take_u32(body: &mut Bytes, field: &'static str) -> Result<u32, DecodeError> {
    if body.remaining() < 4 {
        return Err(DecodeError::Truncated { field });
    }
    Ok(body.get_u32_le())
}

fn take_bytes(body: &mut Bytes, len: usize, field: &'static str) -> Result<Bytes, DecodeError> {
    if body.remaining() < len {
        return Err(DecodeError::Truncated { field });
    }
    Ok(body.split_to(len))
}

fn take_string(body: &mut Bytes, field: &'static str) -> Result<String, DecodeError> {
    let len = take_u16(body, field)? as usize;
    let raw = take_bytes(body, len, field)?;
    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::NotUtf8 { field })
}

fn take_headers(body: &mut Bytes) -> Result<Vec<(String, String)>, DecodeError> {
    let count = take_u16(body, "header count")? as usize;
    let mut headers = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        let key = take_string(body, "header key")?;
        let value = take_string(body, "header value")?;
        headers.push((key, value));
    }
    Ok(headers)
}

fn take_payload(body: &mut Bytes) -> Result<Option<Bytes>, DecodeError> {
    let len = take_u32(body, "payload length")? as usize;
    if len == 0 {
        return Ok(None);
    }
    Ok(Some(take_bytes(body, len, "payload")?))
}

fn reject_trailing(body: &Bytes) -> Result<(), DecodeError> {
    if body.has_remaining() {
        return Err(DecodeError::TrailingBytes {
            count: body.remaining(),
        });
    }
    Ok(())
}
