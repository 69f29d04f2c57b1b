//! JSON-RPC 2.0 envelopes and their wire encoding.
//!
//! An envelope travels as a text message holding the JSON document, or, when
//! a binary blob is attached, as a binary message laid out as
//!
//! ```text
//! [u32 little-endian length of JSON][JSON bytes][blob bytes, rest of frame]
//! ```

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::RpcFailure;
use crate::frame::Message;

/// Supported protocol version tag.
pub const JSONRPC_VERSION: &str = "2.0";

/// Method name used by progress notifications.
pub const PROGRESS_METHOD: &str = "progress";

// Standard JSON-RPC 2.0 error codes
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

// Server-defined error codes
pub const ENDPOINT_ERROR: i32 = -32000;
pub const UNKNOWN_TASK_ID: i32 = -32001;
pub const DUPLICATE_TASK_ID: i32 = -32002;
pub const TASK_CANCELLED: i32 = -32003;

const LENGTH_PREFIX: usize = 4;

/// Request identifier. Absent or null on the wire means fire-and-forget.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

/// JSON-RPC 2.0 request object.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    /// If None, no reply is expected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    pub params: Value,
    /// Raw bytes that travelled alongside the JSON document.
    #[serde(skip)]
    pub blob: Option<Bytes>,
}

impl Request {
    pub fn new(id: Option<RequestId>, method: impl Into<String>, params: Value) -> Self {
        Self {
            id,
            method: method.into(),
            params,
            blob: None,
        }
    }

    pub fn with_blob(mut self, blob: impl Into<Bytes>) -> Self {
        self.blob = Some(blob.into());
        self
    }

    /// Check if this request is a notification (no response expected).
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// Successful reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub id: RequestId,
    pub result: Value,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Error reply. The id is null when the request could not be read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub id: Option<RequestId>,
    pub error: RpcError,
}

/// Progress of a running task, addressed by the originating request id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub id: RequestId,
    pub operation: String,
    pub amount: f64,
}

/// Any message exchanged over a connection.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(Request),
    Reply(Reply),
    Error(ErrorReply),
    Progress(ProgressUpdate),
}

impl Envelope {
    /// Create a success reply with the given result.
    pub fn reply(id: RequestId, result: Value) -> Self {
        Envelope::Reply(Reply { id, result })
    }

    /// Create an error reply from a failure.
    pub fn error(id: Option<RequestId>, failure: &RpcFailure) -> Self {
        Envelope::Error(ErrorReply {
            id,
            error: failure.to_rpc_error(),
        })
    }

    pub fn progress(id: RequestId, operation: impl Into<String>, amount: f64) -> Self {
        Envelope::Progress(ProgressUpdate {
            id,
            operation: operation.into(),
            amount,
        })
    }

    /// Render the JSON document for this envelope.
    pub fn to_json(&self) -> Result<String, EnvelopeError> {
        #[derive(Serialize)]
        struct Tagged<'a, T: Serialize> {
            jsonrpc: &'static str,
            #[serde(flatten)]
            body: &'a T,
        }

        #[derive(Serialize)]
        struct Notification<'a> {
            jsonrpc: &'static str,
            method: &'static str,
            params: &'a ProgressUpdate,
        }

        let json = match self {
            Envelope::Request(body) => serde_json::to_string(&Tagged {
                jsonrpc: JSONRPC_VERSION,
                body,
            }),
            Envelope::Reply(body) => serde_json::to_string(&Tagged {
                jsonrpc: JSONRPC_VERSION,
                body,
            }),
            Envelope::Error(body) => serde_json::to_string(&Tagged {
                jsonrpc: JSONRPC_VERSION,
                body,
            }),
            Envelope::Progress(params) => serde_json::to_string(&Notification {
                jsonrpc: JSONRPC_VERSION,
                method: PROGRESS_METHOD,
                params,
            }),
        };
        Ok(json?)
    }
}

/// Failures while packing or unpacking the wire representation.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("binary message is shorter than its 4-byte length prefix")]
    MissingLengthPrefix,
    #[error("declared JSON length {declared} exceeds the {available} bytes available")]
    LengthOverrun { declared: usize, available: usize },
    #[error("JSON text of {0} bytes does not fit the 4-byte length prefix")]
    TooLarge(usize),
    #[error("JSON text is not valid UTF-8")]
    InvalidUtf8,
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<EnvelopeError> for RpcFailure {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::TooLarge(_) => RpcFailure::Unexpected(err.to_string()),
            other => RpcFailure::Parse(other.to_string()),
        }
    }
}

/// Pack JSON text and a blob as `len(json) LE u32 || json || blob`.
pub fn pack_binary(json: &str, blob: &[u8]) -> Result<Bytes, EnvelopeError> {
    let len = u32::try_from(json.len()).map_err(|_| EnvelopeError::TooLarge(json.len()))?;
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX + json.len() + blob.len());
    buf.put_u32_le(len);
    buf.extend_from_slice(json.as_bytes());
    buf.extend_from_slice(blob);
    Ok(buf.freeze())
}

/// Split a binary message into its JSON text and trailing blob.
pub fn unpack_binary(mut data: Bytes) -> Result<(String, Bytes), EnvelopeError> {
    if data.len() < LENGTH_PREFIX {
        return Err(EnvelopeError::MissingLengthPrefix);
    }
    let declared = data.get_u32_le() as usize;
    if declared > data.len() {
        return Err(EnvelopeError::LengthOverrun {
            declared,
            available: data.len(),
        });
    }
    let json = data.split_to(declared);
    let json = String::from_utf8(json.to_vec()).map_err(|_| EnvelopeError::InvalidUtf8)?;
    Ok((json, data))
}

/// Encode an envelope, attaching the blob when one is given.
pub fn encode(envelope: &Envelope, blob: Option<&[u8]>) -> Result<Message, EnvelopeError> {
    let json = envelope.to_json()?;
    match blob {
        Some(blob) => Ok(Message::Binary(pack_binary(&json, blob)?)),
        None => Ok(Message::Text(json)),
    }
}

/// Decode any envelope (client side) together with its blob.
pub fn decode(message: Message) -> Result<(Envelope, Option<Bytes>), RpcFailure> {
    let (mut object, blob) = parse_object(message)?;

    if object.contains_key("method") {
        let has_id = !matches!(object.get("id"), None | Some(Value::Null));
        let is_progress = object.get("method").and_then(Value::as_str) == Some(PROGRESS_METHOD);
        if is_progress && !has_id {
            let params = object.remove("params").unwrap_or(Value::Null);
            let update: ProgressUpdate = serde_json::from_value(params)
                .map_err(|e| RpcFailure::InvalidRequest(format!("malformed progress: {e}")))?;
            return Ok((Envelope::Progress(update), blob));
        }
        let request = request_from_object(object, blob.clone())?;
        return Ok((Envelope::Request(request), blob));
    }

    if object.contains_key("error") {
        let reply: ErrorReply = serde_json::from_value(Value::Object(object))
            .map_err(|e| RpcFailure::InvalidRequest(format!("malformed error reply: {e}")))?;
        return Ok((Envelope::Error(reply), blob));
    }

    if object.contains_key("result") {
        let reply: Reply = serde_json::from_value(Value::Object(object))
            .map_err(|e| RpcFailure::InvalidRequest(format!("malformed reply: {e}")))?;
        return Ok((Envelope::Reply(reply), blob));
    }

    Err(RpcFailure::InvalidRequest(
        "envelope is neither a request, a reply nor a notification".into(),
    ))
}

/// Decode an inbound request (server side). The outer shape is validated
/// here; parameters are validated later against the endpoint's schema.
pub fn decode_request(message: Message) -> Result<Request, RpcFailure> {
    let (object, blob) = parse_object(message)?;
    request_from_object(object, blob)
}

fn parse_object(message: Message) -> Result<(Map<String, Value>, Option<Bytes>), RpcFailure> {
    let (json, blob) = match message {
        Message::Text(text) => (text, None),
        Message::Binary(data) => {
            let (json, blob) = unpack_binary(data)?;
            (json, Some(blob))
        }
    };

    let value: Value =
        serde_json::from_str(&json).map_err(|e| RpcFailure::Parse(e.to_string()))?;
    let Value::Object(object) = value else {
        return Err(RpcFailure::InvalidRequest("envelope must be a JSON object".into()));
    };

    match object.get("jsonrpc") {
        Some(Value::String(v)) if v == JSONRPC_VERSION => Ok((object, blob)),
        Some(_) => Err(RpcFailure::InvalidRequest(
            "jsonrpc must be \"2.0\"".into(),
        )),
        None => Err(RpcFailure::InvalidRequest("jsonrpc is missing".into())),
    }
}

fn request_from_object(
    mut object: Map<String, Value>,
    blob: Option<Bytes>,
) -> Result<Request, RpcFailure> {
    let method = match object.remove("method") {
        Some(Value::String(method)) if !method.is_empty() => method,
        Some(Value::String(_)) | None => {
            return Err(RpcFailure::MethodNotFound(String::new()));
        }
        Some(_) => {
            return Err(RpcFailure::InvalidRequest("method must be a string".into()));
        }
    };

    let id = match object.remove("id") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(
            serde_json::from_value::<RequestId>(raw)
                .map_err(|_| RpcFailure::InvalidRequest("id must be an integer or a string".into()))?,
        ),
    };

    Ok(Request {
        id,
        method,
        params: object.remove("params").unwrap_or(Value::Null),
        blob,
    })
}
