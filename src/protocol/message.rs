//! Wire message types.
//!
//! Requests and responses are plain serde structs. Unknown fields are
//! ignored on the way in, absent options are omitted on the way out, so the
//! format stays interoperable with other JSON-RPC peers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Reserved error codes.
pub mod codes {
    /// The requested method has no registered handler.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// A handler failed while producing its reply.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// The connection failed terminally. Client-synthesized, never sent
    /// over the wire.
    pub const TRANSPORT_FAILURE: i64 = -32300;
    /// The entry was evicted from the outbound buffer. Client-synthesized.
    pub const OVERFLOW: i64 = -32000;
}

/// A protocol-level error, carried in the `error` field of a response or
/// synthesized locally for transport failures and overflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach a diagnostic payload.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found() -> Self {
        Self::new(codes::METHOD_NOT_FOUND, "Method not found")
    }

    pub fn internal() -> Self {
        Self::new(codes::INTERNAL_ERROR, "Internal error")
    }

    pub fn overflow() -> Self {
        Self::new(codes::OVERFLOW, "Overflow")
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::new(codes::TRANSPORT_FAILURE, reason)
    }
}

/// An inbound request as seen by the server. `id` is absent for
/// notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// An inbound response as seen by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}
