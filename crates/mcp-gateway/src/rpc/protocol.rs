//! JSON-RPC 2.0 message types for the child server wire.
//!
//! Outbound messages are fully typed. Inbound frames stay opaque
//! `serde_json::Value`s until correlation, because the bridge never
//! interprets response payloads beyond the envelope members.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Numeric JSON-RPC request id.
///
/// Ids come from a per-connection counter starting at 1; the wire form is
/// a bare JSON number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbound JSON-RPC message: a call when `id` is set, a notification
/// when it is not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RpcRequest {
    pub fn call(id: RequestId, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: method.into(),
            params: Some(params),
        }
    }

    pub fn notification(method: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: method.into(),
            params: None,
        }
    }
}

/// The child's answer to a call: the raw `result` or `error` member,
/// passed through untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcReply {
    Result(Value),
    Error(Value),
}

impl RpcReply {
    /// Extracts the reply from a decoded response frame.
    ///
    /// Presence of the `error` member marks a failure, whatever its value.
    /// A response carrying neither member yields a null result; the caller
    /// logs it.
    pub fn from_response(frame: Value) -> Self {
        if let Value::Object(mut members) = frame {
            if let Some(error) = members.remove("error") {
                return RpcReply::Error(error);
            }
            if let Some(result) = members.remove("result") {
                return RpcReply::Result(result);
            }
        }
        RpcReply::Result(Value::Null)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RpcReply::Error(_))
    }
}

/// Numeric id of an inbound frame, if it has one.
///
/// Outbound ids are always numeric, so a string or missing id can never
/// match a pending call.
pub fn response_id(frame: &Value) -> Option<u64> {
    frame.get("id").and_then(Value::as_u64)
}
