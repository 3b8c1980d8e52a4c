//! YAML-RPC message model.
//!
//! One message is a YAML mapping carrying the protocol tag plus exactly one
//! of `method` (request), `result` (response), or `error` (error):
//!
//! ```text
//! yamlrpc: "1.0"
//! method: node.validate
//! params: { input: "..." }
//! id: req-1700000000000-1
//! ```
//!
//! Decoding is presence-discriminated and deliberately lenient about error
//! bodies: a corrupted `error` mapping still decodes to a usable Error
//! message with default code and text, so partial corruption surfaces to the
//! caller instead of vanishing as a parse failure.

use crate::config::ProtocolConfig;
use crate::Result;
use serde_yaml::{Mapping, Value};

/// YAML-RPC error codes.
///
/// The negative five-digit codes match JSON-RPC 2.0; the `-1000` block is
/// node-specific.
pub struct ErrorCode;

impl ErrorCode {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    pub const NODE_INIT_ERROR: i32 = -1000;
    pub const NODE_CONFIG_ERROR: i32 = -1001;
    pub const NODE_VALIDATION_ERROR: i32 = -1002;
    pub const NODE_EXECUTION_TIMEOUT: i32 = -1003;
    pub const NODE_RESOURCE_LIMIT: i32 = -1004;
    pub const NODE_INTERNAL_ERROR: i32 = -1005;
}

/// One YAML-RPC message.
///
/// `id` is an opaque correlation token echoed verbatim by responders; the
/// empty string means "no correlation" (a notification that expects no
/// reply).
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    Request {
        method: String,
        params: Option<Value>,
        id: String,
    },
    Response {
        /// Result payload; YAML null when the node returned nothing. Kept
        /// non-optional so encode always writes the `result` key that decode
        /// discriminates on.
        result: Value,
        id: String,
    },
    Error {
        code: i32,
        message: String,
        data: Option<Value>,
        id: String,
    },
}

impl RpcMessage {
    /// Create a request.
    pub fn request(method: impl Into<String>, params: Option<Value>, id: impl Into<String>) -> Self {
        RpcMessage::Request {
            method: method.into(),
            params,
            id: id.into(),
        }
    }

    /// Create a fire-and-forget notification (a request with no id).
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::request(method, params, "")
    }

    /// Create a response.
    pub fn response(result: Value, id: impl Into<String>) -> Self {
        RpcMessage::Response {
            result,
            id: id.into(),
        }
    }

    /// Create an error without detail data.
    pub fn error(code: i32, message: impl Into<String>, id: impl Into<String>) -> Self {
        RpcMessage::Error {
            code,
            message: message.into(),
            data: None,
            id: id.into(),
        }
    }

    /// Create an error carrying structured detail data.
    pub fn error_with_data(
        code: i32,
        message: impl Into<String>,
        data: Value,
        id: impl Into<String>,
    ) -> Self {
        RpcMessage::Error {
            code,
            message: message.into(),
            data: Some(data),
            id: id.into(),
        }
    }

    /// Correlation id; empty when the message is a notification.
    pub fn id(&self) -> &str {
        match self {
            RpcMessage::Request { id, .. }
            | RpcMessage::Response { id, .. }
            | RpcMessage::Error { id, .. } => id,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, RpcMessage::Request { .. })
    }

    pub fn is_response(&self) -> bool {
        matches!(self, RpcMessage::Response { .. })
    }

    pub fn is_error(&self) -> bool {
        matches!(self, RpcMessage::Error { .. })
    }

    /// Encode to wire bytes (a UTF-8 YAML document, unframed).
    ///
    /// Omitted when empty: `params`, `data`, `id`. Always written: the
    /// protocol tag and, for responses, `result`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut map = Mapping::new();
        map.insert(
            Value::from("yamlrpc"),
            Value::from(ProtocolConfig::VERSION),
        );

        match self {
            RpcMessage::Request { method, params, id } => {
                map.insert(Value::from("method"), Value::from(method.as_str()));
                if let Some(params) = params {
                    map.insert(Value::from("params"), params.clone());
                }
                if !id.is_empty() {
                    map.insert(Value::from("id"), Value::from(id.as_str()));
                }
            }
            RpcMessage::Response { result, id } => {
                map.insert(Value::from("result"), result.clone());
                if !id.is_empty() {
                    map.insert(Value::from("id"), Value::from(id.as_str()));
                }
            }
            RpcMessage::Error {
                code,
                message,
                data,
                id,
            } => {
                let mut error = Mapping::new();
                error.insert(Value::from("code"), Value::from(*code));
                error.insert(Value::from("message"), Value::from(message.as_str()));
                if let Some(data) = data {
                    error.insert(Value::from("data"), data.clone());
                }
                map.insert(Value::from("error"), Value::Mapping(error));
                if !id.is_empty() {
                    map.insert(Value::from("id"), Value::from(id.as_str()));
                }
            }
        }

        let text = serde_yaml::to_string(&Value::Mapping(map))?;
        Ok(text.into_bytes())
    }

    /// Decode wire bytes into a message.
    ///
    /// Returns `None` when the payload is not a YAML mapping, the protocol
    /// tag is absent or mismatched, or none of `method`/`result`/`error` is
    /// present. Never panics on malformed input.
    pub fn decode(bytes: &[u8]) -> Option<RpcMessage> {
        let value: Value = serde_yaml::from_slice(bytes).ok()?;
        let map = value.as_mapping()?;

        let tag = scalar_to_string(map.get("yamlrpc")?)?;
        if tag != ProtocolConfig::VERSION {
            return None;
        }

        let id = match map.get("id") {
            None => String::new(),
            Some(v) => scalar_to_string(v)?,
        };

        if let Some(method) = map.get("method") {
            let method = method.as_str()?.to_string();
            let params = map.get("params").cloned();
            return Some(RpcMessage::Request { method, params, id });
        }

        if let Some(result) = map.get("result") {
            return Some(RpcMessage::Response {
                result: result.clone(),
                id,
            });
        }

        if let Some(error) = map.get("error") {
            // Lenient: a malformed error body still yields a usable Error.
            let (code, message, data) = match error.as_mapping() {
                Some(body) => (
                    body.get("code")
                        .and_then(Value::as_i64)
                        .map(|c| c as i32)
                        .unwrap_or(ErrorCode::INTERNAL_ERROR),
                    body.get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("Unknown error")
                        .to_string(),
                    body.get("data").cloned(),
                ),
                None => (ErrorCode::INTERNAL_ERROR, "Unknown error".to_string(), None),
            };
            return Some(RpcMessage::Error {
                code,
                message,
                data,
                id,
            });
        }

        None
    }
}

/// Render a YAML scalar as a string, tolerating the unquoted forms peers
/// produce (`id: 42`, `yamlrpc: 1.0`). Non-scalar values yield `None`.
fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
