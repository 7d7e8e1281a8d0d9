/// JSON-RPC 2.0 message types and framing helpers.
///
/// One message struct covers requests, notifications, and responses; the
/// optional fields distinguish them. A request has a non-null string or
/// integer `id`; a notification has no `id`; a response echoes the `id` and
/// carries exactly one of `result` or `error`.
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::GateError;

/// Protocol version string carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Parse error (malformed JSON).
pub const PARSE_ERROR: i64 = -32700;
/// Invalid JSON-RPC shape.
pub const INVALID_REQUEST: i64 = -32600;
/// Unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid params.
pub const INVALID_PARAMS: i64 = -32602;
/// Internal error.
pub const INTERNAL_ERROR: i64 = -32603;
/// Session has not completed `initialize`.
pub const NOT_INITIALIZED: i64 = -32002;
/// Application error: rate limited, breaker open, unknown tool.
pub const APPLICATION_ERROR: i64 = -32000;

/// A JSON-RPC 2.0 message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    /// JSON-RPC version (always "2.0").
    pub jsonrpc: String,
    /// Request ID (None for notifications).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    /// Method name (for requests/notifications).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Parameters (for requests/notifications).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Result (for responses).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error (for error responses).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code.
    pub code: i64,
    /// Error message.
    pub message: String,
    /// Additional error data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcMessage {
    /// Build a request with the given id, method, and params.
    pub fn request(id: Value, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    /// Build a notification (no id).
    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    /// Build a success response echoing `id`.
    pub fn response(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response echoing `id`.
    pub fn error_response(id: Option<Value>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: None,
            params: None,
            result: None,
            error: Some(error),
        }
    }

    /// Build the error response for a [`GateError`], echoing `id`.
    pub fn from_gate_error(id: Option<Value>, err: &GateError) -> Self {
        Self::error_response(id, err.to_rpc_error())
    }

    /// True when this message is a request (method + non-null id).
    pub fn is_request(&self) -> bool {
        self.method.is_some() && self.id.as_ref().is_some_and(|id| !id.is_null())
    }

    /// True when this message is a notification (method, no id).
    pub fn is_notification(&self) -> bool {
        self.method.is_some() && self.id.is_none()
    }

    /// True when this message is a response (result or error, no method).
    pub fn is_response(&self) -> bool {
        self.method.is_none() && (self.result.is_some() || self.error.is_some())
    }

    /// Validate the JSON-RPC 2.0 envelope.
    ///
    /// Rejects a wrong version string, a request id that is neither a string
    /// nor an integer, and responses carrying both `result` and `error`.
    pub fn validate(&self) -> Result<(), GateError> {
        if self.jsonrpc != JSONRPC_VERSION {
            return Err(GateError::InvalidRequest(format!(
                "jsonrpc must be \"2.0\", got {:?}",
                self.jsonrpc
            )));
        }
        if let Some(id) = &self.id {
            let ok = id.is_string() || (id.is_number() && id.as_f64().is_some_and(|f| f.fract() == 0.0));
            if !ok && !id.is_null() {
                return Err(GateError::InvalidRequest(format!(
                    "id must be a string or integer, got {id}"
                )));
            }
        }
        if self.result.is_some() && self.error.is_some() {
            return Err(GateError::InvalidRequest(
                "response carries both result and error".to_string(),
            ));
        }
        if self.method.is_none() && self.result.is_none() && self.error.is_none() {
            return Err(GateError::InvalidRequest(
                "message has neither method nor result nor error".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse one newline-delimited frame into a validated message.
    ///
    /// JSON syntax errors map to [`GateError::Parse`] (wire code -32700);
    /// shape errors map to [`GateError::InvalidRequest`].
    pub fn parse_line(line: &str) -> Result<Self, GateError> {
        let message: JsonRpcMessage =
            serde_json::from_str(line).map_err(|e| GateError::Parse(e.to_string()))?;
        message.validate()?;
        Ok(message)
    }

    /// Stable string form of the id for correlation-map keys.
    pub fn id_key(&self) -> Option<String> {
        self.id.as_ref().map(id_key)
    }
}

/// Stable string form of an id value for correlation-map keys.
pub fn id_key(id: &Value) -> String {
    match id {
        Value::String(s) => format!("s:{s}"),
        other => format!("n:{other}"),
    }
}
