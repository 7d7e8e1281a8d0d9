/// Unified error type for the toolgate proxy.
///
/// All crates use this error type for propagation across crate boundaries.
/// Internal module errors should be converted into the appropriate variant.
/// Every variant maps onto a JSON-RPC error code via [`GateError::code`], so
/// any failure can be surfaced as a wire error response.
use crate::rpc::JsonRpcError;

/// Unified error enum shared by every toolgate crate.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// Input failed structural validation (empty name, bad params shape).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A toolset id with no registered loader.
    #[error("unknown toolset: {0}")]
    UnknownToolset(String),

    /// A tool name is already owned by another active toolset.
    #[error("tool name collision: {0}")]
    Collision(String),

    /// More than one toolset owns a tool under the `error` conflict policy.
    #[error("ambiguous tool owner: {0}")]
    Ambiguous(String),

    /// Input carries a property the tool schema does not declare.
    #[error("unknown property: {0}")]
    UnknownProperty(String),

    /// Input is missing a property the tool schema requires.
    #[error("missing required property: {0}")]
    MissingRequired(String),

    /// Input property value does not match the declared schema type.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// The requested tool is not active and could not be auto-enabled.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// A backend name with no live connection.
    #[error("no connection: {0}")]
    NoConnection(String),

    /// Request arrived before the session completed `initialize`.
    #[error("not initialized: {0}")]
    NotInitialized(String),

    /// Bearer token missing or wrong.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Fixed-window rate limit exceeded.
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    /// Circuit breaker is open for the target backend/method.
    #[error("circuit open: {0}")]
    CircuitOpen(String),

    /// Bounded request queue is full.
    #[error("queue full: {0}")]
    QueueFull(String),

    /// Inbound bytes were not valid JSON.
    #[error("parse error: {0}")]
    Parse(String),

    /// Valid JSON but not a valid JSON-RPC 2.0 message.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Method is not part of the routed surface.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Deadline expired waiting for a response.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Transport-level failure (disconnect, write error, stopped).
    #[error("transport error: {0}")]
    Transport(String),

    /// A backend returned an error or misbehaved.
    #[error("backend error: {0}")]
    Backend(String),

    /// A toolset loader failed.
    #[error("loader error: {0}")]
    Loader(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration loading or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// Generic internal error for unexpected conditions.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GateError {
    /// The JSON-RPC error code this error surfaces as on the wire.
    pub fn code(&self) -> i64 {
        match self {
            GateError::Parse(_) => crate::rpc::PARSE_ERROR,
            GateError::InvalidRequest(_) => crate::rpc::INVALID_REQUEST,
            GateError::MethodNotFound(_) => crate::rpc::METHOD_NOT_FOUND,
            GateError::InvalidInput(_)
            | GateError::UnknownProperty(_)
            | GateError::MissingRequired(_)
            | GateError::TypeMismatch(_) => crate::rpc::INVALID_PARAMS,
            GateError::NotInitialized(_) => crate::rpc::NOT_INITIALIZED,
            GateError::Unauthorized(_)
            | GateError::RateLimited(_)
            | GateError::CircuitOpen(_)
            | GateError::QueueFull(_)
            | GateError::ToolNotFound(_)
            | GateError::UnknownToolset(_)
            | GateError::Collision(_)
            | GateError::Ambiguous(_)
            | GateError::NoConnection(_)
            | GateError::Backend(_)
            | GateError::Loader(_)
            | GateError::Timeout(_)
            | GateError::Transport(_) => crate::rpc::APPLICATION_ERROR,
            GateError::Serialization(_) | GateError::Config(_) | GateError::Internal(_) => {
                crate::rpc::INTERNAL_ERROR
            }
        }
    }

    /// Build the wire error object for this error.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        JsonRpcError {
            code: self.code(),
            message: self.to_string(),
            data: None,
        }
    }
}

impl From<serde_json::Error> for GateError {
    fn from(err: serde_json::Error) -> Self {
        GateError::Serialization(err.to_string())
    }
}
