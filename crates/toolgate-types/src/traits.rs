/// Trait contracts for all toolgate subsystems.
///
/// Every module in the proxy implements one or more traits from this file.
/// This enables parallel development: modules code against these interfaces,
/// not against each other's concrete types. All traits are defined here in
/// `toolgate-types` so that every crate can depend on them without circular
/// dependencies.
use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::GateError;
use crate::events::{GateEvent, GateEventKind};
use crate::rpc::JsonRpcMessage;
use crate::tool::ToolDescriptor;

// ============================================================
// Transport Traits
// ============================================================

/// Health snapshot of a transport.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TransportHealth {
    /// Whether the transport currently has a live connection.
    pub connected: bool,
    /// Outbound requests awaiting a correlated response.
    pub pending_requests: usize,
    /// Whether the transport can push server-initiated notifications.
    pub supports_push: bool,
}

/// Handles inbound requests arriving on a transport.
///
/// The handler always produces a response message; transports never drop a
/// request without answering (failures become JSON-RPC error responses).
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle one inbound request and return the response to write back.
    ///
    /// `session_key` identifies the originating connection: a header value
    /// for HTTP, the connection id for WebSocket, a fixed key for stdio.
    async fn handle_request(&self, message: JsonRpcMessage, session_key: &str) -> JsonRpcMessage;
}

/// Handles inbound notifications arriving on a transport.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    /// Handle one inbound notification. No response is produced.
    async fn handle_notification(&self, message: JsonRpcMessage, session_key: &str);
}

/// Transport abstraction over stdio, HTTP, and WebSocket framing.
///
/// Transports are values behind `Box<dyn Transport>`, selected by
/// [`crate::tool::TransportKind`] at construction. All methods take `&self`;
/// implementations use interior mutability so a transport can be shared
/// across tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start the transport (spawn child process, open socket, bind listener).
    async fn start(&self) -> Result<(), GateError>;

    /// Stop the transport. All pending requests reject with
    /// "Transport stopped".
    async fn stop(&self) -> Result<(), GateError>;

    /// Register the handler invoked for inbound requests.
    fn set_request_handler(&self, handler: Arc<dyn RequestHandler>);

    /// Register the handler invoked for inbound notifications.
    fn set_notification_handler(&self, handler: Arc<dyn NotificationHandler>);

    /// Send a request and await its correlated response.
    ///
    /// Every outbound request carries a deadline; expiry rejects with
    /// "Request timeout" and a late response is silently discarded.
    async fn send_request(&self, request: JsonRpcMessage) -> Result<JsonRpcMessage, GateError>;

    /// Send a notification (fire and forget).
    async fn send_notification(&self, notification: JsonRpcMessage) -> Result<(), GateError>;

    /// Current health snapshot.
    fn health(&self) -> TransportHealth;
}

// ============================================================
// Gate Traits
// ============================================================

/// Produces the descriptors of a lazily-loaded toolset.
///
/// `load` is the expensive path and runs at most once per concurrent
/// enablement burst; `expose_names` is the cheap path used to build the
/// reverse index without loading.
#[async_trait]
pub trait ToolsetLoader: Send + Sync {
    /// Load the toolset's descriptors.
    async fn load(&self) -> Result<Vec<ToolDescriptor>, GateError>;

    /// Tool names this loader would produce, when enumerable without
    /// loading. `None` when the loader cannot enumerate cheaply.
    fn expose_names(&self) -> Option<Vec<String>> {
        None
    }
}

// ============================================================
// Event Bus Traits
// ============================================================

/// Receives published events.
pub trait EventHandler: Send + Sync {
    /// Called for every event of a kind the handler subscribed to.
    fn on_event(&self, event: &GateEvent);
}

/// Typed event bus injected into every component as a constructor
/// dependency. No global state.
pub trait EventBus: Send + Sync {
    /// Publish an event to all handlers subscribed to its kind.
    fn publish(&self, event: GateEvent);

    /// Subscribe a handler to one event kind.
    fn subscribe(&self, kind: GateEventKind, handler: Arc<dyn EventHandler>);
}
