//! MCP method router.
//!
//! Dispatches inbound JSON-RPC methods: `initialize` creates and
//! initializes the session; `tools/list` unions the built-in catalogue with
//! the gate's filtered view; `tools/call` resolves built-ins, then active
//! tools, then tries auto-enablement; everything else answers `-32601`.
//! Every failure becomes a JSON-RPC error response, never a dropped
//! connection.
//!
//! Enable/disable paths (manual and automatic) publish a
//! `notifications/tools.listChanged` frame to push-capable surfaces after
//! the state change is visible.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use toolgate_gate::controller::GateController;
use toolgate_gate::discovery::{discover_scored, GatingService};
use toolgate_gate::filters::FilterContext;
use toolgate_gate::repository::ToolRepository;
use toolgate_proxy::service::{validate_input, ProxyService};
use toolgate_types::errors::GateError;
use toolgate_types::rpc::JsonRpcMessage;
use toolgate_types::traits::RequestHandler;

use crate::builtin::{self, builtin_descriptors};
use crate::load_balancer::LoadBalancer;
use crate::session::SessionManager;

/// Notification method emitted when the visible tool set changes.
pub const TOOLS_LIST_CHANGED: &str = "notifications/tools.listChanged";

/// The MCP method router.
pub struct McpRouter {
    server_name: String,
    sessions: Arc<SessionManager>,
    balancer: Arc<LoadBalancer>,
    gate: Arc<GateController>,
    gating: Arc<GatingService>,
    repository: Arc<RwLock<ToolRepository>>,
    proxy: Arc<ProxyService>,
    notify_tx: broadcast::Sender<JsonRpcMessage>,
}

impl McpRouter {
    /// Wire a router over the assembled subsystems.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        server_name: String,
        sessions: Arc<SessionManager>,
        balancer: Arc<LoadBalancer>,
        gate: Arc<GateController>,
        gating: Arc<GatingService>,
        repository: Arc<RwLock<ToolRepository>>,
        proxy: Arc<ProxyService>,
    ) -> Self {
        let (notify_tx, _) = broadcast::channel(64);
        Self {
            server_name,
            sessions,
            balancer,
            gate,
            gating,
            repository,
            proxy,
            notify_tx,
        }
    }

    /// Subscribe to outbound notifications (push-capable surfaces forward
    /// these frames to their clients).
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<JsonRpcMessage> {
        self.notify_tx.subscribe()
    }

    /// Announce a visible-toolset change. Called after the change is
    /// observable through `tools/list`.
    pub fn notify_tools_changed(&self) {
        let _ = self
            .notify_tx
            .send(JsonRpcMessage::notification(TOOLS_LIST_CHANGED, json!({})));
    }

    async fn route(&self, message: JsonRpcMessage, session_key: &str) -> Result<Value, GateError> {
        message.validate()?;
        let method = message
            .method
            .clone()
            .ok_or_else(|| GateError::InvalidRequest("message has no method".to_string()))?;
        let params = message.params.clone().unwrap_or_else(|| json!({}));

        if method == "initialize" {
            return self.handle_initialize(params, session_key).await;
        }

        // Everything else needs an initialized session and LB admission.
        self.sessions.require_initialized(session_key).await?;
        let record = self.balancer.admit(session_key, &method)?;
        let result = match method.as_str() {
            "tools/list" => self.handle_tools_list(session_key).await,
            "tools/call" => self.handle_tools_call(params, session_key).await,
            other => Err(GateError::MethodNotFound(other.to_string())),
        };
        self.balancer.finish(record, result.is_ok());
        result
    }

    async fn handle_initialize(
        &self,
        params: Value,
        session_key: &str,
    ) -> Result<Value, GateError> {
        let protocol_version = params.get("protocolVersion").cloned();
        let client_info = params.get("clientInfo").cloned();
        let task_type = params
            .get("taskType")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.sessions
            .initialize(session_key, protocol_version, client_info, task_type)
            .await;

        Ok(json!({
            "protocolVersion": { "major": 2024, "minor": 11, "patch": 5 },
            "capabilities": {
                "logging": { "level": "info" },
                "tools": { "listChanged": true },
                "resources": { "listChanged": false, "subscribe": false },
                "prompts": { "listChanged": false }
            },
            "serverInfo": {
                "name": self.server_name,
                "version": env!("CARGO_PKG_VERSION")
            }
        }))
    }

    async fn filter_context(&self, session_key: &str) -> FilterContext {
        let session = self.sessions.touch(session_key).await;
        FilterContext {
            task_type: session.task_type,
        }
    }

    async fn visible_tools(&self, session_key: &str) -> Vec<toolgate_types::ToolDescriptor> {
        let ctx = self.filter_context(session_key).await;
        let mut tools = builtin_descriptors();
        tools.extend(self.gate.available_tools(&ctx).await);
        tools
    }

    async fn handle_tools_list(&self, session_key: &str) -> Result<Value, GateError> {
        let tools = self.visible_tools(session_key).await;
        Ok(json!({ "tools": tools }))
    }

    async fn handle_tools_call(
        &self,
        params: Value,
        session_key: &str,
    ) -> Result<Value, GateError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| GateError::InvalidInput("tools/call requires a name".to_string()))?
            .to_string();
        let input = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        if builtin::is_builtin(&name) {
            let descriptor = builtin_descriptors()
                .into_iter()
                .find(|t| t.name == name)
                .ok_or_else(|| GateError::ToolNotFound(name.clone()))?;
            validate_input(&descriptor.input_schema, &input)?;
            return self.call_builtin(&name, &input, session_key).await;
        }

        // Resolve the tool: active, else try auto-enablement.
        let tool = match self.gate.resolve_active_tool(&name).await {
            Some(tool) => tool,
            None => {
                let became_available = self.gate.ensure_tool_available(&name).await?;
                if became_available {
                    self.notify_tools_changed();
                }
                match self.gate.resolve_active_tool(&name).await {
                    Some(tool) => tool,
                    None => {
                        return Err(GateError::ToolNotFound(format!("Tool not found: {name}")))
                    }
                }
            }
        };

        let backend = tool
            .backend
            .clone()
            .ok_or_else(|| GateError::Backend(format!("tool '{name}' has no backend")))?;
        let breaker_key = format!("{backend}:tools/call");
        self.balancer.breaker_admit(&breaker_key)?;

        match self.proxy.dispatch(&tool, input).await {
            Ok(result) => {
                self.balancer.breaker_success(&breaker_key);
                self.gate.mark_used(&tool.name).await;
                Ok(result)
            }
            Err(e) => {
                self.balancer.breaker_failure(&breaker_key);
                Err(e)
            }
        }
    }

    async fn call_builtin(
        &self,
        name: &str,
        input: &Value,
        session_key: &str,
    ) -> Result<Value, GateError> {
        match name {
            builtin::SYSTEM_INFO => Ok(json!({
                "version": env!("CARGO_PKG_VERSION"),
                "runtime": "rust/tokio"
            })),
            builtin::SYSTEM_HEALTH => Ok(json!({
                "healthy": true,
                "metrics": {
                    "requests": self.balancer.metrics(),
                    "breakers": self.balancer.breaker_metrics(),
                    "sessions": self.sessions.count().await
                }
            })),
            builtin::TOOLS_LIST => {
                let index: Vec<Value> = self
                    .visible_tools(session_key)
                    .await
                    .into_iter()
                    .map(|t| json!({ "name": t.name, "description": t.description }))
                    .collect();
                Ok(Value::Array(index))
            }
            builtin::TOOLS_SCHEMA => {
                let wanted = required_name(input)?;
                let found = builtin_descriptors()
                    .into_iter()
                    .find(|t| t.name == wanted);
                let found = match found {
                    Some(tool) => Some(tool),
                    None => match self.gate.resolve_active_tool(&wanted).await {
                        Some(tool) => Some(tool),
                        None => self.repository.read().await.get(&wanted).cloned(),
                    },
                };
                let tool = found.ok_or_else(|| {
                    GateError::ToolNotFound(format!("Tool not found: {wanted}"))
                })?;
                Ok(json!({
                    "name": tool.name,
                    "description": tool.description,
                    "inputSchema": tool.input_schema
                }))
            }
            builtin::DISCOVER_TOOLS => {
                let query = input
                    .get("query")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        GateError::InvalidInput("discover_tools requires a query".to_string())
                    })?;
                let limit = input
                    .get("limit")
                    .and_then(Value::as_f64)
                    .unwrap_or(f64::INFINITY);
                let repository = self.repository.read().await;
                let ranked: Vec<Value> = discover_scored(&repository, query, limit)
                    .into_iter()
                    .map(|(score, tool)| {
                        let mut value = serde_json::to_value(&tool).unwrap_or(Value::Null);
                        if let Some(map) = value.as_object_mut() {
                            map.insert("score".to_string(), json!(score));
                        }
                        value
                    })
                    .collect();
                Ok(Value::Array(ranked))
            }
            builtin::PROVISION_TOOLS => {
                let query = input
                    .get("query")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        GateError::InvalidInput("provision_tools requires a query".to_string())
                    })?;
                let max_tokens = input
                    .get("maxTokens")
                    .and_then(Value::as_f64)
                    .ok_or_else(|| {
                        GateError::InvalidInput("provision_tools requires maxTokens".to_string())
                    })?;
                let repository = self.repository.read().await;
                let provisioned = self.gating.provision_query(&repository, query, max_tokens);
                Ok(serde_json::to_value(provisioned)?)
            }
            builtin::GATE_DISCOVER_TOOLSETS => Ok(json!({
                "toolsets": self.gate.list_toolsets().await
            })),
            builtin::GATE_ENABLE_TOOLSET => {
                let toolset = required_name(input)?;
                let tools = self.gate.enable_toolset(&toolset).await?;
                self.notify_tools_changed();
                Ok(json!({ "tools": tools }))
            }
            builtin::GATE_DISABLE_TOOLSET => {
                let toolset = required_name(input)?;
                let tools = self.gate.disable_toolset(&toolset).await?;
                self.notify_tools_changed();
                Ok(json!({ "tools": tools }))
            }
            builtin::GATE_LIST_ACTIVE_TOOLS => Ok(json!({
                "tools": self.gate.active_tool_names().await
            })),
            builtin::GATE_PIN_TOOLSET => {
                let toolset = required_name(input)?;
                self.gate.pin(&toolset).await;
                Ok(json!({ "pinned": self.gate.pinned().await }))
            }
            builtin::GATE_UNPIN_TOOLSET => {
                let toolset = required_name(input)?;
                self.gate.unpin(&toolset).await;
                Ok(json!({ "pinned": self.gate.pinned().await }))
            }
            builtin::GATE_LIST_PINNED => Ok(json!({
                "pinned": self.gate.pinned().await
            })),
            builtin::GATE_USAGE_STATS => Ok(json!({
                "toolsets": self.gate.usage_stats().await
            })),
            other => Err(GateError::ToolNotFound(other.to_string())),
        }
    }
}

fn required_name(input: &Value) -> Result<String, GateError> {
    input
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| GateError::InvalidInput("a name parameter is required".to_string()))
}

#[async_trait]
impl RequestHandler for McpRouter {
    async fn handle_request(&self, message: JsonRpcMessage, session_key: &str) -> JsonRpcMessage {
        let id = message.id.clone();
        match self.route(message, session_key).await {
            Ok(result) => JsonRpcMessage::response(id, result),
            Err(e) => {
                debug!(session = %session_key, error = %e, "request failed");
                JsonRpcMessage::from_gate_error(id, &e)
            }
        }
    }
}

/// Forward router notifications into a transport until the channel closes.
pub async fn forward_notifications(
    mut rx: broadcast::Receiver<JsonRpcMessage>,
    transport: Arc<dyn toolgate_types::traits::Transport>,
) {
    loop {
        match rx.recv().await {
            Ok(notification) => {
                if !transport.health().supports_push {
                    continue;
                }
                if let Err(e) = transport.send_notification(notification).await {
                    warn!(error = %e, "failed to push notification");
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "notification forwarder lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
