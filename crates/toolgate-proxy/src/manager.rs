//! Backend client manager.
//!
//! Owns every connection to a backend MCP server: spawn/connect via the
//! configured transport, the `initialize` handshake, tool discovery with
//! descriptor validation, tool-call routing, and teardown. Connecting an
//! existing name replaces the prior client after disconnecting it.
//!
//! Backend failures during startup are non-fatal to the proxy: other
//! backends proceed, the failing one is logged and counted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use toolgate_types::errors::GateError;
use toolgate_types::events::GateEvent;
use toolgate_types::rpc::JsonRpcMessage;
use toolgate_types::tool::{validate_descriptor, BackendConfig, ToolDescriptor};
use toolgate_types::traits::{EventBus, Transport};

use crate::transport::build_backend_transport;

struct BackendConnection {
    config: BackendConfig,
    transport: Arc<dyn Transport>,
}

/// Result of a bulk startup connect.
#[derive(Debug, Default)]
pub struct StartupSummary {
    /// Backends that connected and completed the handshake.
    pub connected: Vec<String>,
    /// Backends that failed, with the failure message.
    pub failed: Vec<(String, String)>,
}

/// Manages connections to backend MCP servers.
pub struct ClientManager {
    connections: RwLock<HashMap<String, BackendConnection>>,
    events: Arc<dyn EventBus>,
    next_id: AtomicU64,
}

impl ClientManager {
    /// Create a manager publishing lifecycle events on the given bus.
    pub fn new(events: Arc<dyn EventBus>) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            events,
            next_id: AtomicU64::new(0),
        }
    }

    fn next_request_id(&self) -> Value {
        json!(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Connect a backend using the transport its config selects.
    pub async fn connect(&self, config: BackendConfig) -> Result<(), GateError> {
        let transport: Arc<dyn Transport> = Arc::from(build_backend_transport(&config)?);
        self.connect_with_transport(config, transport).await
    }

    /// Connect a backend over an explicit transport (used by tests and
    /// embedders with custom framing).
    pub async fn connect_with_transport(
        &self,
        config: BackendConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<(), GateError> {
        let name = config.name.clone();
        transport.start().await?;

        let init = JsonRpcMessage::request(
            self.next_request_id(),
            "initialize",
            json!({
                "protocolVersion": { "major": 2024, "minor": 11, "patch": 5 },
                "capabilities": {},
                "clientInfo": { "name": "toolgate", "version": env!("CARGO_PKG_VERSION") }
            }),
        );
        let response = match transport.send_request(init).await {
            Ok(response) => response,
            Err(e) => {
                let _ = transport.stop().await;
                return Err(GateError::Backend(format!(
                    "initialize failed for '{name}': {e}"
                )));
            }
        };
        if let Some(error) = &response.error {
            let _ = transport.stop().await;
            return Err(GateError::Backend(format!(
                "backend '{name}' rejected initialize: {} (code {})",
                error.message, error.code
            )));
        }

        // Replace an existing connection after disconnecting it.
        let prior = {
            let mut connections = self.connections.write().await;
            let prior = connections.remove(&name);
            connections.insert(name.clone(), BackendConnection { config, transport });
            prior
        };
        if let Some(prior) = prior {
            let _ = prior.transport.stop().await;
            debug!(backend = %name, "replaced prior backend connection");
        }

        info!(backend = %name, "backend connected");
        self.events
            .publish(GateEvent::BackendConnected { backend: name });
        Ok(())
    }

    /// Connect every configured backend; failures are logged and counted,
    /// never fatal.
    pub async fn connect_all(&self, configs: Vec<BackendConfig>) -> StartupSummary {
        let mut summary = StartupSummary::default();
        for config in configs {
            let name = config.name.clone();
            match self.connect(config).await {
                Ok(()) => summary.connected.push(name),
                Err(e) => {
                    warn!(backend = %name, error = %e, "backend failed at startup");
                    summary.failed.push((name, e.to_string()));
                }
            }
        }
        info!(
            connected = summary.connected.len(),
            failed = summary.failed.len(),
            "backend startup complete"
        );
        summary
    }

    /// `tools/list` on a backend, validating each descriptor.
    ///
    /// Malformed entries (no `name` string, no `inputSchema`) are skipped
    /// silently; valid ones are tagged with the backend name.
    pub async fn list_tools(&self, name: &str) -> Result<Vec<ToolDescriptor>, GateError> {
        let transport = self.transport(name).await?;
        let request = JsonRpcMessage::request(self.next_request_id(), "tools/list", json!({}));
        let response = transport.send_request(request).await?;
        if let Some(error) = &response.error {
            return Err(GateError::Backend(format!(
                "tools/list failed on '{name}': {} (code {})",
                error.message, error.code
            )));
        }

        let raw_tools = response
            .result
            .as_ref()
            .and_then(|result| result.get("tools"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut tools = Vec::new();
        for raw in &raw_tools {
            match validate_descriptor(raw) {
                Some(mut tool) => {
                    tool.backend = Some(name.to_string());
                    tools.push(tool);
                }
                None => {
                    debug!(backend = %name, entry = %raw, "skipping malformed tool descriptor");
                }
            }
        }
        debug!(backend = %name, count = tools.len(), "discovered backend tools");
        Ok(tools)
    }

    /// `tools/call` on a backend with `{tool, input}` params.
    pub async fn execute_tool(
        &self,
        backend: &str,
        tool_name: &str,
        input: Value,
    ) -> Result<Value, GateError> {
        let transport = self.transport(backend).await?;
        let request = JsonRpcMessage::request(
            self.next_request_id(),
            "tools/call",
            json!({ "tool": tool_name, "input": input }),
        );
        let response = transport.send_request(request).await?;
        if let Some(error) = &response.error {
            return Err(GateError::Backend(format!(
                "{} (code {})",
                error.message, error.code
            )));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Tear down a backend connection. Idempotent.
    pub async fn disconnect(&self, name: &str) -> Result<(), GateError> {
        let removed = self.connections.write().await.remove(name);
        if let Some(connection) = removed {
            let _ = connection.transport.stop().await;
            info!(backend = %name, "backend disconnected");
            self.events.publish(GateEvent::BackendDisconnected {
                backend: name.to_string(),
            });
        }
        Ok(())
    }

    /// Names of currently connected backends, sorted.
    pub async fn backends(&self) -> Vec<String> {
        let connections = self.connections.read().await;
        let mut names: Vec<String> = connections.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a backend is connected.
    pub async fn is_connected(&self, name: &str) -> bool {
        self.connections.read().await.contains_key(name)
    }

    /// The stored config for a backend.
    pub async fn config(&self, name: &str) -> Option<BackendConfig> {
        self.connections
            .read()
            .await
            .get(name)
            .map(|c| c.config.clone())
    }

    async fn transport(&self, name: &str) -> Result<Arc<dyn Transport>, GateError> {
        self.connections
            .read()
            .await
            .get(name)
            .map(|connection| connection.transport.clone())
            .ok_or_else(|| GateError::NoConnection(format!("no connection to backend '{name}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use toolgate_types::tool::TransportKind;
    use toolgate_types::traits::{
        NotificationHandler, RequestHandler, TransportHealth,
    };
    use toolgate_types::InMemoryEventBus;

    /// Transport replaying canned responses; echoes back the request id.
    struct MockTransport {
        responses: Mutex<VecDeque<Result<Value, (i64, String)>>>,
        sent: Mutex<Vec<JsonRpcMessage>>,
    }

    impl MockTransport {
        fn new(responses: Vec<Result<Value, (i64, String)>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into_iter().collect()),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent_methods(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|m| m.method.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn start(&self) -> Result<(), GateError> {
            Ok(())
        }

        async fn stop(&self) -> Result<(), GateError> {
            Ok(())
        }

        fn set_request_handler(&self, _handler: Arc<dyn RequestHandler>) {}
        fn set_notification_handler(&self, _handler: Arc<dyn NotificationHandler>) {}

        async fn send_request(
            &self,
            request: JsonRpcMessage,
        ) -> Result<JsonRpcMessage, GateError> {
            let id = request.id.clone();
            self.sent.lock().unwrap().push(request);
            match self.responses.lock().unwrap().pop_front() {
                Some(Ok(result)) => Ok(JsonRpcMessage::response(id, result)),
                Some(Err((code, message))) => Ok(JsonRpcMessage::error_response(
                    id,
                    toolgate_types::rpc::JsonRpcError {
                        code,
                        message,
                        data: None,
                    },
                )),
                None => Err(GateError::Transport("no more mock responses".to_string())),
            }
        }

        async fn send_notification(&self, _notification: JsonRpcMessage) -> Result<(), GateError> {
            Ok(())
        }

        fn health(&self) -> TransportHealth {
            TransportHealth {
                connected: true,
                pending_requests: 0,
                supports_push: true,
            }
        }
    }

    fn init_ok() -> Result<Value, (i64, String)> {
        Ok(json!({
            "protocolVersion": { "major": 2024, "minor": 11, "patch": 5 },
            "capabilities": {},
            "serverInfo": { "name": "mock-backend", "version": "1.0" }
        }))
    }

    fn backend_config(name: &str) -> BackendConfig {
        BackendConfig {
            name: name.to_string(),
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            transport: TransportKind::Stdio,
        }
    }

    fn manager() -> ClientManager {
        ClientManager::new(Arc::new(InMemoryEventBus::new()))
    }

    #[tokio::test]
    async fn test_connect_performs_initialize_handshake() {
        let transport = MockTransport::new(vec![init_ok()]);
        let manager = manager();
        manager
            .connect_with_transport(backend_config("fs"), transport.clone())
            .await
            .unwrap();

        assert_eq!(transport.sent_methods(), vec!["initialize"]);
        assert!(manager.is_connected("fs").await);
        assert_eq!(manager.backends().await, vec!["fs"]);
    }

    #[tokio::test]
    async fn test_connect_rejected_initialize_fails() {
        let transport = MockTransport::new(vec![Err((-32603, "boot failure".to_string()))]);
        let manager = manager();
        let err = manager
            .connect_with_transport(backend_config("fs"), transport)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boot failure"));
        assert!(!manager.is_connected("fs").await);
    }

    #[tokio::test]
    async fn test_reconnect_replaces_prior_client() {
        let manager = manager();
        let first = MockTransport::new(vec![init_ok()]);
        let second = MockTransport::new(vec![init_ok(), Ok(json!({"tools": []}))]);

        manager
            .connect_with_transport(backend_config("fs"), first)
            .await
            .unwrap();
        manager
            .connect_with_transport(backend_config("fs"), second.clone())
            .await
            .unwrap();

        assert_eq!(manager.backends().await, vec!["fs"]);
        // The replacement serves subsequent traffic.
        manager.list_tools("fs").await.unwrap();
        assert_eq!(second.sent_methods(), vec!["initialize", "tools/list"]);
    }

    #[tokio::test]
    async fn test_list_tools_validates_and_tags_descriptors() {
        let manager = manager();
        let transport = MockTransport::new(vec![
            init_ok(),
            Ok(json!({
                "tools": [
                    { "name": "fs/read", "description": "Read a file",
                      "inputSchema": { "type": "object" } },
                    { "description": "no name", "inputSchema": {} },
                    { "name": "", "inputSchema": {} },
                    { "name": "fs/bad-schema" },
                    { "name": "fs/write", "inputSchema": { "type": "object" } }
                ]
            })),
        ]);
        manager
            .connect_with_transport(backend_config("fs"), transport)
            .await
            .unwrap();

        let tools = manager.list_tools("fs").await.unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["fs/read", "fs/write"]);
        assert!(tools.iter().all(|t| t.backend.as_deref() == Some("fs")));
    }

    #[tokio::test]
    async fn test_execute_tool_round_trip() {
        let manager = manager();
        let transport = MockTransport::new(vec![
            init_ok(),
            Ok(json!({"content": [{"type": "text", "text": "done"}]})),
        ]);
        manager
            .connect_with_transport(backend_config("fs"), transport.clone())
            .await
            .unwrap();

        let result = manager
            .execute_tool("fs", "fs/read", json!({"path": "/etc/hosts"}))
            .await
            .unwrap();
        assert_eq!(result["content"][0]["text"], "done");

        // The wire call uses {tool, input} params.
        let sent = transport.sent.lock().unwrap();
        let call = sent.last().unwrap();
        assert_eq!(call.method.as_deref(), Some("tools/call"));
        let params = call.params.as_ref().unwrap();
        assert_eq!(params["tool"], "fs/read");
        assert_eq!(params["input"]["path"], "/etc/hosts");
    }

    #[tokio::test]
    async fn test_execute_tool_unknown_backend() {
        let manager = manager();
        let err = manager
            .execute_tool("ghost", "x", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::NoConnection(_)));
        assert!(err.to_string().contains("ghost"));
    }

    #[tokio::test]
    async fn test_execute_tool_backend_error_surfaces() {
        let manager = manager();
        let transport = MockTransport::new(vec![
            init_ok(),
            Err((-32000, "tool exploded".to_string())),
        ]);
        manager
            .connect_with_transport(backend_config("fs"), transport)
            .await
            .unwrap();

        let err = manager
            .execute_tool("fs", "fs/read", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::Backend(_)));
        assert!(err.to_string().contains("tool exploded"));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let manager = manager();
        let transport = MockTransport::new(vec![init_ok()]);
        manager
            .connect_with_transport(backend_config("fs"), transport)
            .await
            .unwrap();

        manager.disconnect("fs").await.unwrap();
        assert!(!manager.is_connected("fs").await);
        // Second disconnect is a no-op.
        manager.disconnect("fs").await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_all_counts_failures_non_fatally() {
        let manager = manager();
        // Stdio config with no command fails to build/start; the other
        // config will also fail (no real transport in tests), proving the
        // loop continues past failures.
        let summary = manager
            .connect_all(vec![backend_config("a"), backend_config("b")])
            .await;
        assert_eq!(summary.connected.len(), 0);
        assert_eq!(summary.failed.len(), 2);
        assert_eq!(summary.failed[0].0, "a");
        assert_eq!(summary.failed[1].0, "b");
    }

    #[tokio::test]
    async fn test_lifecycle_events_published() {
        use toolgate_types::events::GateEventKind;
        use toolgate_types::traits::EventHandler;

        struct Capture {
            kinds: Mutex<Vec<String>>,
        }
        impl EventHandler for Capture {
            fn on_event(&self, event: &GateEvent) {
                self.kinds.lock().unwrap().push(event.kind().to_string());
            }
        }

        let bus = Arc::new(InMemoryEventBus::new());
        let capture = Arc::new(Capture {
            kinds: Mutex::new(Vec::new()),
        });
        bus.subscribe(GateEventKind::BackendConnected, capture.clone());
        bus.subscribe(GateEventKind::BackendDisconnected, capture.clone());

        let manager = ClientManager::new(bus);
        manager
            .connect_with_transport(backend_config("fs"), MockTransport::new(vec![init_ok()]))
            .await
            .unwrap();
        manager.disconnect("fs").await.unwrap();

        let kinds = capture.kinds.lock().unwrap();
        assert_eq!(
            *kinds,
            vec!["backend.connected".to_string(), "backend.disconnected".to_string()]
        );
    }
}
