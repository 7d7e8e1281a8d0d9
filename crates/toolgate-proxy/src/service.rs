//! Proxy service: schema validation and dispatch.
//!
//! The last stop before a tool call leaves for a backend. Input is checked
//! against the tool's JSON Schema; only a clean input reaches the client
//! manager. Backend failures come back prefixed with the responsible
//! server and tool so the wire error identifies the culprit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use toolgate_types::errors::GateError;
use toolgate_types::events::GateEvent;
use toolgate_types::tool::ToolDescriptor;
use toolgate_types::traits::EventBus;

use crate::manager::ClientManager;

/// Primitive schema types the validator enforces.
const PRIMITIVE_TYPES: [&str; 6] = ["string", "number", "boolean", "object", "array", "null"];

/// Validate an input value against a tool's JSON Schema.
///
/// Enforced rules:
/// - `type: "object"` schemas require a non-null, non-array object input
/// - properties not declared in `schema.properties` are rejected unless
///   `additionalProperties` is explicitly `true`
/// - every `required` property must be present
/// - a present property with a declared primitive `type` must match it
pub fn validate_input(schema: &Value, input: &Value) -> Result<(), GateError> {
    if schema.get("type").and_then(Value::as_str) != Some("object") {
        return Ok(());
    }

    let Some(input_map) = input.as_object() else {
        return Err(GateError::TypeMismatch(
            "input must be a non-null object".to_string(),
        ));
    };

    let empty = serde_json::Map::new();
    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    let additional_allowed = schema.get("additionalProperties") == Some(&Value::Bool(true));
    if !additional_allowed {
        for key in input_map.keys() {
            if !properties.contains_key(key) {
                return Err(GateError::UnknownProperty(format!(
                    "property '{key}' is not declared by the tool schema"
                )));
            }
        }
    }

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !input_map.contains_key(name) {
                return Err(GateError::MissingRequired(format!(
                    "property '{name}' is required"
                )));
            }
        }
    }

    for (key, value) in input_map {
        let Some(declared) = properties
            .get(key)
            .and_then(|prop| prop.get("type"))
            .and_then(Value::as_str)
        else {
            continue;
        };
        if !PRIMITIVE_TYPES.contains(&declared) {
            continue;
        }
        let matches = match declared {
            "string" => value.is_string(),
            "number" => value.is_number(),
            "boolean" => value.is_boolean(),
            "object" => value.is_object(),
            "array" => value.is_array(),
            "null" => value.is_null(),
            _ => true,
        };
        if !matches {
            return Err(GateError::TypeMismatch(format!(
                "property '{key}' must be of type {declared}"
            )));
        }
    }

    Ok(())
}

/// Validates inputs and dispatches tool calls to the owning backend.
pub struct ProxyService {
    manager: Arc<ClientManager>,
    tools: RwLock<HashMap<String, ToolDescriptor>>,
    events: Arc<dyn EventBus>,
}

impl ProxyService {
    /// Create a service over the given client manager and event bus.
    pub fn new(manager: Arc<ClientManager>, events: Arc<dyn EventBus>) -> Self {
        Self {
            manager,
            tools: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Register a routable tool.
    ///
    /// Rejects duplicates and tools without a backend.
    pub async fn add_tool(&self, tool: ToolDescriptor) -> Result<(), GateError> {
        if tool.backend.is_none() {
            return Err(GateError::InvalidInput(format!(
                "tool '{}' has no backend",
                tool.name
            )));
        }
        let mut tools = self.tools.write().await;
        if tools.contains_key(&tool.name) {
            return Err(GateError::InvalidInput(format!(
                "tool '{}' is already registered",
                tool.name
            )));
        }
        debug!(tool = %tool.name, backend = ?tool.backend, "registered proxy tool");
        tools.insert(tool.name.clone(), tool);
        Ok(())
    }

    /// Remove a registered tool. Returns whether something was removed.
    pub async fn remove_tool(&self, name: &str) -> bool {
        self.tools.write().await.remove(name).is_some()
    }

    /// Look up a registered tool.
    pub async fn tool(&self, name: &str) -> Option<ToolDescriptor> {
        self.tools.read().await.get(name).cloned()
    }

    /// Validate and dispatch a call to a registered tool.
    pub async fn execute(&self, tool_name: &str, input: Value) -> Result<Value, GateError> {
        let tool = self
            .tool(tool_name)
            .await
            .ok_or_else(|| GateError::ToolNotFound(tool_name.to_string()))?;
        self.dispatch(&tool, input).await
    }

    /// Validate and dispatch a call for a resolved descriptor.
    ///
    /// On success emits `tool.execute.ok`; on dispatch failure emits
    /// `tool.execute.err` and re-throws with the message prefixed
    /// `[ProxyService] server=X tool=Y: …`.
    pub async fn dispatch(&self, tool: &ToolDescriptor, input: Value) -> Result<Value, GateError> {
        let backend = tool.backend.clone().ok_or_else(|| {
            GateError::InvalidInput(format!("tool '{}' has no backend", tool.name))
        })?;

        validate_input(&tool.input_schema, &input)?;

        let started = Instant::now();
        match self
            .manager
            .execute_tool(&backend, &tool.name, input)
            .await
        {
            Ok(result) => {
                self.events.publish(GateEvent::ToolExecuteOk {
                    backend,
                    tool: tool.name.clone(),
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                Ok(result)
            }
            Err(e) => {
                warn!(backend = %backend, tool = %tool.name, error = %e, "tool execution failed");
                self.events.publish(GateEvent::ToolExecuteErr {
                    backend: backend.clone(),
                    tool: tool.name.clone(),
                    error: e.to_string(),
                });
                Err(GateError::Backend(format!(
                    "[ProxyService] server={} tool={}: {e}",
                    backend, tool.name
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;
    use toolgate_types::rpc::JsonRpcMessage;
    use toolgate_types::tool::{BackendConfig, TransportKind};
    use toolgate_types::traits::{
        NotificationHandler, RequestHandler, Transport, TransportHealth,
    };
    use toolgate_types::InMemoryEventBus;

    // ---- validate_input ----

    fn object_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "a": { "type": "string" },
                "count": { "type": "number" },
                "flags": { "type": "array" }
            },
            "required": ["a"]
        })
    }

    #[test]
    fn test_valid_input_accepted() {
        validate_input(&object_schema(), &json!({"a": "x", "count": 3})).unwrap();
    }

    #[test]
    fn test_unknown_property_rejected() {
        let err = validate_input(&object_schema(), &json!({"a": "x", "b": 1})).unwrap_err();
        assert!(matches!(err, GateError::UnknownProperty(_)));
        assert!(err.to_string().contains("'b'"));
    }

    #[test]
    fn test_additional_properties_true_allows_extras() {
        let schema = json!({
            "type": "object",
            "properties": { "a": { "type": "string" } },
            "additionalProperties": true
        });
        validate_input(&schema, &json!({"a": "x", "extra": 1})).unwrap();
    }

    #[test]
    fn test_additional_properties_false_still_rejects() {
        let schema = json!({
            "type": "object",
            "properties": { "a": { "type": "string" } },
            "additionalProperties": false
        });
        let err = validate_input(&schema, &json!({"a": "x", "extra": 1})).unwrap_err();
        assert!(matches!(err, GateError::UnknownProperty(_)));
    }

    #[test]
    fn test_missing_required_rejected() {
        let err = validate_input(&object_schema(), &json!({"count": 3})).unwrap_err();
        assert!(matches!(err, GateError::MissingRequired(_)));
        assert!(err.to_string().contains("'a'"));
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let err = validate_input(&object_schema(), &json!({"a": 42})).unwrap_err();
        assert!(matches!(err, GateError::TypeMismatch(_)));

        let err = validate_input(&object_schema(), &json!({"a": "x", "count": "3"})).unwrap_err();
        assert!(matches!(err, GateError::TypeMismatch(_)));

        let err = validate_input(&object_schema(), &json!({"a": "x", "flags": {}})).unwrap_err();
        assert!(matches!(err, GateError::TypeMismatch(_)));
    }

    #[test]
    fn test_integer_counts_as_number() {
        validate_input(&object_schema(), &json!({"a": "x", "count": 7})).unwrap();
        validate_input(&object_schema(), &json!({"a": "x", "count": 7.5})).unwrap();
    }

    #[test]
    fn test_non_object_inputs_rejected() {
        for input in [json!(null), json!([1, 2]), json!("text"), json!(9)] {
            let err = validate_input(&object_schema(), &input).unwrap_err();
            assert!(matches!(err, GateError::TypeMismatch(_)), "input: {input}");
        }
    }

    #[test]
    fn test_non_object_schema_skips_validation() {
        validate_input(&json!({"type": "string"}), &json!({"anything": true})).unwrap();
        validate_input(&json!({}), &json!(null)).unwrap();
    }

    #[test]
    fn test_non_primitive_declared_type_skipped() {
        let schema = json!({
            "type": "object",
            "properties": { "n": { "type": "integer" } }
        });
        // "integer" is not in the enforced primitive set.
        validate_input(&schema, &json!({"n": "not-a-number"})).unwrap();
    }

    // ---- dispatch ----

    /// Transport whose tools/call either succeeds or fails.
    struct OneShotTransport {
        fail_call: bool,
        calls: Mutex<Vec<JsonRpcMessage>>,
    }

    #[async_trait]
    impl Transport for OneShotTransport {
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
            let method = request.method.clone();
            self.calls.lock().unwrap().push(request);
            match method.as_deref() {
                Some("initialize") => Ok(JsonRpcMessage::response(id, json!({"capabilities": {}}))),
                Some("tools/call") if self.fail_call => {
                    Err(GateError::Backend("backend melted".to_string()))
                }
                Some("tools/call") => Ok(JsonRpcMessage::response(id, json!({"ok": true}))),
                other => Err(GateError::MethodNotFound(format!("{other:?}"))),
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

    async fn service_with_backend(fail_call: bool) -> (ProxyService, Arc<InMemoryEventBus>) {
        let bus = Arc::new(InMemoryEventBus::new());
        let manager = Arc::new(ClientManager::new(bus.clone()));
        manager
            .connect_with_transport(
                BackendConfig {
                    name: "fs".to_string(),
                    command: String::new(),
                    args: Vec::new(),
                    env: Default::default(),
                    transport: TransportKind::Stdio,
                },
                Arc::new(OneShotTransport {
                    fail_call,
                    calls: Mutex::new(Vec::new()),
                }),
            )
            .await
            .unwrap();
        (ProxyService::new(manager, bus.clone()), bus)
    }

    fn fs_read_tool() -> ToolDescriptor {
        let mut tool = ToolDescriptor::new("fs/read", "Read a file");
        tool.input_schema = json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        });
        tool.backend = Some("fs".to_string());
        tool
    }

    #[tokio::test]
    async fn test_add_tool_rejects_duplicates_and_backendless() {
        let (service, _bus) = service_with_backend(false).await;

        let mut orphan = ToolDescriptor::new("orphan", "");
        orphan.backend = None;
        assert!(service.add_tool(orphan).await.is_err());

        service.add_tool(fs_read_tool()).await.unwrap();
        let err = service.add_tool(fs_read_tool()).await.unwrap_err();
        assert!(err.to_string().contains("already registered"));
    }

    #[tokio::test]
    async fn test_execute_validates_then_dispatches() {
        let (service, _bus) = service_with_backend(false).await;
        service.add_tool(fs_read_tool()).await.unwrap();

        let result = service
            .execute("fs/read", json!({"path": "/etc/hosts"}))
            .await
            .unwrap();
        assert_eq!(result["ok"], true);

        // Validation failure never reaches the backend.
        let err = service
            .execute("fs/read", json!({"path": "/x", "extra": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, GateError::UnknownProperty(_)));
    }

    #[tokio::test]
    async fn test_execute_unknown_tool() {
        let (service, _bus) = service_with_backend(false).await;
        let err = service.execute("ghost", json!({})).await.unwrap_err();
        assert!(matches!(err, GateError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn test_backend_error_prefixed_with_server_and_tool() {
        let (service, _bus) = service_with_backend(true).await;
        service.add_tool(fs_read_tool()).await.unwrap();

        let err = service
            .execute("fs/read", json!({"path": "/x"}))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(
            message.contains("[ProxyService] server=fs tool=fs/read:"),
            "got: {message}"
        );
        assert!(message.contains("backend melted"));
    }

    #[tokio::test]
    async fn test_execute_events_published() {
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

        let (service, bus) = service_with_backend(false).await;
        let capture = Arc::new(Capture {
            kinds: Mutex::new(Vec::new()),
        });
        bus.subscribe(GateEventKind::ToolExecuteOk, capture.clone());
        bus.subscribe(GateEventKind::ToolExecuteErr, capture.clone());

        service.add_tool(fs_read_tool()).await.unwrap();
        service
            .execute("fs/read", json!({"path": "/x"}))
            .await
            .unwrap();

        assert_eq!(*capture.kinds.lock().unwrap(), vec!["tool.execute.ok"]);
    }
}
