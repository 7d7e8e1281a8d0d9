/// Tool and toolset model shared across the gate, proxy, and server.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool descriptor as exchanged with backends and clients.
///
/// `name` is globally unique; by convention it uses "/" as a namespace
/// separator whose prefix is the category.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    /// Unique tool name (e.g. "fs/read").
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// JSON Schema describing the tool's input.
    pub input_schema: Value,
    /// Category tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    /// Capability tags.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    /// Whether the tool is deprecated (hidden from search by default).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deprecated: bool,
    /// Externally supplied token count. Carried as metadata only; the
    /// provisioning budget always re-estimates from the JSON encoding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<f64>,
    /// Name of the backend that serves this tool.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    /// Where this descriptor was discovered from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovery_source: Option<String>,
}

impl ToolDescriptor {
    /// Minimal descriptor with an empty object schema.
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema: serde_json::json!({"type": "object"}),
            categories: Vec::new(),
            capabilities: Vec::new(),
            deprecated: false,
            token_count: None,
            backend: None,
            discovery_source: None,
        }
    }

    /// The "/"-prefix category of the tool name, if the name has one.
    pub fn category(&self) -> Option<&str> {
        self.name.split_once('/').map(|(prefix, _)| prefix)
    }
}

/// Validate a raw descriptor value from a backend `tools/list` response.
///
/// Requires a non-empty string `name` and an `inputSchema` value. Returns
/// `None` for malformed entries so callers can skip them.
pub fn validate_descriptor(raw: &Value) -> Option<ToolDescriptor> {
    let name = raw.get("name")?.as_str()?;
    if name.is_empty() {
        return None;
    }
    raw.get("inputSchema")?;
    serde_json::from_value(raw.clone()).ok()
}

/// Lifecycle states of a toolset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolsetState {
    /// Registered, loader never run.
    Unloaded,
    /// Loader in flight.
    Loading,
    /// Loader succeeded; descriptors are in the active map.
    Active,
    /// Explicitly or automatically disabled.
    Disabled,
}

impl std::fmt::Display for ToolsetState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolsetState::Unloaded => write!(f, "unloaded"),
            ToolsetState::Loading => write!(f, "loading"),
            ToolsetState::Active => write!(f, "active"),
            ToolsetState::Disabled => write!(f, "disabled"),
        }
    }
}

/// Cheap sidecar listing the tool names a toolset would produce.
///
/// Used to build the reverse index (tool name → owning toolset ids)
/// without running the toolset's loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsetManifest {
    /// Toolset id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Tool names the toolset would expose once loaded.
    pub tools: Vec<String>,
}

impl ToolsetManifest {
    /// Read a manifest sidecar from a JSON file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, crate::errors::GateError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            crate::errors::GateError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            crate::errors::GateError::Config(format!("failed to parse {}: {e}", path.display()))
        })
    }
}

/// How to reach a backend MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportKind {
    /// Spawn a child process and speak newline-delimited JSON on its pipes.
    Stdio,
    /// One HTTP POST per message.
    Http {
        /// Endpoint URL.
        url: String,
    },
    /// Persistent WebSocket connection.
    WebSocket {
        /// Endpoint URL.
        url: String,
    },
}

/// Configuration for one backend MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend name (unique within the proxy).
    pub name: String,
    /// Command to spawn for stdio backends.
    #[serde(default)]
    pub command: String,
    /// Command arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables for the child process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Transport selection.
    pub transport: TransportKind,
}
