//! Built-in tool catalogue.
//!
//! These tools are served by the proxy itself and exposed unconditionally
//! through `tools/list`, alongside the gate's filtered view. Handlers live
//! in the router; this module owns the exact names and schemas.

use serde_json::json;

use toolgate_types::tool::ToolDescriptor;

/// Proxy and runtime information.
pub const SYSTEM_INFO: &str = "system/info";
/// Health flag plus load-balancer metrics.
pub const SYSTEM_HEALTH: &str = "system/health";
/// Lightweight name+description index of visible tools.
pub const TOOLS_LIST: &str = "tools/list";
/// Full schema for one tool.
pub const TOOLS_SCHEMA: &str = "tools/schema";
/// Keyword discovery over the repository.
pub const DISCOVER_TOOLS: &str = "discover_tools";
/// Token-budgeted provisioning over the repository.
pub const PROVISION_TOOLS: &str = "provision_tools";
/// List registered toolset ids.
pub const GATE_DISCOVER_TOOLSETS: &str = "gate/discover_toolsets";
/// Enable a toolset by id.
pub const GATE_ENABLE_TOOLSET: &str = "gate/enable_toolset";
/// Disable a toolset by id.
pub const GATE_DISABLE_TOOLSET: &str = "gate/disable_toolset";
/// Names of currently active tools.
pub const GATE_LIST_ACTIVE_TOOLS: &str = "gate/list_active_tools";
/// Pin a toolset against eviction.
pub const GATE_PIN_TOOLSET: &str = "gate/pin_toolset";
/// Remove a pin.
pub const GATE_UNPIN_TOOLSET: &str = "gate/unpin_toolset";
/// List pinned toolset ids.
pub const GATE_LIST_PINNED: &str = "gate/list_pinned";
/// Per-toolset usage statistics.
pub const GATE_USAGE_STATS: &str = "gate/usage_stats";

fn empty_object_schema() -> serde_json::Value {
    json!({ "type": "object", "properties": {} })
}

fn name_param_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": { "name": { "type": "string" } },
        "required": ["name"]
    })
}

fn tool(name: &str, description: &str, schema: serde_json::Value) -> ToolDescriptor {
    let mut descriptor = ToolDescriptor::new(name, description);
    descriptor.input_schema = schema;
    descriptor
}

/// Every built-in descriptor, in catalogue order.
pub fn builtin_descriptors() -> Vec<ToolDescriptor> {
    vec![
        tool(SYSTEM_INFO, "Proxy version and runtime", empty_object_schema()),
        tool(
            SYSTEM_HEALTH,
            "Health flag and request metrics",
            empty_object_schema(),
        ),
        tool(
            TOOLS_LIST,
            "List visible tools with names and descriptions",
            empty_object_schema(),
        ),
        tool(
            TOOLS_SCHEMA,
            "Full input schema for one tool",
            name_param_schema(),
        ),
        tool(
            DISCOVER_TOOLS,
            "Rank known tools against a keyword query",
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "limit": { "type": "number" }
                },
                "required": ["query"]
            }),
        ),
        tool(
            PROVISION_TOOLS,
            "Select discovered tools under a token budget",
            json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "maxTokens": { "type": "number" }
                },
                "required": ["query", "maxTokens"]
            }),
        ),
        tool(
            GATE_DISCOVER_TOOLSETS,
            "List registered toolset ids",
            empty_object_schema(),
        ),
        tool(GATE_ENABLE_TOOLSET, "Enable a toolset", name_param_schema()),
        tool(
            GATE_DISABLE_TOOLSET,
            "Disable a toolset",
            name_param_schema(),
        ),
        tool(
            GATE_LIST_ACTIVE_TOOLS,
            "Names of currently active tools",
            empty_object_schema(),
        ),
        tool(
            GATE_PIN_TOOLSET,
            "Pin a toolset against TTL and LRU eviction",
            name_param_schema(),
        ),
        tool(GATE_UNPIN_TOOLSET, "Remove a pin", name_param_schema()),
        tool(
            GATE_LIST_PINNED,
            "List pinned toolset ids",
            empty_object_schema(),
        ),
        tool(
            GATE_USAGE_STATS,
            "Usage statistics per active toolset",
            empty_object_schema(),
        ),
    ]
}

/// Whether a tool name is served by the proxy itself.
pub fn is_builtin(name: &str) -> bool {
    builtin_descriptors().iter().any(|t| t.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_builtin_names() {
        let names: Vec<String> = builtin_descriptors().into_iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec![
                "system/info",
                "system/health",
                "tools/list",
                "tools/schema",
                "discover_tools",
                "provision_tools",
                "gate/discover_toolsets",
                "gate/enable_toolset",
                "gate/disable_toolset",
                "gate/list_active_tools",
                "gate/pin_toolset",
                "gate/unpin_toolset",
                "gate/list_pinned",
                "gate/usage_stats",
            ]
        );
    }

    #[test]
    fn test_is_builtin() {
        assert!(is_builtin("gate/enable_toolset"));
        assert!(is_builtin("system/info"));
        assert!(!is_builtin("fs/read"));
    }

    #[test]
    fn test_name_taking_builtins_require_name() {
        for descriptor in builtin_descriptors() {
            let required = descriptor.input_schema["required"]
                .as_array()
                .cloned()
                .unwrap_or_default();
            match descriptor.name.as_str() {
                GATE_ENABLE_TOOLSET | GATE_DISABLE_TOOLSET | GATE_PIN_TOOLSET
                | GATE_UNPIN_TOOLSET | TOOLS_SCHEMA => {
                    assert!(required.contains(&serde_json::json!("name")));
                }
                _ => {}
            }
        }
    }
}
