//! Tool schema optimizer.
//!
//! Shrinks descriptors before they reach a client:
//! - truncates every `description` to at most 50 code points
//! - strips `default` and `examples` from every schema node
//!
//! The transform is a pure value-to-value mapping; key order and array
//! order of everything it does not touch are preserved.

use serde_json::Value;

use toolgate_types::tool::ToolDescriptor;

/// Maximum description length, in code points (not bytes).
pub const MAX_DESCRIPTION_CHARS: usize = 50;

/// Optimize one descriptor: truncate its description and optimize its
/// input schema. The input is consumed; nothing is mutated in place.
pub fn optimize_descriptor(mut tool: ToolDescriptor) -> ToolDescriptor {
    tool.description = truncate(&tool.description);
    tool.input_schema = optimize_schema(tool.input_schema);
    tool
}

/// Recursively optimize a schema value.
///
/// Every object node loses its `default` and `examples` keys and has a
/// string `description` truncated; non-string descriptions are left
/// unchanged. Arrays are walked element-wise in order.
pub fn optimize_schema(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, child) in map {
                if key == "default" || key == "examples" {
                    continue;
                }
                if key == "description" {
                    if let Value::String(text) = &child {
                        out.insert(key, Value::String(truncate(text)));
                        continue;
                    }
                }
                out.insert(key, optimize_schema(child));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(optimize_schema).collect()),
        other => other,
    }
}

/// Simple slice to 50 code points, no ellipsis.
fn truncate(text: &str) -> String {
    text.chars().take(MAX_DESCRIPTION_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn long(n: usize) -> String {
        "x".repeat(n)
    }

    #[test]
    fn test_tool_description_truncated_to_50_chars() {
        let mut tool = ToolDescriptor::new("fs/read", &long(60));
        tool = optimize_descriptor(tool);
        assert_eq!(tool.description.chars().count(), 50);
    }

    #[test]
    fn test_short_description_unchanged() {
        let tool = optimize_descriptor(ToolDescriptor::new("fs/read", "short"));
        assert_eq!(tool.description, "short");
    }

    #[test]
    fn test_truncation_counts_code_points_not_bytes() {
        // 60 three-byte characters: 180 bytes, 60 code points.
        let text: String = "あ".repeat(60);
        let tool = optimize_descriptor(ToolDescriptor::new("t", &text));
        assert_eq!(tool.description.chars().count(), 50);
        assert_eq!(tool.description, "あ".repeat(50));
    }

    #[test]
    fn test_default_and_examples_stripped_recursively() {
        let schema = json!({
            "type": "object",
            "description": long(60),
            "default": {"whole": "object"},
            "examples": [1, 2],
            "properties": {
                "foo": {
                    "type": "string",
                    "default": "bar",
                    "examples": ["baz"],
                    "description": long(60)
                },
                "nested": {
                    "type": "object",
                    "properties": {
                        "deep": { "type": "number", "default": 7 }
                    }
                }
            }
        });

        let optimized = optimize_schema(schema);
        assert!(optimized.get("default").is_none());
        assert!(optimized.get("examples").is_none());
        assert_eq!(
            optimized["description"].as_str().unwrap().chars().count(),
            50
        );

        let foo = &optimized["properties"]["foo"];
        assert!(foo.get("default").is_none());
        assert!(foo.get("examples").is_none());
        assert_eq!(foo["description"].as_str().unwrap().chars().count(), 50);

        let deep = &optimized["properties"]["nested"]["properties"]["deep"];
        assert!(deep.get("default").is_none());
        assert_eq!(deep["type"], "number");
    }

    #[test]
    fn test_non_string_description_left_unchanged() {
        let schema = json!({"description": {"not": "a string"}, "type": "object"});
        let optimized = optimize_schema(schema);
        assert_eq!(optimized["description"], json!({"not": "a string"}));
    }

    #[test]
    fn test_other_keys_and_array_order_preserved() {
        let schema = json!({
            "type": "object",
            "required": ["b", "a", "c"],
            "enum": [3, 1, 2],
            "properties": {}
        });
        let optimized = optimize_schema(schema.clone());
        assert_eq!(optimized["required"], json!(["b", "a", "c"]));
        assert_eq!(optimized["enum"], json!([3, 1, 2]));
        assert_eq!(optimized["type"], "object");
    }

    #[test]
    fn test_schemas_inside_arrays_are_walked() {
        let schema = json!({
            "oneOf": [
                {"type": "string", "default": "x"},
                {"type": "number", "examples": [1]}
            ]
        });
        let optimized = optimize_schema(schema);
        assert!(optimized["oneOf"][0].get("default").is_none());
        assert!(optimized["oneOf"][1].get("examples").is_none());
    }

    #[test]
    fn test_scalar_passthrough() {
        assert_eq!(optimize_schema(json!(true)), json!(true));
        assert_eq!(optimize_schema(json!("text")), json!("text"));
        assert_eq!(optimize_schema(Value::Null), Value::Null);
    }
}
