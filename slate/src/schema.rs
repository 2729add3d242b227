//! Closed-schema enforcement for structured LLM outputs.
//!
//! Structured-output providers reject open object schemas, and an open schema
//! invites the model to invent keys. [`close_schema`] rewrites a JSON schema
//! so that every object with `properties` carries
//! `additionalProperties: false` and `required` equal to the full property
//! set; fields that were not originally required become nullable instead
//! (`type: [T, "null"]`).
//!
//! The same transform backs MCP argument synthesis: the cached `inputSchema`
//! of an MCP tool is closed before it is shown to the LLM, and the runtime
//! drops `null` values before forwarding arguments to the server.

use serde_json::{json, Map, Value};

/// Returns a closed copy of `schema`. Non-object schemas pass through with
/// only their nested sub-schemas rewritten.
pub fn close_schema(schema: &Value) -> Value {
    close_inner(schema, false)
}

fn close_inner(schema: &Value, nullable: bool) -> Value {
    let Some(obj) = schema.as_object() else {
        return schema.clone();
    };
    let mut out = Map::new();

    let originally_required: Vec<String> = obj
        .get("required")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let is_object_schema = obj
        .get("properties")
        .map(Value::is_object)
        .unwrap_or(false);

    for (key, value) in obj {
        match key.as_str() {
            "properties" if is_object_schema => {
                let props = value.as_object().expect("checked above");
                let mut closed_props = Map::new();
                for (name, prop_schema) in props {
                    let optional = !originally_required.contains(name);
                    closed_props.insert(name.clone(), close_inner(prop_schema, optional));
                }
                out.insert("properties".into(), Value::Object(closed_props));
            }
            "required" if is_object_schema => {
                // Replaced below with the full property set.
            }
            "additionalProperties" if is_object_schema => {
                // Forced to false below.
            }
            "items" => {
                out.insert("items".into(), close_inner(value, false));
            }
            "anyOf" | "oneOf" | "allOf" => {
                let variants = value
                    .as_array()
                    .map(|items| items.iter().map(|v| close_inner(v, false)).collect())
                    .unwrap_or_default();
                out.insert(key.clone(), Value::Array(variants));
            }
            "type" if nullable => {
                out.insert("type".into(), nullable_type(value));
            }
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }

    if is_object_schema {
        let all_keys: Vec<Value> = obj["properties"]
            .as_object()
            .expect("checked above")
            .keys()
            .map(|k| Value::String(k.clone()))
            .collect();
        out.insert("required".into(), Value::Array(all_keys));
        out.insert("additionalProperties".into(), Value::Bool(false));
    }

    Value::Object(out)
}

fn nullable_type(type_value: &Value) -> Value {
    match type_value {
        Value::String(t) => {
            if t == "null" {
                json!("null")
            } else {
                json!([t, "null"])
            }
        }
        Value::Array(types) => {
            let mut list: Vec<Value> = types.clone();
            if !list.iter().any(|v| v.as_str() == Some("null")) {
                list.push(json!("null"));
            }
            Value::Array(list)
        }
        other => other.clone(),
    }
}

/// Builds the outer argument envelope for a namespaced tool:
/// `{ tool_name: <literal>, arguments: <closed inner schema> }`, itself closed.
pub fn tool_argument_envelope(namespaced_tool_name: &str, inner_schema: &Value) -> Value {
    let inner = match inner_schema {
        Value::Object(obj) if obj.get("properties").map(Value::is_object).unwrap_or(false) => {
            close_schema(inner_schema)
        }
        Value::Object(obj) if obj.get("type").and_then(Value::as_str) == Some("object") => {
            close_schema(inner_schema)
        }
        // Non-object input schemas degrade to an empty closed object.
        _ => close_schema(&json!({ "type": "object", "properties": {} })),
    };
    json!({
        "type": "object",
        "properties": {
            "tool_name": { "type": "string", "const": namespaced_tool_name },
            "arguments": inner,
        },
        "required": ["tool_name", "arguments"],
        "additionalProperties": false,
    })
}

/// Checks the closed-schema invariant: every object sub-schema with
/// `properties` has `additionalProperties: false` and `required` equal to the
/// full property name set.
pub fn is_closed(schema: &Value) -> bool {
    let Some(obj) = schema.as_object() else {
        return true;
    };
    if let Some(props) = obj.get("properties").and_then(Value::as_object) {
        if obj.get("additionalProperties") != Some(&Value::Bool(false)) {
            return false;
        }
        let required: Vec<&str> = obj
            .get("required")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let mut prop_names: Vec<&str> = props.keys().map(String::as_str).collect();
        let mut required_sorted = required.clone();
        prop_names.sort_unstable();
        required_sorted.sort_unstable();
        if prop_names != required_sorted {
            return false;
        }
        if !props.values().all(is_closed) {
            return false;
        }
    }
    for key in ["items", "anyOf", "oneOf", "allOf"] {
        match obj.get(key) {
            Some(Value::Array(items)) => {
                if !items.iter().all(is_closed) {
                    return false;
                }
            }
            Some(single) => {
                if !is_closed(single) {
                    return false;
                }
            }
            None => {}
        }
    }
    true
}

/// Strips `null` values from an argument object before it is forwarded to an
/// MCP server; nullable-but-required synthesis means absent fields arrive as
/// explicit nulls the server never asked for.
pub fn strip_null_arguments(arguments: &Map<String, Value>) -> Map<String, Value> {
    arguments
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
