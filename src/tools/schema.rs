//! JSON-schema builders for tool inputs

use serde_json::{json, Map, Value};

/// Object schema from `(property, schema)` pairs and a list of required names.
pub fn object_schema(properties: Vec<(&str, Value)>, required: &[&str]) -> Value {
    let mut props = Map::with_capacity(properties.len());
    for (name, schema) in properties {
        props.insert(name.to_string(), schema);
    }

    json!({
        "type": "object",
        "properties": props,
        "required": required,
    })
}

pub fn string_property(description: &str) -> Value {
    json!({ "type": "string", "description": description })
}

pub fn integer_property(description: &str) -> Value {
    json!({ "type": "integer", "description": description })
}

pub fn string_enum_property(description: &str, values: &[&str]) -> Value {
    json!({ "type": "string", "description": description, "enum": values })
}

/// Names listed under `required` that are absent from `arguments`.
pub fn missing_required(schema: &Value, arguments: &Value) -> Vec<String> {
    schema
        .get("required")
        .and_then(Value::as_array)
        .map(|required| {
            required
                .iter()
                .filter_map(Value::as_str)
                .filter(|name| arguments.get(*name).map_or(true, Value::is_null))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
