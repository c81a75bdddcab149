//! Normalizes Claude/OpenAI tool-parameter JSON Schema into Gemini's
//! stricter `Schema` dialect (spec §4.F step 4), shared by every
//! `*2gemini` request mapper instead of each routing its input schema
//! straight into `parametersJsonSchema` passthrough.
//!
//! Gemini's `FunctionDeclaration.parameters` is a typed `Schema` (see
//! `gproxy_protocol::gemini::generate_content::types::Schema`): a single
//! required `type` enum with uppercase variants (`"STRING"`, `"OBJECT"`,
//! ...), no `$schema`/`$ref`/`const`, `enum` is string-valued only, item
//! counts are encoded as strings, and nullability is its own `nullable`
//! flag rather than a `type` array or a `{..., "type": "null"}` branch in
//! `anyOf`. Claude and OpenAI tool schemas are drawn from arbitrary JSON
//! Schema and commonly use all of these, so raw passthrough into
//! `parametersJsonSchema` is the only thing that survives unchanged; this
//! module rewrites the common shapes into what `parameters` expects.

use gproxy_protocol::gemini::generate_content::types::Schema;
use serde_json::{Map, Value};

/// Normalizes a JSON Schema tool-parameter object into Gemini's `Schema`
/// shape and deserializes it. Returns `None` when the result still doesn't
/// fit the typed shape (e.g. a `$ref` this module doesn't resolve), in
/// which case the caller should fall back to `parameters_json_schema`
/// passthrough.
pub fn normalize_tool_schema(schema: Value) -> Option<Schema> {
    serde_json::from_value(normalize_value(schema)).ok()
}

const UNSUPPORTED_KEYS: &[&str] = &[
    "$schema",
    "$id",
    "$ref",
    "$defs",
    "definitions",
    "examples",
    "if",
    "then",
    "else",
    "contentEncoding",
    "contentMediaType",
    "patternProperties",
    "unevaluatedProperties",
];

/// Gemini encodes these as strings ("Int64 is encoded as string in the API").
const STRING_ENCODED_INT_KEYS: &[&str] = &[
    "maxItems",
    "minItems",
    "minProperties",
    "maxProperties",
    "minLength",
    "maxLength",
];

fn normalize_value(value: Value) -> Value {
    match value {
        Value::Object(map) => normalize_object(map),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_value).collect()),
        other => other,
    }
}

fn normalize_object(mut map: Map<String, Value>) -> Value {
    for key in UNSUPPORTED_KEYS {
        map.remove(*key);
    }

    // `const: V` has no Gemini field; narrow to a single-value enum.
    if let Some(const_value) = map.remove("const") {
        map.insert("enum".to_string(), Value::Array(vec![const_value]));
    }

    // `type: ["X", "null"]` -> `type: "X"`, `nullable: true`.
    let mut nullable = false;
    if let Some(Value::Array(types)) = map.get("type").cloned() {
        let mut concrete = None;
        for entry in types {
            if entry.as_str() == Some("null") {
                nullable = true;
            } else if concrete.is_none() {
                concrete = Some(entry);
            }
        }
        match concrete {
            Some(concrete) => {
                map.insert("type".to_string(), concrete);
            }
            None => {
                map.remove("type");
            }
        }
    }

    // `anyOf: [X, {"type": "null"}]` collapses onto X with `nullable: true`;
    // an `anyOf` with more than one remaining branch is left as Gemini's own
    // `anyOf` field, which the typed `Schema` already supports.
    if let Some(Value::Array(variants)) = map.remove("anyOf") {
        let mut non_null = Vec::new();
        for variant in variants {
            if is_null_schema(&variant) {
                nullable = true;
            } else {
                non_null.push(normalize_value(variant));
            }
        }
        match non_null.len() {
            0 => {}
            1 => {
                if let Value::Object(inner) = non_null.into_iter().next().unwrap() {
                    for (key, value) in inner {
                        map.entry(key).or_insert(value);
                    }
                }
            }
            _ => {
                map.insert("anyOf".to_string(), Value::Array(non_null));
            }
        }
    }

    if nullable {
        map.insert("nullable".to_string(), Value::Bool(true));
    }

    // An object schema commonly omits an explicit root `type`; infer it from
    // `properties` before falling back further below.
    if map.get("type").is_none() && map.contains_key("properties") {
        map.insert("type".to_string(), Value::String("object".to_string()));
    }

    // Tuple-style `items: [schema, ...]` belongs in `prefixItems`; Gemini's
    // `items` field holds exactly one schema.
    if matches!(map.get("items"), Some(Value::Array(_))) {
        if let Some(Value::Array(items)) = map.remove("items") {
            map.insert(
                "prefixItems".to_string(),
                Value::Array(items.into_iter().map(normalize_value).collect()),
            );
        }
    }

    for key in ["items", "additionalProperties"] {
        if let Some(value) = map.remove(key) {
            map.insert(key.to_string(), normalize_value(value));
        }
    }
    if let Some(Value::Object(properties)) = map.remove("properties") {
        let normalized = properties
            .into_iter()
            .map(|(name, prop_schema)| (name, normalize_value(prop_schema)))
            .collect();
        map.insert("properties".to_string(), Value::Object(normalized));
    }

    for key in STRING_ENCODED_INT_KEYS {
        if let Some(Value::Number(n)) = map.get(*key).cloned() {
            map.insert(key.to_string(), Value::String(n.to_string()));
        }
    }

    // `enum` (including the one synthesized from `const` above) must be
    // string-valued; coerce non-string members rather than fail.
    if let Some(Value::Array(values)) = map.remove("enum") {
        let first_kind = values.first().cloned();
        map.insert(
            "enum".to_string(),
            Value::Array(values.into_iter().map(enum_member_to_string).collect()),
        );
        if map.get("type").is_none() {
            if let Some(inferred) = first_kind.and_then(|v| type_of_json_value(&v)) {
                map.insert("type".to_string(), Value::String(inferred.to_string()));
            }
        }
    }

    // `Schema::type` is a required field; every leaf that still lacks one
    // (e.g. a bare `{}` placeholder) defaults to an open string field.
    if map.get("type").is_none() {
        map.insert("type".to_string(), Value::String("string".to_string()));
    }
    if let Some(Value::String(type_str)) = map.get("type").cloned() {
        if let Some(gemini_type) = json_schema_type_to_gemini(&type_str) {
            map.insert("type".to_string(), Value::String(gemini_type.to_string()));
        }
    }

    Value::Object(map)
}

fn is_null_schema(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some("null")
}

fn enum_member_to_string(value: Value) -> Value {
    let text = match &value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => "null".to_string(),
        other => other.to_string(),
    };
    Value::String(text)
}

fn type_of_json_value(value: &Value) -> Option<&'static str> {
    match value {
        Value::String(_) => Some("string"),
        Value::Bool(_) => Some("boolean"),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some("integer"),
        Value::Number(_) => Some("number"),
        _ => None,
    }
}

fn json_schema_type_to_gemini(type_str: &str) -> Option<&'static str> {
    match type_str {
        "string" => Some("STRING"),
        "number" => Some("NUMBER"),
        "integer" => Some("INTEGER"),
        "boolean" => Some("BOOLEAN"),
        "array" => Some("ARRAY"),
        "object" => Some("OBJECT"),
        "null" => Some("NULL"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gproxy_protocol::gemini::generate_content::types::Type;
    use serde_json::json;

    #[test]
    fn drops_dollar_schema_and_infers_object_type() {
        let input = json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "properties": {"name": {"type": "string"}},
            "required": ["name"],
        });
        let schema = normalize_tool_schema(input).expect("should deserialize into Schema");
        assert_eq!(schema.r#type, Type::Object);
        assert_eq!(schema.required.as_deref(), Some(&["name".to_string()][..]));
        assert_eq!(schema.properties.unwrap()["name"].r#type, Type::String);
    }

    #[test]
    fn converts_const_to_single_element_enum() {
        let input = json!({"type": "string", "const": "fixed"});
        let schema = normalize_tool_schema(input).unwrap();
        assert_eq!(schema.enum_values.as_deref(), Some(&["fixed".to_string()][..]));
        assert_eq!(schema.r#type, Type::String);
    }

    #[test]
    fn infers_type_from_bare_const() {
        let input = json!({"const": "v1"});
        let schema = normalize_tool_schema(input).unwrap();
        assert_eq!(schema.r#type, Type::String);
        assert_eq!(schema.enum_values.as_deref(), Some(&["v1".to_string()][..]));
    }

    #[test]
    fn collapses_nullable_type_array() {
        let input = json!({"type": ["string", "null"]});
        let schema = normalize_tool_schema(input).unwrap();
        assert_eq!(schema.r#type, Type::String);
        assert_eq!(schema.nullable, Some(true));
    }

    #[test]
    fn collapses_single_variant_any_of_with_null() {
        let input = json!({
            "anyOf": [
                {"type": "integer"},
                {"type": "null"},
            ],
        });
        let schema = normalize_tool_schema(input).unwrap();
        assert_eq!(schema.r#type, Type::Integer);
        assert_eq!(schema.nullable, Some(true));
        assert!(schema.any_of.is_none());
    }

    #[test]
    fn keeps_multi_variant_any_of() {
        let input = json!({
            "anyOf": [
                {"type": "string"},
                {"type": "integer"},
            ],
        });
        let schema = normalize_tool_schema(input).unwrap();
        assert!(schema.any_of.is_some());
    }

    #[test]
    fn recurses_into_nested_properties() {
        let input = json!({
            "properties": {
                "tag": {"const": "v1"},
                "count": {"type": ["integer", "null"]},
            },
        });
        let schema = normalize_tool_schema(input).unwrap();
        let properties = schema.properties.expect("properties should be present");
        assert_eq!(
            properties["tag"].enum_values.as_deref(),
            Some(&["v1".to_string()][..])
        );
        assert_eq!(properties["count"].nullable, Some(true));
    }

    #[test]
    fn converts_tuple_items_to_prefix_items() {
        let input = json!({
            "type": "array",
            "items": [{"type": "string"}, {"type": "integer"}],
        });
        let schema = normalize_tool_schema(input).unwrap();
        assert!(schema.items.is_none());
        assert_eq!(schema.prefix_items.map(|items| items.len()), Some(2));
    }

    #[test]
    fn stringifies_int64_constraints() {
        let input = json!({"type": "array", "items": {"type": "string"}, "minItems": 1, "maxItems": 5});
        let schema = normalize_tool_schema(input).unwrap();
        assert_eq!(schema.min_items.as_deref(), Some("1"));
        assert_eq!(schema.max_items.as_deref(), Some("5"));
    }
}
