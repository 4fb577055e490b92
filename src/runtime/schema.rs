//! Event schemas and JSON-schema validation
//!
//! Validation is a pure function behind [`SchemaValidator`]; the runtime
//! never depends on a particular schema engine. [`JsonSchema`] implements the
//! subset of JSON Schema the runtime's own configuration uses. The
//! [`SchemaRegistry`] holds per-event-type schemas, each tagged with a stable
//! Blake3 hash so configuration drift can be detected.

use blake3::Hasher;
use serde_json::{Map, Value, json};
use std::collections::HashMap;

use super::message::{ERROR_EVENT, SUCCESS_EVENT};

/// Schema identifier computed from the schema definition
pub type SchemaId = String;

/// Outcome of validating a value against a schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    /// Whether the value conforms
    pub valid: bool,
    /// Human readable violations (empty when valid)
    pub errors: Vec<String>,
}

impl Validation {
    /// A passing result
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    /// A failing result with a single reason
    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            errors: vec![reason.into()],
        }
    }

    fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// Pure schema validation hook
pub trait SchemaValidator: Send + Sync {
    /// Validate `value` against `schema`
    fn validate(&self, schema: &Value, value: &Value) -> Validation;
}

/// Built-in JSON Schema subset validator
///
/// Supported keywords: `type`, `properties`, `required`,
/// `additionalProperties: false`, `const`, `enum`, `minimum`, `maximum`,
/// `minLength`, `maxLength`, `items`. Unknown keywords are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSchema;

impl SchemaValidator for JsonSchema {
    fn validate(&self, schema: &Value, value: &Value) -> Validation {
        let mut errors = Vec::new();
        check(schema, value, "$", &mut errors);
        Validation::from_errors(errors)
    }
}

fn check(schema: &Value, value: &Value, path: &str, errors: &mut Vec<String>) {
    let schema = match schema {
        Value::Bool(true) => return,
        Value::Bool(false) => {
            errors.push(format!("{}: no value is allowed", path));
            return;
        }
        Value::Object(map) => map,
        _ => {
            errors.push(format!("{}: schema must be an object or boolean", path));
            return;
        }
    };

    if let Some(expected) = schema.get("type") {
        let allowed: Vec<&str> = match expected {
            Value::String(name) => vec![name.as_str()],
            Value::Array(names) => names.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|name| has_type(value, name)) {
            errors.push(format!(
                "{}: expected {}, found {}",
                path,
                allowed.join(" or "),
                type_name(value)
            ));
            return;
        }
    }

    if let Some(constant) = schema.get("const") {
        if constant != value {
            errors.push(format!("{}: must equal {}", path, constant));
        }
    }

    if let Some(Value::Array(options)) = schema.get("enum") {
        if !options.contains(value) {
            errors.push(format!("{}: not one of the allowed values", path));
        }
    }

    if let Some(number) = value.as_f64() {
        if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
            if number < min {
                errors.push(format!("{}: {} is less than {}", path, number, min));
            }
        }
        if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
            if number > max {
                errors.push(format!("{}: {} is greater than {}", path, number, max));
            }
        }
    }

    if let Some(text) = value.as_str() {
        let length = text.chars().count() as u64;
        if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
            if length < min {
                errors.push(format!("{}: shorter than {}", path, min));
            }
        }
        if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
            if length > max {
                errors.push(format!("{}: longer than {}", path, max));
            }
        }
    }

    if let Value::Object(object) = value {
        check_object(schema, object, path, errors);
    }

    if let (Value::Array(items), Some(item_schema)) = (value, schema.get("items")) {
        for (index, item) in items.iter().enumerate() {
            check(item_schema, item, &format!("{}[{}]", path, index), errors);
        }
    }
}

fn check_object(
    schema: &Map<String, Value>,
    object: &Map<String, Value>,
    path: &str,
    errors: &mut Vec<String>,
) {
    if let Some(Value::Array(required)) = schema.get("required") {
        for key in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(key) {
                errors.push(format!("{}: missing required property '{}'", path, key));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);
    if let Some(properties) = properties {
        for (key, property_schema) in properties {
            if let Some(property) = object.get(key) {
                check(property_schema, property, &format!("{}.{}", path, key), errors);
            }
        }
    }

    if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
        for key in object.keys() {
            if !properties.is_some_and(|p| p.contains_key(key)) {
                errors.push(format!("{}: unexpected property '{}'", path, key));
            }
        }
    }
}

fn has_type(value: &Value, name: &str) -> bool {
    match name {
        "null" => value.is_null(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().is_some_and(|n| n.fract() == 0.0)
        }
        _ => false,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A registered event schema with its hash
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaDefinition {
    /// Event type name
    pub name: String,
    /// JSON schema for the event payload
    pub schema: Value,
    /// Blake3 hash of the canonical schema text
    pub hash: SchemaId,
}

/// Registry of payload schemas keyed by event type
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    schemas: HashMap<String, SchemaDefinition>,
}

impl SchemaRegistry {
    /// Create a registry holding the built-in reply and mutation schemas
    pub fn new(mutation_event: &str) -> Self {
        let mut registry = Self {
            schemas: HashMap::new(),
        };
        registry.register_builtin_schemas(mutation_event);
        registry
    }

    fn register_builtin_schemas(&mut self, mutation_event: &str) {
        self.register(SUCCESS_EVENT, json!({ "type": "object" }));
        self.register(
            ERROR_EVENT,
            json!({
                "type": "object",
                "required": ["errors"],
                "properties": {
                    "errors": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["kind", "message"],
                            "properties": {
                                "kind": { "type": "string" },
                                "message": { "type": "string" }
                            }
                        }
                    }
                }
            }),
        );
        self.register(
            mutation_event,
            json!({ "type": "object", "required": ["op"] }),
        );
    }

    /// Register (or replace) the schema for an event type, returning its hash
    pub fn register(&mut self, name: &str, schema: Value) -> SchemaId {
        let hash = compute_schema_hash(name, &schema);
        self.schemas.insert(
            name.to_string(),
            SchemaDefinition {
                name: name.to_string(),
                schema,
                hash: hash.clone(),
            },
        );
        hash
    }

    /// Get a schema by event type
    pub fn get(&self, name: &str) -> Option<&SchemaDefinition> {
        self.schemas.get(name)
    }

}

/// Compute a stable hash for a schema definition
fn compute_schema_hash(name: &str, schema: &Value) -> SchemaId {
    let mut hasher = Hasher::new();
    hasher.update(name.as_bytes());
    hasher.update(b"|");
    // serde_json maps are ordered, so this text is canonical.
    hasher.update(schema.to_string().as_bytes());
    hasher.finalize().to_hex().to_string()
}
