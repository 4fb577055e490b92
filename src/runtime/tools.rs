//! Tool registry: named, schema-validated callable actions
//!
//! Behaviors reach tools through the `function` action: the actor's attached
//! function names a registered tool. Parameters may be declared loosely
//! (`{"title": "string", "limit": {"type": "integer", "optional": true}}`)
//! and are normalized into a JSON object schema at registration time.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::error::{ConfigError, ConfigResult, ToolError, ToolResult};
use super::ids::ActorId;
use super::schema::{JsonSchema, SchemaValidator};

/// What a tool sees of the calling actor
#[derive(Debug, Clone, PartialEq)]
pub struct ActorView {
    /// Calling actor
    pub id: ActorId,
    /// Caller's context as of the start of the call (staged patches included)
    pub context: Value,
}

/// Executable half of a tool
pub trait ToolFunction: Send + Sync {
    /// Run the tool; the payload has already passed schema validation
    fn execute(&self, actor: &ActorView, payload: &Value) -> ToolResult<Value>;
}

impl<F> ToolFunction for F
where
    F: Fn(&ActorView, &Value) -> ToolResult<Value> + Send + Sync,
{
    fn execute(&self, actor: &ActorView, payload: &Value) -> ToolResult<Value> {
        self(actor, payload)
    }
}

/// Declarative half of a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name
    pub name: String,
    /// Human readable description
    #[serde(default)]
    pub description: String,
    /// Normalized JSON object schema for the payload
    pub parameters: Value,
}

impl ToolDefinition {
    /// Build a definition from a loose or already-normalized parameter declaration
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: &Value,
    ) -> ConfigResult<Self> {
        let name = name.into();
        let parameters = normalize_parameters(&name, parameters)?;
        Ok(Self {
            name,
            description: description.into(),
            parameters,
        })
    }

    /// Names of the required parameters
    pub fn required(&self) -> Vec<&str> {
        self.parameters
            .get("required")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }
}

/// Turn a parameter declaration into `{type: object, properties, required}`
pub fn normalize_parameters(tool: &str, declared: &Value) -> ConfigResult<Value> {
    let invalid = |reason: String| ConfigError::InvalidAction {
        tag: "function",
        reason: format!("tool '{}': {}", tool, reason),
    };

    let declared = match declared {
        Value::Null => return Ok(json!({ "type": "object", "properties": {}, "required": [] })),
        Value::Object(map) => map,
        other => return Err(invalid(format!("parameters must be an object, found {}", other))),
    };

    if declared.contains_key("properties") || declared.get("type") == Some(&json!("object")) {
        let mut schema = declared.clone();
        schema.insert("type".into(), json!("object"));
        schema.entry("properties").or_insert_with(|| json!({}));
        schema.entry("required").or_insert_with(|| json!([]));
        return Ok(Value::Object(schema));
    }

    let mut properties = Map::new();
    let mut required = Vec::new();
    for (param, spec) in declared {
        let (property, is_required) = match spec {
            Value::String(type_name) => (json!({ "type": type_name }), true),
            Value::Object(spec) => {
                let mut property = spec.clone();
                let optional = property
                    .remove("optional")
                    .map(|flag| flag == Value::Bool(true))
                    .unwrap_or(false);
                let is_required = !optional && !property.contains_key("default");
                (Value::Object(property), is_required)
            }
            other => {
                return Err(invalid(format!(
                    "parameter '{}' must be a type name or object, found {}",
                    param, other
                )));
            }
        };
        if is_required {
            required.push(Value::String(param.clone()));
        }
        properties.insert(param.clone(), property);
    }

    Ok(json!({
        "type": "object",
        "properties": properties,
        "required": required,
    }))
}

/// Registry statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Total tool executions
    pub total_executions: u64,
    /// Successful executions
    pub successful_executions: u64,
    /// Executions rejected by schema validation
    pub rejected_executions: u64,
    /// Failed executions
    pub failed_executions: u64,
}

#[derive(Clone)]
struct RegisteredTool {
    definition: ToolDefinition,
    function: Arc<dyn ToolFunction>,
}

/// Registry of named tools
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, RegisteredTool>>,
    validator: Arc<dyn SchemaValidator>,
    stats: RwLock<RegistryStats>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Create an empty registry using the built-in schema validator
    pub fn new() -> Self {
        Self::with_validator(Arc::new(JsonSchema))
    }

    /// Create an empty registry using a custom schema validator
    pub fn with_validator(validator: Arc<dyn SchemaValidator>) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            validator,
            stats: RwLock::new(RegistryStats::default()),
        }
    }

    /// Register (or replace) a tool under its definition's name
    pub fn register_tool<F>(&self, definition: ToolDefinition, function: F)
    where
        F: ToolFunction + 'static,
    {
        let name = definition.name.clone();
        let previous = self.tools.write().insert(
            name.clone(),
            RegisteredTool {
                definition,
                function: Arc::new(function),
            },
        );
        if previous.is_some() {
            warn!(tool = %name, "Replacing registered tool");
        } else {
            info!(tool = %name, "Registering tool");
        }
    }

    /// Register a closure as a tool
    pub fn register_fn<F>(&self, definition: ToolDefinition, function: F)
    where
        F: Fn(&ActorView, &Value) -> ToolResult<Value> + Send + Sync + 'static,
    {
        self.register_tool(definition, function);
    }

    /// Remove a tool
    pub fn unregister(&self, name: &str) -> ToolResult<()> {
        self.tools
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ToolError::NotFound {
                name: name.to_string(),
            })
    }

    /// Check if a tool exists
    pub fn contains(&self, name: &str) -> bool {
        self.tools.read().contains_key(name)
    }

    /// Definition of a registered tool
    pub fn definition(&self, name: &str) -> Option<ToolDefinition> {
        self.tools.read().get(name).map(|tool| tool.definition.clone())
    }

    /// List all registered tool names
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Execution statistics so far
    pub fn stats(&self) -> RegistryStats {
        self.stats.read().clone()
    }

    /// Validate `payload` and run the tool, returning its raw result
    pub fn execute(&self, name: &str, actor: &ActorView, payload: &Value) -> ToolResult<Value> {
        let tool = self
            .tools
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ToolError::NotFound {
                name: name.to_string(),
            })?;

        self.stats.write().total_executions += 1;

        let validation = self
            .validator
            .validate(&tool.definition.parameters, payload);
        if !validation.valid {
            self.stats.write().rejected_executions += 1;
            debug!(tool = %name, errors = ?validation.errors, "Tool payload rejected");
            return Err(ToolError::Validation {
                tool: name.to_string(),
                errors: validation.errors,
            });
        }

        // Registry lock is not held while the tool runs.
        let result = tool.function.execute(actor, payload);
        let mut stats = self.stats.write();
        match &result {
            Ok(_) => stats.successful_executions += 1,
            Err(_) => stats.failed_executions += 1,
        }
        result
    }
}
