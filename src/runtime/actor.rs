//! Actors and their persisted configuration records
//!
//! An actor is addressed by the id of its configuration record. The record
//! names the actor's inbox and context objects, its declared interface, its
//! behavior definition, and an optional attached function (a tool name).

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

use super::error::{ConfigError, ConfigResult};
use super::ids::{ActorId, InboxId, ObjectId};

/// The persisted configuration record of an actor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorConfig {
    /// Event types the actor accepts
    pub interface: Vec<String>,
    /// Inbox object id
    pub inbox: InboxId,
    /// Context object id
    pub context: ObjectId,
    /// Behavior definition (state machine or process)
    pub behavior: Value,
    /// Tool invoked by the `function` action
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    /// Named child actors
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, ActorId>,
    /// Per-actor payload schemas, taking precedence over the runtime registry
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub schemas: BTreeMap<String, Value>,
}

impl ActorConfig {
    /// Decode a configuration record read from the store
    pub fn from_value(actor: ActorId, value: Value) -> ConfigResult<Self> {
        serde_json::from_value(value).map_err(|err| ConfigError::InvalidActor {
            actor,
            reason: err.to_string(),
        })
    }

    /// Inbox id declared by a raw configuration record, if well-formed
    pub fn inbox_of(record: &Value) -> Option<InboxId> {
        record.get("inbox").and_then(ObjectId::from_value)
    }
}

/// Everything needed to create a new actor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorSpec {
    /// Event types the actor accepts
    pub interface: Vec<String>,
    /// Behavior definition
    pub behavior: Value,
    /// Initial context value
    #[serde(default = "empty_context")]
    pub context: Value,
    /// Attached function (tool name)
    #[serde(default)]
    pub function: Option<String>,
    /// Named child actors
    #[serde(default)]
    pub children: BTreeMap<String, ActorId>,
    /// Per-actor payload schemas
    #[serde(default)]
    pub schemas: BTreeMap<String, Value>,
}

fn empty_context() -> Value {
    json!({})
}

impl ActorSpec {
    /// Spec with the given interface and behavior, empty context
    pub fn new<I, S>(interface: I, behavior: Value) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            interface: interface.into_iter().map(Into::into).collect(),
            behavior,
            context: empty_context(),
            function: None,
            children: BTreeMap::new(),
            schemas: BTreeMap::new(),
        }
    }

    /// Set the initial context
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    /// Attach a function (tool name)
    pub fn with_function(mut self, tool: impl Into<String>) -> Self {
        self.function = Some(tool.into());
        self
    }

    /// Declare a payload schema for one event type
    pub fn with_schema(mut self, event: impl Into<String>, schema: Value) -> Self {
        self.schemas.insert(event.into(), schema);
        self
    }

    /// Register a named child actor
    pub fn with_child(mut self, name: impl Into<String>, child: ActorId) -> Self {
        self.children.insert(name.into(), child);
        self
    }
}

/// A running actor, as owned by the supervisor
#[derive(Debug, Clone, PartialEq)]
pub struct Actor {
    /// Unique actor ID
    pub id: ActorId,
    /// Declared interface
    pub interface: Vec<String>,
    /// Context object handle
    pub context: ObjectId,
    /// Inbox object handle
    pub inbox: InboxId,
    /// Named child actors
    pub children: BTreeMap<String, ActorId>,
    /// Attached function (tool name)
    pub function: Option<String>,
    /// Per-actor payload schemas
    pub schemas: BTreeMap<String, Value>,
}

impl Actor {
    /// Build the runtime actor from its configuration record
    pub fn from_config(id: ActorId, config: &ActorConfig) -> Self {
        Self {
            id,
            interface: config.interface.clone(),
            context: config.context,
            inbox: config.inbox,
            children: config.children.clone(),
            function: config.function.clone(),
            schemas: config.schemas.clone(),
        }
    }

    /// Whether `event` is part of the declared interface
    pub fn accepts(&self, event: &str) -> bool {
        self.interface.iter().any(|name| name == event)
    }

    /// Look up a named child
    pub fn child(&self, name: &str) -> Option<ActorId> {
        self.children.get(name).copied()
    }
}
